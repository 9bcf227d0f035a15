//! Simulation configuration
//!
//! One `SimulationConfig` describes a single trial: the price model, the
//! income schedule, and the strategies competing on the shared price path.
//! Batches and the optimizer reuse it unchanged for every trial.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::error::{invalid, Result, SimError};
use crate::simulation::price::PriceModel;

/// Which buying rule a strategy follows
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategyKind {
    /// Spend all available cash every turn
    BuyRegularly,
    /// Hold cash forever
    NeverBuy,
    /// Buy when price <= mean(last `window` prices) * threshold
    BuyDipThreshold { threshold: f64, window: usize },
    /// Buy after `trend_length` consecutive declines
    BuyDipTrend { trend_length: usize },
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BuyRegularly => write!(f, "Buy Regularly"),
            Self::NeverBuy => write!(f, "Never Buy"),
            Self::BuyDipThreshold { threshold, window } => {
                write!(f, "Buy Dip at Threshold ({:.3} x {}-turn mean)", threshold, window)
            }
            Self::BuyDipTrend { trend_length } => {
                write!(f, "Buy Dip after Trend ({} declines)", trend_length)
            }
        }
    }
}

/// A labelled strategy taking part in every trial
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySpec {
    pub label: String,
    #[serde(flatten)]
    pub kind: StrategyKind,
}

impl StrategySpec {
    pub fn new(label: impl Into<String>, kind: StrategyKind) -> Self {
        Self {
            label: label.into(),
            kind,
        }
    }
}

/// Net-worth ratio `numerator / denominator` tracked across a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatioPair {
    pub numerator: String,
    pub denominator: String,
}

impl RatioPair {
    pub fn new(numerator: impl Into<String>, denominator: impl Into<String>) -> Self {
        Self {
            numerator: numerator.into(),
            denominator: denominator.into(),
        }
    }
}

impl std::fmt::Display for RatioPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} vs {}", self.numerator, self.denominator)
    }
}

/// Configuration for one simulated trial
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Number of turns (days) simulated
    pub turns: usize,

    /// Fixed seed; `None` draws one per trial
    pub seed: Option<u64>,

    /// Price before the first turn
    pub starting_price: f64,

    /// Cash every strategy starts with
    pub starting_cash: f64,

    /// Income credited to every strategy on pay turns
    pub salary: f64,

    /// Salary arrives on turns where `turn % salary_interval == 0`
    pub salary_interval: usize,

    /// Per-turn drift of the price process
    pub drift: f64,

    /// Per-turn volatility of the price process
    pub volatility: f64,

    pub price_model: PriceModel,

    /// Strategies, in dispatch order
    pub strategies: Vec<StrategySpec>,

    /// Ratios reported by the aggregator; the first one drives the optimizer
    pub pairs: Vec<RatioPair>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            turns: 365 * 3,
            seed: None,
            starting_price: 100.0,
            starting_cash: 10_000.0,
            salary: 100.0,
            salary_interval: 1,
            drift: 0.0006,
            volatility: 0.0094,
            price_model: PriceModel::default(),
            strategies: vec![
                StrategySpec::new("regular", StrategyKind::BuyRegularly),
                StrategySpec::new(
                    "dip",
                    StrategyKind::BuyDipThreshold {
                        threshold: 0.95,
                        window: 30,
                    },
                ),
                StrategySpec::new("never", StrategyKind::NeverBuy),
            ],
            pairs: vec![RatioPair::new("regular", "dip")],
        }
    }
}

impl SimulationConfig {
    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SimulationConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Add a trend-following dip buyer and compare it against `regular`
    pub fn with_trend_buyer(mut self, trend_length: usize) -> Self {
        self.strategies.push(StrategySpec::new(
            "trend",
            StrategyKind::BuyDipTrend { trend_length },
        ));
        self.pairs.push(RatioPair::new("regular", "trend"));
        self
    }

    /// Copy of this config with every threshold dip buyer retuned
    pub fn with_dip_params(&self, threshold: f64, window: usize) -> Self {
        let mut config = self.clone();
        for spec in &mut config.strategies {
            if let StrategyKind::BuyDipThreshold { .. } = spec.kind {
                spec.kind = StrategyKind::BuyDipThreshold { threshold, window };
            }
        }
        config
    }

    pub fn has_threshold_strategy(&self) -> bool {
        self.strategies
            .iter()
            .any(|s| matches!(s.kind, StrategyKind::BuyDipThreshold { .. }))
    }

    /// Position of a strategy in dispatch order
    pub fn index_of(&self, label: &str) -> Result<usize> {
        self.strategies
            .iter()
            .position(|s| s.label == label)
            .ok_or_else(|| SimError::UnknownStrategy(label.to_string()))
    }

    /// Number of turns that receive salary, turn 0 included
    pub fn salary_payments(&self) -> usize {
        if self.salary_interval == 0 {
            return 0;
        }
        self.turns.div_ceil(self.salary_interval)
    }

    /// Reject configurations that cannot produce a meaningful trial
    pub fn validate(&self) -> Result<()> {
        if self.turns == 0 {
            return Err(invalid("turns must be positive"));
        }
        if !(self.starting_price.is_finite() && self.starting_price > 0.0) {
            return Err(invalid(format!(
                "starting_price must be positive, got {}",
                self.starting_price
            )));
        }
        if !(self.starting_cash.is_finite() && self.starting_cash >= 0.0) {
            return Err(invalid(format!(
                "starting_cash must be non-negative, got {}",
                self.starting_cash
            )));
        }
        if !(self.salary.is_finite() && self.salary >= 0.0) {
            return Err(invalid(format!("salary must be non-negative, got {}", self.salary)));
        }
        if self.salary_interval == 0 {
            return Err(invalid("salary_interval must be positive"));
        }
        if !self.drift.is_finite() {
            return Err(invalid("drift must be finite"));
        }
        if !(self.volatility.is_finite() && self.volatility >= 0.0) {
            return Err(invalid(format!(
                "volatility must be non-negative, got {}",
                self.volatility
            )));
        }
        self.price_model.validate()?;

        if self.strategies.is_empty() {
            return Err(invalid("at least one strategy is required"));
        }
        let mut seen = HashSet::new();
        for spec in &self.strategies {
            if spec.label.is_empty() {
                return Err(invalid("strategy labels must not be empty"));
            }
            if !seen.insert(spec.label.as_str()) {
                return Err(invalid(format!("duplicate strategy label `{}`", spec.label)));
            }
            match spec.kind {
                StrategyKind::BuyDipThreshold { threshold, window } => {
                    if !(threshold.is_finite() && threshold >= 0.0) {
                        return Err(invalid(format!(
                            "`{}`: threshold must be non-negative, got {}",
                            spec.label, threshold
                        )));
                    }
                    if window == 0 {
                        return Err(invalid(format!(
                            "`{}`: rolling window must hold at least one price",
                            spec.label
                        )));
                    }
                }
                StrategyKind::BuyDipTrend { trend_length } => {
                    if trend_length == 0 {
                        return Err(invalid(format!(
                            "`{}`: trend_length must be positive",
                            spec.label
                        )));
                    }
                }
                StrategyKind::BuyRegularly | StrategyKind::NeverBuy => {}
            }
        }

        for pair in &self.pairs {
            self.index_of(&pair.numerator)?;
            self.index_of(&pair.denominator)?;
        }

        Ok(())
    }
}
