//! One simulated trial
//!
//! INITIALIZING -> RUNNING (one step per turn) -> DONE
//!
//! All strategies see the same price path. Each turn:
//! 1. Salary is credited on pay turns (turn 0 included), before the price moves
//! 2. The price process draws the next price from the trial's generator
//! 3. Every strategy updates, decides and buys, in configuration order

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::{SimulationConfig, StrategyKind};
use crate::error::{Result, SimError};

use super::strategy::{self, Holdings, Strategy};

/// Seeds drawn without an explicit seed fall in `0..SEED_RANGE`
pub const SEED_RANGE: u64 = 1_000_000_000;

/// Draw a fresh seed from thread entropy
pub fn random_seed() -> u64 {
    rand::thread_rng().gen_range(0..SEED_RANGE)
}

/// Lifecycle of a trial
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrialPhase {
    Initializing,
    Running,
    Done,
}

impl std::fmt::Display for TrialPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrialPhase::Initializing => write!(f, "INITIALIZING"),
            TrialPhase::Running => write!(f, "RUNNING"),
            TrialPhase::Done => write!(f, "DONE"),
        }
    }
}

/// Terminal snapshot of one strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyOutcome {
    pub label: String,
    pub kind: StrategyKind,
    pub holdings: Holdings,
    pub net_worth: f64,
    pub average_price: f64,
}

impl StrategyOutcome {
    fn capture(label: &str, strategy: &dyn Strategy) -> Self {
        let holdings = strategy.holdings().clone();
        Self {
            label: label.to_string(),
            kind: strategy.kind(),
            net_worth: holdings.net_worth(),
            average_price: holdings.average_price(),
            holdings,
        }
    }
}

/// Everything a finished trial reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub seed: u64,
    pub turns: usize,
    pub final_price: f64,
    /// One entry per configured strategy, in configuration order
    pub outcomes: Vec<StrategyOutcome>,
}

impl TrialResult {
    pub fn outcome(&self, label: &str) -> Option<&StrategyOutcome> {
        self.outcomes.iter().find(|o| o.label == label)
    }
}

/// Per-turn sequences for chart collaborators
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrialTrace {
    pub prices: Vec<f64>,
    pub strategies: Vec<StrategyTrace>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyTrace {
    pub label: String,
    /// Turns on which at least one share was bought
    pub buy_turns: Vec<usize>,
    /// Buy level per turn, for strategies that have one
    pub reference_levels: Option<Vec<f64>>,
}

/// A single trial, stepped one turn at a time
pub struct Trial<'a> {
    config: &'a SimulationConfig,
    seed: u64,
    rng: StdRng,
    phase: TrialPhase,
    turn: usize,
    price: f64,
    strategies: Vec<Box<dyn Strategy>>,
    trace: Option<TrialTrace>,
}

impl<'a> Trial<'a> {
    /// Validate the config and prepare a trial.
    ///
    /// Seed precedence: `seed` argument, then `config.seed`, then a random draw.
    pub fn new(config: &'a SimulationConfig, seed: Option<u64>) -> Result<Self> {
        config.validate()?;

        let seed = seed.or(config.seed).unwrap_or_else(random_seed);
        let strategies = config
            .strategies
            .iter()
            .map(|spec| strategy::build(&spec.kind, config.starting_cash))
            .collect();

        Ok(Self {
            config,
            seed,
            rng: StdRng::seed_from_u64(seed),
            phase: TrialPhase::Initializing,
            turn: 0,
            price: config.starting_price,
            strategies,
            trace: None,
        })
    }

    /// Record per-turn prices and buy levels while running
    pub fn with_trace(mut self) -> Self {
        let strategies = self
            .config
            .strategies
            .iter()
            .zip(&self.strategies)
            .map(|(spec, s)| StrategyTrace {
                label: spec.label.clone(),
                buy_turns: Vec::new(),
                reference_levels: matches!(s.kind(), StrategyKind::BuyDipThreshold { .. })
                    .then(|| Vec::with_capacity(self.config.turns)),
            })
            .collect();
        self.trace = Some(TrialTrace {
            prices: Vec::with_capacity(self.config.turns),
            strategies,
        });
        self
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn phase(&self) -> TrialPhase {
        self.phase
    }

    /// Next turn to execute
    pub fn turn(&self) -> usize {
        self.turn
    }

    pub fn price(&self) -> f64 {
        self.price
    }

    pub fn strategies(&self) -> &[Box<dyn Strategy>] {
        &self.strategies
    }

    /// Execute one turn and return the phase afterwards
    pub fn step(&mut self) -> Result<TrialPhase> {
        match self.phase {
            TrialPhase::Done => return Ok(TrialPhase::Done),
            TrialPhase::Initializing => self.phase = TrialPhase::Running,
            TrialPhase::Running => {}
        }

        let turn = self.turn;
        let config = self.config;

        if turn % config.salary_interval == 0 {
            for s in &mut self.strategies {
                s.holdings_mut().deposit(config.salary);
            }
        }

        let price = config
            .price_model
            .next_price(&mut self.rng, self.price, config.drift, config.volatility);
        if !(price.is_finite() && price > 0.0) {
            return Err(SimError::TrialFailed {
                seed: self.seed,
                turn,
                reason: format!("price process produced {}", price),
            });
        }
        self.price = price;

        let mut recording = self.trace.as_mut();
        if let Some(rec) = recording.as_deref_mut() {
            rec.prices.push(price);
        }

        for (i, s) in self.strategies.iter_mut().enumerate() {
            let shares = s.assess_and_buy(price, turn);
            if shares > 0 {
                trace!(
                    "turn {} {} bought {} @ {:.2}",
                    turn,
                    config.strategies[i].label,
                    shares,
                    price
                );
            }

            if let Some(rec) = recording.as_deref_mut() {
                let st = &mut rec.strategies[i];
                if shares > 0 {
                    st.buy_turns.push(turn);
                }
                if let (Some(levels), Some(level)) = (&mut st.reference_levels, s.reference_level()) {
                    levels.push(level);
                }
            }
        }

        self.turn += 1;
        if self.turn >= config.turns {
            self.phase = TrialPhase::Done;
        }
        Ok(self.phase)
    }

    /// Run the remaining turns and snapshot the result
    pub fn run(mut self) -> Result<TrialResult> {
        while self.step()? != TrialPhase::Done {}
        Ok(self.snapshot())
    }

    /// Run the remaining turns, returning the result and the recorded trace
    pub fn run_traced(self) -> Result<(TrialResult, TrialTrace)> {
        let mut trial = if self.trace.is_some() { self } else { self.with_trace() };
        while trial.step()? != TrialPhase::Done {}

        let result = trial.snapshot();
        let trace = trial.trace.take().unwrap_or_default();
        Ok((result, trace))
    }

    fn snapshot(&self) -> TrialResult {
        let outcomes = self
            .config
            .strategies
            .iter()
            .zip(&self.strategies)
            .map(|(spec, s)| StrategyOutcome::capture(&spec.label, s.as_ref()))
            .collect();

        TrialResult {
            seed: self.seed,
            turns: self.turn,
            final_price: self.price,
            outcomes,
        }
    }
}

/// Run one complete trial
pub fn run_trial(config: &SimulationConfig, seed: Option<u64>) -> Result<TrialResult> {
    Trial::new(config, seed)?.run()
}

/// Run one complete trial and keep its per-turn trace
pub fn run_traced(config: &SimulationConfig, seed: Option<u64>) -> Result<(TrialResult, TrialTrace)> {
    Trial::new(config, seed)?.run_traced()
}
