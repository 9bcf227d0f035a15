//! Batch aggregation
//!
//! Runs many independent trials in parallel using Rayon and reduces them to
//! percentile bands and net-worth ratio statistics.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::config::{RatioPair, SimulationConfig, StrategyKind};
use crate::error::{invalid, Result};
use crate::simulation::trial::{random_seed, run_trial, StrategyOutcome, TrialResult, SEED_RANGE};

use super::stats::{ratio, sort_values, MeanEstimate, PercentileBand, BAND_PERCENTILES};

/// Distribution of one strategy's terminal metrics across a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySummary {
    pub label: String,
    pub kind: StrategyKind,
    pub net_worth: PercentileBand,
    pub average_price: PercentileBand,
    pub buy_count: PercentileBand,
    pub peak_buy_count: PercentileBand,
    /// Share of turns on which a new peak price was set
    pub peak_turn_fraction: PercentileBand,
    pub mean_net_worth: f64,
    pub mean_buy_count: f64,
    pub mean_peak_buy_count: f64,
}

/// Terminal metrics of one strategy in one trial
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutcomeMetrics {
    pub net_worth: f64,
    pub average_price: f64,
    pub buy_count: usize,
    pub peak_buy_count: usize,
    pub peak_turn_fraction: f64,
}

impl OutcomeMetrics {
    fn from_outcome(outcome: &StrategyOutcome, turns: usize) -> Self {
        Self {
            net_worth: outcome.net_worth,
            average_price: outcome.average_price,
            buy_count: outcome.holdings.buy_count,
            peak_buy_count: outcome.holdings.peak_buy_count,
            peak_turn_fraction: outcome.holdings.peak_turn_count as f64 / turns.max(1) as f64,
        }
    }
}

/// The trial sitting at one percentile rank of the ratio-sorted batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedTrial {
    pub percentile: f64,
    /// Replays this trial exactly
    pub seed: u64,
    pub net_worth_ratio: f64,
    pub price_paid_ratio: f64,
    pub buy_count_ratio: f64,
    pub numerator: OutcomeMetrics,
    pub denominator: OutcomeMetrics,
}

/// Net-worth ratio statistics for one strategy pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairReport {
    pub pair: RatioPair,
    pub estimate: MeanEstimate,
    pub ratio: PercentileBand,
    pub ranked: Vec<RankedTrial>,
}

/// Statistics derived from one batch of trials
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub trial_count: usize,
    pub turns: usize,
    pub strategies: Vec<StrategySummary>,
    pub pairs: Vec<PairReport>,
}

impl AggregateReport {
    /// First configured pair
    pub fn primary(&self) -> Option<&PairReport> {
        self.pairs.first()
    }

    pub fn pair(&self, numerator: &str, denominator: &str) -> Option<&PairReport> {
        self.pairs
            .iter()
            .find(|p| p.pair.numerator == numerator && p.pair.denominator == denominator)
    }

    pub fn strategy(&self, label: &str) -> Option<&StrategySummary> {
        self.strategies.iter().find(|s| s.label == label)
    }
}

/// Runs batches of trials for one configuration
#[derive(Clone)]
pub struct BatchRunner {
    config: SimulationConfig,
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl BatchRunner {
    /// `config.seed`, when set, seeds the whole batch rather than each trial
    pub fn new(config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, pool: None })
    }

    /// Run on a dedicated pool of `workers` threads instead of the global one
    pub fn with_workers(mut self, workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(invalid("worker count must be positive"));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("dip-sim-{}", i))
            .build()?;
        self.pool = Some(Arc::new(pool));
        Ok(self)
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Same runner and pool, different configuration
    pub fn reconfigured(&self, config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            pool: self.pool.clone(),
        })
    }

    /// Trial seeds for a batch. Deterministic when the config has a seed;
    /// a larger batch from the same seed extends a smaller one.
    pub fn draw_seeds(&self, trial_count: usize) -> Vec<u64> {
        match self.config.seed {
            Some(batch_seed) => {
                let mut rng = StdRng::seed_from_u64(batch_seed);
                (0..trial_count).map(|_| rng.gen_range(0..SEED_RANGE)).collect()
            }
            None => (0..trial_count).map(|_| random_seed()).collect(),
        }
    }

    pub fn run_batch(&self, trial_count: usize) -> Result<AggregateReport> {
        if trial_count == 0 {
            return Err(invalid("trial_count must be positive"));
        }
        let seeds = self.draw_seeds(trial_count);
        self.run_with_seeds(&seeds)
    }

    pub fn run_with_seeds(&self, seeds: &[u64]) -> Result<AggregateReport> {
        let trials = self.run_trials(seeds)?;
        aggregate(&self.config, &trials)
    }

    /// Run one trial per seed. Results keep seed order; any failure fails the batch.
    pub fn run_trials(&self, seeds: &[u64]) -> Result<Vec<TrialResult>> {
        if seeds.is_empty() {
            return Err(invalid("trial_count must be positive"));
        }

        let total = seeds.len();
        let log_every = (total / 10).max(1);
        let completed = AtomicUsize::new(0);
        let start = Instant::now();
        let config = &self.config;

        let run = || -> Result<Vec<TrialResult>> {
            seeds
                .par_iter()
                .map(|&seed| {
                    let result = run_trial(config, Some(seed));

                    let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                    if done % log_every == 0 || done == total {
                        let elapsed = start.elapsed().as_secs_f64();
                        debug!(
                            "[{}/{}] trials, {:.0}/s",
                            done,
                            total,
                            done as f64 / elapsed.max(f64::EPSILON)
                        );
                    }

                    result
                })
                .collect()
        };

        match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        }
    }
}

/// Reduce a batch of trials to an `AggregateReport`
pub fn aggregate(config: &SimulationConfig, trials: &[TrialResult]) -> Result<AggregateReport> {
    if trials.is_empty() {
        return Err(invalid("cannot aggregate an empty batch"));
    }
    if let Some(t) = trials.iter().find(|t| t.outcomes.len() != config.strategies.len()) {
        return Err(invalid(format!(
            "trial {} has {} outcomes but the config has {} strategies",
            t.seed,
            t.outcomes.len(),
            config.strategies.len()
        )));
    }

    let strategies = config
        .strategies
        .iter()
        .enumerate()
        .map(|(i, spec)| summarize_strategy(&spec.label, spec.kind, i, trials))
        .collect();

    let pairs = config
        .pairs
        .iter()
        .map(|pair| summarize_pair(config, pair, trials))
        .collect::<Result<Vec<_>>>()?;

    Ok(AggregateReport {
        trial_count: trials.len(),
        turns: config.turns,
        strategies,
        pairs,
    })
}

fn summarize_strategy(
    label: &str,
    kind: StrategyKind,
    index: usize,
    trials: &[TrialResult],
) -> StrategySummary {
    let metrics: Vec<OutcomeMetrics> = trials
        .iter()
        .map(|t| OutcomeMetrics::from_outcome(&t.outcomes[index], t.turns))
        .collect();
    let column = |f: fn(&OutcomeMetrics) -> f64| -> Vec<f64> { metrics.iter().map(f).collect() };

    let net_worth = column(|m| m.net_worth);
    let buy_count = column(|m| m.buy_count as f64);
    let peak_buy_count = column(|m| m.peak_buy_count as f64);

    StrategySummary {
        label: label.to_string(),
        kind,
        mean_net_worth: super::stats::mean(&net_worth),
        mean_buy_count: super::stats::mean(&buy_count),
        mean_peak_buy_count: super::stats::mean(&peak_buy_count),
        net_worth: PercentileBand::from_values(net_worth),
        average_price: PercentileBand::from_values(column(|m| m.average_price)),
        buy_count: PercentileBand::from_values(buy_count),
        peak_buy_count: PercentileBand::from_values(peak_buy_count),
        peak_turn_fraction: PercentileBand::from_values(column(|m| m.peak_turn_fraction)),
    }
}

fn summarize_pair(
    config: &SimulationConfig,
    pair: &RatioPair,
    trials: &[TrialResult],
) -> Result<PairReport> {
    let num = config.index_of(&pair.numerator)?;
    let den = config.index_of(&pair.denominator)?;

    let ratios: Vec<f64> = trials
        .iter()
        .map(|t| ratio(t.outcomes[num].net_worth, t.outcomes[den].net_worth))
        .collect();
    let estimate = MeanEstimate::from_values(&ratios);

    // trial indices ordered by ratio; stable so ties keep seed order
    let mut order: Vec<usize> = (0..trials.len()).collect();
    order.sort_by(|&a, &b| ratios[a].total_cmp(&ratios[b]));

    let n = trials.len();
    let ranks = [n / 20, n / 4, n / 2, (n / 4) * 3, (n / 20) * 19];
    let ranked = BAND_PERCENTILES
        .iter()
        .zip(ranks)
        .map(|(&percentile, rank)| {
            let t = &trials[order[rank.min(n - 1)]];
            let a = OutcomeMetrics::from_outcome(&t.outcomes[num], t.turns);
            let b = OutcomeMetrics::from_outcome(&t.outcomes[den], t.turns);
            RankedTrial {
                percentile,
                seed: t.seed,
                net_worth_ratio: ratio(a.net_worth, b.net_worth),
                price_paid_ratio: ratio(a.average_price, b.average_price),
                buy_count_ratio: ratio(a.buy_count as f64, b.buy_count as f64),
                numerator: a,
                denominator: b,
            }
        })
        .collect();

    let mut sorted = ratios;
    sort_values(&mut sorted);

    Ok(PairReport {
        pair: pair.clone(),
        estimate,
        ratio: PercentileBand::from_sorted(&sorted),
        ranked,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrategySpec;

    fn quick_config() -> SimulationConfig {
        SimulationConfig {
            turns: 120,
            seed: Some(2024),
            ..Default::default()
        }
    }

    #[test]
    fn test_batch_is_reproducible_from_seed() {
        let runner = BatchRunner::new(quick_config()).unwrap();
        let a = runner.run_batch(40).unwrap();
        let b = runner.run_batch(40).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.trial_count, 40);
    }

    #[test]
    fn test_larger_batch_extends_seeds() {
        let runner = BatchRunner::new(quick_config()).unwrap();
        let small = runner.draw_seeds(10);
        let large = runner.draw_seeds(20);
        assert_eq!(small[..], large[..10]);
    }

    #[test]
    fn test_dedicated_pool_matches_global() {
        let runner = BatchRunner::new(quick_config()).unwrap();
        let pooled = runner.clone().with_workers(2).unwrap();
        assert_eq!(runner.run_batch(25).unwrap(), pooled.run_batch(25).unwrap());
        assert!(runner.clone().with_workers(0).is_err());
    }

    #[test]
    fn test_percentiles_are_ordered() {
        let config = SimulationConfig { volatility: 0.02, ..quick_config() };
        let report = BatchRunner::new(config).unwrap().run_batch(50).unwrap();
        for s in &report.strategies {
            assert!(s.net_worth.p5 <= s.net_worth.p50);
            assert!(s.net_worth.p50 <= s.net_worth.p95);
        }
        let pair = report.primary().unwrap();
        assert!(pair.ratio.p5 <= pair.ratio.p50 && pair.ratio.p50 <= pair.ratio.p95);
        let ranked: Vec<f64> = pair.ranked.iter().map(|r| r.net_worth_ratio).collect();
        assert!(ranked.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_ranked_trials_replay() {
        let config = quick_config();
        let report = BatchRunner::new(config.clone()).unwrap().run_batch(30).unwrap();
        let median = &report.primary().unwrap().ranked[2];
        let replay = run_trial(&config, Some(median.seed)).unwrap();
        let regular = replay.outcome("regular").unwrap();
        assert_eq!(regular.net_worth, median.numerator.net_worth);
    }

    #[test]
    fn test_zero_net_worth_ratio_is_infinite() {
        let config = SimulationConfig {
            turns: 60,
            seed: Some(3),
            starting_cash: 0.0,
            salary: 0.0,
            drift: 0.01,
            volatility: 0.0,
            ..Default::default()
        };
        let report = BatchRunner::new(config).unwrap().run_batch(20).unwrap();
        let pair = report.primary().unwrap();
        assert_eq!(pair.estimate.mean, f64::INFINITY);
        for v in pair.ratio.values() {
            assert_eq!(v, f64::INFINITY);
        }
        for r in &pair.ranked {
            assert_eq!(r.net_worth_ratio, f64::INFINITY);
            assert_eq!(r.price_paid_ratio, f64::INFINITY);
        }
        assert_eq!(report.strategy("regular").unwrap().net_worth.p50, 0.0);
    }

    #[test]
    fn test_identical_strategies_have_unit_ratio() {
        let config = SimulationConfig {
            turns: 80,
            seed: Some(9),
            strategies: vec![
                StrategySpec::new("a", StrategyKind::BuyRegularly),
                StrategySpec::new("b", StrategyKind::BuyRegularly),
            ],
            pairs: vec![RatioPair::new("a", "b")],
            ..Default::default()
        };
        let report = BatchRunner::new(config).unwrap().run_batch(20).unwrap();
        let pair = report.pair("a", "b").unwrap();
        assert_eq!(pair.estimate.mean, 1.0);
        assert_eq!(pair.estimate.half_width, 0.0);
    }

    #[test]
    fn test_rejects_empty_batch() {
        let runner = BatchRunner::new(quick_config()).unwrap();
        assert!(runner.run_batch(0).is_err());
        assert!(runner.run_with_seeds(&[]).is_err());
    }

    #[test]
    fn test_aggregate_rejects_mismatched_trials() {
        let narrow = SimulationConfig {
            strategies: vec![StrategySpec::new("regular", StrategyKind::BuyRegularly)],
            pairs: vec![],
            ..quick_config()
        };
        let trials = vec![run_trial(&narrow, Some(1)).unwrap()];
        assert!(matches!(
            aggregate(&quick_config(), &trials),
            Err(crate::error::SimError::InvalidConfig(_))
        ));
        assert!(aggregate(&narrow, &trials).is_ok());
    }

    #[test]
    fn test_failed_trial_fails_batch() {
        // exp overflows to inf within a few turns
        let config = SimulationConfig { drift: 400.0, ..quick_config() };
        let runner = BatchRunner::new(config).unwrap();
        assert!(matches!(
            runner.run_batch(8),
            Err(crate::error::SimError::TrialFailed { .. })
        ));
    }
}
