//! Tipping-point search
//!
//! Walks the (threshold, window) plane of the threshold dip buyer looking for
//! the setting where the primary net-worth ratio reaches parity (≈ 1.0).
//!
//! Each iteration probes four neighbours in a fixed order:
//! threshold up, threshold down, window up, window down.
//! A neighbour replaces the current best when `check_ratio` accepts it, so
//! later acceptable neighbours win over earlier ones. Overshooting parity
//! doubles the step multiplier, which shrinks all later steps.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::SimulationConfig;
use crate::error::{invalid, Result};

use super::aggregate::BatchRunner;
use super::stats::MeanEstimate;

/// Search settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub initial_threshold: f64,
    pub initial_window: usize,
    /// Trials per evaluation before any doubling
    pub initial_trial_count: usize,
    /// Doubling stops here; the last estimate is used as-is
    pub max_trial_count: usize,
    pub max_iterations: usize,
    /// Ratios strictly inside (lower, upper) count as parity
    pub parity_lower: f64,
    pub parity_upper: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            initial_threshold: 0.95,
            initial_window: 30,
            initial_trial_count: 1000,
            max_trial_count: 256_000,
            max_iterations: 100,
            parity_lower: 0.99,
            parity_upper: 1.01,
        }
    }
}

/// Which way the ratio has to move to reach parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Ratio above 1, push it down
    Down,
    /// Ratio at or below 1, push it up
    Up,
}

impl Direction {
    pub fn toward_parity(ratio: f64) -> Self {
        if ratio > 1.0 {
            Direction::Down
        } else {
            Direction::Up
        }
    }

    /// The move ended on the far side of 1 from where it started
    pub fn overshot(self, ratio: f64) -> bool {
        match self {
            Direction::Down => ratio < 1.0,
            Direction::Up => ratio > 1.0,
        }
    }
}

/// Whether `candidate` should replace `best` when heading in `direction`
pub fn check_ratio(candidate: f64, direction: Direction, best: f64) -> bool {
    match direction {
        Direction::Down => (candidate > 1.0 && candidate < best) || (candidate <= 1.0 && candidate > best),
        Direction::Up => (candidate < 1.0 && candidate > best) || (candidate >= 1.0 && candidate < best),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Move {
    ThresholdUp,
    ThresholdDown,
    WindowUp,
    WindowDown,
}

impl std::fmt::Display for Move {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Move::ThresholdUp => write!(f, "threshold up"),
            Move::ThresholdDown => write!(f, "threshold down"),
            Move::WindowUp => write!(f, "window up"),
            Move::WindowDown => write!(f, "window down"),
        }
    }
}

/// One neighbouring parameter setting
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub step: Move,
    pub threshold: f64,
    pub window: usize,
}

/// The four neighbours of (threshold, window), in evaluation order
pub fn neighbors(threshold: f64, window: usize, step_multiplier: f64, turns: usize) -> [Candidate; 4] {
    let widen = 1.0 + 1.0 / step_multiplier;
    let gap = 1.0 - threshold;

    [
        Candidate {
            step: Move::ThresholdUp,
            threshold: (1.0 - gap / (2.0 * step_multiplier)).min(0.99),
            window,
        },
        Candidate {
            step: Move::ThresholdDown,
            threshold: (1.0 - gap * widen).max(0.0),
            window,
        },
        Candidate {
            step: Move::WindowUp,
            threshold,
            window: ((window as f64 * widen).floor() as usize).min(turns),
        },
        Candidate {
            step: Move::WindowDown,
            threshold,
            window: ((window as f64 / widen).floor() as usize).max(2),
        },
    ]
}

/// How a search ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchOutcome {
    /// Ratio inside the parity band
    Converged,
    /// No neighbour moved the ratio toward parity
    NoImprovement,
    Cancelled,
    IterationLimit,
}

impl std::fmt::Display for SearchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SearchOutcome::Converged => write!(f, "CONVERGED"),
            SearchOutcome::NoImprovement => write!(f, "NO_IMPROVEMENT"),
            SearchOutcome::Cancelled => write!(f, "CANCELLED"),
            SearchOutcome::IterationLimit => write!(f, "ITERATION_LIMIT"),
        }
    }
}

/// Current point of the walk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchState {
    pub threshold: f64,
    pub window: usize,
    pub step_multiplier: f64,
    pub estimate: MeanEstimate,
    pub iterations: usize,
    /// Batches run so far, doublings included
    pub evaluations: usize,
}

impl SearchState {
    /// Move to `candidate`, doubling the step multiplier when the new ratio
    /// lands past 1 in `direction`. Returns whether it doubled.
    pub fn advance(&mut self, candidate: Candidate, estimate: MeanEstimate, direction: Direction) -> bool {
        self.threshold = candidate.threshold;
        self.window = candidate.window;
        self.estimate = estimate;
        let overshot = direction.overshot(estimate.mean);
        if overshot {
            self.step_multiplier *= 2.0;
        }
        overshot
    }
}

/// Neighbour to move to from a ratio of `current`, if any.
///
/// Candidates are checked in order against the best ratio so far, so a later
/// acceptable candidate replaces an earlier one.
pub fn select_move(
    current: f64,
    direction: Direction,
    evaluated: &[(Candidate, MeanEstimate)],
) -> Option<(Candidate, MeanEstimate)> {
    let mut best_ratio = current;
    let mut best = None;
    for &(candidate, estimate) in evaluated {
        if check_ratio(estimate.mean, direction, best_ratio) {
            best_ratio = estimate.mean;
            best = Some((candidate, estimate));
        }
    }
    best
}

/// Final parameters and ratio of a search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub outcome: SearchOutcome,
    pub threshold: f64,
    pub window: usize,
    pub mean_ratio: f64,
    pub half_width: f64,
    pub iterations: usize,
    pub evaluations: usize,
}

/// A significant-enough estimate for one parameter setting
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub estimate: MeanEstimate,
    /// Trials in the batch that produced `estimate`
    pub trial_count: usize,
    pub batches: usize,
}

enum Phase {
    Check,
    Probe,
    Finished(SearchOutcome),
}

pub struct ParameterOptimizer {
    runner: BatchRunner,
    config: OptimizerConfig,
    cancel: Arc<AtomicBool>,
}

impl ParameterOptimizer {
    /// `base` supplies the price model, income and competing strategies;
    /// its first ratio pair is the one driven to parity.
    pub fn new(base: SimulationConfig, config: OptimizerConfig) -> Result<Self> {
        if !base.has_threshold_strategy() {
            return Err(invalid("optimizer needs a buy_dip_threshold strategy to tune"));
        }
        if base.pairs.is_empty() {
            return Err(invalid("optimizer needs a ratio pair"));
        }
        if config.initial_window == 0 {
            return Err(invalid("initial_window must be positive"));
        }
        if config.initial_trial_count == 0 || config.max_trial_count < config.initial_trial_count {
            return Err(invalid(
                "trial counts must satisfy 0 < initial_trial_count <= max_trial_count",
            ));
        }
        if !(config.parity_lower < 1.0 && 1.0 < config.parity_upper) {
            return Err(invalid("parity band must contain 1.0"));
        }

        let base = base.with_dip_params(config.initial_threshold, config.initial_window);
        Ok(Self {
            runner: BatchRunner::new(base)?,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_workers(mut self, workers: usize) -> Result<Self> {
        self.runner = self.runner.with_workers(workers)?;
        Ok(self)
    }

    /// Share an external cancellation flag
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Setting this flag stops the search before its next iteration
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Estimate the primary ratio at (threshold, window), doubling the trial
    /// count until the estimate is distinguishable from zero.
    pub fn evaluate(&self, trial_count: usize, threshold: f64, window: usize) -> Result<Evaluation> {
        let runner = self
            .runner
            .reconfigured(self.runner.config().with_dip_params(threshold, window))?;

        let mut trials = trial_count;
        let mut batches = 0;
        loop {
            let report = runner.run_batch(trials)?;
            batches += 1;
            let estimate = report
                .primary()
                .map(|p| p.estimate)
                .ok_or_else(|| invalid("optimizer needs a ratio pair"))?;

            if estimate.is_distinguishable() {
                return Ok(Evaluation { estimate, trial_count: trials, batches });
            }

            let next = trials.saturating_mul(2);
            if next > self.config.max_trial_count {
                warn!(
                    "Threshold {:.3}, window {}: ratio {:.3} ± {:.3} still not significant at {} trials",
                    threshold, window, estimate.mean, estimate.half_width, trials
                );
                return Ok(Evaluation { estimate, trial_count: trials, batches });
            }
            debug!(
                "ratio {:.3} ± {:.3} not significant, retrying with {} trials",
                estimate.mean, estimate.half_width, next
            );
            trials = next;
        }
    }

    /// Walk toward the tipping point
    pub fn search(&self) -> Result<SearchResult> {
        let first = self.evaluate(
            self.config.initial_trial_count,
            self.config.initial_threshold,
            self.config.initial_window,
        )?;
        let mut state = SearchState {
            threshold: self.config.initial_threshold,
            window: self.config.initial_window,
            step_multiplier: 1.0,
            estimate: first.estimate,
            iterations: 0,
            evaluations: first.batches,
        };

        let mut phase = Phase::Check;
        let outcome = loop {
            phase = match phase {
                Phase::Check => match self.termination(&state) {
                    Some(outcome) => Phase::Finished(outcome),
                    None => Phase::Probe,
                },
                Phase::Probe => {
                    if self.probe(&mut state)? {
                        Phase::Check
                    } else {
                        Phase::Finished(SearchOutcome::NoImprovement)
                    }
                }
                Phase::Finished(outcome) => break outcome,
            };
        };

        info!(
            "{}: threshold {:.3}, window {}, ratio {:.3} ± {:.3} after {} iterations",
            outcome,
            state.threshold,
            state.window,
            state.estimate.mean,
            state.estimate.half_width,
            state.iterations
        );

        Ok(SearchResult {
            outcome,
            threshold: state.threshold,
            window: state.window,
            mean_ratio: state.estimate.mean,
            half_width: state.estimate.half_width,
            iterations: state.iterations,
            evaluations: state.evaluations,
        })
    }

    fn termination(&self, state: &SearchState) -> Option<SearchOutcome> {
        let ratio = state.estimate.mean;
        if self.config.parity_lower < ratio && ratio < self.config.parity_upper {
            Some(SearchOutcome::Converged)
        } else if self.cancel.load(Ordering::Relaxed) {
            Some(SearchOutcome::Cancelled)
        } else if state.iterations >= self.config.max_iterations {
            Some(SearchOutcome::IterationLimit)
        } else {
            None
        }
    }

    /// Evaluate all neighbours and move to the preferred one.
    /// Returns false when none beats the current setting.
    fn probe(&self, state: &mut SearchState) -> Result<bool> {
        let direction = Direction::toward_parity(state.estimate.mean);
        info!(
            "Best so far: threshold {:.3}, window {}, ratio {:.3} ± {:.3}",
            state.threshold, state.window, state.estimate.mean, state.estimate.half_width
        );

        let turns = self.runner.config().turns;
        let mut evaluated = Vec::with_capacity(4);
        for candidate in neighbors(state.threshold, state.window, state.step_multiplier, turns) {
            let eval = self.evaluate(
                self.config.initial_trial_count,
                candidate.threshold,
                candidate.window,
            )?;
            state.evaluations += eval.batches;
            debug!(
                "{}: threshold {:.3}, window {} -> ratio {:.3} ± {:.3}",
                candidate.step,
                candidate.threshold,
                candidate.window,
                eval.estimate.mean,
                eval.estimate.half_width
            );
            evaluated.push((candidate, eval.estimate));
        }
        state.iterations += 1;

        let Some((candidate, estimate)) = select_move(state.estimate.mean, direction, &evaluated) else {
            info!("Current parameters are optimal");
            return Ok(false);
        };

        if state.advance(candidate, estimate, direction) {
            debug!("Overshot parity, step multiplier now {}", state.step_multiplier);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_config() -> SimulationConfig {
        SimulationConfig {
            turns: 50,
            seed: Some(17),
            drift: 0.0,
            volatility: 0.0,
            ..Default::default()
        }
    }

    fn small_search() -> OptimizerConfig {
        OptimizerConfig {
            initial_trial_count: 10,
            max_trial_count: 40,
            ..Default::default()
        }
    }

    #[test]
    fn test_check_ratio_from_above() {
        // heading down from 1.2
        assert!(check_ratio(1.1, Direction::Down, 1.2));
        assert!(!check_ratio(1.3, Direction::Down, 1.2));
        // crossed below 1: accepted while above the current best
        assert!(check_ratio(0.9, Direction::Down, 0.8));
        assert!(!check_ratio(0.7, Direction::Down, 0.8));
        assert!(check_ratio(1.0, Direction::Down, 0.95));
    }

    #[test]
    fn test_check_ratio_from_below() {
        assert!(check_ratio(0.9, Direction::Up, 0.8));
        assert!(!check_ratio(0.7, Direction::Up, 0.8));
        assert!(check_ratio(1.1, Direction::Up, 1.2));
        assert!(!check_ratio(1.3, Direction::Up, 1.2));
        assert!(check_ratio(1.0, Direction::Up, 1.05));
    }

    #[test]
    fn test_direction() {
        assert_eq!(Direction::toward_parity(1.5), Direction::Down);
        assert_eq!(Direction::toward_parity(1.0), Direction::Up);
        assert!(Direction::Down.overshot(0.98));
        assert!(!Direction::Down.overshot(1.02));
        assert!(Direction::Up.overshot(1.02));
    }

    #[test]
    fn test_neighbors() {
        let [t_up, t_down, w_up, w_down] = neighbors(0.9, 30, 1.0, 1095);
        assert_eq!(t_up.step, Move::ThresholdUp);
        assert!((t_up.threshold - 0.95).abs() < 1e-12);
        assert!((t_down.threshold - 0.8).abs() < 1e-12);
        assert_eq!(w_up.window, 60);
        assert_eq!(w_down.window, 15);
        assert_eq!(w_up.threshold, 0.9);
        assert_eq!(t_up.window, 30);

        // step multiplier 2 -> widen 1.5
        let [t_up, t_down, w_up, w_down] = neighbors(0.9, 30, 2.0, 40);
        assert!((t_up.threshold - 0.975).abs() < 1e-12);
        assert!((t_down.threshold - 0.85).abs() < 1e-12);
        assert_eq!(w_up.window, 40);
        assert_eq!(w_down.window, 20);
    }

    #[test]
    fn test_neighbors_are_clamped() {
        let [t_up, t_down, _, w_down] = neighbors(0.995, 3, 1.0, 100);
        assert_eq!(t_up.threshold, 0.99);
        assert!(t_down.threshold > 0.98);
        assert_eq!(w_down.window, 2);

        let [_, t_down, _, _] = neighbors(0.3, 3, 1.0, 100);
        assert_eq!(t_down.threshold, 0.0);
    }

    fn estimate(mean: f64) -> MeanEstimate {
        MeanEstimate { mean, std_error: 0.0, half_width: 0.0, samples: 10 }
    }

    #[test]
    fn test_later_acceptable_neighbor_wins() {
        let [t_up, t_down, w_up, w_down] = neighbors(0.9, 30, 1.0, 1095);
        // heading down from 1.3
        let evaluated = [
            (t_up, estimate(1.2)),
            (t_down, estimate(1.4)),
            (w_up, estimate(1.1)),
            // beats 1.3 but not the 1.1 already accepted
            (w_down, estimate(1.25)),
        ];
        let (chosen, est) = select_move(1.3, Direction::Down, &evaluated).unwrap();
        assert_eq!(chosen.step, Move::WindowUp);
        assert_eq!(chosen.window, 60);
        assert_eq!(est.mean, 1.1);

        let worse = [(t_up, estimate(1.5)), (t_down, estimate(1.4))];
        assert!(select_move(1.3, Direction::Down, &worse).is_none());
    }

    #[test]
    fn test_advance_doubles_step_on_overshoot() {
        let mut state = SearchState {
            threshold: 0.9,
            window: 30,
            step_multiplier: 1.0,
            estimate: estimate(1.2),
            iterations: 1,
            evaluations: 5,
        };
        let [t_up, _, _, w_down] = neighbors(0.9, 30, 1.0, 1095);

        assert!(!state.advance(t_up, estimate(1.05), Direction::Down));
        assert_eq!(state.step_multiplier, 1.0);
        assert!((state.threshold - 0.95).abs() < 1e-12);

        assert!(state.advance(w_down, estimate(0.97), Direction::Down));
        assert_eq!(state.step_multiplier, 2.0);
        assert_eq!(state.window, 15);
        assert_eq!(state.estimate.mean, 0.97);

        // crossing back up doubles again
        assert!(state.advance(t_up, estimate(1.02), Direction::Up));
        assert_eq!(state.step_multiplier, 4.0);
    }

    #[test]
    fn test_search_moves_away_from_start() {
        let config = SimulationConfig {
            turns: 200,
            seed: Some(3),
            volatility: 0.02,
            ..Default::default()
        };
        let search = OptimizerConfig {
            initial_threshold: 0.7,
            initial_trial_count: 40,
            max_trial_count: 160,
            ..Default::default()
        };
        let result = ParameterOptimizer::new(config, search).unwrap().search().unwrap();
        assert!(result.iterations >= 1);
        assert!(result.evaluations >= 5);
        assert!(result.threshold != 0.7 || result.window != 30);
        assert_ne!(result.outcome, SearchOutcome::Cancelled);
    }

    #[test]
    fn test_degenerate_market_converges_immediately() {
        // flat price: a threshold of 1.0 buys every turn, same as the regular buyer
        let search = OptimizerConfig {
            initial_threshold: 1.0,
            ..small_search()
        };
        let result = ParameterOptimizer::new(flat_config(), search)
            .unwrap()
            .search()
            .unwrap();
        assert_eq!(result.outcome, SearchOutcome::Converged);
        assert_eq!(result.evaluations, 1);
        assert_eq!(result.iterations, 0);
        assert!(0.99 < result.mean_ratio && result.mean_ratio < 1.01);
        assert_eq!(result.threshold, 1.0);
    }

    fn rising_config() -> SimulationConfig {
        SimulationConfig {
            turns: 50,
            seed: Some(5),
            drift: 0.01,
            volatility: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_no_improvement_in_rising_market() {
        // steadily rising prices never dip below any threshold <= 0.99
        let search = OptimizerConfig {
            initial_threshold: 0.9,
            ..small_search()
        };
        let result = ParameterOptimizer::new(rising_config(), search)
            .unwrap()
            .search()
            .unwrap();
        assert_eq!(result.outcome, SearchOutcome::NoImprovement);
        assert_eq!(result.iterations, 1);
        assert_eq!(result.evaluations, 5);
        assert!(result.mean_ratio > 1.01);
        assert_eq!(result.threshold, 0.9);
        assert_eq!(result.window, 30);
    }

    #[test]
    fn test_cancel_and_iteration_limit() {
        let optimizer = ParameterOptimizer::new(rising_config(), small_search()).unwrap();
        optimizer.cancel_flag().store(true, Ordering::Relaxed);
        let result = optimizer.search().unwrap();
        assert_eq!(result.outcome, SearchOutcome::Cancelled);
        assert_eq!(result.iterations, 0);

        let limited = OptimizerConfig { max_iterations: 0, ..small_search() };
        let result = ParameterOptimizer::new(rising_config(), limited)
            .unwrap()
            .search()
            .unwrap();
        assert_eq!(result.outcome, SearchOutcome::IterationLimit);
    }

    #[test]
    fn test_evaluate_stops_once_significant() {
        let mut config = SimulationConfig {
            turns: 30,
            seed: Some(1),
            volatility: 0.02,
            ..Default::default()
        };
        config.pairs = vec![crate::config::RatioPair::new("regular", "never")];
        let optimizer = ParameterOptimizer::new(config, small_search()).unwrap();
        let eval = optimizer.evaluate(10, 0.95, 10).unwrap();
        assert_eq!(eval.trial_count, 10);
        assert_eq!(eval.batches, 1);
        assert!(eval.estimate.mean > 0.0);
    }

    #[test]
    fn test_rejects_config_without_threshold_strategy() {
        let mut config = SimulationConfig::default();
        config.strategies.retain(|s| s.label != "dip");
        config.pairs = vec![crate::config::RatioPair::new("regular", "never")];
        assert!(ParameterOptimizer::new(config, OptimizerConfig::default()).is_err());

        let bad = OptimizerConfig { initial_trial_count: 0, ..Default::default() };
        assert!(ParameterOptimizer::new(SimulationConfig::default(), bad).is_err());
    }
}
