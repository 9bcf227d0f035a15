//! Statistics over many trials
//!
//! - Batch runner (parallel trials) and aggregate report
//! - Percentile / mean-with-interval helpers
//! - Tipping-point optimizer

pub mod aggregate;
pub mod optimizer;
pub mod stats;

pub use aggregate::{
    aggregate, AggregateReport, BatchRunner, OutcomeMetrics, PairReport, RankedTrial,
    StrategySummary,
};
pub use optimizer::{
    check_ratio, neighbors, select_move, Candidate, Direction, Evaluation, Move, OptimizerConfig,
    ParameterOptimizer, SearchOutcome, SearchResult, SearchState,
};
pub use stats::{MeanEstimate, PercentileBand, Z_95_ONE_SIDED};
