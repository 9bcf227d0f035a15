// Library crate - simulation kernel, batch statistics and tipping-point search

pub mod config;
pub mod error;
pub mod simulation;
pub mod analysis;
pub mod report;

// Re-export commonly used types
pub use config::{RatioPair, SimulationConfig, StrategyKind, StrategySpec};
pub use error::{Result, SimError};
pub use simulation::{run_trial, PriceModel, TrialResult};
pub use analysis::{AggregateReport, BatchRunner, OptimizerConfig, ParameterOptimizer, SearchResult};
