//! Simulation kernel
//!
//! - Price process (GBM or legacy additive)
//! - Strategy variants sharing one per-turn protocol
//! - Trial runner driving all strategies over one shared price path

pub mod price;
pub mod strategy;
pub mod trial;

pub use price::PriceModel;
pub use strategy::{Holdings, Strategy};
pub use trial::{
    random_seed, run_trial, run_traced, StrategyOutcome, StrategyTrace, Trial, TrialPhase,
    TrialResult, TrialTrace,
};
