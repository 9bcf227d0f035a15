use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use dip_sim::analysis::{BatchRunner, OptimizerConfig, ParameterOptimizer};
use dip_sim::config::{SimulationConfig, StrategyKind};
use dip_sim::report;
use dip_sim::simulation::{self, PriceModel};

#[derive(Parser, Debug)]
#[command(name = "dip-sim")]
#[command(about = "Monte Carlo comparison of buying regularly vs buying the dip")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// JSON simulation config; flags below override it
    #[arg(short, long, global = true, env = "DIP_SIM_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    /// Dedicated worker threads (default: one per core)
    #[arg(short, long, global = true, env = "DIP_SIM_WORKERS")]
    workers: Option<usize>,

    /// Print verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(clap::Args, Debug)]
struct Overrides {
    /// Turns (days) per trial
    #[arg(long, global = true)]
    turns: Option<usize>,

    /// Seed for a single trial, or for the whole batch
    #[arg(long, global = true)]
    seed: Option<u64>,

    #[arg(long, global = true)]
    starting_price: Option<f64>,

    #[arg(long, global = true)]
    starting_cash: Option<f64>,

    #[arg(long, global = true)]
    salary: Option<f64>,

    /// Turns between salary payments
    #[arg(long, global = true)]
    salary_interval: Option<usize>,

    /// Per-turn price drift
    #[arg(long, global = true, allow_hyphen_values = true)]
    drift: Option<f64>,

    /// Per-turn price volatility
    #[arg(long, global = true)]
    volatility: Option<f64>,

    /// Use the legacy additive price model (floored at 1.0)
    #[arg(long, global = true)]
    additive: bool,

    /// Dip buyer threshold (fraction of rolling mean)
    #[arg(long, global = true)]
    threshold: Option<f64>,

    /// Dip buyer rolling window (turns)
    #[arg(long, global = true)]
    window: Option<usize>,

    /// Also run a trend dip buyer after this many declines
    #[arg(long, global = true)]
    trend: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one trial and print every strategy's final state
    Trial {
        /// Write the per-turn price path and buy levels as CSV
        #[arg(long)]
        trace_out: Option<PathBuf>,

        /// Write the trial result as JSON
        #[arg(long)]
        json_out: Option<PathBuf>,
    },

    /// Run many trials and report percentiles and ratios
    Batch {
        /// Number of trials
        #[arg(short = 'n', long, default_value = "1000", env = "DIP_SIM_TRIALS")]
        trials: usize,

        /// Write one row per strategy per trial as CSV
        #[arg(long)]
        csv_out: Option<PathBuf>,

        /// Write the aggregate report as JSON
        #[arg(long)]
        json_out: Option<PathBuf>,
    },

    /// Search for the dip parameters where both strategies break even
    Optimize {
        /// Trials per evaluation before doubling
        #[arg(short = 'n', long, default_value = "1000", env = "DIP_SIM_TRIALS")]
        trials: usize,

        /// Upper bound on trials per evaluation
        #[arg(long, default_value = "256000")]
        max_trials: usize,

        #[arg(long, default_value = "100")]
        max_iterations: usize,

        /// Write the search result as JSON
        #[arg(long)]
        json_out: Option<PathBuf>,
    },
}

impl Overrides {
    fn apply(&self, config: &mut SimulationConfig) {
        if let Some(turns) = self.turns {
            config.turns = turns;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        if let Some(v) = self.starting_price {
            config.starting_price = v;
        }
        if let Some(v) = self.starting_cash {
            config.starting_cash = v;
        }
        if let Some(v) = self.salary {
            config.salary = v;
        }
        if let Some(v) = self.salary_interval {
            config.salary_interval = v;
        }
        if let Some(v) = self.drift {
            config.drift = v;
        }
        if let Some(v) = self.volatility {
            config.volatility = v;
        }
        if self.additive {
            config.price_model = PriceModel::additive();
        }
        if self.threshold.is_some() || self.window.is_some() {
            let (threshold, window) = current_dip_params(config);
            *config = config.with_dip_params(
                self.threshold.unwrap_or(threshold),
                self.window.unwrap_or(window),
            );
        }
        if let Some(trend_length) = self.trend {
            *config = config.clone().with_trend_buyer(trend_length);
        }
    }
}

fn current_dip_params(config: &SimulationConfig) -> (f64, usize) {
    config
        .strategies
        .iter()
        .find_map(|s| match s.kind {
            StrategyKind::BuyDipThreshold { threshold, window } => Some((threshold, window)),
            _ => None,
        })
        .unwrap_or((0.95, 30))
}

fn load_config(args: &Args) -> Result<SimulationConfig> {
    let mut config = match &args.config {
        Some(path) => SimulationConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => SimulationConfig::default(),
    };
    args.overrides.apply(&mut config);
    config.validate().context("Invalid simulation config")?;
    Ok(config)
}

fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let directive = if args.verbose { "dip_sim=debug" } else { "dip_sim=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(directive.parse()?),
        )
        .init();

    let config = load_config(&args)?;

    match &args.command {
        Commands::Trial { trace_out, json_out } => {
            let (result, trace) = simulation::run_traced(&config, None)?;
            report::print_trial(&result);

            if let Some(path) = trace_out {
                report::write_trace_csv(path, &trace)
                    .with_context(|| format!("Failed to write trace to {:?}", path))?;
                info!("Trace written to {:?}", path);
            }
            if let Some(path) = json_out {
                report::write_json(path, &result)?;
                info!("Trial written to {:?}", path);
            }
        }

        Commands::Batch { trials, csv_out, json_out } => {
            let mut runner = BatchRunner::new(config.clone())?;
            if let Some(workers) = args.workers {
                runner = runner.with_workers(workers)?;
            }

            anyhow::ensure!(*trials > 0, "trials must be positive");
            report::print_config(&config, *trials);
            let start = std::time::Instant::now();
            let seeds = runner.draw_seeds(*trials);
            let results = runner.run_trials(&seeds)?;
            let aggregate = dip_sim::analysis::aggregate(&config, &results)?;
            info!(
                "{} trials in {:.1}s",
                results.len(),
                start.elapsed().as_secs_f64()
            );

            report::print_batch_report(&aggregate);

            if let Some(path) = csv_out {
                report::write_trials_csv(path, &results)
                    .with_context(|| format!("Failed to write trials to {:?}", path))?;
                info!("Trials written to {:?}", path);
            }
            if let Some(path) = json_out {
                report::write_json(path, &aggregate)?;
                info!("Report written to {:?}", path);
            }
        }

        Commands::Optimize { trials, max_trials, max_iterations, json_out } => {
            let (threshold, window) = current_dip_params(&config);
            let search = OptimizerConfig {
                initial_threshold: threshold,
                initial_window: window,
                initial_trial_count: *trials,
                max_trial_count: *max_trials,
                max_iterations: *max_iterations,
                ..Default::default()
            };

            report::print_config(&config, *trials);
            let mut optimizer = ParameterOptimizer::new(config.clone(), search)?;
            if let Some(workers) = args.workers {
                optimizer = optimizer.with_workers(workers)?;
            }

            let result = optimizer.search()?;
            report::print_search_result(&result, &config);

            if let Some(path) = json_out {
                report::write_json(path, &result)?;
                info!("Search result written to {:?}", path);
            }
        }
    }

    Ok(())
}
