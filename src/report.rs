//! Report sinks
//!
//! Console tables and file exports for already-computed results.

use serde::Serialize;
use std::path::Path;

use crate::analysis::{AggregateReport, PercentileBand, SearchResult};
use crate::config::SimulationConfig;
use crate::error::Result;
use crate::simulation::{TrialResult, TrialTrace};

fn band_row(name: &str, metric: &str, band: &PercentileBand) {
    let cells: Vec<String> = band.values().iter().map(|v| format!("{:>12.2}", v)).collect();
    println!("  {:24} {:22} {}", name, metric, cells.join(" "));
}

fn band_header() {
    println!(
        "  {:24} {:22} {:>12} {:>12} {:>12} {:>12} {:>12}",
        "Strategy", "Metric", "5th", "25th", "50th", "75th", "95th"
    );
    println!("  {}", "-".repeat(114));
}

/// Print the parameters a batch or search ran with
pub fn print_config(config: &SimulationConfig, trial_count: usize) {
    println!("\n{}", "=".repeat(70));
    println!(
        "{} trials x {} turns ({} price model)",
        trial_count, config.turns, config.price_model
    );
    println!("{}", "=".repeat(70));
    println!("  Starting cash:    {:.2}", config.starting_cash);
    println!("  Salary:           {:.2} every {} turns", config.salary, config.salary_interval);
    println!("  Starting price:   {:.2}", config.starting_price);
    println!("  Drift:            {}", config.drift);
    println!("  Volatility:       {}", config.volatility);
    for spec in &config.strategies {
        println!("  {:17} {}", format!("{}:", spec.label), spec.kind);
    }
}

pub fn print_batch_report(report: &AggregateReport) {
    println!("\nRESULTS ({} trials):", report.trial_count);

    for pair in &report.pairs {
        println!(
            "  {}: mean net worth ratio {:.3} ± {:.3} (95%)",
            pair.pair, pair.estimate.mean, pair.estimate.half_width
        );
    }

    println!();
    band_header();
    for pair in &report.pairs {
        band_row(&pair.pair.to_string(), "Net Worth Ratio", &pair.ratio);
    }
    for s in &report.strategies {
        band_row(&s.label, "Net Worth", &s.net_worth);
        band_row(&s.label, "Average Price Paid", &s.average_price);
        band_row(&s.label, "Turns with Buy", &s.buy_count);
        band_row(&s.label, "Buys at Peak", &s.peak_buy_count);
        band_row(&s.label, "% Turns at Peak", &PercentileBand {
            p5: s.peak_turn_fraction.p5 * 100.0,
            p25: s.peak_turn_fraction.p25 * 100.0,
            p50: s.peak_turn_fraction.p50 * 100.0,
            p75: s.peak_turn_fraction.p75 * 100.0,
            p95: s.peak_turn_fraction.p95 * 100.0,
        });
    }

    for pair in &report.pairs {
        println!("\n  Trials at ratio percentiles ({}):", pair.pair);
        println!(
            "  {:>6} {:>12} {:>12} {:>12} {:>12} {:>14} {:>14}",
            "Pct", "Seed", "NW Ratio", "Price Ratio", "Buy Ratio", "NW (num)", "NW (den)"
        );
        for r in &pair.ranked {
            println!(
                "  {:>5.0}% {:>12} {:>12.3} {:>12.3} {:>12.3} {:>14.2} {:>14.2}",
                r.percentile * 100.0,
                r.seed,
                r.net_worth_ratio,
                r.price_paid_ratio,
                r.buy_count_ratio,
                r.numerator.net_worth,
                r.denominator.net_worth
            );
        }
    }
}

pub fn print_trial(result: &TrialResult) {
    println!("\nTRIAL seed {} ({} turns), final price {:.2}", result.seed, result.turns, result.final_price);
    println!(
        "  {:16} {:>10} {:>14} {:>14} {:>10} {:>10}",
        "Strategy", "Shares", "Cash", "Net Worth", "Avg Price", "Buys"
    );
    for o in &result.outcomes {
        println!(
            "  {:16} {:>10} {:>14.2} {:>14.2} {:>10.2} {:>10}",
            o.label, o.holdings.shares, o.holdings.cash, o.net_worth, o.average_price, o.holdings.buy_count
        );
    }
}

pub fn print_search_result(result: &SearchResult, config: &SimulationConfig) {
    println!("\n{}", "=".repeat(60));
    println!("SEARCH {}", result.outcome);
    println!("{}", "=".repeat(60));
    println!("  Ratio:       {:.3} ± {:.3}", result.mean_ratio, result.half_width);
    println!("  Drift:       {}", config.drift);
    println!("  Volatility:  {}", config.volatility);
    println!("  Threshold:   {:.3}", result.threshold);
    println!("  Window:      {}", result.window);
    println!("  Iterations:  {} ({} batches)", result.iterations, result.evaluations);
}

#[derive(Serialize)]
struct TrialRow<'a> {
    seed: u64,
    strategy: &'a str,
    final_price: f64,
    shares: u64,
    cash: f64,
    net_worth: f64,
    average_price: f64,
    buy_count: usize,
    peak_buy_count: usize,
    peak_turn_count: usize,
}

/// One CSV row per strategy per trial
pub fn write_trials_csv(path: &Path, trials: &[TrialResult]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for t in trials {
        for o in &t.outcomes {
            writer.serialize(TrialRow {
                seed: t.seed,
                strategy: &o.label,
                final_price: t.final_price,
                shares: o.holdings.shares,
                cash: o.holdings.cash,
                net_worth: o.net_worth,
                average_price: o.average_price,
                buy_count: o.holdings.buy_count,
                peak_buy_count: o.holdings.peak_buy_count,
                peak_turn_count: o.holdings.peak_turn_count,
            })?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// Turn, price, then per strategy a buy flag and its buy level when it has one
pub fn write_trace_csv(path: &Path, trace: &TrialTrace) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;

    let mut header = vec!["turn".to_string(), "price".to_string()];
    for s in &trace.strategies {
        header.push(format!("{}_buy", s.label));
        if s.reference_levels.is_some() {
            header.push(format!("{}_level", s.label));
        }
    }
    writer.write_record(&header)?;

    for (turn, price) in trace.prices.iter().enumerate() {
        let mut record = vec![turn.to_string(), price.to_string()];
        for s in &trace.strategies {
            let bought = s.buy_turns.binary_search(&turn).is_ok();
            record.push(u8::from(bought).to_string());
            if let Some(levels) = &s.reference_levels {
                record.push(levels.get(turn).map(|l| l.to_string()).unwrap_or_default());
            }
        }
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), value)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::run_traced;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("dip-sim-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_trace_csv_has_one_row_per_turn() {
        let config = SimulationConfig { turns: 25, ..Default::default() };
        let (_, trace) = run_traced(&config, Some(4)).unwrap();
        let path = temp_path("trace.csv");
        write_trace_csv(&path, &trace).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[0], "turn");
        assert!(headers.iter().any(|h| h == "dip_level"));
        assert_eq!(reader.records().count(), 25);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_trials_csv_rows() {
        let config = SimulationConfig { turns: 10, ..Default::default() };
        let trials: Vec<TrialResult> = (0..3)
            .map(|seed| crate::simulation::run_trial(&config, Some(seed)).unwrap())
            .collect();
        let path = temp_path("trials.csv");
        write_trials_csv(&path, &trials).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        assert_eq!(reader.records().count(), 3 * config.strategies.len());
        std::fs::remove_file(&path).ok();
    }
}
