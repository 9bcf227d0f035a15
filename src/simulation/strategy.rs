//! Investment strategies
//!
//! Every strategy runs the same per-turn protocol:
//! 1. `update` - observe the new price (peak tracking + variant state)
//! 2. `decide` - variant buy signal against the price just observed
//! 3. `apply_buy` - convert cash into whole shares when the signal fires
//!
//! Shared bookkeeping (cash, shares, peaks, buy counts) lives in `Holdings`,
//! which each variant owns. Strategies never sell.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::config::StrategyKind;

/// Cash, shares and buy history of one strategy in one trial
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holdings {
    pub cash: f64,
    pub shares: u64,
    pub total_spent: f64,
    pub last_price: f64,
    pub peak_price: f64,
    /// Turns on which a new peak price was set
    pub peak_turn_count: usize,
    /// Turns on which at least one share was bought
    pub buy_count: usize,
    /// Buys made at the peak price seen so far
    pub peak_buy_count: usize,
}

impl Holdings {
    pub fn new(cash: f64) -> Self {
        Self {
            cash,
            shares: 0,
            total_spent: 0.0,
            last_price: 0.0,
            peak_price: 0.0,
            peak_turn_count: 0,
            buy_count: 0,
            peak_buy_count: 0,
        }
    }

    pub fn deposit(&mut self, amount: f64) {
        self.cash += amount;
    }

    /// Record the latest price and track new peaks
    pub fn observe(&mut self, price: f64) {
        self.last_price = price;
        if price > self.peak_price {
            self.peak_price = price;
            self.peak_turn_count += 1;
        }
    }

    /// Spend as much cash as possible on whole shares. Returns shares bought.
    pub fn buy(&mut self, price: f64) -> u64 {
        let mut shares = (self.cash / price).floor();
        // cash / price can round up onto the next integer
        if shares > 0.0 && shares * price > self.cash {
            shares -= 1.0;
        }
        let shares = shares.max(0.0) as u64;

        if shares > 0 {
            self.buy_count += 1;
            if price >= self.peak_price {
                self.peak_buy_count += 1;
            }
        }

        let cost = price * shares as f64;
        self.cash -= cost;
        self.total_spent += cost;
        self.shares += shares;
        shares
    }

    /// Shares valued at the last observed price, plus cash
    pub fn net_worth(&self) -> f64 {
        self.shares as f64 * self.last_price + self.cash
    }

    /// Average price paid per share, 0 when nothing was bought
    pub fn average_price(&self) -> f64 {
        if self.shares > 0 {
            self.total_spent / self.shares as f64
        } else {
            0.0
        }
    }
}

/// Per-turn protocol shared by every strategy variant
pub trait Strategy: Send + std::fmt::Debug {
    fn kind(&self) -> StrategyKind;

    fn holdings(&self) -> &Holdings;

    fn holdings_mut(&mut self) -> &mut Holdings;

    /// Observe the price for `turn`
    fn update(&mut self, price: f64, turn: usize);

    /// Buy signal for the price just observed
    fn decide(&self, price: f64) -> bool;

    /// Price level the strategy currently buys at or below, if it has one
    fn reference_level(&self) -> Option<f64> {
        None
    }

    /// Buy whole shares when `decide` fires. Returns shares bought.
    fn apply_buy(&mut self, price: f64, _turn: usize) -> u64 {
        if self.decide(price) {
            self.holdings_mut().buy(price)
        } else {
            0
        }
    }

    /// Full turn: update, then decide and buy
    fn assess_and_buy(&mut self, price: f64, turn: usize) -> u64 {
        self.update(price, turn);
        self.apply_buy(price, turn)
    }
}

/// Create the strategy described by `kind` with `cash` to start
pub fn build(kind: &StrategyKind, cash: f64) -> Box<dyn Strategy> {
    match *kind {
        StrategyKind::BuyRegularly => Box::new(RegularBuyer::new(cash)),
        StrategyKind::NeverBuy => Box::new(NeverBuyer::new(cash)),
        StrategyKind::BuyDipThreshold { threshold, window } => {
            Box::new(ThresholdDipBuyer::new(cash, threshold, window))
        }
        StrategyKind::BuyDipTrend { trend_length } => {
            Box::new(TrendDipBuyer::new(cash, trend_length))
        }
    }
}

/// Buys with every dollar, every turn
#[derive(Debug, Clone)]
pub struct RegularBuyer {
    holdings: Holdings,
}

impl RegularBuyer {
    pub fn new(cash: f64) -> Self {
        Self {
            holdings: Holdings::new(cash),
        }
    }
}

impl Strategy for RegularBuyer {
    fn kind(&self) -> StrategyKind {
        StrategyKind::BuyRegularly
    }

    fn holdings(&self) -> &Holdings {
        &self.holdings
    }

    fn holdings_mut(&mut self) -> &mut Holdings {
        &mut self.holdings
    }

    fn update(&mut self, price: f64, _turn: usize) {
        self.holdings.observe(price);
    }

    fn decide(&self, _price: f64) -> bool {
        true
    }
}

/// Baseline that only accumulates cash
#[derive(Debug, Clone)]
pub struct NeverBuyer {
    holdings: Holdings,
}

impl NeverBuyer {
    pub fn new(cash: f64) -> Self {
        Self {
            holdings: Holdings::new(cash),
        }
    }
}

impl Strategy for NeverBuyer {
    fn kind(&self) -> StrategyKind {
        StrategyKind::NeverBuy
    }

    fn holdings(&self) -> &Holdings {
        &self.holdings
    }

    fn holdings_mut(&mut self) -> &mut Holdings {
        &mut self.holdings
    }

    fn update(&mut self, price: f64, _turn: usize) {
        self.holdings.observe(price);
    }

    fn decide(&self, _price: f64) -> bool {
        false
    }
}

/// Buys when the price drops to `threshold` times its rolling mean.
///
/// The rolling mean is the strategy's belief about the "real value" of the
/// asset; it covers the last `window` observed prices, current one included.
#[derive(Debug, Clone)]
pub struct ThresholdDipBuyer {
    holdings: Holdings,
    threshold: f64,
    window: usize,
    prices: VecDeque<f64>,
}

impl ThresholdDipBuyer {
    pub fn new(cash: f64, threshold: f64, window: usize) -> Self {
        Self {
            holdings: Holdings::new(cash),
            threshold,
            window,
            prices: VecDeque::with_capacity(window + 1),
        }
    }

    /// Mean of the rolling window, `None` before the first price
    pub fn rolling_mean(&self) -> Option<f64> {
        if self.prices.is_empty() {
            return None;
        }
        Some(self.prices.iter().sum::<f64>() / self.prices.len() as f64)
    }

    pub fn window_prices(&self) -> impl Iterator<Item = &f64> {
        self.prices.iter()
    }
}

impl Strategy for ThresholdDipBuyer {
    fn kind(&self) -> StrategyKind {
        StrategyKind::BuyDipThreshold {
            threshold: self.threshold,
            window: self.window,
        }
    }

    fn holdings(&self) -> &Holdings {
        &self.holdings
    }

    fn holdings_mut(&mut self) -> &mut Holdings {
        &mut self.holdings
    }

    fn update(&mut self, price: f64, _turn: usize) {
        self.holdings.observe(price);
        self.prices.push_back(price);
        while self.prices.len() > self.window {
            self.prices.pop_front();
        }
    }

    fn decide(&self, price: f64) -> bool {
        match self.reference_level() {
            Some(level) => level >= price,
            None => false,
        }
    }

    fn reference_level(&self) -> Option<f64> {
        self.rolling_mean().map(|mean| mean * self.threshold)
    }
}

/// Buys once the price has fallen `trend_length` turns in a row
#[derive(Debug, Clone)]
pub struct TrendDipBuyer {
    holdings: Holdings,
    trend_length: usize,
    trend_count: usize,
}

impl TrendDipBuyer {
    pub fn new(cash: f64, trend_length: usize) -> Self {
        Self {
            holdings: Holdings::new(cash),
            trend_length,
            trend_count: 0,
        }
    }

    pub fn trend_count(&self) -> usize {
        self.trend_count
    }
}

impl Strategy for TrendDipBuyer {
    fn kind(&self) -> StrategyKind {
        StrategyKind::BuyDipTrend {
            trend_length: self.trend_length,
        }
    }

    fn holdings(&self) -> &Holdings {
        &self.holdings
    }

    fn holdings_mut(&mut self) -> &mut Holdings {
        &mut self.holdings
    }

    fn update(&mut self, price: f64, _turn: usize) {
        // compare against the previous turn before observe() overwrites it
        if price < self.holdings.last_price {
            self.trend_count += 1;
        } else {
            self.trend_count = 0;
        }
        self.holdings.observe(price);
    }

    fn decide(&self, _price: f64) -> bool {
        self.trend_count >= self.trend_length
    }
}
