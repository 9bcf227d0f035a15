//! Batch statistics
//!
//! Values may contain `+inf` (ratio against a zero net worth). Nothing here
//! panics on non-finite input; results are infinite or NaN instead.

use serde::{Deserialize, Serialize};

/// z-score of the 95th percentile of N(0,1).
///
/// Used as a symmetric half-width multiplier. A two-sided 95% interval would
/// use 1.96; this keeps the narrower one-sided value.
pub const Z_95_ONE_SIDED: f64 = 1.644_853_626_951_472_2;

/// Ranks reported in every percentile band
pub const BAND_PERCENTILES: [f64; 5] = [0.05, 0.25, 0.50, 0.75, 0.95];

/// `numerator / denominator`, `+inf` when the denominator is zero
pub fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        f64::INFINITY
    } else {
        numerator / denominator
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Standard error of the mean, sample standard deviation (n - 1)
pub fn std_error(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return f64::NAN;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (n - 1) as f64;
    variance.sqrt() / (n as f64).sqrt()
}

/// Sort ascending; `+inf` sorts last, NaN after it
pub fn sort_values(values: &mut [f64]) {
    values.sort_by(|a, b| a.total_cmp(b));
}

/// Linear-interpolation percentile over an ascending slice, `p` in [0, 1]
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let p = p.clamp(0.0, 1.0);
    let idx = p * (sorted.len() - 1) as f64;
    let lo = idx.floor() as usize;
    let hi = idx.ceil() as usize;
    let (a, b) = (sorted[lo], sorted[hi]);
    let w = idx - lo as f64;
    // exact hits and equal neighbours avoid inf * 0 and inf - inf
    if lo == hi || w == 0.0 || a == b {
        return a;
    }
    a + (b - a) * w
}

/// 5th/25th/50th/75th/95th percentiles of one metric
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentileBand {
    pub p5: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p95: f64,
}

impl PercentileBand {
    pub fn from_values(mut values: Vec<f64>) -> Self {
        sort_values(&mut values);
        Self::from_sorted(&values)
    }

    pub fn from_sorted(sorted: &[f64]) -> Self {
        let [p5, p25, p50, p75, p95] = BAND_PERCENTILES.map(|p| percentile(sorted, p));
        Self { p5, p25, p50, p75, p95 }
    }

    pub fn values(&self) -> [f64; 5] {
        [self.p5, self.p25, self.p50, self.p75, self.p95]
    }
}

/// Sample mean with a normal-approximation half-width
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeanEstimate {
    pub mean: f64,
    pub std_error: f64,
    pub half_width: f64,
    pub samples: usize,
}

impl MeanEstimate {
    pub fn from_values(values: &[f64]) -> Self {
        let std_error = std_error(values);
        Self {
            mean: mean(values),
            std_error,
            half_width: Z_95_ONE_SIDED * std_error,
            samples: values.len(),
        }
    }

    /// False only while the interval still covers zero. NaN counts as settled.
    pub fn is_distinguishable(&self) -> bool {
        !(self.mean.abs() - self.half_width < 0.0)
    }
}
