//! Synthetic price process
//!
//! Each turn moves the price by one random shock drawn from the trial's own
//! generator, so a trial replays exactly from its seed.

use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::error::{invalid, Result};

/// How a price evolves from one turn to the next
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PriceModel {
    /// `p * exp(drift - vol^2/2 + vol*w)`. Always positive.
    GeometricBrownian,
    /// `max(p + p * (drift + vol*w), floor)`. Legacy arithmetic update.
    Additive { floor: f64 },
}

impl Default for PriceModel {
    fn default() -> Self {
        Self::GeometricBrownian
    }
}

impl std::fmt::Display for PriceModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GeometricBrownian => write!(f, "GBM"),
            Self::Additive { floor } => write!(f, "Additive (floor {})", floor),
        }
    }
}

impl PriceModel {
    /// Legacy model floored at 1.0
    pub fn additive() -> Self {
        Self::Additive { floor: 1.0 }
    }

    pub fn validate(&self) -> Result<()> {
        match *self {
            Self::GeometricBrownian => Ok(()),
            Self::Additive { floor } if floor.is_finite() && floor > 0.0 => Ok(()),
            Self::Additive { floor } => Err(invalid(format!(
                "additive price floor must be positive, got {}",
                floor
            ))),
        }
    }

    /// Draw the next price
    pub fn next_price<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        price: f64,
        drift: f64,
        volatility: f64,
    ) -> f64 {
        let w: f64 = rng.sample(StandardNormal);
        match *self {
            Self::GeometricBrownian => {
                price * (drift - 0.5 * volatility * volatility + volatility * w).exp()
            }
            Self::Additive { floor } => (price + price * (drift + volatility * w)).max(floor),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_gbm_stays_positive() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut price = 100.0;
        for _ in 0..10_000 {
            price = PriceModel::GeometricBrownian.next_price(&mut rng, price, -0.01, 0.2);
            assert!(price > 0.0);
        }
    }

    #[test]
    fn test_zero_volatility_is_deterministic_growth() {
        let mut rng = StdRng::seed_from_u64(1);
        let flat = PriceModel::GeometricBrownian.next_price(&mut rng, 100.0, 0.0, 0.0);
        assert_eq!(flat, 100.0);

        let grown = PriceModel::GeometricBrownian.next_price(&mut rng, 100.0, 0.01, 0.0);
        assert!((grown - 100.0 * 0.01f64.exp()).abs() < 1e-9);

        let additive = PriceModel::additive().next_price(&mut rng, 100.0, 0.01, 0.0);
        assert!((additive - 101.0).abs() < 1e-9);
    }

    #[test]
    fn test_additive_is_floored() {
        let mut rng = StdRng::seed_from_u64(3);
        let model = PriceModel::Additive { floor: 0.5 };
        // a -300% drift would go negative without the floor
        let price = model.next_price(&mut rng, 10.0, -3.0, 0.0);
        assert_eq!(price, 0.5);
    }

    #[test]
    fn test_same_seed_same_path() {
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        let (mut pa, mut pb) = (100.0, 100.0);
        for _ in 0..100 {
            pa = PriceModel::GeometricBrownian.next_price(&mut a, pa, 0.0006, 0.0094);
            pb = PriceModel::GeometricBrownian.next_price(&mut b, pb, 0.0006, 0.0094);
        }
        assert_eq!(pa.to_bits(), pb.to_bits());
    }

    #[test]
    fn test_invalid_floor() {
        assert!(PriceModel::Additive { floor: 0.0 }.validate().is_err());
        assert!(PriceModel::additive().validate().is_ok());
    }
}
