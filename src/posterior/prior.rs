use std::f64::consts::PI;

use rand::Rng;
use rand_distr::{Cauchy, Distribution, Gamma, LogNormal, Normal};
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_8;

/// A univariate prior distribution
///
/// Outside the support the log-density is negative infinity and the gradient is zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LogPrior {
    /// Uniform on the closed interval `[lower, upper]`
    Uniform { lower: f64, upper: f64 },
    Normal { mean: f64, sd: f64 },
    /// `ln x ~ N(mean_log, sd_log)`
    LogNormal { mean_log: f64, sd_log: f64 },
    /// Cauchy folded at `location`, supported on `[location, ∞)`
    HalfCauchy { location: f64, scale: f64 },
    /// Shape-rate parametrisation
    Gamma { shape: f64, rate: f64 },
}

impl LogPrior {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let valid = match *self {
            LogPrior::Uniform { lower, upper } => {
                lower.is_finite() && upper.is_finite() && lower < upper
            }
            LogPrior::Normal { mean, sd } => mean.is_finite() && sd > 0.0,
            LogPrior::LogNormal { mean_log, sd_log } => mean_log.is_finite() && sd_log > 0.0,
            LogPrior::HalfCauchy { location, scale } => location.is_finite() && scale > 0.0,
            LogPrior::Gamma { shape, rate } => shape > 0.0 && rate > 0.0,
        };
        if valid {
            Ok(())
        } else {
            Err(ConfigurationError::InvalidSetting(format!(
                "invalid prior {:?}",
                self
            )))
        }
    }

    pub fn log_pdf(&self, x: f64) -> f64 {
        if !x.is_finite() {
            return f64::NEG_INFINITY;
        }
        match *self {
            LogPrior::Uniform { lower, upper } => {
                if x < lower || x > upper {
                    f64::NEG_INFINITY
                } else {
                    -(upper - lower).ln()
                }
            }
            LogPrior::Normal { mean, sd } => {
                -LN_SQRT_2PI - sd.ln() - (x - mean).powi(2) / (2.0 * sd * sd)
            }
            LogPrior::LogNormal { mean_log, sd_log } => {
                if x <= 0.0 {
                    return f64::NEG_INFINITY;
                }
                let ln_x = x.ln();
                -LN_SQRT_2PI - sd_log.ln() - ln_x - (ln_x - mean_log).powi(2) / (2.0 * sd_log * sd_log)
            }
            LogPrior::HalfCauchy { location, scale } => {
                if x < location {
                    return f64::NEG_INFINITY;
                }
                let z = (x - location) / scale;
                (2.0 / (PI * scale)).ln() - (1.0 + z * z).ln()
            }
            LogPrior::Gamma { shape, rate } => {
                if x <= 0.0 {
                    return f64::NEG_INFINITY;
                }
                shape * rate.ln() - ln_gamma(shape) + (shape - 1.0) * x.ln() - rate * x
            }
        }
    }

    pub fn gradient(&self, x: f64) -> f64 {
        if !self.log_pdf(x).is_finite() {
            return 0.0;
        }
        match *self {
            LogPrior::Uniform { .. } => 0.0,
            LogPrior::Normal { mean, sd } => -(x - mean) / (sd * sd),
            LogPrior::LogNormal { mean_log, sd_log } => {
                -1.0 / x - (x.ln() - mean_log) / (sd_log * sd_log * x)
            }
            LogPrior::HalfCauchy { location, scale } => {
                let d = x - location;
                -2.0 * d / (scale * scale + d * d)
            }
            LogPrior::Gamma { shape, rate } => (shape - 1.0) / x - rate,
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<f64, ConfigurationError> {
        let invalid = |err: String| ConfigurationError::InvalidSetting(err);
        let value = match *self {
            LogPrior::Uniform { lower, upper } => rng.random_range(lower..upper),
            LogPrior::Normal { mean, sd } => Normal::new(mean, sd)
                .map_err(|err| invalid(err.to_string()))?
                .sample(rng),
            LogPrior::LogNormal { mean_log, sd_log } => LogNormal::new(mean_log, sd_log)
                .map_err(|err| invalid(err.to_string()))?
                .sample(rng),
            LogPrior::HalfCauchy { location, scale } => {
                let draw: f64 = Cauchy::new(0.0, scale)
                    .map_err(|err| invalid(err.to_string()))?
                    .sample(rng);
                location + draw.abs()
            }
            LogPrior::Gamma { shape, rate } => Gamma::new(shape, 1.0 / rate)
                .map_err(|err| invalid(err.to_string()))?
                .sample(rng),
        };
        Ok(value)
    }
}

/// Lanczos approximation of `ln Γ(x)` for `x > 0`
fn ln_gamma(x: f64) -> f64 {
    const COEFFICIENTS: [f64; 9] = [
        0.999_999_999_999_809_9,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];
    if x < 0.5 {
        // Reflection formula
        return (PI / (PI * x).sin()).ln() - ln_gamma(1.0 - x);
    }
    let x = x - 1.0;
    let mut a = COEFFICIENTS[0];
    let t = x + 7.5;
    for (i, c) in COEFFICIENTS.iter().enumerate().skip(1) {
        a += c / (x + i as f64);
    }
    0.5 * (2.0 * PI).ln() + (x + 0.5) * t.ln() - t + a.ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn ln_gamma_known_values() {
        assert_relative_eq!(ln_gamma(1.0), 0.0, epsilon = 1e-12);
        assert_relative_eq!(ln_gamma(5.0), 24.0f64.ln(), epsilon = 1e-12);
        assert_relative_eq!(ln_gamma(0.5), PI.sqrt().ln(), epsilon = 1e-12);
    }

    #[test]
    fn support_is_respected() {
        assert_eq!(
            LogPrior::Uniform { lower: 0.0, upper: 2.0 }.log_pdf(2.5),
            f64::NEG_INFINITY
        );
        assert_relative_eq!(
            LogPrior::Uniform { lower: 0.0, upper: 2.0 }.log_pdf(0.0),
            -(2.0f64).ln()
        );
        assert_eq!(
            LogPrior::HalfCauchy { location: 0.0, scale: 1.0 }.log_pdf(-0.1),
            f64::NEG_INFINITY
        );
        assert_eq!(LogPrior::Gamma { shape: 2.0, rate: 1.0 }.gradient(-1.0), 0.0);
    }

    #[test]
    fn gradients_match_finite_differences() {
        let priors = [
            LogPrior::Normal { mean: 1.0, sd: 2.0 },
            LogPrior::LogNormal { mean_log: 0.2, sd_log: 0.5 },
            LogPrior::HalfCauchy { location: 0.0, scale: 0.7 },
            LogPrior::Gamma { shape: 3.0, rate: 2.0 },
        ];
        let h = 1e-6;
        for prior in priors {
            let x = 1.3;
            let fd = (prior.log_pdf(x + h) - prior.log_pdf(x - h)) / (2.0 * h);
            assert_relative_eq!(prior.gradient(x), fd, max_relative = 1e-6);
        }
    }

    #[test]
    fn samples_are_in_support() {
        let mut rng = StdRng::seed_from_u64(3);
        let priors = [
            LogPrior::Uniform { lower: 1.0, upper: 2.0 },
            LogPrior::LogNormal { mean_log: 0.0, sd_log: 1.0 },
            LogPrior::HalfCauchy { location: 0.5, scale: 1.0 },
            LogPrior::Gamma { shape: 1.5, rate: 0.5 },
        ];
        for prior in priors {
            for _ in 0..100 {
                let x = prior.sample(&mut rng).unwrap();
                assert!(prior.log_pdf(x).is_finite());
            }
        }
        assert!(LogPrior::Normal { mean: 0.0, sd: -1.0 }.validate().is_err());
    }
}
