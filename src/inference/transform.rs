use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, PkpdError};
use crate::posterior::{check_dimension, LogDensity};

/// Bijection between a constrained model parameter and the unconstrained search space
///
/// `forward` maps a model value to the search space and `inverse` maps it back.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum Transform {
    #[default]
    Identity,
    /// Positive parameters, searched on the log scale
    Log,
    /// Parameters in the open interval `(lower, upper)`
    Logit { lower: f64, upper: f64 },
}

impl Transform {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if let Transform::Logit { lower, upper } = *self {
            if !(lower.is_finite() && upper.is_finite() && lower < upper) {
                return Err(ConfigurationError::InvalidSetting(format!(
                    "logit transform needs finite bounds with lower < upper, got ({}, {})",
                    lower, upper
                )));
            }
        }
        Ok(())
    }

    pub fn forward(&self, x: f64) -> f64 {
        match *self {
            Transform::Identity => x,
            Transform::Log => x.ln(),
            Transform::Logit { lower, upper } => {
                let p = (x - lower) / (upper - lower);
                (p / (1.0 - p)).ln()
            }
        }
    }

    pub fn inverse(&self, y: f64) -> f64 {
        match *self {
            Transform::Identity => y,
            Transform::Log => y.exp(),
            Transform::Logit { lower, upper } => lower + (upper - lower) * sigmoid(y),
        }
    }

    /// `dx/dy` of the inverse map
    pub fn inverse_derivative(&self, y: f64) -> f64 {
        match *self {
            Transform::Identity => 1.0,
            Transform::Log => y.exp(),
            Transform::Logit { lower, upper } => {
                let s = sigmoid(y);
                (upper - lower) * s * (1.0 - s)
            }
        }
    }

    /// `ln |dx/dy|`
    pub fn log_jacobian(&self, y: f64) -> f64 {
        match *self {
            Transform::Identity => 0.0,
            Transform::Log => y,
            Transform::Logit { lower, upper } => {
                // ln σ(y) + ln(1 - σ(y)) written to stay finite for large |y|
                (upper - lower).ln() - softplus(-y) - softplus(y)
            }
        }
    }

    /// Derivative of [Transform::log_jacobian] with respect to `y`
    pub fn log_jacobian_derivative(&self, y: f64) -> f64 {
        match *self {
            Transform::Identity => 0.0,
            Transform::Log => 1.0,
            Transform::Logit { .. } => 1.0 - 2.0 * sigmoid(y),
        }
    }
}

fn sigmoid(y: f64) -> f64 {
    if y >= 0.0 {
        1.0 / (1.0 + (-y).exp())
    } else {
        let e = y.exp();
        e / (1.0 + e)
    }
}

fn softplus(y: f64) -> f64 {
    if y > 0.0 {
        y + (-y).exp().ln_1p()
    } else {
        y.exp().ln_1p()
    }
}

/// A log-density evaluated in the unconstrained search space
///
/// With `with_jacobian` the log-absolute-Jacobian of the inverse map is added, which keeps
/// the density of the original parameters invariant (sampling). Without it the maximiser
/// coincides with the maximiser in the original parametrisation (optimisation).
#[derive(Debug, Clone)]
pub struct TransformedLogDensity<D> {
    density: D,
    transforms: Vec<Transform>,
    with_jacobian: bool,
}

impl<D: LogDensity> TransformedLogDensity<D> {
    pub fn new(
        density: D,
        transforms: Vec<Transform>,
        with_jacobian: bool,
    ) -> Result<Self, ConfigurationError> {
        check_dimension("transforms", density.n_parameters(), transforms.len())?;
        for transform in &transforms {
            transform.validate()?;
        }
        Ok(Self {
            density,
            transforms,
            with_jacobian,
        })
    }

    pub fn inner(&self) -> &D {
        &self.density
    }

    pub fn transforms(&self) -> &[Transform] {
        &self.transforms
    }

    /// Map model parameters to the search space
    pub fn to_search_space(&self, x: &[f64]) -> Vec<f64> {
        self.transforms
            .iter()
            .zip(x)
            .map(|(transform, value)| transform.forward(*value))
            .collect()
    }

    /// Map search-space values back to model parameters
    pub fn to_model_space(&self, y: &[f64]) -> Vec<f64> {
        self.transforms
            .iter()
            .zip(y)
            .map(|(transform, value)| transform.inverse(*value))
            .collect()
    }

    fn log_jacobian(&self, y: &[f64]) -> f64 {
        if !self.with_jacobian {
            return 0.0;
        }
        self.transforms
            .iter()
            .zip(y)
            .map(|(transform, value)| transform.log_jacobian(*value))
            .sum()
    }
}

impl<D: LogDensity> LogDensity for TransformedLogDensity<D> {
    fn n_parameters(&self) -> usize {
        self.density.n_parameters()
    }

    fn parameter_names(&self) -> Vec<String> {
        self.density.parameter_names()
    }

    fn evaluate(&self, y: &[f64]) -> Result<f64, PkpdError> {
        check_dimension("transformed log-density", self.n_parameters(), y.len())?;
        let value = self.density.evaluate(&self.to_model_space(y))?;
        if value == f64::NEG_INFINITY {
            return Ok(value);
        }
        Ok(value + self.log_jacobian(y))
    }

    fn evaluate_with_gradient(&self, y: &[f64]) -> Result<(f64, Vec<f64>), PkpdError> {
        check_dimension("transformed log-density", self.n_parameters(), y.len())?;
        let (value, gradient) = self.density.evaluate_with_gradient(&self.to_model_space(y))?;
        if value == f64::NEG_INFINITY {
            return Ok((value, vec![0.0; y.len()]));
        }
        let gradient = self
            .transforms
            .iter()
            .zip(y)
            .zip(gradient)
            .map(|((transform, value), g)| {
                let mut g = g * transform.inverse_derivative(*value);
                if self.with_jacobian {
                    g += transform.log_jacobian_derivative(*value);
                }
                g
            })
            .collect();
        Ok((value + self.log_jacobian(y), gradient))
    }

    fn sample_initial(&self, rng: &mut StdRng) -> Option<Vec<f64>> {
        self.density
            .sample_initial(rng)
            .map(|x| self.to_search_space(&x))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    struct Gaussian;

    impl LogDensity for Gaussian {
        fn n_parameters(&self) -> usize {
            2
        }

        fn parameter_names(&self) -> Vec<String> {
            vec!["a".to_string(), "b".to_string()]
        }

        fn evaluate(&self, x: &[f64]) -> Result<f64, PkpdError> {
            Ok(-0.5 * (x[0] - 1.0).powi(2) - 0.5 * (x[1] - 0.3).powi(2))
        }

        fn evaluate_with_gradient(&self, x: &[f64]) -> Result<(f64, Vec<f64>), PkpdError> {
            Ok((self.evaluate(x)?, vec![-(x[0] - 1.0), -(x[1] - 0.3)]))
        }
    }

    #[test]
    fn log_round_trip() {
        for x in [1e-6, 0.5, 3.0, 1e5] {
            assert_relative_eq!(
                Transform::Log.inverse(Transform::Log.forward(x)),
                x,
                max_relative = 1e-12
            );
        }
        let logit = Transform::Logit { lower: -1.0, upper: 2.0 };
        for x in [-0.999, 0.0, 1.5] {
            assert_relative_eq!(logit.inverse(logit.forward(x)), x, max_relative = 1e-12);
        }
    }

    #[test]
    fn invalid_logit_bounds() {
        assert!(Transform::Logit { lower: 1.0, upper: 1.0 }.validate().is_err());
    }

    #[test]
    fn gradient_matches_finite_differences() {
        for with_jacobian in [false, true] {
            let density = TransformedLogDensity::new(
                Gaussian,
                vec![Transform::Log, Transform::Logit { lower: 0.0, upper: 1.0 }],
                with_jacobian,
            )
            .unwrap();
            let y = vec![0.2, -0.4];
            let (value, gradient) = density.evaluate_with_gradient(&y).unwrap();
            assert_relative_eq!(value, density.evaluate(&y).unwrap());
            let h = 1e-6;
            for j in 0..2 {
                let mut up = y.clone();
                let mut down = y.clone();
                up[j] += h;
                down[j] -= h;
                let fd =
                    (density.evaluate(&up).unwrap() - density.evaluate(&down).unwrap()) / (2.0 * h);
                assert_relative_eq!(gradient[j], fd, max_relative = 1e-6, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn optimisation_keeps_the_mode() {
        let density = TransformedLogDensity::new(
            Gaussian,
            vec![Transform::Log, Transform::Identity],
            false,
        )
        .unwrap();
        let (_, gradient) = density
            .evaluate_with_gradient(&density.to_search_space(&[1.0, 0.3]))
            .unwrap();
        assert!(gradient.iter().all(|g| g.abs() < 1e-12));
    }
}
