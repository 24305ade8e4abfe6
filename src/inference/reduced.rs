use rand::rngs::StdRng;

use crate::error::{ConfigurationError, PkpdError};
use crate::posterior::{check_dimension, LogDensity};

/// A log-density with some parameters held at fixed values
///
/// Only the free parameters are exposed; fixed values are substituted before every
/// evaluation.
#[derive(Debug, Clone)]
pub struct ReducedLogDensity<D> {
    density: D,
    fixed: Vec<Option<f64>>,
    free: Vec<usize>,
}

impl<D: LogDensity> ReducedLogDensity<D> {
    /// `fixed[i]` is `Some(value)` to hold parameter `i` at `value`, `None` to leave it free
    pub fn new(density: D, fixed: Vec<Option<f64>>) -> Result<Self, ConfigurationError> {
        if fixed.len() != density.n_parameters() {
            return Err(ConfigurationError::InvalidMask(format!(
                "mask has {} entries but the log-density has {} parameters",
                fixed.len(),
                density.n_parameters()
            )));
        }
        if let Some(value) = fixed.iter().flatten().find(|v| !v.is_finite()) {
            return Err(ConfigurationError::InvalidMask(format!(
                "fixed value {} is not finite",
                value
            )));
        }
        let free: Vec<usize> = fixed
            .iter()
            .enumerate()
            .filter_map(|(i, value)| value.is_none().then_some(i))
            .collect();
        if free.is_empty() {
            return Err(ConfigurationError::InvalidMask(
                "every parameter is fixed".to_string(),
            ));
        }
        Ok(Self {
            density,
            fixed,
            free,
        })
    }

    /// Fix parameters by name
    pub fn from_names(density: D, fixed: &[(&str, f64)]) -> Result<Self, ConfigurationError> {
        let names = density.parameter_names();
        let mut mask = vec![None; names.len()];
        for (name, value) in fixed {
            let index = names.iter().position(|n| n == name).ok_or_else(|| {
                ConfigurationError::InvalidMask(format!("unknown parameter {}", name))
            })?;
            mask[index] = Some(*value);
        }
        Self::new(density, mask)
    }

    pub fn inner(&self) -> &D {
        &self.density
    }

    /// Indices of the free parameters in the full vector
    pub fn free_indices(&self) -> &[usize] {
        &self.free
    }

    /// The full parameter vector for a vector of free parameters
    pub fn expand(&self, free: &[f64]) -> Vec<f64> {
        let mut values = free.iter();
        self.fixed
            .iter()
            .map(|fixed| match fixed {
                Some(value) => *value,
                None => values.next().copied().unwrap_or(f64::NAN),
            })
            .collect()
    }

    /// The free entries of a full parameter vector
    pub fn reduce(&self, full: &[f64]) -> Vec<f64> {
        self.free.iter().map(|&i| full[i]).collect()
    }
}

impl<D: LogDensity> LogDensity for ReducedLogDensity<D> {
    fn n_parameters(&self) -> usize {
        self.free.len()
    }

    fn parameter_names(&self) -> Vec<String> {
        let names = self.density.parameter_names();
        self.free.iter().map(|&i| names[i].clone()).collect()
    }

    fn evaluate(&self, x: &[f64]) -> Result<f64, PkpdError> {
        check_dimension("reduced log-density", self.n_parameters(), x.len())?;
        self.density.evaluate(&self.expand(x))
    }

    fn evaluate_with_gradient(&self, x: &[f64]) -> Result<(f64, Vec<f64>), PkpdError> {
        check_dimension("reduced log-density", self.n_parameters(), x.len())?;
        let (value, gradient) = self.density.evaluate_with_gradient(&self.expand(x))?;
        Ok((value, self.reduce(&gradient)))
    }

    fn sample_initial(&self, rng: &mut StdRng) -> Option<Vec<f64>> {
        self.density
            .sample_initial(rng)
            .map(|full| self.reduce(&full))
    }
}
