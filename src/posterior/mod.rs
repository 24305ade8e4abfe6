pub mod hierarchical;
pub mod prior;

use rand::rngs::StdRng;

pub use hierarchical::HierarchicalLogPosterior;
pub use prior::LogPrior;

use crate::error::{ConfigurationError, PkpdError};
use crate::simulator::likelihood::IndividualLogLikelihood;

/// A log-density over a real parameter vector
///
/// This is the only contract optimisers and samplers rely on. Implementors hold no mutable
/// state, so a single instance can be evaluated concurrently with different vectors.
pub trait LogDensity: Send + Sync {
    fn n_parameters(&self) -> usize;

    fn parameter_names(&self) -> Vec<String>;

    fn evaluate(&self, x: &[f64]) -> Result<f64, PkpdError>;

    /// Value and gradient. Where the value is negative infinity the gradient is zero.
    fn evaluate_with_gradient(&self, x: &[f64]) -> Result<(f64, Vec<f64>), PkpdError>;

    /// A random starting point, usually drawn from the priors
    fn sample_initial(&self, _rng: &mut StdRng) -> Option<Vec<f64>> {
        None
    }
}

impl<D: LogDensity + ?Sized> LogDensity for &D {
    fn n_parameters(&self) -> usize {
        (**self).n_parameters()
    }

    fn parameter_names(&self) -> Vec<String> {
        (**self).parameter_names()
    }

    fn evaluate(&self, x: &[f64]) -> Result<f64, PkpdError> {
        (**self).evaluate(x)
    }

    fn evaluate_with_gradient(&self, x: &[f64]) -> Result<(f64, Vec<f64>), PkpdError> {
        (**self).evaluate_with_gradient(x)
    }

    fn sample_initial(&self, rng: &mut StdRng) -> Option<Vec<f64>> {
        (**self).sample_initial(rng)
    }
}

pub(crate) fn check_dimension(
    context: &str,
    expected: usize,
    found: usize,
) -> Result<(), ConfigurationError> {
    if expected != found {
        return Err(ConfigurationError::ParameterCount {
            context: context.to_string(),
            expected,
            found,
        });
    }
    Ok(())
}

/// Log-posterior of a single individual: its log-likelihood plus one prior per parameter
#[derive(Debug, Clone)]
pub struct IndividualLogPosterior {
    likelihood: IndividualLogLikelihood,
    priors: Vec<LogPrior>,
}

impl IndividualLogPosterior {
    pub fn new(
        likelihood: IndividualLogLikelihood,
        priors: Vec<LogPrior>,
    ) -> Result<Self, ConfigurationError> {
        check_dimension("priors", likelihood.n_parameters(), priors.len())?;
        for prior in &priors {
            prior.validate()?;
        }
        Ok(Self { likelihood, priors })
    }

    pub fn likelihood(&self) -> &IndividualLogLikelihood {
        &self.likelihood
    }

    pub fn priors(&self) -> &[LogPrior] {
        &self.priors
    }

    fn log_prior(&self, x: &[f64]) -> f64 {
        self.priors
            .iter()
            .zip(x.iter())
            .map(|(prior, value)| prior.log_pdf(*value))
            .sum()
    }
}

impl LogDensity for IndividualLogPosterior {
    fn n_parameters(&self) -> usize {
        self.likelihood.n_parameters()
    }

    fn parameter_names(&self) -> Vec<String> {
        self.likelihood.parameter_names()
    }

    fn evaluate(&self, x: &[f64]) -> Result<f64, PkpdError> {
        check_dimension("individual log-posterior", self.n_parameters(), x.len())?;
        let log_prior = self.log_prior(x);
        if log_prior == f64::NEG_INFINITY {
            return Ok(f64::NEG_INFINITY);
        }
        Ok(log_prior + self.likelihood.evaluate(x)?)
    }

    fn evaluate_with_gradient(&self, x: &[f64]) -> Result<(f64, Vec<f64>), PkpdError> {
        check_dimension("individual log-posterior", self.n_parameters(), x.len())?;
        let log_prior = self.log_prior(x);
        if log_prior == f64::NEG_INFINITY {
            return Ok((f64::NEG_INFINITY, vec![0.0; x.len()]));
        }
        let (log_likelihood, mut gradient) = self.likelihood.evaluate_with_gradient(x)?;
        let value = log_prior + log_likelihood;
        if value == f64::NEG_INFINITY {
            return Ok((value, vec![0.0; x.len()]));
        }
        for ((g, prior), value) in gradient.iter_mut().zip(&self.priors).zip(x) {
            *g += prior.gradient(*value);
        }
        Ok((value, gradient))
    }

    fn sample_initial(&self, rng: &mut StdRng) -> Option<Vec<f64>> {
        self.priors.iter().map(|prior| prior.sample(rng).ok()).collect()
    }
}
