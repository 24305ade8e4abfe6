//! Population models describe how the parameters of individuals relate to population-level
//! parameters.
//!
//! One [PopulationModel] is attached to each dimension of the individual parameter vector. Random
//! effects use a non-centred parametrisation: each individual carries a standardised latent draw
//! `η ~ N(0, 1)` and its parameter is a deterministic function of the population parameters, `η`
//! and, for [PopulationModel::Covariate], its covariates.

pub mod covariate;

use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

pub use covariate::{CovariatePopulationModel, LatentShape};

use crate::error::ConfigurationError;

/// Partial derivatives of an individual parameter
#[derive(Debug, Clone, PartialEq)]
pub struct IndividualGradient {
    /// `∂θ/∂pop`
    pub population: Vec<f64>,
    /// `∂θ/∂η`
    pub latent: Vec<f64>,
}

/// Partial derivatives of the log-density of the latent draws
#[derive(Debug, Clone, PartialEq)]
pub struct DensityGradient {
    /// `∂log p/∂pop`
    pub population: Vec<f64>,
    /// `∂log p/∂η`
    pub latent: Vec<f64>,
}

/// The distribution of one individual parameter across the population
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PopulationModel {
    /// Every individual shares the population value; no latent draw
    Pooled,
    /// Every individual has its own free parameter and no shared distribution
    Heterogeneous,
    /// `θ = μ + σ η`
    Normal,
    /// `θ = exp(μ_log + σ_log η)`
    LogNormal,
    /// Random effects with a covariate-dependent location
    Covariate(CovariatePopulationModel),
}

impl PopulationModel {
    /// Number of population-level parameters
    pub fn n_population_parameters(&self) -> usize {
        match self {
            PopulationModel::Pooled => 1,
            PopulationModel::Heterogeneous => 0,
            PopulationModel::Normal | PopulationModel::LogNormal => 2,
            PopulationModel::Covariate(model) => model.n_parameters(),
        }
    }

    /// Number of latent draws per individual
    pub fn n_latent(&self) -> usize {
        match self {
            PopulationModel::Pooled => 0,
            _ => 1,
        }
    }

    pub fn covariate_names(&self) -> &[String] {
        match self {
            PopulationModel::Covariate(model) => model.covariate_names(),
            _ => &[],
        }
    }

    /// Names of the population parameters for the individual parameter `name`
    pub fn parameter_names(&self, name: &str) -> Vec<String> {
        match self {
            PopulationModel::Pooled => vec![format!("Pooled {}", name)],
            PopulationModel::Heterogeneous => vec![],
            PopulationModel::Normal => vec![format!("Mean {}", name), format!("Std. {}", name)],
            PopulationModel::LogNormal => vec![
                format!("Mean log {}", name),
                format!("Std. log {}", name),
            ],
            PopulationModel::Covariate(model) => model.parameter_names(name),
        }
    }

    /// Index of the scale parameter among the population parameters, if any
    fn scale_index(&self) -> Option<usize> {
        match self {
            PopulationModel::Normal
            | PopulationModel::LogNormal
            | PopulationModel::Covariate(_) => Some(1),
            _ => None,
        }
    }

    pub(crate) fn check(
        &self,
        pop: &[f64],
        eta: &[f64],
        covariates: &[f64],
    ) -> Result<(), ConfigurationError> {
        if pop.len() != self.n_population_parameters() {
            return Err(ConfigurationError::ParameterCount {
                context: "population parameters".to_string(),
                expected: self.n_population_parameters(),
                found: pop.len(),
            });
        }
        if eta.len() != self.n_latent() {
            return Err(ConfigurationError::ParameterCount {
                context: "latent draws".to_string(),
                expected: self.n_latent(),
                found: eta.len(),
            });
        }
        if covariates.len() != self.covariate_names().len() {
            return Err(ConfigurationError::ParameterCount {
                context: "covariates".to_string(),
                expected: self.covariate_names().len(),
                found: covariates.len(),
            });
        }
        Ok(())
    }

    /// Deterministic map from population parameters and latent draw to the individual parameter
    pub fn individual_parameter(
        &self,
        pop: &[f64],
        eta: &[f64],
        covariates: &[f64],
    ) -> Result<f64, ConfigurationError> {
        self.check(pop, eta, covariates)?;
        Ok(self.individual_parameter_unchecked(pop, eta, covariates).0)
    }

    /// Gradients of [PopulationModel::individual_parameter]
    pub fn individual_parameter_gradient(
        &self,
        pop: &[f64],
        eta: &[f64],
        covariates: &[f64],
    ) -> Result<IndividualGradient, ConfigurationError> {
        self.check(pop, eta, covariates)?;
        Ok(self.individual_parameter_unchecked(pop, eta, covariates).1)
    }

    pub(crate) fn individual_parameter_unchecked(
        &self,
        pop: &[f64],
        eta: &[f64],
        covariates: &[f64],
    ) -> (f64, IndividualGradient) {
        match self {
            PopulationModel::Pooled => (
                pop[0],
                IndividualGradient {
                    population: vec![1.0],
                    latent: vec![],
                },
            ),
            PopulationModel::Heterogeneous => (
                eta[0],
                IndividualGradient {
                    population: vec![],
                    latent: vec![1.0],
                },
            ),
            PopulationModel::Normal => {
                let (mu, sigma) = (pop[0], pop[1]);
                (
                    mu + sigma * eta[0],
                    IndividualGradient {
                        population: vec![1.0, eta[0]],
                        latent: vec![sigma],
                    },
                )
            }
            PopulationModel::LogNormal => {
                let (mu, sigma) = (pop[0], pop[1]);
                let theta = (mu + sigma * eta[0]).exp();
                (
                    theta,
                    IndividualGradient {
                        population: vec![theta, theta * eta[0]],
                        latent: vec![theta * sigma],
                    },
                )
            }
            PopulationModel::Covariate(model) => {
                let (theta, population, d_eta) =
                    model.individual_parameter(pop, eta[0], covariates);
                (
                    theta,
                    IndividualGradient {
                        population,
                        latent: vec![d_eta],
                    },
                )
            }
        }
    }

    /// Log-density of the latent draw given the population parameters
    ///
    /// The standard normal density of the draws without its normalising constant, so that a
    /// zero draw contributes nothing. Pooled and heterogeneous models contribute zero. A
    /// negative scale parameter gives negative infinity.
    pub fn log_density(
        &self,
        pop: &[f64],
        eta: &[f64],
        covariates: &[f64],
    ) -> Result<f64, ConfigurationError> {
        self.check(pop, eta, covariates)?;
        Ok(self.log_density_unchecked(pop, eta))
    }

    /// Gradients of [PopulationModel::log_density]
    pub fn log_density_gradient(
        &self,
        pop: &[f64],
        eta: &[f64],
        covariates: &[f64],
    ) -> Result<DensityGradient, ConfigurationError> {
        self.check(pop, eta, covariates)?;
        Ok(self.log_density_gradient_unchecked(pop, eta))
    }

    pub(crate) fn log_density_unchecked(&self, pop: &[f64], eta: &[f64]) -> f64 {
        match self {
            PopulationModel::Pooled | PopulationModel::Heterogeneous => 0.0,
            _ => {
                if let Some(index) = self.scale_index() {
                    if pop[index] < 0.0 || !pop[index].is_finite() {
                        return f64::NEG_INFINITY;
                    }
                }
                eta.iter().map(|e| -0.5 * e * e).sum()
            }
        }
    }

    pub(crate) fn log_density_gradient_unchecked(&self, pop: &[f64], eta: &[f64]) -> DensityGradient {
        let population = vec![0.0; pop.len()];
        let latent = match self {
            PopulationModel::Pooled | PopulationModel::Heterogeneous => vec![0.0; eta.len()],
            _ => {
                if self.log_density_unchecked(pop, eta).is_finite() {
                    eta.iter().map(|e| -e).collect()
                } else {
                    vec![0.0; eta.len()]
                }
            }
        };
        DensityGradient { population, latent }
    }

    /// Draw a latent value for a new individual
    ///
    /// Heterogeneous models have no shared distribution to draw from.
    pub fn sample_latent<R: Rng + ?Sized>(
        &self,
        pop: &[f64],
        covariates: &[f64],
        rng: &mut R,
    ) -> Result<Vec<f64>, ConfigurationError> {
        if let PopulationModel::Heterogeneous = self {
            return Err(ConfigurationError::InvalidPopulationModel(
                "a heterogeneous population model has no latent distribution to sample from"
                    .to_string(),
            ));
        }
        let eta: Vec<f64> = (0..self.n_latent())
            .map(|_| rng.sample(StandardNormal))
            .collect();
        self.check(pop, &eta, covariates)?;
        Ok(eta)
    }
}
