use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, PkpdError};
use crate::posterior::LogDensity;
use crate::settings::{SamplerKind, SamplerSettings};

/// Every iteration of one Markov chain, warm-up included
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chain {
    pub samples: Vec<Vec<f64>>,
    pub log_densities: Vec<f64>,
    /// Fraction of accepted proposals after adaptation
    pub acceptance_rate: f64,
    /// Proposal scale at the end of the run
    pub step_size: f64,
}

impl Chain {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Draws of parameter `index` from iteration `skip` on
    pub fn trace(&self, index: usize, skip: usize) -> Vec<f64> {
        self.samples.iter().skip(skip).map(|x| x[index]).collect()
    }
}

/// Draws a Markov chain targeting a [LogDensity]
///
/// The same seed and starting point give the same chain.
pub trait Sampler: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(
        &self,
        density: &dyn LogDensity,
        x0: &[f64],
        n_iterations: usize,
        seed: u64,
    ) -> Result<Chain, PkpdError>;
}

/// The shipped sampler selected by `settings`, adapting during the warm-up
pub fn sampler_from_settings(settings: &SamplerSettings) -> Box<dyn Sampler> {
    match settings.kind {
        SamplerKind::Metropolis => Box::new(MetropolisSampler {
            step_size: settings.step_size,
            adaptation: settings.warmup,
            ..MetropolisSampler::default()
        }),
        SamplerKind::Mala => Box::new(MalaSampler {
            step_size: settings.step_size,
            adaptation: settings.warmup,
            ..MalaSampler::default()
        }),
    }
}

fn check_start(density: &dyn LogDensity, x0: &[f64]) -> Result<(), PkpdError> {
    if x0.len() != density.n_parameters() {
        return Err(ConfigurationError::ParameterCount {
            context: "sampler starting point".to_string(),
            expected: density.n_parameters(),
            found: x0.len(),
        }
        .into());
    }
    Ok(())
}

fn non_finite_start() -> PkpdError {
    ConfigurationError::MissingInitialValues(
        "the starting point has a log-density of negative infinity".to_string(),
    )
    .into()
}

/// Robbins-Monro update of a log step size towards a target acceptance probability
fn adapt(log_step: f64, accept_probability: f64, target: f64, iteration: usize) -> f64 {
    let rate = (iteration as f64 + 1.0).powf(-0.6);
    log_step + rate * (accept_probability - target)
}

/// Random-walk Metropolis with an isotropic Gaussian proposal
///
/// During the first `adaptation` iterations the proposal scale is tuned towards an
/// acceptance rate of 0.234.
#[derive(Debug, Clone, Copy)]
pub struct MetropolisSampler {
    pub step_size: f64,
    pub adaptation: usize,
    pub target_acceptance: f64,
}

impl Default for MetropolisSampler {
    fn default() -> Self {
        Self {
            step_size: 0.1,
            adaptation: 500,
            target_acceptance: 0.234,
        }
    }
}

impl Sampler for MetropolisSampler {
    fn name(&self) -> &'static str {
        "Metropolis"
    }

    fn run(
        &self,
        density: &dyn LogDensity,
        x0: &[f64],
        n_iterations: usize,
        seed: u64,
    ) -> Result<Chain, PkpdError> {
        check_start(density, x0)?;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut x = x0.to_vec();
        let mut log_density = density.evaluate(&x)?;
        if log_density == f64::NEG_INFINITY {
            return Err(non_finite_start());
        }

        let mut log_step = self.step_size.ln();
        let mut samples = Vec::with_capacity(n_iterations);
        let mut log_densities = Vec::with_capacity(n_iterations);
        let mut accepted = 0usize;
        for iteration in 0..n_iterations {
            let scale = log_step.exp();
            let proposal: Vec<f64> = x
                .iter()
                .map(|xi| xi + scale * rng.sample::<f64, _>(StandardNormal))
                .collect();
            let proposed = density.evaluate(&proposal)?;
            let accept_probability = if proposed.is_nan() {
                0.0
            } else {
                (proposed - log_density).exp().min(1.0)
            };
            let accept = rng.random::<f64>() < accept_probability;
            if accept {
                x = proposal;
                log_density = proposed;
            }
            if iteration < self.adaptation {
                log_step = adapt(log_step, accept_probability, self.target_acceptance, iteration);
            } else if accept {
                accepted += 1;
            }
            samples.push(x.clone());
            log_densities.push(log_density);
        }

        let sampling = n_iterations.saturating_sub(self.adaptation);
        Ok(Chain {
            samples,
            log_densities,
            acceptance_rate: if sampling > 0 {
                accepted as f64 / sampling as f64
            } else {
                0.0
            },
            step_size: log_step.exp(),
        })
    }
}

/// Metropolis-adjusted Langevin algorithm
///
/// Proposals follow the gradient, `x' = x + ε²/2 ∇log p(x) + ε z`. The step size is tuned
/// towards an acceptance rate of 0.574 during the first `adaptation` iterations.
#[derive(Debug, Clone, Copy)]
pub struct MalaSampler {
    pub step_size: f64,
    pub adaptation: usize,
    pub target_acceptance: f64,
}

impl Default for MalaSampler {
    fn default() -> Self {
        Self {
            step_size: 0.1,
            adaptation: 500,
            target_acceptance: 0.574,
        }
    }
}

impl MalaSampler {
    /// `log q(to | from)` up to a constant
    fn log_proposal(to: &[f64], from: &[f64], gradient: &[f64], step: f64) -> f64 {
        let half = 0.5 * step * step;
        to.iter()
            .zip(from)
            .zip(gradient)
            .map(|((t, f), g)| {
                let r = t - f - half * g;
                -r * r / (2.0 * step * step)
            })
            .sum()
    }
}

impl Sampler for MalaSampler {
    fn name(&self) -> &'static str {
        "MALA"
    }

    fn run(
        &self,
        density: &dyn LogDensity,
        x0: &[f64],
        n_iterations: usize,
        seed: u64,
    ) -> Result<Chain, PkpdError> {
        check_start(density, x0)?;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut x = x0.to_vec();
        let (mut log_density, mut gradient) = density.evaluate_with_gradient(&x)?;
        if log_density == f64::NEG_INFINITY {
            return Err(non_finite_start());
        }

        let mut log_step = self.step_size.ln();
        let mut samples = Vec::with_capacity(n_iterations);
        let mut log_densities = Vec::with_capacity(n_iterations);
        let mut accepted = 0usize;
        for iteration in 0..n_iterations {
            let step = log_step.exp();
            let half = 0.5 * step * step;
            let proposal: Vec<f64> = x
                .iter()
                .zip(&gradient)
                .map(|(xi, g)| xi + half * g + step * rng.sample::<f64, _>(StandardNormal))
                .collect();
            let (proposed, proposed_gradient) = density.evaluate_with_gradient(&proposal)?;
            let accept_probability = if proposed.is_finite() {
                let log_ratio = proposed - log_density
                    + Self::log_proposal(&x, &proposal, &proposed_gradient, step)
                    - Self::log_proposal(&proposal, &x, &gradient, step);
                if log_ratio.is_nan() {
                    0.0
                } else {
                    log_ratio.exp().min(1.0)
                }
            } else {
                0.0
            };
            let accept = rng.random::<f64>() < accept_probability;
            if accept {
                x = proposal;
                log_density = proposed;
                gradient = proposed_gradient;
            }
            if iteration < self.adaptation {
                log_step = adapt(log_step, accept_probability, self.target_acceptance, iteration);
            } else if accept {
                accepted += 1;
            }
            samples.push(x.clone());
            log_densities.push(log_density);
        }

        let sampling = n_iterations.saturating_sub(self.adaptation);
        Ok(Chain {
            samples,
            log_densities,
            acceptance_rate: if sampling > 0 {
                accepted as f64 / sampling as f64
            } else {
                0.0
            },
            step_size: log_step.exp(),
        })
    }
}
