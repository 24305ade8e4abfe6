use indicatif::{ProgressBar, ProgressStyle};
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::error::{ConfigurationError, ConvergenceWarning, PkpdError};
use crate::inference::optimiser::{optimiser_from_settings, Optimiser};
use crate::inference::results::{split_rhat, OptimisationResult, OptimisationRun, SamplingResult};
use crate::inference::sampler::{sampler_from_settings, Sampler};
use crate::inference::{ReducedLogDensity, Transform, TransformedLogDensity};
use crate::posterior::{check_dimension, LogDensity};
use crate::settings::{OptimiserSettings, SamplerSettings};

/// Fixed values, transforms and initial values shared by both controllers
#[derive(Debug, Clone)]
struct Problem {
    names: Vec<String>,
    fixed: Vec<Option<f64>>,
    transforms: Vec<Transform>,
    initial_values: Option<Vec<Vec<f64>>>,
}

impl Problem {
    fn new(names: Vec<String>) -> Self {
        let n = names.len();
        Self {
            names,
            fixed: vec![None; n],
            transforms: vec![Transform::Identity; n],
            initial_values: None,
        }
    }

    fn fix(&mut self, fixed: &[(&str, f64)]) -> Result<(), ConfigurationError> {
        for (name, value) in fixed {
            let index = self.index(name)?;
            self.fixed[index] = Some(*value);
        }
        Ok(())
    }

    fn transform(&mut self, transforms: &[(&str, Transform)]) -> Result<(), ConfigurationError> {
        for (name, transform) in transforms {
            transform.validate()?;
            let index = self.index(name)?;
            self.transforms[index] = *transform;
        }
        Ok(())
    }

    fn index(&self, name: &str) -> Result<usize, ConfigurationError> {
        self.names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| ConfigurationError::InvalidMask(format!("unknown parameter {}", name)))
    }

    fn set_initial_values(&mut self, values: Vec<Vec<f64>>) -> Result<(), ConfigurationError> {
        for x in &values {
            check_dimension("initial values", self.names.len(), x.len())?;
        }
        self.initial_values = Some(values);
        Ok(())
    }

    /// The reduced density in the transformed search space
    fn build<'a, D: LogDensity>(
        &self,
        density: &'a D,
        with_jacobian: bool,
    ) -> Result<TransformedLogDensity<ReducedLogDensity<&'a D>>, ConfigurationError> {
        let reduced = ReducedLogDensity::new(density, self.fixed.clone())?;
        let transforms = reduced
            .free_indices()
            .iter()
            .map(|&i| self.transforms[i])
            .collect();
        TransformedLogDensity::new(reduced, transforms, with_jacobian)
    }

    /// Starting points in the search space, given or drawn from the density
    fn starting_points<D: LogDensity>(
        &self,
        search: &TransformedLogDensity<ReducedLogDensity<&D>>,
        n: usize,
        seed: u64,
    ) -> Result<Vec<Vec<f64>>, ConfigurationError> {
        match &self.initial_values {
            Some(values) => {
                if values.len() != n {
                    return Err(ConfigurationError::MissingInitialValues(format!(
                        "{} initial values for {} runs",
                        values.len(),
                        n
                    )));
                }
                Ok(values
                    .iter()
                    .map(|x| search.to_search_space(&search.inner().reduce(x)))
                    .collect())
            }
            None => (0..n)
                .map(|i| {
                    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64));
                    search.sample_initial(&mut rng).ok_or_else(|| {
                        ConfigurationError::MissingInitialValues(
                            "no initial values were given and the log-density cannot sample any"
                                .to_string(),
                        )
                    })
                })
                .collect(),
        }
    }

    /// Full model-space vector for a search-space point
    fn to_model<D: LogDensity>(
        &self,
        search: &TransformedLogDensity<ReducedLogDensity<&D>>,
        y: &[f64],
    ) -> Vec<f64> {
        search.inner().expand(&search.to_model_space(y))
    }
}

/// Maximum a posteriori estimation with multiple starts
///
/// Fixed parameters are removed from the search, the free ones are searched in their
/// transformed space without the Jacobian term, and standard errors come from a Laplace
/// approximation at the best estimate.
pub struct OptimisationController<D> {
    density: D,
    problem: Problem,
    settings: OptimiserSettings,
    optimiser: Box<dyn Optimiser>,
    standard_errors: bool,
}

impl<D: LogDensity> OptimisationController<D> {
    pub fn new(density: D, settings: OptimiserSettings) -> Self {
        let problem = Problem::new(density.parameter_names());
        Self {
            optimiser: optimiser_from_settings(&settings),
            density,
            problem,
            settings,
            standard_errors: true,
        }
    }

    pub fn fix_parameters(mut self, fixed: &[(&str, f64)]) -> Result<Self, ConfigurationError> {
        self.problem.fix(fixed)?;
        Ok(self)
    }

    pub fn with_transforms(
        mut self,
        transforms: &[(&str, Transform)],
    ) -> Result<Self, ConfigurationError> {
        self.problem.transform(transforms)?;
        Ok(self)
    }

    /// One full parameter vector per run
    pub fn with_initial_values(mut self, values: Vec<Vec<f64>>) -> Result<Self, ConfigurationError> {
        self.problem.set_initial_values(values)?;
        Ok(self)
    }

    pub fn with_optimiser(mut self, optimiser: Box<dyn Optimiser>) -> Self {
        self.optimiser = optimiser;
        self
    }

    pub fn with_standard_errors(mut self, standard_errors: bool) -> Self {
        self.standard_errors = standard_errors;
        self
    }

    pub fn run(&self) -> Result<OptimisationResult, PkpdError> {
        let search = self.problem.build(&self.density, false)?;
        let starts = self
            .problem
            .starting_points(&search, self.settings.n_runs, self.settings.seed)?;
        tracing::info!(
            "Maximising a log-density with {} free parameters: {} run(s) of {}",
            search.n_parameters(),
            starts.len(),
            self.optimiser.name()
        );

        let outputs: Vec<Result<OptimisationRun, PkpdError>> = starts
            .par_iter()
            .map(|y0| {
                let output = self.optimiser.maximise(&search, y0)?;
                Ok(OptimisationRun {
                    initial: self.problem.to_model(&search, y0),
                    parameters: self.problem.to_model(&search, &output.parameters),
                    log_density: output.log_density,
                    iterations: output.iterations,
                    converged: output.converged,
                    termination: output.termination,
                })
            })
            .collect();
        let runs = outputs.into_iter().collect::<Result<Vec<_>, _>>()?;

        let mut warnings = Vec::new();
        for (i, run) in runs.iter().enumerate() {
            if !run.converged {
                warnings.push(ConvergenceWarning::new(
                    self.optimiser.name(),
                    format!("run {} stopped before converging ({})", i, run.termination),
                ));
            }
        }
        let best = runs
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.log_density.total_cmp(&b.log_density))
            .map(|(i, _)| i)
            .ok_or_else(|| PkpdError::Optimiser("no optimisation runs".to_string()))?;
        tracing::info!("Best log-density {:.6} from run {}", runs[best].log_density, best);

        let standard_errors = if self.standard_errors {
            let reduced = search.inner();
            let free = reduced.reduce(&runs[best].parameters);
            match laplace_standard_errors(reduced, &free)? {
                Some(errors) => {
                    let mut full = vec![0.0; self.problem.names.len()];
                    for (&i, e) in reduced.free_indices().iter().zip(errors) {
                        full[i] = e;
                    }
                    Some(full)
                }
                None => {
                    warnings.push(ConvergenceWarning::new(
                        "Laplace approximation",
                        "the negative Hessian at the estimate is not positive definite",
                    ));
                    None
                }
            }
        } else {
            None
        };

        Ok(OptimisationResult {
            parameter_names: self.problem.names.clone(),
            runs,
            best,
            standard_errors,
            warnings,
        })
    }
}

/// Finite-difference Hessian of a log-density
pub fn hessian(density: &dyn LogDensity, x: &[f64]) -> Result<DMatrix<f64>, PkpdError> {
    let n = x.len();
    let steps: Vec<f64> = x.iter().map(|v| 1e-4 * v.abs().max(1.0)).collect();
    let mut h = DMatrix::zeros(n, n);
    let mut point = x.to_vec();
    let mut eval = |i: usize, si: f64, j: usize, sj: f64| -> Result<f64, PkpdError> {
        point.copy_from_slice(x);
        point[i] += si * steps[i];
        point[j] += sj * steps[j];
        density.evaluate(&point)
    };
    for i in 0..n {
        for j in i..n {
            let value = (eval(i, 1.0, j, 1.0)? - eval(i, 1.0, j, -1.0)? - eval(i, -1.0, j, 1.0)?
                + eval(i, -1.0, j, -1.0)?)
                / (4.0 * steps[i] * steps[j]);
            h[(i, j)] = value;
            h[(j, i)] = value;
        }
    }
    Ok(h)
}

/// Standard errors from the inverse of the negative Hessian, if it is positive definite
fn laplace_standard_errors(
    density: &dyn LogDensity,
    x: &[f64],
) -> Result<Option<Vec<f64>>, PkpdError> {
    let h = hessian(density, x)?;
    if h.iter().any(|v| !v.is_finite()) {
        return Ok(None);
    }
    let information = -h;
    if information.clone().cholesky().is_none() {
        return Ok(None);
    }
    Ok(information
        .try_inverse()
        .map(|covariance| covariance.diagonal().iter().map(|v| v.sqrt()).collect()))
}

/// Posterior sampling with parallel chains
///
/// Chains run in the transformed space with the Jacobian term, chain `c` is seeded with
/// `seed + c`, and the first `warmup` iterations of every chain are adapted and discarded.
pub struct SamplingController<D> {
    density: D,
    problem: Problem,
    settings: SamplerSettings,
    sampler: Box<dyn Sampler>,
}

impl<D: LogDensity> SamplingController<D> {
    pub fn new(density: D, settings: SamplerSettings) -> Self {
        let problem = Problem::new(density.parameter_names());
        Self {
            sampler: sampler_from_settings(&settings),
            density,
            problem,
            settings,
        }
    }

    pub fn fix_parameters(mut self, fixed: &[(&str, f64)]) -> Result<Self, ConfigurationError> {
        self.problem.fix(fixed)?;
        Ok(self)
    }

    pub fn with_transforms(
        mut self,
        transforms: &[(&str, Transform)],
    ) -> Result<Self, ConfigurationError> {
        self.problem.transform(transforms)?;
        Ok(self)
    }

    /// One full parameter vector per chain
    pub fn with_initial_values(mut self, values: Vec<Vec<f64>>) -> Result<Self, ConfigurationError> {
        self.problem.set_initial_values(values)?;
        Ok(self)
    }

    pub fn with_sampler(mut self, sampler: Box<dyn Sampler>) -> Self {
        self.sampler = sampler;
        self
    }

    fn progress_bar(&self) -> ProgressBar {
        if !self.settings.progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(self.settings.n_chains as u64);
        if let Ok(style) = ProgressStyle::with_template("{msg} [{bar:40}] {pos}/{len} chains ({elapsed})") {
            bar.set_style(style);
        }
        bar.set_message(self.sampler.name());
        bar
    }

    pub fn run(&self) -> Result<SamplingResult, PkpdError> {
        let settings = &self.settings;
        if settings.n_chains == 0 || settings.warmup >= settings.n_iterations {
            return Err(ConfigurationError::InvalidSetting(format!(
                "need at least one chain and more iterations ({}) than warm-up ({})",
                settings.n_iterations, settings.warmup
            ))
            .into());
        }
        let search = self.problem.build(&self.density, true)?;
        let starts = self
            .problem
            .starting_points(&search, settings.n_chains, settings.seed)?;
        tracing::info!(
            "Sampling {} free parameters: {} chain(s) of {} iterations with {}",
            search.n_parameters(),
            settings.n_chains,
            settings.n_iterations,
            self.sampler.name()
        );

        let bar = self.progress_bar();
        let chains: Vec<Result<_, PkpdError>> = starts
            .par_iter()
            .enumerate()
            .map(|(c, y0)| {
                let chain = self.sampler.run(
                    &search,
                    y0,
                    settings.n_iterations,
                    settings.seed.wrapping_add(c as u64),
                )?;
                bar.inc(1);
                Ok(chain)
            })
            .collect();
        bar.finish_and_clear();
        let chains = chains.into_iter().collect::<Result<Vec<_>, _>>()?;

        let mut draws = Vec::with_capacity(chains.len());
        let mut log_densities = Vec::with_capacity(chains.len());
        let mut acceptance_rates = Vec::with_capacity(chains.len());
        for chain in &chains {
            draws.push(
                chain
                    .samples
                    .iter()
                    .skip(settings.warmup)
                    .map(|y| self.problem.to_model(&search, y))
                    .collect::<Vec<_>>(),
            );
            log_densities.push(chain.log_densities[settings.warmup..].to_vec());
            acceptance_rates.push(chain.acceptance_rate);
        }

        let free = search.inner().free_indices();
        let mut rhat = vec![f64::NAN; self.problem.names.len()];
        let mut warnings = Vec::new();
        for &i in free {
            let traces: Vec<Vec<f64>> = draws
                .iter()
                .map(|chain| chain.iter().map(|x| x[i]).collect())
                .collect();
            rhat[i] = split_rhat(&traces);
            if rhat[i] > 1.1 {
                warnings.push(ConvergenceWarning::new(
                    self.sampler.name(),
                    format!("split R-hat of {} is {:.3}", self.problem.names[i], rhat[i]),
                ));
            }
        }

        Ok(SamplingResult {
            parameter_names: self.problem.names.clone(),
            chains: draws,
            log_densities,
            acceptance_rates,
            warmup: settings.warmup,
            rhat,
            warnings,
        })
    }
}
