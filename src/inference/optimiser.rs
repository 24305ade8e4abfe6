use std::sync::atomic::{AtomicUsize, Ordering};

use argmin::{
    core::{CostFunction, Error, Executor, Gradient, State, TerminationReason, TerminationStatus},
    solver::{linesearch::MoreThuenteLineSearch, neldermead::NelderMead, quasinewton::LBFGS},
};
use serde::{Deserialize, Serialize};

use crate::error::PkpdError;
use crate::posterior::LogDensity;
use crate::settings::{OptimiserKind, OptimiserSettings};

/// Outcome of a single maximisation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimiserOutput {
    pub parameters: Vec<f64>,
    pub log_density: f64,
    pub iterations: u64,
    pub evaluations: usize,
    /// Whether the optimiser stopped on its own convergence criterion
    pub converged: bool,
    pub termination: String,
}

/// Maximises a [LogDensity] from a starting point
pub trait Optimiser: Send + Sync {
    fn name(&self) -> &'static str;

    fn maximise(&self, density: &dyn LogDensity, x0: &[f64]) -> Result<OptimiserOutput, PkpdError>;
}

/// The shipped optimiser selected by `settings`
pub fn optimiser_from_settings(settings: &OptimiserSettings) -> Box<dyn Optimiser> {
    match settings.kind {
        OptimiserKind::NelderMead => Box::new(NelderMeadOptimiser {
            max_iters: settings.max_iters,
            sd_tolerance: settings.sd_tolerance,
            ..NelderMeadOptimiser::default()
        }),
        OptimiserKind::Lbfgs => Box::new(LbfgsOptimiser {
            max_iters: settings.max_iters,
            ..LbfgsOptimiser::default()
        }),
    }
}

/// Negated log-density as an argmin problem
struct Objective<'a> {
    density: &'a dyn LogDensity,
    evaluations: &'a AtomicUsize,
}

impl CostFunction for Objective<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, x: &Self::Param) -> Result<Self::Output, Error> {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        let value = self.density.evaluate(x)?;
        if value.is_nan() {
            return Ok(f64::INFINITY);
        }
        Ok(-value)
    }
}

impl Gradient for Objective<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, x: &Self::Param) -> Result<Self::Gradient, Error> {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        let (_, gradient) = self.density.evaluate_with_gradient(x)?;
        Ok(gradient.into_iter().map(|g| -g).collect())
    }
}

fn is_converged(status: &TerminationStatus) -> bool {
    matches!(
        status,
        TerminationStatus::Terminated(TerminationReason::SolverConverged)
            | TerminationStatus::Terminated(TerminationReason::TargetCostReached)
    )
}

/// Derivative-free simplex search
#[derive(Debug, Clone, Copy)]
pub struct NelderMeadOptimiser {
    pub max_iters: u64,
    /// Standard deviation of the simplex costs at which the search stops
    pub sd_tolerance: f64,
    /// Relative size of the initial simplex
    pub perturbation: f64,
}

impl Default for NelderMeadOptimiser {
    fn default() -> Self {
        Self {
            max_iters: 1000,
            sd_tolerance: 1e-8,
            perturbation: 0.05,
        }
    }
}

impl NelderMeadOptimiser {
    fn initial_simplex(&self, x0: &[f64]) -> Vec<Vec<f64>> {
        let mut vertices = Vec::with_capacity(x0.len() + 1);
        vertices.push(x0.to_vec());
        for i in 0..x0.len() {
            let perturbation = if x0[i] == 0.0 {
                self.perturbation
            } else {
                self.perturbation * x0[i]
            };
            let mut vertex = x0.to_vec();
            vertex[i] += perturbation;
            vertices.push(vertex);
        }
        vertices
    }
}

impl Optimiser for NelderMeadOptimiser {
    fn name(&self) -> &'static str {
        "Nelder-Mead"
    }

    fn maximise(&self, density: &dyn LogDensity, x0: &[f64]) -> Result<OptimiserOutput, PkpdError> {
        let evaluations = AtomicUsize::new(0);
        let problem = Objective {
            density,
            evaluations: &evaluations,
        };
        let solver: NelderMead<Vec<f64>, f64> = NelderMead::new(self.initial_simplex(x0))
            .with_sd_tolerance(self.sd_tolerance)
            .map_err(PkpdError::from_anyhow)?;
        let result = Executor::new(problem, solver)
            .configure(|state| state.max_iters(self.max_iters))
            .run()
            .map_err(PkpdError::from_anyhow)?;

        let state = result.state();
        let parameters = state
            .get_best_param()
            .cloned()
            .ok_or_else(|| PkpdError::Optimiser("Nelder-Mead returned no parameters".to_string()))?;
        Ok(OptimiserOutput {
            parameters,
            log_density: -state.get_best_cost(),
            iterations: state.get_iter(),
            evaluations: evaluations.load(Ordering::Relaxed),
            converged: is_converged(state.get_termination_status()),
            termination: state.get_termination_status().to_string(),
        })
    }
}

/// Limited-memory BFGS with a More-Thuente line search
///
/// Needs a finite log-density and gradient along the whole path; starting points with a
/// log-density of negative infinity are rejected.
#[derive(Debug, Clone, Copy)]
pub struct LbfgsOptimiser {
    pub max_iters: u64,
    /// Number of stored correction pairs
    pub memory: usize,
    pub tolerance_grad: f64,
    pub tolerance_cost: f64,
}

impl Default for LbfgsOptimiser {
    fn default() -> Self {
        Self {
            max_iters: 1000,
            memory: 7,
            tolerance_grad: 1e-6,
            tolerance_cost: 1e-12,
        }
    }
}

impl Optimiser for LbfgsOptimiser {
    fn name(&self) -> &'static str {
        "L-BFGS"
    }

    fn maximise(&self, density: &dyn LogDensity, x0: &[f64]) -> Result<OptimiserOutput, PkpdError> {
        if !density.evaluate(x0)?.is_finite() {
            return Err(PkpdError::Optimiser(
                "L-BFGS needs a starting point with finite log-density".to_string(),
            ));
        }
        let evaluations = AtomicUsize::new(0);
        let problem = Objective {
            density,
            evaluations: &evaluations,
        };
        let linesearch = MoreThuenteLineSearch::new();
        let solver = LBFGS::new(linesearch, self.memory)
            .with_tolerance_grad(self.tolerance_grad)
            .and_then(|solver| solver.with_tolerance_cost(self.tolerance_cost))
            .map_err(PkpdError::from_anyhow)?;
        let result = Executor::new(problem, solver)
            .configure(|state| state.param(x0.to_vec()).max_iters(self.max_iters))
            .run()
            .map_err(PkpdError::from_anyhow)?;

        let state = result.state();
        let parameters = state
            .get_best_param()
            .cloned()
            .ok_or_else(|| PkpdError::Optimiser("L-BFGS returned no parameters".to_string()))?;
        Ok(OptimiserOutput {
            parameters,
            log_density: -state.get_best_cost(),
            iterations: state.get_iter(),
            evaluations: evaluations.load(Ordering::Relaxed),
            converged: is_converged(state.get_termination_status()),
            termination: state.get_termination_status().to_string(),
        })
    }
}
