//! Model-informed precision dosing.
//!
//! A [RegimenTemplate] describes a family of regimens with a few free knobs (dose amounts,
//! dosing interval). [RegimenOptimiser] searches the knobs with Nelder-Mead so that the
//! simulated response of an individual meets a [TargetCriterion]. The individual is given
//! either as a point estimate or as posterior draws, in which case the expected cost over
//! the draws is minimised.

pub mod criterion;
pub mod regimen;

use argmin::{
    core::{CostFunction, Error, Executor, State, TerminationReason, TerminationStatus},
    solver::neldermead::NelderMead,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

pub use criterion::TargetCriterion;
pub use regimen::{Amounts, Knob, RegimenTemplate, Schedule};

use crate::data::DosingRegimen;
use crate::error::{ConfigurationError, ConvergenceWarning, PkpdError};
use crate::settings::SolverSettings;
use crate::simulator::MechanisticModel;

/// Model parameters of the individual a regimen is optimised for
///
/// Vectors may carry trailing noise parameters (as produced by the hierarchical
/// log-posterior); only the leading model parameters are used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IndividualParameters {
    Point(Vec<f64>),
    /// Posterior draws; the cost is averaged over them
    Samples(Vec<Vec<f64>>),
}

impl IndividualParameters {
    fn draws(&self) -> Vec<&[f64]> {
        match self {
            IndividualParameters::Point(theta) => vec![theta.as_slice()],
            IndividualParameters::Samples(samples) => samples.iter().map(Vec::as_slice).collect(),
        }
    }
}

/// The best regimen found for an individual
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimenOptimisation {
    pub regimen: DosingRegimen,
    /// Values of the free knobs
    pub knobs: Vec<f64>,
    pub cost: f64,
    pub iterations: u64,
    pub warning: Option<ConvergenceWarning>,
}

/// Nelder-Mead search over the free knobs of a [RegimenTemplate]
#[derive(Debug, Clone, Copy)]
pub struct RegimenOptimiser {
    pub settings: SolverSettings,
    pub max_iters: u64,
    pub sd_tolerance: f64,
}

impl Default for RegimenOptimiser {
    fn default() -> Self {
        Self {
            settings: SolverSettings::default(),
            max_iters: 500,
            sd_tolerance: 1e-10,
        }
    }
}

struct RegimenCost<'a> {
    model: &'a MechanisticModel,
    template: &'a RegimenTemplate,
    criterion: &'a TargetCriterion,
    draws: Vec<&'a [f64]>,
    times: Vec<f64>,
    settings: &'a SolverSettings,
}

impl RegimenCost<'_> {
    fn evaluate(&self, x: &[f64]) -> Result<f64, PkpdError> {
        if !self.template.in_bounds(x) {
            return Ok(f64::INFINITY);
        }
        let regimen = match self.template.build(x) {
            Ok(regimen) => regimen,
            Err(_) => return Ok(f64::INFINITY),
        };
        let n = self.model.n_parameters();
        let costs: Vec<Result<f64, PkpdError>> = self
            .draws
            .par_iter()
            .map(|theta| {
                match self
                    .model
                    .simulate(&theta[..n], &regimen, &self.times, self.settings)
                {
                    Ok(result) => Ok(self.criterion.cost(&result)),
                    Err(PkpdError::Simulation(_)) => Ok(f64::INFINITY),
                    Err(err) => Err(err),
                }
            })
            .collect();
        let mut total = 0.0;
        for cost in costs {
            total += cost?;
        }
        Ok(total / self.draws.len() as f64)
    }
}

impl CostFunction for RegimenCost<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, x: &Self::Param) -> Result<Self::Output, Error> {
        Ok(self.evaluate(x)?)
    }
}

impl RegimenOptimiser {
    fn initial_simplex(template: &RegimenTemplate) -> Vec<Vec<f64>> {
        let initial = template.initial();
        let mut vertices = vec![initial.clone()];
        for (i, (lower, upper)) in template.bounds().into_iter().enumerate() {
            let step = 0.1 * (upper - lower);
            let mut vertex = initial.clone();
            vertex[i] = if vertex[i] + step <= upper {
                vertex[i] + step
            } else {
                vertex[i] - step
            };
            vertices.push(vertex);
        }
        vertices
    }

    pub fn optimise(
        &self,
        model: &MechanisticModel,
        template: &RegimenTemplate,
        criterion: &TargetCriterion,
        parameters: &IndividualParameters,
    ) -> Result<RegimenOptimisation, PkpdError> {
        template.validate()?;
        criterion.validate(model.n_outputs())?;
        let draws = parameters.draws();
        if draws.is_empty() {
            return Err(ConfigurationError::InvalidSetting(
                "no individual parameters to optimise for".to_string(),
            )
            .into());
        }
        if let Some(theta) = draws.iter().find(|theta| theta.len() < model.n_parameters()) {
            return Err(ConfigurationError::ParameterCount {
                context: "individual parameters".to_string(),
                expected: model.n_parameters(),
                found: theta.len(),
            }
            .into());
        }
        let problem = RegimenCost {
            model,
            template,
            criterion,
            draws,
            times: criterion.times(),
            settings: &self.settings,
        };

        if template.n_free() == 0 {
            let cost = problem.evaluate(&[])?;
            return Ok(RegimenOptimisation {
                regimen: template.build(&[])?,
                knobs: vec![],
                cost,
                iterations: 0,
                warning: None,
            });
        }

        tracing::info!(
            "Optimising {} regimen knob(s) over {} parameter draw(s)",
            template.n_free(),
            problem.draws.len()
        );
        let solver: NelderMead<Vec<f64>, f64> = NelderMead::new(Self::initial_simplex(template))
            .with_sd_tolerance(self.sd_tolerance)
            .map_err(PkpdError::from_anyhow)?;
        let result = Executor::new(problem, solver)
            .configure(|state| state.max_iters(self.max_iters))
            .run()
            .map_err(PkpdError::from_anyhow)?;

        let state = result.state();
        let knobs = state
            .get_best_param()
            .cloned()
            .ok_or_else(|| PkpdError::Optimiser("no regimen was evaluated".to_string()))?;
        let cost = state.get_best_cost();
        if !cost.is_finite() {
            return Err(PkpdError::Optimiser(
                "every regimen tried failed to simulate or violated the bounds".to_string(),
            ));
        }
        let warning = match state.get_termination_status() {
            TerminationStatus::Terminated(TerminationReason::SolverConverged) => None,
            status => Some(ConvergenceWarning::new(
                "Regimen optimiser",
                format!("stopped before converging ({})", status),
            )),
        };
        Ok(RegimenOptimisation {
            regimen: template.build(&knobs)?,
            knobs,
            cost,
            iterations: state.get_iter(),
            warning,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn one_compartment() -> MechanisticModel {
        MechanisticModel::new(
            |x, p, _t, dx, rateiv| {
                fetch_params!(p, ke, _v);
                dx[0] = -ke * x[0] + rateiv[0];
            },
            |_p| lag! {},
            |_p| fa! {},
            |_p, _x| {},
            |x, p, _t, y| {
                fetch_params!(p, _ke, v);
                y[0] = x[0] / v;
            },
            (1, 1),
            vec!["ke", "v"],
        )
    }

    #[test]
    fn single_bolus_hits_a_level() {
        let template = RegimenTemplate {
            schedule: Schedule::Fixed(vec![0.0]),
            amounts: Amounts::Shared(Knob::Free {
                initial: 100.0,
                lower: 0.0,
                upper: 1000.0,
            }),
            duration: 0.0,
            input: 0,
        };
        let criterion = TargetCriterion::Level {
            output: 0,
            target: 5.0,
            times: vec![10.0],
        };
        // C(10) = D / V exp(-10 ke), so D = 5 V exp(10 ke)
        let theta = vec![0.1, 20.0];
        let optimised = RegimenOptimiser::default()
            .optimise(
                &one_compartment(),
                &template,
                &criterion,
                &IndividualParameters::Point(theta),
            )
            .unwrap();
        assert_relative_eq!(optimised.knobs[0], 100.0 * 1f64.exp(), max_relative = 1e-3);
        assert!(optimised.cost < 1e-6);
    }

    #[test]
    fn fixed_template_is_evaluated_once() {
        let template = RegimenTemplate {
            schedule: Schedule::Fixed(vec![0.0]),
            amounts: Amounts::Shared(Knob::Fixed(100.0)),
            duration: 0.0,
            input: 0,
        };
        let criterion = TargetCriterion::Level {
            output: 0,
            target: 5.0,
            times: vec![0.0],
        };
        let optimised = RegimenOptimiser::default()
            .optimise(
                &one_compartment(),
                &template,
                &criterion,
                &IndividualParameters::Samples(vec![vec![0.1, 20.0, 0.5], vec![0.2, 20.0, 0.5]]),
            )
            .unwrap();
        assert_eq!(optimised.iterations, 0);
        assert_relative_eq!(optimised.cost, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn short_parameter_vectors_are_rejected() {
        let template = RegimenTemplate {
            schedule: Schedule::Fixed(vec![0.0]),
            amounts: Amounts::Shared(Knob::Fixed(100.0)),
            duration: 0.0,
            input: 0,
        };
        let criterion = TargetCriterion::Level {
            output: 0,
            target: 5.0,
            times: vec![1.0],
        };
        let result = RegimenOptimiser::default().optimise(
            &one_compartment(),
            &template,
            &criterion,
            &IndividualParameters::Point(vec![0.1]),
        );
        assert!(matches!(result, Err(PkpdError::Configuration(_))));
    }
}
