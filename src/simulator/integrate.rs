use std::collections::HashMap;
use std::time::Instant;

use ndarray::{Array2, Array3};

use crate::data::{Dose, DosingRegimen, Infusion};
use crate::error::{PkpdError, SimulationError, SimulationFailure};
use crate::settings::SolverSettings;
use crate::simulator::solver::{SolverFailure, SolverFailureKind};
use crate::simulator::sensitivity::{
    augmented_rhs, initial_sensitivity, output_sensitivity, DosingSensitivity,
    ParameterPerturbation,
};
use crate::simulator::{MechanisticModel, SimulationResult, SimulationStats, M, T, V};

/// A bolus at its lag-shifted time
#[derive(Debug, Clone, Copy)]
struct ScheduledBolus {
    time: f64,
    amount: f64,
    input: usize,
}

/// Quantities needed to propagate sensitivities through the segments
struct SensitivityContext {
    perturbation: ParameterPerturbation,
    fa_perturbed: Vec<(HashMap<usize, T>, HashMap<usize, T>)>,
    dosing: DosingSensitivity,
}

fn bioavailability(fa: &HashMap<usize, T>, input: usize) -> f64 {
    fa.get(&input).copied().unwrap_or(1.0)
}

/// Infusion rates in effect just after time `t`
fn infusion_rates(infusions: &[Infusion], fa: &HashMap<usize, T>, t: f64, n_states: usize) -> V {
    let mut rates = V::zeros(n_states);
    for infusion in infusions {
        if infusion.time() <= t && t < infusion.end_time() {
            rates[infusion.input()] += bioavailability(fa, infusion.input()) * infusion.rate();
        }
    }
    rates
}

fn check_dosing(lag: &HashMap<usize, T>, fa: &HashMap<usize, T>) -> Result<(), SimulationError> {
    for (input, value) in lag {
        if !value.is_finite() || *value < 0.0 {
            return Err(SimulationError::new(
                SimulationFailure::InvalidDosing(format!(
                    "lag time {} for compartment {}",
                    value, input
                )),
                0.0,
                vec![],
            ));
        }
    }
    for (input, value) in fa {
        if !value.is_finite() || *value < 0.0 {
            return Err(SimulationError::new(
                SimulationFailure::InvalidDosing(format!(
                    "bioavailability {} for compartment {}",
                    value, input
                )),
                0.0,
                vec![],
            ));
        }
    }
    Ok(())
}

fn state_of(z: &V, n_states: usize) -> Vec<f64> {
    z.rows(0, n_states).iter().copied().collect()
}

/// Share of the step and wall-clock budgets left for the next segment
fn remaining_budget(
    settings: &SolverSettings,
    stats: &SimulationStats,
    started: Instant,
) -> SolverSettings {
    SolverSettings {
        max_steps: settings.max_steps.saturating_sub(stats.steps()).max(1),
        max_wall_time: settings
            .max_wall_time
            .map(|budget| (budget - started.elapsed().as_secs_f64()).max(0.0)),
        ..*settings
    }
}

/// Budget exhaustion inside a segment is reported like exhaustion between segments
fn segment_failure(
    failure: SolverFailure,
    settings: &SolverSettings,
    stats: &SimulationStats,
    started: Instant,
    state: Vec<f64>,
) -> SimulationError {
    let kind = match failure.kind {
        SolverFailureKind::StepLimit => SimulationFailure::StepBudget {
            steps: stats.steps() + failure.steps,
            max_steps: settings.max_steps,
        },
        SolverFailureKind::WallTime => SimulationFailure::WallTime {
            elapsed: started.elapsed().as_secs_f64(),
            max_wall_time: settings.max_wall_time.unwrap_or(0.0),
        },
        _ => SimulationFailure::Solver(failure.reason),
    };
    SimulationError {
        failure: kind,
        time: failure.time,
        state,
        step_size: failure.step_size,
    }
}

/// Integrate the model over the merged breakpoints
///
/// Times must already be validated (finite, non-negative). The returned result lists the
/// times in ascending order.
pub(crate) fn simulate(
    model: &MechanisticModel,
    theta: &V,
    regimen: &DosingRegimen,
    times: &[f64],
    settings: &SolverSettings,
    with_sensitivities: bool,
) -> Result<SimulationResult, PkpdError> {
    let (n_states, n_outputs) = model.neqs;
    let n_params = theta.len();
    let started = Instant::now();

    let mut times = times.to_vec();
    times.sort_by(|a, b| a.total_cmp(b));
    let t_end = times.last().copied().unwrap_or(0.0);

    if theta.iter().any(|value| !value.is_finite()) {
        return Err(SimulationError::new(SimulationFailure::NonFiniteParameters, 0.0, vec![]).into());
    }

    let lag = (model.lag)(theta);
    let fa = (model.fa)(theta);
    check_dosing(&lag, &fa)?;

    let mut boluses: Vec<ScheduledBolus> = regimen
        .iter()
        .filter_map(|dose| match dose {
            Dose::Bolus(bolus) => Some(ScheduledBolus {
                time: bolus.time() + lag.get(&bolus.input()).copied().unwrap_or(0.0),
                amount: bolus.amount(),
                input: bolus.input(),
            }),
            Dose::Infusion(_) => None,
        })
        .filter(|bolus| bolus.time <= t_end)
        .collect();
    boluses.sort_by(|a, b| a.time.total_cmp(&b.time));

    let infusions: Vec<Infusion> = regimen
        .iter()
        .filter_map(|dose| match dose {
            Dose::Infusion(infusion) if infusion.time() <= t_end => Some(*infusion),
            _ => None,
        })
        .collect();

    let mut breakpoints = vec![0.0];
    breakpoints.extend(times.iter().copied());
    breakpoints.extend(boluses.iter().map(|bolus| bolus.time));
    for infusion in &infusions {
        breakpoints.push(infusion.time());
        if infusion.end_time() <= t_end {
            breakpoints.push(infusion.end_time());
        }
    }
    breakpoints.sort_by(|a, b| a.total_cmp(b));
    breakpoints.dedup();

    let context = if with_sensitivities {
        let perturbation = ParameterPerturbation::new(theta, settings.fd_step);
        let fa_perturbed = (0..n_params)
            .map(|j| {
                (
                    (model.fa)(&perturbation.plus[j]),
                    (model.fa)(&perturbation.minus[j]),
                )
            })
            .collect();
        let dosing = DosingSensitivity::new(model.lag, model.fa, &perturbation);
        Some(SensitivityContext {
            perturbation,
            fa_perturbed,
            dosing,
        })
    } else {
        None
    };

    let mut x0 = V::zeros(n_states);
    (model.init)(theta, &mut x0);
    let mut z = match &context {
        Some(context) => {
            let s0 = initial_sensitivity(model.init, &context.perturbation, n_states);
            let mut z = V::zeros(n_states * (1 + n_params));
            z.rows_mut(0, n_states).copy_from(&x0);
            z.as_mut_slice()[n_states..].copy_from_slice(s0.as_slice());
            z
        }
        None => x0,
    };
    if z.iter().any(|value| !value.is_finite()) {
        return Err(SimulationError::new(
            SimulationFailure::NonFiniteState,
            0.0,
            state_of(&z, n_states),
        )
        .into());
    }

    let mut states = Array2::zeros((times.len(), n_states));
    let mut outputs = Array2::zeros((times.len(), n_outputs));
    let mut sensitivities = context
        .as_ref()
        .map(|_| Array3::zeros((times.len(), n_outputs, n_params)));
    let mut stats = SimulationStats::default();

    let mut t = 0.0;
    let mut next_bolus = 0;
    let mut next_time = 0;

    for &breakpoint in &breakpoints {
        if breakpoint > t {
            let mid = 0.5 * (t + breakpoint);
            let rates = infusion_rates(&infusions, &fa, mid, n_states);

            let x = z.rows(0, n_states).into_owned();
            let mut dx = V::zeros(n_states);
            (model.diffeq)(&x, theta, t, &mut dx, &rates);
            if dx.iter().any(|value| !value.is_finite()) {
                return Err(PkpdError::NumericalAnomaly(format!(
                    "right-hand side returned non-finite derivatives at t = {} from state {:?}",
                    t,
                    x.as_slice()
                )));
            }

            let budget = remaining_budget(settings, &stats, started);
            let solution = match &context {
                Some(context) => {
                    let rates_perturbed: Vec<(V, V)> = context
                        .fa_perturbed
                        .iter()
                        .map(|(plus, minus)| {
                            (
                                infusion_rates(&infusions, plus, mid, n_states),
                                infusion_rates(&infusions, minus, mid, n_states),
                            )
                        })
                        .collect();
                    let rhs = |time: T, y: &V, dy: &mut V| {
                        augmented_rhs(
                            model.diffeq,
                            time,
                            y,
                            theta,
                            &rates,
                            &rates_perturbed,
                            &context.perturbation,
                            n_states,
                            settings.fd_step,
                            dy,
                        )
                    };
                    model.solver.integrate(&rhs, t, breakpoint, &z, &budget)
                }
                None => {
                    let rhs = |time: T, y: &V, dy: &mut V| {
                        dy.fill(0.0);
                        (model.diffeq)(y, theta, time, dy, &rates)
                    };
                    model.solver.integrate(&rhs, t, breakpoint, &z, &budget)
                }
            };

            let solution = solution.map_err(|failure| {
                segment_failure(failure, settings, &stats, started, state_of(&z, n_states))
            })?;

            stats.accepted_steps += solution.accepted_steps;
            stats.rejected_steps += solution.rejected_steps;
            stats.rhs_evaluations += solution.rhs_evaluations;
            stats.segments += 1;

            if stats.steps() > settings.max_steps {
                return Err(SimulationError::new(
                    SimulationFailure::StepBudget {
                        steps: stats.steps(),
                        max_steps: settings.max_steps,
                    },
                    breakpoint,
                    state_of(&solution.state, n_states),
                )
                .into());
            }
            if let Some(max_wall_time) = settings.max_wall_time {
                let elapsed = started.elapsed().as_secs_f64();
                if elapsed > max_wall_time {
                    return Err(SimulationError::new(
                        SimulationFailure::WallTime {
                            elapsed,
                            max_wall_time,
                        },
                        breakpoint,
                        state_of(&solution.state, n_states),
                    )
                    .into());
                }
            }

            z = solution.state;
            if z.iter().any(|value| !value.is_finite()) {
                return Err(SimulationError::new(
                    SimulationFailure::NonFiniteState,
                    breakpoint,
                    state_of(&z, n_states),
                )
                .into());
            }
            t = breakpoint;
        }

        // Doses first, then the outputs recorded at the same time
        while next_bolus < boluses.len() && boluses[next_bolus].time <= breakpoint {
            let bolus = boluses[next_bolus];
            let fraction = bioavailability(&fa, bolus.input);
            match &context {
                Some(context) => {
                    let rates = infusion_rates(&infusions, &fa, breakpoint, n_states);
                    let mut f_before = V::zeros(n_states);
                    let x_before = z.rows(0, n_states).into_owned();
                    (model.diffeq)(&x_before, theta, breakpoint, &mut f_before, &rates);

                    z[bolus.input] += fraction * bolus.amount;

                    let mut f_after = V::zeros(n_states);
                    let x_after = z.rows(0, n_states).into_owned();
                    (model.diffeq)(&x_after, theta, breakpoint, &mut f_after, &rates);

                    if let Some(dfa) = context.dosing.fa.get(&bolus.input) {
                        for (j, dfa_j) in dfa.iter().enumerate() {
                            z[n_states + j * n_states + bolus.input] += bolus.amount * dfa_j;
                        }
                    }
                    if let Some(dlag) = context.dosing.lag.get(&bolus.input) {
                        for (j, dlag_j) in dlag.iter().enumerate() {
                            for i in 0..n_states {
                                z[n_states + j * n_states + i] +=
                                    (f_before[i] - f_after[i]) * dlag_j;
                            }
                        }
                    }
                }
                None => {
                    z[bolus.input] += fraction * bolus.amount;
                }
            }
            next_bolus += 1;
        }

        while next_time < times.len() && times[next_time] <= breakpoint {
            let x = z.rows(0, n_states).into_owned();
            let mut y = V::zeros(n_outputs);
            (model.out)(&x, theta, breakpoint, &mut y);
            for i in 0..n_states {
                states[[next_time, i]] = x[i];
            }
            for o in 0..n_outputs {
                outputs[[next_time, o]] = y[o];
            }
            if let (Some(context), Some(sensitivities)) = (&context, sensitivities.as_mut()) {
                let sens = M::from_column_slice(n_states, n_params, &z.as_slice()[n_states..]);
                let output_sens = output_sensitivity(
                    model.out,
                    &x,
                    theta,
                    breakpoint,
                    &sens,
                    &context.perturbation,
                    n_outputs,
                    settings.fd_step,
                );
                for o in 0..n_outputs {
                    for j in 0..n_params {
                        sensitivities[[next_time, o, j]] = output_sens[(o, j)];
                    }
                }
            }
            next_time += 1;
        }
    }

    Ok(SimulationResult::new(
        times,
        states,
        outputs,
        sensitivities,
        stats,
    ))
}
