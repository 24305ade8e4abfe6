use std::cell::Cell;
use std::fmt;
use std::time::{Duration, Instant};

use ode_solvers::dop_shared::{IntegrationError, OutputType};
use ode_solvers::Dopri5;

use crate::settings::SolverSettings;
use crate::simulator::{T, V};

/// State at the end of one integrated segment
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentSolution {
    pub state: V,
    pub accepted_steps: usize,
    pub rejected_steps: usize,
    pub rhs_evaluations: usize,
}

/// Why an [OdeSolver] stopped before the end of its segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverFailureKind {
    /// `settings.max_steps` steps were attempted within the segment
    StepLimit,
    /// `settings.max_wall_time` elapsed within the segment
    WallTime,
    StepSizeUnderflow,
    Stiffness,
    /// The solver finished without producing the state at the segment end
    MissingOutput,
}

/// Failure reported by an [OdeSolver]
///
/// `time` is the absolute time at which the solver stopped. `step_size` is the last step
/// the solver accepted, when it took one.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverFailure {
    pub kind: SolverFailureKind,
    pub time: f64,
    pub step_size: Option<f64>,
    pub steps: usize,
    pub reason: String,
}

impl fmt::Display for SolverFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at t = {}", self.reason, self.time)
    }
}

/// An adaptive integrator for a single smooth segment `[t0, t1]`
///
/// Implementors must be reentrant: every call owns its own workspace. The right-hand side
/// receives the absolute time. `settings.max_steps` and `settings.max_wall_time` bound this
/// call alone; the caller passes whatever is left of the simulation budget.
pub trait OdeSolver: fmt::Debug + Send + Sync {
    fn integrate(
        &self,
        rhs: &dyn Fn(T, &V, &mut V),
        t0: T,
        t1: T,
        y0: &V,
        settings: &SolverSettings,
    ) -> Result<SegmentSolution, SolverFailure>;
}

/// Dormand-Prince 5(4) from the `ode_solvers` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct Dopri5Solver;

/// Relative time and size of the last accepted step
#[derive(Debug, Default)]
struct Progress {
    x: Cell<f64>,
    step: Cell<Option<f64>>,
    timed_out: Cell<bool>,
}

struct Segment<'a> {
    rhs: &'a dyn Fn(T, &V, &mut V),
    t0: T,
    deadline: Option<Instant>,
    progress: &'a Progress,
}

// The segment is integrated in relative time starting at zero
impl ode_solvers::System<T, V> for Segment<'_> {
    fn system(&self, t: T, y: &V, dy: &mut V) {
        (self.rhs)(self.t0 + t, y, dy)
    }

    fn solout(&mut self, x: T, _y: &V, _dy: &V) -> bool {
        self.progress.step.set(Some(x - self.progress.x.get()));
        self.progress.x.set(x);
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                self.progress.timed_out.set(true);
                true
            }
            _ => false,
        }
    }
}

impl OdeSolver for Dopri5Solver {
    fn integrate(
        &self,
        rhs: &dyn Fn(T, &V, &mut V),
        t0: T,
        t1: T,
        y0: &V,
        settings: &SolverSettings,
    ) -> Result<SegmentSolution, SolverFailure> {
        let h = t1 - t0;
        if h <= 0.0 {
            return Ok(SegmentSolution {
                state: y0.clone(),
                accepted_steps: 0,
                rejected_steps: 0,
                rhs_evaluations: 0,
            });
        }

        let deadline = settings
            .max_wall_time
            .and_then(|seconds| Duration::try_from_secs_f64(seconds.max(0.0)).ok())
            .and_then(|budget| Instant::now().checked_add(budget));
        let progress = Progress::default();
        // Attempts are counted from zero and checked before each step
        let n_max = settings.max_steps.saturating_sub(1).min(u32::MAX as usize) as u32;

        // Overshoot slightly so that the dense output at exactly `h` is always emitted
        let x_end = h * (1.0 + 1e-10);
        let system = Segment {
            rhs,
            t0,
            deadline,
            progress: &progress,
        };
        let mut stepper = Dopri5::from_param(
            system,
            0.0,
            x_end,
            h,
            y0.clone(),
            settings.rtol,
            settings.atol,
            0.9,
            0.04,
            0.2,
            10.0,
            x_end,
            0.0,
            n_max,
            1000,
            OutputType::Dense,
        );

        let failure = |kind, x: f64, steps: usize, reason: String| SolverFailure {
            kind,
            time: t0 + x,
            step_size: progress.step.get(),
            steps,
            reason,
        };

        let stats = match stepper.integrate() {
            Ok(stats) => stats,
            Err(err) => {
                let reason = err.to_string();
                return Err(match err {
                    IntegrationError::MaxNumStepReached { x, n_step } => {
                        failure(SolverFailureKind::StepLimit, x, n_step as usize, reason)
                    }
                    IntegrationError::StepSizeUnderflow { x } => {
                        failure(SolverFailureKind::StepSizeUnderflow, x, 0, reason)
                    }
                    IntegrationError::StiffnessDetected { x } => {
                        failure(SolverFailureKind::Stiffness, x, 0, reason)
                    }
                });
            }
        };
        let steps = (stats.accepted_steps + stats.rejected_steps) as usize;

        if progress.timed_out.get() && progress.x.get() < h {
            return Err(failure(
                SolverFailureKind::WallTime,
                progress.x.get(),
                steps,
                "wall-clock budget exhausted".to_string(),
            ));
        }

        let tolerance = 1e-8 * h.max(1.0);
        let state = stepper
            .x_out()
            .iter()
            .zip(stepper.y_out().iter())
            .rev()
            .find(|(x, _)| (**x - h).abs() <= tolerance)
            .map(|(_, y)| y.clone())
            .ok_or_else(|| {
                failure(
                    SolverFailureKind::MissingOutput,
                    progress.x.get(),
                    steps,
                    "no dense output at the end of the segment".to_string(),
                )
            })?;

        Ok(SegmentSolution {
            state,
            accepted_steps: stats.accepted_steps as usize,
            rejected_steps: stats.rejected_steps as usize,
            rhs_evaluations: stats.num_eval as usize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn exponential_decay_segment() {
        let rhs = |_t: T, y: &V, dy: &mut V| {
            dy[0] = -0.5 * y[0];
        };
        let settings = SolverSettings::default().with_tolerances(1e-10, 1e-12);
        let y0 = V::from_vec(vec![2.0]);
        let solution = Dopri5Solver
            .integrate(&rhs, 1.0, 3.0, &y0, &settings)
            .unwrap();
        assert_relative_eq!(solution.state[0], 2.0 * (-1.0f64).exp(), max_relative = 1e-8);
        assert!(solution.accepted_steps > 0);
    }

    #[test]
    fn rhs_sees_absolute_time() {
        let rhs = |t: T, _y: &V, dy: &mut V| {
            dy[0] = t;
        };
        let settings = SolverSettings::default().with_tolerances(1e-10, 1e-12);
        let y0 = V::from_vec(vec![0.0]);
        let solution = Dopri5Solver
            .integrate(&rhs, 2.0, 4.0, &y0, &settings)
            .unwrap();
        // Integral of t from 2 to 4
        assert_relative_eq!(solution.state[0], 6.0, max_relative = 1e-8);
    }

    #[test]
    fn empty_segment_is_a_no_op() {
        let rhs = |_t: T, _y: &V, dy: &mut V| {
            dy[0] = 1.0;
        };
        let y0 = V::from_vec(vec![1.0]);
        let solution = Dopri5Solver
            .integrate(&rhs, 1.0, 1.0, &y0, &SolverSettings::default())
            .unwrap();
        assert_eq!(solution.state, y0);
        assert_eq!(solution.rhs_evaluations, 0);
    }

    fn oscillator(_t: T, y: &V, dy: &mut V) {
        dy[0] = 200.0 * y[1];
        dy[1] = -200.0 * y[0];
    }

    #[test]
    fn step_limit_applies_within_a_segment() {
        let settings = SolverSettings::default().with_max_steps(100);
        let y0 = V::from_vec(vec![1.0, 0.0]);
        let failure = Dopri5Solver
            .integrate(&oscillator, 5.0, 2005.0, &y0, &settings)
            .unwrap_err();
        assert_eq!(failure.kind, SolverFailureKind::StepLimit);
        assert!(failure.steps <= 100);
        // Stopped part of the way into the segment, reported in absolute time
        assert!(failure.time > 5.0 && failure.time < 2005.0);
        assert!(failure.step_size.unwrap() > 0.0);
    }

    #[test]
    fn wall_time_applies_within_a_segment() {
        let settings = SolverSettings::default()
            .with_tolerances(1e-12, 1e-14)
            .with_max_steps(usize::MAX)
            .with_max_wall_time(0.01);
        let y0 = V::from_vec(vec![1.0, 0.0]);
        let started = Instant::now();
        let failure = Dopri5Solver
            .integrate(&oscillator, 0.0, 1e6, &y0, &settings)
            .unwrap_err();
        assert_eq!(failure.kind, SolverFailureKind::WallTime);
        assert!(failure.time > 0.0 && failure.time < 1e6);
        assert!(started.elapsed().as_secs_f64() < 1.0);
    }
}
