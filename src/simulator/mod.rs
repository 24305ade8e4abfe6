pub(crate) mod integrate;
pub mod likelihood;
pub mod model;
pub mod predictive;
pub(crate) mod sensitivity;
pub mod solver;

use std::collections::HashMap;

use ndarray::{Array2, Array3, ArrayView1, ArrayView2, Axis};
use serde::Serialize;

pub use model::MechanisticModel;
pub use solver::{Dopri5Solver, OdeSolver, SegmentSolution, SolverFailure, SolverFailureKind};

pub type T = f64;
pub type V = nalgebra::DVector<T>;
pub type M = nalgebra::DMatrix<T>;

/// This closure represents the differential equation of the model:
/// Params:
/// - x: The state vector at time t
/// - p: The parameters of the model; Use the [fetch_params!] macro to extract the parameters
/// - t: The time at which the differential equation is evaluated
/// - dx: A mutable reference to the derivative of the state vector at time t
/// - rateiv: A vector of infusion rates at time t
/// Example:
/// ```ignore
/// use pkpdinfer::*;
/// let diff_eq = |x, p, _t, dx, rateiv| {
///  fetch_params!(p, ka, ke);
///  dx[0] = -ka * x[0];
///  dx[1] = ka * x[0] - ke * x[1] + rateiv[1];
/// };
/// ```
pub type DiffEq = fn(&V, &V, T, &mut V, &V);

/// This closure represents the initial state of the system:
/// Params:
/// - p: The parameters of the model; Use the [fetch_params!] macro to extract the parameters
/// - x: A mutable reference to the state vector at t = 0, zero-initialised
/// Example:
/// ```ignore
/// use pkpdinfer::*;
/// let init = |p, x| {
///  fetch_params!(p, baseline);
///  x[0] = baseline;
/// };
/// ```
pub type Init = fn(&V, &mut V);

/// This closure represents the output equation of the model:
/// Params:
/// - x: The state vector at time t
/// - p: The parameters of the model; Use the [fetch_params!] macro to extract the parameters
/// - t: The time at which the output equation is evaluated
/// - y: A mutable reference to the output vector at time t
/// Example:
/// ```ignore
/// use pkpdinfer::*;
/// let out = |x, p, _t, y| {
///   fetch_params!(p, ka, ke, v);
///   y[0] = x[1] / v;
/// };
/// ```
pub type Out = fn(&V, &V, T, &mut V);

/// This closure represents the lag time of the model, the lag term delays only the boluses going
/// into a specific compartment.
/// Params:
/// - p: The parameters of the model; Use the [fetch_params!] macro to extract the parameters
/// Returns:
/// - A hashmap with the lag times for each compartment, if not present it is assumed to be 0.
/// There is a convenience macro [lag!] to create the hashmap
/// Example:
/// ```ignore
/// use pkpdinfer::*;
/// let lag = |p| {
///    fetch_params!(p, tlag);
///    lag! {0=>tlag, 1=>0.3}
/// };
/// ```
pub type Lag = fn(&V) -> HashMap<usize, T>;

/// This closure represents the fraction absorbed (bioavailability) of the model. It scales the
/// amount of every dose, bolus or infusion, going into a compartment.
/// Params:
/// - p: The parameters of the model; Use the [fetch_params!] macro to extract the parameters
/// Returns:
/// - A hashmap with the fraction absorbed for each compartment, if not present it is assumed to be 1.
/// There is a convenience macro [fa!] to create the hashmap
/// Example:
/// ```ignore
/// use pkpdinfer::*;
/// let fa = |p| {
///   fetch_params!(p, f1);
///   fa! {0=>f1}
/// };
/// ```
pub type Fa = fn(&V) -> HashMap<usize, T>;

/// The number of states and output equations of the model
/// The first element is the number of states and the second element is the number of output equations
/// Example:
/// ```ignore
/// let neqs = (2, 1);
/// ```
/// This means that the system of equations has 2 states and there is only 1 output equation.
pub type Neqs = (usize, usize);

/// Integrator statistics accumulated over all segments of one simulation
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SimulationStats {
    pub accepted_steps: usize,
    pub rejected_steps: usize,
    pub rhs_evaluations: usize,
    /// Number of breakpoint-to-breakpoint segments that were integrated
    pub segments: usize,
}

impl SimulationStats {
    pub fn steps(&self) -> usize {
        self.accepted_steps + self.rejected_steps
    }
}

/// The trajectory of a single simulation
///
/// Rows of `states` and `outputs` correspond to `times`, which are sorted in ascending order.
/// When sensitivities were requested, `sensitivities[[i, o, j]]` is the derivative of output
/// `o` at `times[i]` with respect to parameter `j`.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationResult {
    times: Vec<f64>,
    states: Array2<f64>,
    outputs: Array2<f64>,
    sensitivities: Option<Array3<f64>>,
    stats: SimulationStats,
}

impl SimulationResult {
    pub(crate) fn new(
        times: Vec<f64>,
        states: Array2<f64>,
        outputs: Array2<f64>,
        sensitivities: Option<Array3<f64>>,
        stats: SimulationStats,
    ) -> Self {
        Self {
            times,
            states,
            outputs,
            sensitivities,
            stats,
        }
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn states(&self) -> ArrayView2<'_, f64> {
        self.states.view()
    }

    pub fn outputs(&self) -> ArrayView2<'_, f64> {
        self.outputs.view()
    }

    /// The trajectory of a single output
    pub fn output(&self, outeq: usize) -> ArrayView1<'_, f64> {
        self.outputs.index_axis(Axis(1), outeq)
    }

    pub fn sensitivities(&self) -> Option<&Array3<f64>> {
        self.sensitivities.as_ref()
    }

    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    /// Index of the first row recorded at `time`
    pub fn time_index(&self, time: f64) -> Option<usize> {
        // Times are stored in ascending order
        let index = self.times.partition_point(|t| t.total_cmp(&time).is_lt());
        (index < self.times.len() && self.times[index] == time).then_some(index)
    }
}
