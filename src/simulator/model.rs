use std::fmt;
use std::sync::Arc;

use crate::data::DosingRegimen;
use crate::error::{ConfigurationError, PkpdError};
use crate::settings::SolverSettings;
use crate::simulator::integrate;
use crate::simulator::{
    DiffEq, Dopri5Solver, Fa, Init, Lag, Neqs, OdeSolver, Out, SimulationResult, V,
};

/// A parametrised ODE model with parameter-dependent dosing
///
/// The model is a set of plain functions (see [DiffEq], [Init], [Out], [Lag] and [Fa]) together
/// with the names of its parameters, states and outputs. The parameter vector passed to
/// [MechanisticModel::simulate] always follows the order of the parameter names.
///
/// # Example
///
/// ```
/// use pkpdinfer::*;
///
/// let model = MechanisticModel::new(
///     |x, p, _t, dx, rateiv| {
///         fetch_params!(p, ke, _v);
///         dx[0] = -ke * x[0] + rateiv[0];
///     },
///     |_p| lag! {},
///     |_p| fa! {},
///     |_p, _x| {},
///     |x, p, _t, y| {
///         fetch_params!(p, _ke, v);
///         y[0] = x[0] / v;
///     },
///     (1, 1),
///     vec!["ke", "v"],
/// );
///
/// let regimen = DosingRegimen::from_doses(vec![Dose::bolus(0.0, 100.0, 0)]).unwrap();
/// let result = model
///     .simulate(&[0.1, 10.0], &regimen, &[0.0, 5.0], &SolverSettings::default())
///     .unwrap();
/// assert!((result.outputs()[[0, 0]] - 10.0).abs() < 1e-10);
/// ```
#[derive(Clone)]
pub struct MechanisticModel {
    pub(crate) diffeq: DiffEq,
    pub(crate) lag: Lag,
    pub(crate) fa: Fa,
    pub(crate) init: Init,
    pub(crate) out: Out,
    pub(crate) neqs: Neqs,
    parameter_names: Vec<String>,
    state_names: Vec<String>,
    output_names: Vec<String>,
    pub(crate) solver: Arc<dyn OdeSolver>,
}

impl MechanisticModel {
    pub fn new(
        diffeq: DiffEq,
        lag: Lag,
        fa: Fa,
        init: Init,
        out: Out,
        neqs: Neqs,
        parameters: Vec<&str>,
    ) -> Self {
        Self {
            diffeq,
            lag,
            fa,
            init,
            out,
            neqs,
            parameter_names: parameters.into_iter().map(String::from).collect(),
            state_names: (0..neqs.0).map(|i| format!("x{}", i)).collect(),
            output_names: (0..neqs.1).map(|i| format!("y{}", i)).collect(),
            solver: Arc::new(Dopri5Solver),
        }
    }

    pub fn with_state_names(mut self, names: Vec<&str>) -> Result<Self, ConfigurationError> {
        if names.len() != self.neqs.0 {
            return Err(ConfigurationError::ParameterCount {
                context: "state names".to_string(),
                expected: self.neqs.0,
                found: names.len(),
            });
        }
        self.state_names = names.into_iter().map(String::from).collect();
        Ok(self)
    }

    pub fn with_output_names(mut self, names: Vec<&str>) -> Result<Self, ConfigurationError> {
        if names.len() != self.neqs.1 {
            return Err(ConfigurationError::ParameterCount {
                context: "output names".to_string(),
                expected: self.neqs.1,
                found: names.len(),
            });
        }
        self.output_names = names.into_iter().map(String::from).collect();
        Ok(self)
    }

    /// Replace the default Dormand-Prince integrator
    pub fn with_solver(mut self, solver: Arc<dyn OdeSolver>) -> Self {
        self.solver = solver;
        self
    }

    pub fn n_parameters(&self) -> usize {
        self.parameter_names.len()
    }

    pub fn n_states(&self) -> usize {
        self.neqs.0
    }

    pub fn n_outputs(&self) -> usize {
        self.neqs.1
    }

    pub fn parameter_names(&self) -> &[String] {
        &self.parameter_names
    }

    pub fn state_names(&self) -> &[String] {
        &self.state_names
    }

    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }

    fn validate(
        &self,
        parameters: &[f64],
        regimen: &DosingRegimen,
        times: &[f64],
        settings: &SolverSettings,
    ) -> Result<(), ConfigurationError> {
        if parameters.len() != self.n_parameters() {
            return Err(ConfigurationError::ParameterCount {
                context: "mechanistic model".to_string(),
                expected: self.n_parameters(),
                found: parameters.len(),
            });
        }
        if let Some(input) = regimen.max_input() {
            if input >= self.n_states() {
                return Err(ConfigurationError::MalformedRegimen(format!(
                    "dose into compartment {} but the model has {} states",
                    input,
                    self.n_states()
                )));
            }
        }
        if let Some(time) = times.iter().find(|t| !t.is_finite() || **t < 0.0) {
            return Err(ConfigurationError::InvalidTimes(format!(
                "time points must be finite and non-negative, got {}",
                time
            )));
        }
        settings.validate()
    }

    /// Simulate the model outputs at the requested times
    ///
    /// Times may be given in any order and may lie outside the support of the regimen; the
    /// result lists them in ascending order. A failed integration is returned as
    /// [PkpdError::Simulation].
    pub fn simulate(
        &self,
        parameters: &[f64],
        regimen: &DosingRegimen,
        times: &[f64],
        settings: &SolverSettings,
    ) -> Result<SimulationResult, PkpdError> {
        self.run(parameters, regimen, times, settings, false)
    }

    /// Simulate the outputs together with their derivatives with respect to the parameters
    pub fn simulate_with_sensitivities(
        &self,
        parameters: &[f64],
        regimen: &DosingRegimen,
        times: &[f64],
        settings: &SolverSettings,
    ) -> Result<SimulationResult, PkpdError> {
        self.run(parameters, regimen, times, settings, true)
    }

    fn run(
        &self,
        parameters: &[f64],
        regimen: &DosingRegimen,
        times: &[f64],
        settings: &SolverSettings,
        with_sensitivities: bool,
    ) -> Result<SimulationResult, PkpdError> {
        self.validate(parameters, regimen, times, settings)?;
        let theta = V::from_column_slice(parameters);
        integrate::simulate(self, &theta, regimen, times, settings, with_sensitivities).inspect_err(
            |err| {
                if let PkpdError::Simulation(err) = err {
                    tracing::debug!("Simulation failed for {:?}: {}", parameters, err);
                }
            },
        )
    }
}

impl fmt::Debug for MechanisticModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MechanisticModel")
            .field("neqs", &self.neqs)
            .field("parameter_names", &self.parameter_names)
            .field("state_names", &self.state_names)
            .field("output_names", &self.output_names)
            .field("solver", &self.solver)
            .finish()
    }
}
