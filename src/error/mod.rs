use std::fmt;

use thiserror::Error;

/// Top-level error type of the crate.
///
/// Only [SimulationError] is ever absorbed by the statistical layers (as a log-likelihood of
/// negative infinity); every other variant reaches the caller of the inference driver or the
/// regimen optimiser.
#[derive(Error, Debug)]
pub enum PkpdError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("Simulation error: {0}")]
    Simulation(#[from] SimulationError),
    #[error("Numerical anomaly: {0}")]
    NumericalAnomaly(String),
    #[error("Optimiser error: {0}")]
    Optimiser(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PkpdError {
    /// Recover a [PkpdError] that travelled through an argmin executor as an `anyhow::Error`.
    pub(crate) fn from_anyhow(err: anyhow::Error) -> Self {
        match err.downcast::<PkpdError>() {
            Ok(err) => err,
            Err(err) => PkpdError::Optimiser(err.to_string()),
        }
    }
}

/// Malformed inputs. Always fatal and never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("{context}: expected {expected} parameters, found {found}")]
    ParameterCount {
        context: String,
        expected: usize,
        found: usize,
    },
    #[error("Subject {subject} is missing covariate {name}")]
    MissingCovariate { subject: String, name: String },
    #[error("Malformed dosing regimen: {0}")]
    MalformedRegimen(String),
    #[error("Invalid time points: {0}")]
    InvalidTimes(String),
    #[error("Invalid observation for subject {subject}: {reason}")]
    InvalidObservation { subject: String, reason: String },
    #[error("Duplicate subject id {0}")]
    DuplicateSubject(String),
    #[error("Invalid parameter mask: {0}")]
    InvalidMask(String),
    #[error("Invalid population model: {0}")]
    InvalidPopulationModel(String),
    #[error("Invalid setting: {0}")]
    InvalidSetting(String),
    #[error("No initial values available: {0}")]
    MissingInitialValues(String),
}

/// Reason a single simulation was abandoned.
#[derive(Debug, Clone, PartialEq)]
pub enum SimulationFailure {
    /// The ODE solver reported a failure such as step size underflow or stiffness.
    Solver(String),
    /// The configured step budget was exhausted.
    StepBudget { steps: usize, max_steps: usize },
    /// The configured wall-clock budget was exhausted.
    WallTime { elapsed: f64, max_wall_time: f64 },
    /// The state left the finite range during integration.
    NonFiniteState,
    /// The parameter vector contains non-finite entries.
    NonFiniteParameters,
    /// Parameter-dependent dosing (lag time or bioavailability) is out of range.
    InvalidDosing(String),
}

impl fmt::Display for SimulationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimulationFailure::Solver(msg) => write!(f, "solver failure ({})", msg),
            SimulationFailure::StepBudget { steps, max_steps } => {
                write!(f, "step budget exhausted ({} of {} steps)", steps, max_steps)
            }
            SimulationFailure::WallTime {
                elapsed,
                max_wall_time,
            } => write!(
                f,
                "wall-clock budget exhausted ({:.3}s of {:.3}s)",
                elapsed, max_wall_time
            ),
            SimulationFailure::NonFiniteState => write!(f, "state became non-finite"),
            SimulationFailure::NonFiniteParameters => write!(f, "non-finite parameters"),
            SimulationFailure::InvalidDosing(msg) => write!(f, "invalid dosing ({})", msg),
        }
    }
}

/// A simulation that could not be completed for a specific parameter/regimen combination.
///
/// Carries the time at which integration stopped and the last known state.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{failure} at t = {time}")]
pub struct SimulationError {
    pub failure: SimulationFailure,
    pub time: f64,
    pub state: Vec<f64>,
    pub step_size: Option<f64>,
}

impl SimulationError {
    pub(crate) fn new(failure: SimulationFailure, time: f64, state: Vec<f64>) -> Self {
        Self {
            failure,
            time,
            state,
            step_size: None,
        }
    }
}

/// Diagnostic raised when an optimiser or sampler did not reach its stopping criterion.
///
/// Never an error: the result is still returned alongside the warning.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ConvergenceWarning {
    pub source: String,
    pub message: String,
}

impl ConvergenceWarning {
    pub(crate) fn new(source: impl Into<String>, message: impl Into<String>) -> Self {
        let warning = Self {
            source: source.into(),
            message: message.into(),
        };
        tracing::warn!("{}: {}", warning.source, warning.message);
        warning
    }
}

impl fmt::Display for ConvergenceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.source, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anyhow_roundtrip_keeps_variant() {
        let err: anyhow::Error = PkpdError::NumericalAnomaly("nan".to_string()).into();
        match PkpdError::from_anyhow(err) {
            PkpdError::NumericalAnomaly(msg) => assert_eq!(msg, "nan"),
            other => panic!("unexpected variant {:?}", other),
        }
    }

    #[test]
    fn foreign_anyhow_becomes_optimiser_error() {
        let err = anyhow::anyhow!("line search failed");
        assert!(matches!(
            PkpdError::from_anyhow(err),
            PkpdError::Optimiser(_)
        ));
    }

    #[test]
    fn simulation_error_display() {
        let err = SimulationError::new(SimulationFailure::NonFiniteState, 2.5, vec![f64::NAN]);
        assert_eq!(err.to_string(), "state became non-finite at t = 2.5");
    }
}
