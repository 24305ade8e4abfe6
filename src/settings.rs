//! Run configuration.
//!
//! Every setting is an explicit value passed into the call that needs it; nothing here is
//! process-wide state. Settings (de)serialise with `serde`, so a full [Settings] can be read
//! from a JSON file:
//!
//! ```json
//! {
//!   "solver": { "rtol": 1e-8, "atol": 1e-10, "max_steps": 50000 },
//!   "optimiser": { "max_iters": 2000, "n_runs": 3 },
//!   "sampler": { "n_iterations": 4000, "warmup": 1000, "n_chains": 4, "seed": 7 },
//!   "log": { "level": "debug" }
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, PkpdError};

/// Tolerances and budgets for a single simulation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
    /// Relative tolerance of the adaptive integrator
    pub rtol: f64,
    /// Absolute tolerance of the adaptive integrator
    pub atol: f64,
    /// Maximum number of integrator steps over the whole simulation
    pub max_steps: usize,
    /// Maximum wall-clock time in seconds for a single simulation
    pub max_wall_time: Option<f64>,
    /// Relative step used for finite-difference Jacobians
    pub fd_step: f64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            rtol: 1e-6,
            atol: 1e-8,
            max_steps: 100_000,
            max_wall_time: None,
            fd_step: 1e-6,
        }
    }
}

impl SolverSettings {
    pub fn with_tolerances(mut self, rtol: f64, atol: f64) -> Self {
        self.rtol = rtol;
        self.atol = atol;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_max_wall_time(mut self, seconds: f64) -> Self {
        self.max_wall_time = Some(seconds);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !(self.rtol > 0.0 && self.atol > 0.0) {
            return Err(ConfigurationError::InvalidSetting(format!(
                "solver tolerances must be positive (rtol = {}, atol = {})",
                self.rtol, self.atol
            )));
        }
        if self.max_steps == 0 {
            return Err(ConfigurationError::InvalidSetting(
                "max_steps must be at least 1".to_string(),
            ));
        }
        if !(self.fd_step > 0.0) {
            return Err(ConfigurationError::InvalidSetting(format!(
                "fd_step must be positive, got {}",
                self.fd_step
            )));
        }
        Ok(())
    }
}

/// Which shipped optimiser to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OptimiserKind {
    #[default]
    NelderMead,
    Lbfgs,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimiserSettings {
    pub kind: OptimiserKind,
    pub max_iters: u64,
    /// Standard deviation of the simplex at which Nelder-Mead stops
    pub sd_tolerance: f64,
    /// Number of independent optimisation runs (multi-start)
    pub n_runs: usize,
    pub seed: u64,
}

impl Default for OptimiserSettings {
    fn default() -> Self {
        Self {
            kind: OptimiserKind::NelderMead,
            max_iters: 1000,
            sd_tolerance: 1e-8,
            n_runs: 1,
            seed: 42,
        }
    }
}

/// Which shipped sampler to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SamplerKind {
    #[default]
    Metropolis,
    Mala,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerSettings {
    pub kind: SamplerKind,
    pub n_iterations: usize,
    /// Leading iterations of every chain that are adapted and discarded
    pub warmup: usize,
    pub n_chains: usize,
    pub seed: u64,
    /// Initial proposal scale (random walk standard deviation or Langevin step size)
    pub step_size: f64,
    pub progress: bool,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            kind: SamplerKind::Metropolis,
            n_iterations: 2000,
            warmup: 500,
            n_chains: 4,
            seed: 42,
            step_size: 0.1,
            progress: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    pub file: Option<String>,
    pub stdout: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            stdout: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub solver: SolverSettings,
    pub optimiser: OptimiserSettings,
    pub sampler: SamplerSettings,
    pub log: LogSettings,
}

impl Settings {
    pub fn from_json(json: &str) -> Result<Self, PkpdError> {
        let settings: Settings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self, PkpdError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn to_json(&self) -> Result<String, PkpdError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.solver.validate()?;
        if self.optimiser.n_runs == 0 {
            return Err(ConfigurationError::InvalidSetting(
                "optimiser.n_runs must be at least 1".to_string(),
            ));
        }
        if self.sampler.n_chains == 0 {
            return Err(ConfigurationError::InvalidSetting(
                "sampler.n_chains must be at least 1".to_string(),
            ));
        }
        if self.sampler.warmup >= self.sampler.n_iterations {
            return Err(ConfigurationError::InvalidSetting(format!(
                "sampler.warmup ({}) must be smaller than sampler.n_iterations ({})",
                self.sampler.warmup, self.sampler.n_iterations
            )));
        }
        Ok(())
    }
}
