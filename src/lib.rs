//! Simulation of dosing regimens through ODE-defined PKPD models, and hierarchical
//! population inference on top of the simulator.
//!
//! The layers build on each other:
//!
//! - [DosingRegimen] and [MechanisticModel] simulate states, outputs and sensitivities
//! - [ErrorModels] turn predictions into an [IndividualLogLikelihood]
//! - [PopulationModel]s and [LogPrior]s combine many subjects into a
//!   [HierarchicalLogPosterior]
//! - [inference] estimates or samples any [LogDensity]
//! - [optimize] searches dosing regimens for an individual

#[macro_export]
macro_rules! fetch_params {
    ($p:expr, $($name:ident),*) => {
        let p = $p;
        let mut idx = 0;
        $(
            #[allow(unused_mut)]
            let mut $name = p[idx];
            idx += 1;
        )*
        let _ = idx; // Consume idx to avoid unused_assignments warning
    };
}

#[macro_export]
macro_rules! lag {
    ($($k:expr => $v:expr),* $(,)?) => {{
        core::convert::From::from([$(($k, $v),)*])
    }};
}

#[macro_export]
macro_rules! fa {
    ($($k:expr => $v:expr),* $(,)?) => {{
        core::convert::From::from([$(($k, $v),)*])
    }};
}

pub mod data;
pub mod error;
pub mod inference;
pub mod logger;
pub mod optimize;
pub mod population;
pub mod posterior;
pub mod settings;
pub mod simulator;

//extension traits
pub use crate::data::builder::SubjectBuilderExt;
pub use crate::data::*;
pub use crate::error::{
    ConfigurationError, ConvergenceWarning, PkpdError, SimulationError, SimulationFailure,
};
pub use crate::population::{CovariatePopulationModel, LatentShape, PopulationModel};
pub use crate::posterior::{
    HierarchicalLogPosterior, IndividualLogPosterior, LogDensity, LogPrior,
};
pub use crate::settings::{
    LogSettings, OptimiserKind, OptimiserSettings, SamplerKind, SamplerSettings, Settings,
    SolverSettings,
};
pub use crate::simulator::likelihood::IndividualLogLikelihood;
pub use crate::simulator::predictive::{
    PopulationPredictiveModel, PredictiveModel, PriorPredictiveModel,
};
pub use crate::simulator::{MechanisticModel, Neqs, SimulationResult};
pub use std::collections::HashMap;

pub mod prelude {
    pub mod data {
        pub use crate::data::{
            Data, Dose, DosingRegimen, ErrorModel, ErrorModels, Observation, Subject,
        };
    }
    pub mod simulator {
        pub use crate::simulator::{
            likelihood::IndividualLogLikelihood,
            predictive::{PopulationPredictiveModel, PredictiveModel, PriorPredictiveModel},
            Dopri5Solver, MechanisticModel, OdeSolver, SimulationResult,
        };
    }
    pub mod inference {
        pub use crate::inference::{
            OptimisationController, SamplingController, Transform, TransformedLogDensity,
        };
        pub use crate::optimize::{
            IndividualParameters, RegimenOptimiser, RegimenTemplate, TargetCriterion,
        };
    }

    //extension traits
    pub use crate::data::builder::SubjectBuilderExt;
    pub use crate::data::*;
    pub use crate::posterior::LogDensity;
    pub use crate::{fa, fetch_params, lag};
}
