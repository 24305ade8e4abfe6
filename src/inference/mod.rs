//! Point estimation and posterior sampling on top of any [LogDensity](crate::posterior::LogDensity).
//!
//! The controllers fix parameters ([ReducedLogDensity]), move the free ones to an
//! unconstrained space ([TransformedLogDensity]), choose starting points and hand the result
//! to an [Optimiser] or a [Sampler].

pub mod controller;
pub mod optimiser;
pub mod reduced;
pub mod results;
pub mod sampler;
pub mod transform;

pub use controller::{hessian, OptimisationController, SamplingController};
pub use optimiser::{LbfgsOptimiser, NelderMeadOptimiser, Optimiser, OptimiserOutput};
pub use reduced::ReducedLogDensity;
pub use results::{split_rhat, OptimisationResult, OptimisationRun, SamplingResult};
pub use sampler::{Chain, MalaSampler, MetropolisSampler, Sampler};
pub use transform::{Transform, TransformedLogDensity};
