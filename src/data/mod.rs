pub mod builder;
pub mod error_model;
pub mod event;
pub mod regimen;
pub mod structs;
pub use builder::{SubjectBuilder, SubjectBuilderExt};
pub use error_model::{ErrorModel, ErrorModels};
pub use event::*;
pub use regimen::DosingRegimen;
pub use structs::{Data, Subject};
