//! Cox proportional-hazards accumulators and the Newton iteration around them.

pub mod cox;
pub mod driver;
pub mod intermediate;

pub use cox::{CoxResult, CoxState};
pub use driver::{CoxFit, run_newton};
pub use intermediate::{IntermediateCoxResult, IntermediateCoxState};
