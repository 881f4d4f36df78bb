#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

pub mod accumulator;
pub mod config;
pub mod decomposition;
pub mod error;
pub mod guards;
pub mod inference;
pub mod linear;

#[path = "../shared/packing.rs"]
pub mod packing;

#[path = "../survival/mod.rs"]
pub mod survival;

pub use accumulator::{Accumulator, merge_all};
pub use config::{ConfigError, NewtonConfig};
pub use decomposition::{EigenDecomposer, SymmetricDecomposer, SymmetricDecomposition};
pub use error::RegressionError;
pub use linear::{LinearRegressionResult, LinearRegressionState};
pub use survival::{
    CoxFit, CoxResult, CoxState, IntermediateCoxResult, IntermediateCoxState, run_newton,
};
