//! Hybrid PMF library.
//!
//! Generates the Stan programs of the hybrid probabilistic matrix
//! factorisation model in its eight configurations, and drives the
//! Pathfinder then NUTS workflow that fits them with CmdStan.

pub mod codegen;
pub mod dataset;
pub mod diagnostics;
pub mod draws;
pub mod inits;
pub mod model_spec;
pub mod stanrun;
pub mod workflow;

pub use codegen::stan::generate_stan_code;
pub use model_spec::ModelSpec;
