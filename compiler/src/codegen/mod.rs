//! Code generation for the hybrid PMF Stan model
//!
//! `program` holds the block/fragment representation and the identifier
//! scoping check; `stan` holds the fragment builders for each block.

pub mod program;
pub mod stan;

pub use program::{BlockKind, GeneratedProgram, ScopeError, ScopeViolation};
pub use stan::{generate, generate_stan_code};
