//! Stan code generation for the hybrid PMF model
//!
//! Each block of the program has its own fragment builder; [`generate`]
//! composes them in [`BLOCK_ORDER`]. The three [`ModelSpec`] flags switch
//! fragments on and off:
//!
//! - `include_clusters`: clustered feature-matrix priors, cluster data and
//!   cluster-mean parameters
//! - `variance_known`: `v` moves from parameters to data and is added to the
//!   conditional covariance in transformed data
//! - `variance_MC_known`: `v_MC` moves from parameters to data, which lets the
//!   dense-grid precision and the conditional Gaussian map be precomputed once
//!   instead of on every log-density evaluation

mod data;
mod functions;
mod generated_quantities;
mod model;
mod parameters;
mod transformed_data;

use super::program::{Block, BlockKind, GeneratedProgram, ScopeError};
use crate::model_spec::ModelSpec;
use std::collections::HashSet;

/// Builds the fragments of one block for a configuration.
pub type FragmentBuilder = fn(ModelSpec) -> Vec<super::program::Fragment>;

/// Blocks of every generated program, in emission order.
pub const BLOCK_ORDER: [(BlockKind, FragmentBuilder); 6] = [
    (BlockKind::Functions, functions::fragments),
    (BlockKind::Data, data::fragments),
    (BlockKind::TransformedData, transformed_data::fragments),
    (BlockKind::Parameters, parameters::fragments),
    (BlockKind::Model, model::fragments),
    (BlockKind::GeneratedQuantities, generated_quantities::fragments),
];

/// Assemble the program for `spec`.
pub fn generate(spec: ModelSpec) -> GeneratedProgram {
    let blocks = BLOCK_ORDER
        .iter()
        .map(|(kind, build)| Block::new(*kind, build(spec)))
        .collect();
    GeneratedProgram::new(spec, blocks)
}

/// Stan source for the given flags.
pub fn generate_stan_code(include_clusters: bool, variance_known: bool, variance_mc_known: bool) -> String {
    generate(ModelSpec::new(include_clusters, variance_known, variance_mc_known)).render()
}

/// Parameter names of the program generated for `spec`.
pub fn parameter_names(spec: ModelSpec) -> Vec<&'static str> {
    generate(spec).parameters()
}

/// Data inputs of the program generated for `spec`.
pub fn data_inputs(spec: ModelSpec) -> Vec<&'static str> {
    generate(spec).data_inputs()
}

/// Every program-level identifier declared under any configuration.
pub fn program_identifiers() -> HashSet<&'static str> {
    ModelSpec::all()
        .flat_map(|spec| generate(spec).blocks().to_vec())
        .filter(|block| block.kind != BlockKind::Functions)
        .flat_map(|block| block.fragments)
        .flat_map(|fragment| fragment.provides)
        .collect()
}

/// Scoping check of `spec` against the identifiers of all configurations, so
/// that a fragment mentioning an identifier declared only elsewhere is caught.
pub fn check(spec: ModelSpec) -> Result<(), ScopeError> {
    generate(spec).check_scoping_with(&program_identifiers())
}

/// Loop nest rebuilding the dense surface `y_MC_pred` of dataset `dataset`
/// from the feature matrices. Position `m` and its mirror `N_C-m+1` come from
/// the asymmetric pair `U_raw`/`V_raw`; the midpoint `M` from `U_raw` alone.
fn surface_reconstruction(column: Option<&str>, dataset: &str) -> String {
    let cell = |row: &str| match column {
        Some(col) => format!("y_MC_pred[{row}, {col}]"),
        None => format!("y_MC_pred[{row}]"),
    };
    format!(
        "for (t in 1:N_T) {{
    for (m in 1:M-1) {{
        {lower} = dot_product(U_raw[t,m,:,Idx_all[{d},1]] .* v_ARD, V_raw[t,m,:,Idx_all[{d},2]]);
        {upper} = dot_product(U_raw[t,m,:,Idx_all[{d},2]] .* v_ARD, V_raw[t,m,:,Idx_all[{d},1]]);
    }}
    {middle} = dot_product(U_raw[t,M,:,Idx_all[{d},1]] .* v_ARD, U_raw[t,M,:,Idx_all[{d},2]]);
}}",
        lower = cell("m+N_C*(t-1)"),
        upper = cell("N_C-m+1+N_C*(t-1)"),
        middle = cell("M+N_C*(t-1)"),
        d = dataset,
    )
}

// Row range of dataset `i` in the stacked experimental vectors.
const DATASET_RANGE: &str = "int lo = sum(N_points[:i-1]) + 1;
int hi = sum(N_points[:i]);";
