//! Model configuration
//!
//! A [`ModelSpec`] selects one of the eight hybrid PMF variants. Every
//! combination of flags is valid; the generator never rejects one.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Configuration controlling Stan code generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Cluster-structured priors on the feature matrices
    pub include_clusters: bool,

    /// Per-dataset observation variance `v` is supplied as data
    pub variance_known: bool,

    /// Variance `v_MC` between the dense surface and its low-rank
    /// reconstruction is supplied as data
    #[serde(rename = "variance_MC_known")]
    pub variance_mc_known: bool,
}

impl ModelSpec {
    pub const fn new(include_clusters: bool, variance_known: bool, variance_mc_known: bool) -> Self {
        Self {
            include_clusters,
            variance_known,
            variance_mc_known,
        }
    }

    /// All eight configurations, ordered as the binary number
    /// `include_clusters variance_known variance_MC_known`.
    pub fn all() -> impl Iterator<Item = ModelSpec> {
        (0u8..8).map(|bits| ModelSpec::new(bits & 4 != 0, bits & 2 != 0, bits & 1 != 0))
    }

    /// Generate the Stan program for this configuration.
    pub fn generate(&self) -> String {
        crate::codegen::stan::generate(*self).render()
    }

    /// Stem used for model source and executable names.
    pub fn model_name(&self) -> String {
        format!(
            "Hybrid_PMF_include_clusters_{}_variance_known_{}_variance_MC_known_{}",
            py_bool(self.include_clusters),
            py_bool(self.variance_known),
            py_bool(self.variance_mc_known)
        )
    }

    /// Relative directory holding the results of this configuration.
    pub fn result_dir(&self) -> std::path::PathBuf {
        std::path::PathBuf::from(format!("Include_clusters_{}", py_bool(self.include_clusters)))
            .join(format!("Variance_known_{}", py_bool(self.variance_known)))
            .join(format!("Variance_MC_known_{}", py_bool(self.variance_mc_known)))
    }
}

// Result trees from earlier runs are named with capitalised booleans.
fn py_bool(flag: bool) -> &'static str {
    if flag {
        "True"
    } else {
        "False"
    }
}

impl fmt::Display for ModelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "include_clusters={} variance_known={} variance_MC_known={}",
            self.include_clusters, self.variance_known, self.variance_mc_known
        )
    }
}
