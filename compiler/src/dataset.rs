//! Stan data for the hybrid PMF model
//!
//! [`HybridPmfData`] is the JSON document produced by the upstream
//! extraction and clustering step. One file serves every configuration of a
//! functional-group subset, so it may carry optional inputs (`v`, `v_MC`,
//! cluster data) that a given [`ModelSpec`] does not declare. CmdStan ignores
//! those, so [`HybridPmfData::validate_for`] accepts them;
//! [`HybridPmfData::validate_strict_for`] reports them as
//! [`DataError::UnexpectedInput`], and [`HybridPmfData::restricted_to`] drops
//! them when a minimal file is wanted.

use crate::codegen::stan::data_inputs;
use crate::model_spec::ModelSpec;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Inputs that only some configurations declare.
pub const OPTIONAL_INPUTS: [&str; 5] = ["v_MC", "v", "K", "C", "v_cluster"];

/// Data identifiers declared by the program generated for `spec`.
pub fn inputs_for(spec: ModelSpec) -> Vec<&'static str> {
    data_inputs(spec)
}

/// Data block of the generated program, with Stan's variable names on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridPmfData {
    #[serde(rename = "N_known")]
    pub n_known: usize,
    #[serde(rename = "N_unknown")]
    pub n_unknown: usize,
    #[serde(rename = "N_points")]
    pub n_points: Vec<usize>,
    /// Order of the compositional polynomial kernel
    pub order: usize,
    /// Experimental compositions, stacked over known mixtures
    pub x1: Vec<f64>,
    /// Experimental temperatures
    #[serde(rename = "T1")]
    pub t1: Vec<f64>,
    /// Experimental excess enthalpies
    pub y1: Vec<f64>,
    #[serde(rename = "N_T")]
    pub n_t: usize,
    #[serde(rename = "N_C")]
    pub n_c: usize,
    #[serde(rename = "T2_int")]
    pub t2_int: Vec<f64>,
    pub x2_int: Vec<f64>,
    pub scale_lower: f64,
    pub grainsize: usize,
    /// Number of components
    #[serde(rename = "N")]
    pub n: usize,
    /// Rank of the feature matrices
    #[serde(rename = "D")]
    pub d: usize,
    /// 1-based component pairs of the known mixtures
    #[serde(rename = "Idx_known")]
    pub idx_known: Vec<[usize; 2]>,
    #[serde(rename = "Idx_unknown")]
    pub idx_unknown: Vec<[usize; 2]>,
    pub jitter: f64,

    #[serde(rename = "v_MC", default, skip_serializing_if = "Option::is_none")]
    pub v_mc: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<Vec<f64>>,
    /// Number of clusters
    #[serde(rename = "K", default, skip_serializing_if = "Option::is_none")]
    pub k: Option<usize>,
    /// Cluster assignment, `K` rows of `N`
    #[serde(rename = "C", default, skip_serializing_if = "Option::is_none")]
    pub c: Option<Vec<Vec<f64>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v_cluster: Option<Vec<f64>>,
}

/// Errors loading or validating a data file
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("IO error on data file: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error in data file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("`{name}` is required when {spec}")]
    MissingInput { name: &'static str, spec: ModelSpec },

    #[error("`{name}` is supplied but not declared when {spec}")]
    UnexpectedInput { name: &'static str, spec: ModelSpec },

    #[error("`{name}` has length {found}, expected {expected}")]
    ShapeMismatch {
        name: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("`{name}` contains component index {index}, outside 1..={n}")]
    IndexOutOfRange {
        name: &'static str,
        index: usize,
        n: usize,
    },

    #[error("invalid `{name}`: {reason}")]
    InvalidValue { name: &'static str, reason: String },
}

impl HybridPmfData {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, DataError> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<(), DataError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Total number of experimental points, `sum(N_points)` in Stan.
    pub fn total_points(&self) -> usize {
        self.n_points.iter().sum()
    }

    /// Whether the optional input `name` is present. Names outside
    /// [`OPTIONAL_INPUTS`] are not optional inputs and give `false`.
    pub fn has_input(&self, name: &str) -> bool {
        match name {
            "v_MC" => self.v_mc.is_some(),
            "v" => self.v.is_some(),
            "K" => self.k.is_some(),
            "C" => self.c.is_some(),
            "v_cluster" => self.v_cluster.is_some(),
            _ => false,
        }
    }

    /// Optional inputs present in this data that `spec` does not declare.
    pub fn unexpected_inputs(&self, spec: ModelSpec) -> Vec<&'static str> {
        let declared = inputs_for(spec);
        OPTIONAL_INPUTS
            .into_iter()
            .filter(|name| self.has_input(name) && !declared.contains(name))
            .collect()
    }

    /// Copy without the optional inputs `spec` does not declare.
    pub fn restricted_to(&self, spec: ModelSpec) -> Self {
        let declared = inputs_for(spec);
        let keep = |name: &str| declared.contains(&name);
        let mut out = self.clone();
        if !keep("v_MC") {
            out.v_mc = None;
        }
        if !keep("v") {
            out.v = None;
        }
        if !keep("K") {
            out.k = None;
        }
        if !keep("C") {
            out.c = None;
        }
        if !keep("v_cluster") {
            out.v_cluster = None;
        }
        out
    }

    /// Like [`validate_for`](Self::validate_for), but optional inputs that
    /// `spec` does not declare are an error too.
    pub fn validate_strict_for(&self, spec: ModelSpec) -> Result<(), DataError> {
        if let Some(&name) = self.unexpected_inputs(spec).first() {
            return Err(DataError::UnexpectedInput { name, spec });
        }
        self.validate_for(spec)
    }

    /// Check that this data satisfies the data block generated for `spec`.
    /// Undeclared optional inputs are accepted.
    pub fn validate_for(&self, spec: ModelSpec) -> Result<(), DataError> {
        let declared = inputs_for(spec);
        for name in OPTIONAL_INPUTS {
            if declared.contains(&name) && !self.has_input(name) {
                return Err(DataError::MissingInput { name, spec });
            }
        }

        check_len("N_points", self.n_known, self.n_points.len())?;
        let total = self.total_points();
        check_len("x1", total, self.x1.len())?;
        check_len("T1", total, self.t1.len())?;
        check_len("y1", total, self.y1.len())?;
        check_len("T2_int", self.n_t, self.t2_int.len())?;
        check_len("x2_int", self.n_c, self.x2_int.len())?;
        check_len("Idx_known", self.n_known, self.idx_known.len())?;
        check_len("Idx_unknown", self.n_unknown, self.idx_unknown.len())?;

        if self.n_c % 2 == 0 {
            // the dense grid is filled from both ends towards a single midpoint
            return Err(DataError::InvalidValue {
                name: "N_C",
                reason: format!("must be odd, got {}", self.n_c),
            });
        }
        if self.jitter < 0.0 {
            return Err(DataError::InvalidValue {
                name: "jitter",
                reason: "must be non-negative".into(),
            });
        }
        if self.scale_lower <= 0.0 {
            return Err(DataError::InvalidValue {
                name: "scale_lower",
                reason: "must be positive".into(),
            });
        }
        if self.grainsize == 0 {
            return Err(DataError::InvalidValue {
                name: "grainsize",
                reason: "must be at least 1".into(),
            });
        }

        for (name, pairs) in [("Idx_known", &self.idx_known), ("Idx_unknown", &self.idx_unknown)] {
            for &index in pairs.iter().flatten() {
                if index == 0 || index > self.n {
                    return Err(DataError::IndexOutOfRange {
                        name,
                        index,
                        n: self.n,
                    });
                }
            }
        }

        if declared.contains(&"v") {
            if let Some(v) = &self.v {
                check_len("v", self.n_known, v.len())?;
                check_non_negative("v", v)?;
            }
        }
        if declared.contains(&"v_MC") {
            if let Some(v_mc) = self.v_mc {
                check_non_negative("v_MC", &[v_mc])?;
            }
        }
        if declared.contains(&"C") {
            self.validate_clusters()?;
        }

        Ok(())
    }

    fn validate_clusters(&self) -> Result<(), DataError> {
        let (Some(k), Some(c), Some(v_cluster)) = (self.k, &self.c, &self.v_cluster) else {
            return Ok(());
        };
        check_len("C", k, c.len())?;
        for row in c {
            check_len("C", self.n, row.len())?;
        }
        check_len("v_cluster", k, v_cluster.len())?;
        check_non_negative("v_cluster", v_cluster)
    }
}

fn check_len(name: &'static str, expected: usize, found: usize) -> Result<(), DataError> {
    if expected == found {
        Ok(())
    } else {
        Err(DataError::ShapeMismatch {
            name,
            expected,
            found,
        })
    }
}

fn check_non_negative(name: &'static str, values: &[f64]) -> Result<(), DataError> {
    match values.iter().find(|x| !(**x >= 0.0)) {
        Some(x) => Err(DataError::InvalidValue {
            name,
            reason: format!("must be non-negative, got {x}"),
        }),
        None => Ok(()),
    }
}
