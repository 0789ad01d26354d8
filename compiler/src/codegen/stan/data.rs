//! `data` block

use crate::codegen::program::Fragment;
use crate::model_spec::ModelSpec;

pub(super) fn fragments(spec: ModelSpec) -> Vec<Fragment> {
    let mut out = vec![observations()];
    if spec.variance_mc_known {
        out.push(
            Fragment::new(
                "v_MC_known",
                "    real<lower=0> v_MC;                   // variance between y_MC and its reconstruction",
            )
            .provides(&["v_MC"]),
        );
    }
    out.push(dimensions());
    if spec.variance_known {
        out.push(
            Fragment::new(
                "v_known",
                "    vector<lower=0>[N_known] v;           // known data-model variance",
            )
            .provides(&["v"])
            .requires(&["N_known"]),
        );
    }
    if spec.include_clusters {
        out.push(clusters());
    }
    out
}

fn observations() -> Fragment {
    Fragment::new(
        "observations",
        "    int N_known;                          // number of known mixtures
    int N_unknown;                        // number of unknown mixtures
    array[N_known] int N_points;          // experimental points per known mixture
    int order;                            // order of the compositional polynomial
    vector[sum(N_points)] x1;             // experimental compositions
    vector[sum(N_points)] T1;             // experimental temperatures
    vector[sum(N_points)] y1;             // experimental excess enthalpy
    int N_T;                              // number of interpolated temperatures
    int N_C;                              // number of interpolated compositions
    vector[N_T] T2_int;                   // unique temperatures to interpolate
    vector[N_C] x2_int;                   // unique compositions to interpolate
    real<lower=0> scale_lower;            // upper bound of the ARD scale",
    )
    .provides(&[
        "N_known",
        "N_unknown",
        "N_points",
        "order",
        "x1",
        "T1",
        "y1",
        "N_T",
        "N_C",
        "T2_int",
        "x2_int",
        "scale_lower",
    ])
}

fn dimensions() -> Fragment {
    Fragment::new(
        "dimensions",
        "    int grainsize;                        // grain size of reduce_sum
    int N;                                // number of components
    int D;                                // rank of the feature matrices
    array[N_known, 2] int Idx_known;      // component indices of known mixtures
    array[N_unknown, 2] int Idx_unknown;  // component indices of unknown mixtures
    real<lower=0> jitter;                 // diagonal jitter for covariance stability",
    )
    .provides(&["grainsize", "N", "D", "Idx_known", "Idx_unknown", "jitter"])
    .requires(&["N_known", "N_unknown"])
}

fn clusters() -> Fragment {
    Fragment::new(
        "clusters",
        "    int K;                                // number of clusters
    matrix[K, N] C;                       // cluster assignment
    vector<lower=0>[K] v_cluster;         // within-cluster variance",
    )
    .provides(&["K", "C", "v_cluster"])
    .requires(&["N"])
}
