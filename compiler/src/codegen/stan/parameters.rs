//! `parameters` block

use crate::codegen::program::Fragment;
use crate::model_spec::ModelSpec;

pub(super) fn fragments(spec: ModelSpec) -> Vec<Fragment> {
    let mut out = Vec::new();
    if !spec.variance_known {
        out.push(
            Fragment::new(
                "v",
                "    vector<lower=0, upper=5>[N_known] v;          // data-model variance",
            )
            .provides(&["v"])
            .requires(&["N_known"]),
        );
    }
    if !spec.variance_mc_known {
        out.push(
            Fragment::new(
                "v_MC",
                "    real<lower=0, upper=5> v_MC;                  // variance between y_MC and its reconstruction",
            )
            .provides(&["v_MC"]),
        );
    }
    if spec.include_clusters {
        out.push(
            Fragment::new(
                "cluster_means",
                "    array[N_T, M] matrix[D, K] U_raw_means;       // cluster means of U_raw
    array[N_T, M-1] matrix[D, K] V_raw_means;     // cluster means of V_raw",
            )
            .provides(&["U_raw_means", "V_raw_means"])
            .requires(&["N_T", "M", "D", "K"]),
        );
    }
    out.push(
        Fragment::new(
            "feature_matrices",
            "    array[N_T, M] matrix[D, N] U_raw;             // feature matrices U
    array[N_T, M-1] matrix[D, N] V_raw;           // feature matrices V
    real<lower=0, upper=scale_lower> scale;       // strength of the ARD effect
    vector<lower=0>[D] v_ARD;                     // ARD variances",
        )
        .provides(&["U_raw", "V_raw", "scale", "v_ARD"])
        .requires(&["N_T", "M", "D", "N", "scale_lower"]),
    );
    out
}
