//! `model` block

use crate::codegen::program::Fragment;
use crate::model_spec::ModelSpec;

pub(super) fn fragments(spec: ModelSpec) -> Vec<Fragment> {
    let mut out = Vec::new();
    if !spec.variance_mc_known {
        out.push(
            Fragment::new(
                "precision",
                "    // inverse Cholesky factor and precision of the dense grid, which depend on v_MC
    matrix[N_MC, N_MC] L_y_MC_inv_cov = inverse(cholesky_decompose(add_diag(K_MC, v_MC)));
    matrix[N_MC, N_MC] y_MC_prec = crossprod(L_y_MC_inv_cov);

    // log-determinant of the GP prior, once per mixture
    target += (N_known + N_unknown) * log_determinant(L_y_MC_inv_cov);",
            )
            .provides(&["L_y_MC_inv_cov", "y_MC_prec"])
            .requires(&["N_MC", "K_MC", "v_MC", "N_known", "N_unknown"]),
        );
    }
    out.push(
        Fragment::new(
            "ard_prior",
            "    scale ~ exponential(5);
    v_ARD ~ exponential(1/scale);",
        )
        .requires(&["scale", "v_ARD"]),
    );
    if !spec.variance_known {
        out.push(Fragment::new("v_prior", "    v ~ exponential(1);").requires(&["v"]));
    }
    if !spec.variance_mc_known {
        out.push(Fragment::new("v_MC_prior", "    v_MC ~ exponential(1);").requires(&["v_MC"]));
    }
    out.push(feature_matrix_prior(spec));
    out.push(
        Fragment::new(
            "likelihood",
            "    target += reduce_sum(ps_like, N_slice, grainsize, y1, cov_y_yMC,
                         mu_y_y_MC, L_y_MC_inv_cov, y_MC_prec, v,
                         Idx_all, M, N_T, N_MC, N_C, N_known, N_points,
                         v_ARD, U_raw, V_raw, v_MC, K_MC);",
        )
        .requires(&[
            "ps_like",
            "N_slice",
            "grainsize",
            "y1",
            "cov_y_yMC",
            "mu_y_y_MC",
            "L_y_MC_inv_cov",
            "y_MC_prec",
            "v",
            "Idx_all",
            "M",
            "N_T",
            "N_MC",
            "N_C",
            "N_known",
            "N_points",
            "v_ARD",
            "U_raw",
            "V_raw",
            "v_MC",
            "K_MC",
        ]),
    );
    out
}

fn feature_matrix_prior(spec: ModelSpec) -> Fragment {
    if spec.include_clusters {
        Fragment::new(
            "feature_prior_clustered",
            "    for (t in 1:N_T) {
        target += reduce_sum(ps_feature_matrices, M_slice, grainsize, U_raw_means[t,:],
                             V_raw_means[t,:], U_raw[t,:M-1], V_raw[t,:M-1], E_cluster, C);
        to_vector(U_raw_means[t,M]) ~ std_normal();
        to_vector(U_raw[t,M]) ~ normal(to_vector(U_raw_means[t,M] * C), E_cluster);
    }",
        )
        .requires(&[
            "N_T",
            "ps_feature_matrices",
            "M_slice",
            "grainsize",
            "U_raw_means",
            "V_raw_means",
            "U_raw",
            "V_raw",
            "M",
            "E_cluster",
            "C",
        ])
    } else {
        Fragment::new(
            "feature_prior",
            "    for (t in 1:N_T) {
        target += reduce_sum(ps_feature_matrices, M_slice, grainsize, U_raw[t,:M-1], V_raw[t,:]);
        to_vector(U_raw[t,M]) ~ std_normal();
    }",
        )
        .requires(&["N_T", "ps_feature_matrices", "M_slice", "grainsize", "U_raw", "V_raw", "M"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priors_follow_inferred_variances() {
        for spec in ModelSpec::all() {
            let names: Vec<&str> = fragments(spec).iter().map(|f| f.name).collect();
            assert_eq!(names.contains(&"v_prior"), !spec.variance_known, "{spec}");
            assert_eq!(names.contains(&"v_MC_prior"), !spec.variance_mc_known, "{spec}");
            assert_eq!(names.contains(&"precision"), !spec.variance_mc_known, "{spec}");
        }
    }

    #[test]
    fn test_feature_prior_matches_function_body() {
        let clustered = feature_matrix_prior(ModelSpec::new(true, true, true));
        assert!(clustered.text.contains("U_raw_means[t,:]"));
        assert!(clustered.requires.contains(&"E_cluster"));

        let plain = feature_matrix_prior(ModelSpec::new(false, true, true));
        assert!(!plain.text.contains("U_raw_means"));
        assert!(plain.text.contains("V_raw[t,:]"));
    }
}
