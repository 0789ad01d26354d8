//! `functions` block: kernels and the `reduce_sum` partial sums

use super::{surface_reconstruction, DATASET_RANGE};
use crate::codegen::program::{indent, Fragment};
use crate::model_spec::ModelSpec;

pub(super) fn fragments(spec: ModelSpec) -> Vec<Fragment> {
    vec![
        kernels(),
        feature_matrix_prior(spec),
        likelihood(spec),
    ]
}

fn kernels() -> Fragment {
    Fragment::new(
        "kernels",
        "    // kernel over composition
    matrix Kx(vector x1, vector x2, int order) {
        int N = rows(x1);
        int M = rows(x2);
        matrix[N, order+1] X1;
        matrix[M, order+1] X2;
        for (i in 1:order) {
            X1[:,i] = x1 .^(order+2-i) - x1;
            X2[:,i] = x2 .^(order+2-i) - x2;
        }
        X1[:,order+1] = 1e-1 * x1 .* sqrt(1-x1) .* exp(x1);
        X2[:,order+1] = 1e-1 * x2 .* sqrt(1-x2) .* exp(x2);
        return X1 * X2';
    }

    // kernel over temperature
    matrix KT(vector T1, vector T2) {
        int N = rows(T1);
        int M = rows(T2);
        matrix[N, 4] TT1 = append_col(append_col(append_col(rep_vector(1.0, N), T1), T1.^2), 1e-3 * T1.^3);
        matrix[M, 4] TT2 = append_col(append_col(append_col(rep_vector(1.0, M), T2), T2.^2), 1e-3 * T2.^3);
        return TT1 * TT2';
    }

    // product kernel over composition and temperature
    matrix Kernel(vector x1, vector x2, vector T1, vector T2, int order) {
        return Kx(x1, x2, order) .* KT(T1, T2);
    }",
    )
    .provides(&["Kx", "KT", "Kernel"])
}

/// Exactly one of the two `ps_feature_matrices` bodies is emitted.
fn feature_matrix_prior(spec: ModelSpec) -> Fragment {
    if spec.include_clusters {
        Fragment::new(
            "feature_prior_clustered",
            "    // partial sum: priors on the cluster means and on the feature matrices around them
    real ps_feature_matrices(array[] int M_slice, int start, int end, array[] matrix U_raw_means,
                             array[] matrix V_raw_means, array[] matrix U_raw, array[] matrix V_raw,
                             vector E_cluster, matrix C) {
        real all_target = 0;
        for (m in start:end) {
            all_target += std_normal_lpdf(to_vector(U_raw_means[m]));
            all_target += std_normal_lpdf(to_vector(V_raw_means[m]));
            all_target += normal_lpdf(to_vector(U_raw[m]) | to_vector(U_raw_means[m] * C), E_cluster);
            all_target += normal_lpdf(to_vector(V_raw[m]) | to_vector(V_raw_means[m] * C), E_cluster);
        }
        return all_target;
    }",
        )
        .provides(&["ps_feature_matrices"])
    } else {
        Fragment::new(
            "feature_prior",
            "    // partial sum: standard normal priors on the feature matrices
    real ps_feature_matrices(array[] int M_slice, int start, int end, array[] matrix U_raw,
                             array[] matrix V_raw) {
        real all_target = 0;
        for (m in start:end) {
            all_target += std_normal_lpdf(to_vector(U_raw[m]));
            all_target += std_normal_lpdf(to_vector(V_raw[m]));
        }
        return all_target;
    }",
        )
        .provides(&["ps_feature_matrices"])
    }
}

/// `ps_like`: GP prior on the reconstructed dense surface plus the
/// multivariate normal likelihood of every known dataset.
fn likelihood(spec: ModelSpec) -> Fragment {
    let header = "    // partial sum: GP prior on the dense surface and likelihood of the data
    real ps_like(array[] int N_slice, int start, int end, vector y, matrix cov_y_yMC,
                 matrix mu_y_y_MC, matrix L_y_MC_inv_cov, matrix y_MC_prec, vector v,
                 array[,] int Idx_all, int M, int N_T, int N_MC, int N_C, int N_known,
                 array[] int N_points, vector v_ARD, array[,] matrix U_raw,
                 array[,] matrix V_raw, real v_MC, matrix K_MC) {
        real all_target = 0;
        for (i in start:end) {
            vector[N_MC] y_MC_pred;";

    let mut known = String::from(DATASET_RANGE);
    known.push('\n');
    known.push_str(&likelihood_covariance(spec));
    known.push_str("\nall_target += multi_normal_lpdf(y[lo:hi] | y_pred, cov_y);");

    let text = format!(
        "{header}
{surface}
            all_target += -0.5 * dot_self(L_y_MC_inv_cov * y_MC_pred);

            if (i <= N_known) {{
{known}
            }}
        }}
        return all_target;
    }}",
        surface = indent(&surface_reconstruction(None, "i"), 3),
        known = indent(&known, 4),
    );

    Fragment::new("likelihood", text).provides(&["ps_like"])
}

// Mean and covariance of the data given the dense surface, 2x2 over
// (variance_known, variance_MC_known).
fn likelihood_covariance(spec: ModelSpec) -> String {
    let mut out = String::new();

    if spec.variance_mc_known {
        out.push_str("vector[N_points[i]] y_pred = mu_y_y_MC[lo:hi, :] * y_MC_pred;\n");
        if spec.variance_known {
            out.push_str("matrix[N_points[i], N_points[i]] cov_y = cov_y_yMC[lo:hi, :N_points[i]];");
        } else {
            out.push_str(
                "matrix[N_points[i], N_points[i]] cov_y = add_diag(cov_y_yMC[lo:hi, :N_points[i]], v[i]);",
            );
        }
    } else {
        out.push_str(
            "vector[N_points[i]] y_pred = (mu_y_y_MC[lo:hi, :] * y_MC_prec) * y_MC_pred;
matrix[N_points[i], N_points[i]] stable_inv;
{
    matrix[N_points[i], N_MC] ss = mu_y_y_MC[lo:hi, :] * L_y_MC_inv_cov';
    stable_inv = ss * ss';
    stable_inv = (stable_inv + stable_inv') / 2.0; // ensure symmetry
}
matrix[N_points[i], N_points[i]] cov_y = cov_y_yMC[lo:hi, :N_points[i]] - stable_inv;",
        );
        if !spec.variance_known {
            out.push_str("\ncov_y = add_diag(cov_y, v[i]);");
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_prior_bodies_exclusive() {
        for spec in ModelSpec::all() {
            let names: Vec<&str> = fragments(spec).iter().map(|f| f.name).collect();
            let clustered = names.contains(&"feature_prior_clustered");
            let plain = names.contains(&"feature_prior");
            assert!(clustered ^ plain, "{spec}");
            assert_eq!(clustered, spec.include_clusters);
        }
    }

    #[test]
    fn test_clustered_prior_centres_each_matrix_on_its_own_means() {
        let text = feature_matrix_prior(ModelSpec::new(true, false, false)).text;
        assert!(text.contains("normal_lpdf(to_vector(U_raw[m]) | to_vector(U_raw_means[m] * C), E_cluster)"));
        assert!(text.contains("normal_lpdf(to_vector(V_raw[m]) | to_vector(V_raw_means[m] * C), E_cluster)"));
    }

    #[test]
    fn test_likelihood_switch() {
        let both_known = likelihood_covariance(ModelSpec::new(false, true, true));
        assert!(!both_known.contains("add_diag"));
        assert!(!both_known.contains("stable_inv"));

        let v_unknown = likelihood_covariance(ModelSpec::new(false, false, true));
        assert!(v_unknown.contains("add_diag(cov_y_yMC[lo:hi, :N_points[i]], v[i])"));
        assert!(!v_unknown.contains("stable_inv"));

        let mc_unknown = likelihood_covariance(ModelSpec::new(false, true, false));
        assert!(mc_unknown.contains("(stable_inv + stable_inv') / 2.0"));
        assert!(mc_unknown.contains("* y_MC_prec) * y_MC_pred"));
        assert!(!mc_unknown.contains("v[i]"));

        let none_known = likelihood_covariance(ModelSpec::new(false, false, false));
        assert!(none_known.contains("cov_y = add_diag(cov_y, v[i]);"));
    }

    #[test]
    fn test_likelihood_braces_balance() {
        for spec in ModelSpec::all() {
            let text = likelihood(spec).text;
            let open = text.matches('{').count();
            let close = text.matches('}').count();
            assert_eq!(open, close, "{spec}");
        }
    }
}
