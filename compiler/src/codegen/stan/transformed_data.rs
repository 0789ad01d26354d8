//! `transformed data` block
//!
//! The dense-grid kernel is always built here. When `v_MC` is data the
//! inverse Cholesky factor of `K_MC + v_MC I` and the precision are constants,
//! so the conditional Gaussian map from `y_MC` to each dataset is finished
//! here too. Otherwise only the raw cross kernel and marginal covariance are
//! stored and the model block completes them per evaluation.

use super::DATASET_RANGE;
use crate::codegen::program::{indent, Fragment};
use crate::model_spec::ModelSpec;

pub(super) fn fragments(spec: ModelSpec) -> Vec<Fragment> {
    let mut out = vec![declarations()];
    if spec.variance_mc_known {
        out.push(
            Fragment::new(
                "precision_declarations",
                "    matrix[N_MC, N_MC] y_MC_prec;                          // precision of the dense grid
    matrix[N_MC, N_MC] L_y_MC_inv_cov;                     // inverse Cholesky factor of the dense grid",
            )
            .provides(&["y_MC_prec", "L_y_MC_inv_cov"])
            .requires(&["N_MC"]),
        );
    }
    if spec.include_clusters {
        out.push(
            Fragment::new(
                "cluster_variance",
                "    vector[D*N] E_cluster = to_vector(rep_matrix(v_cluster', D) * C); // within-cluster variance per entry",
            )
            .provides(&["E_cluster"])
            .requires(&["D", "N", "v_cluster", "C"]),
        );
    }
    out.push(dense_grid());
    if spec.variance_mc_known {
        out.push(
            Fragment::new(
                "precision",
                "    L_y_MC_inv_cov = inverse(cholesky_decompose(add_diag(K_MC, v_MC)));
    y_MC_prec = crossprod(L_y_MC_inv_cov);",
            )
            .requires(&["L_y_MC_inv_cov", "K_MC", "v_MC", "y_MC_prec"]),
        );
    }
    out.push(conditional_gaussian(spec));
    out.push(slices());
    out
}

fn declarations() -> Fragment {
    Fragment::new(
        "declarations",
        "    real error = 0.01;                                     // relative experimental error
    vector[sum(N_points)] var_data = square(error * y1);   // variance of the data
    int M = (N_C + 1) %/% 2;                               // number of U matrices per temperature
    int N_MC = N_C * N_T;                                  // dense grid points per mixture
    array[M-1] int M_slice;                                // slice indices over feature matrices
    array[N_known+N_unknown] int N_slice;                  // slice indices over mixtures
    array[N_known+N_unknown, 2] int Idx_all = append_array(Idx_known, Idx_unknown);
    vector[N_MC] x2;                                       // compositions of the dense grid
    vector[N_MC] T2;                                       // temperatures of the dense grid
    matrix[N_MC, N_MC] K_MC;                               // kernel of the dense grid
    matrix[sum(N_points), N_MC] mu_y_y_MC;                 // map from y_MC to y
    matrix[sum(N_points), max(N_points)] cov_y_yMC;        // covariance of y given y_MC",
    )
    .provides(&[
        "error",
        "var_data",
        "M",
        "N_MC",
        "M_slice",
        "N_slice",
        "Idx_all",
        "x2",
        "T2",
        "K_MC",
        "mu_y_y_MC",
        "cov_y_yMC",
    ])
    .requires(&[
        "N_points",
        "y1",
        "N_C",
        "N_T",
        "N_known",
        "N_unknown",
        "Idx_known",
        "Idx_unknown",
    ])
}

fn dense_grid() -> Fragment {
    Fragment::new(
        "dense_grid",
        "    for (i in 1:N_T) {
        x2[(i-1)*N_C+1:i*N_C] = x2_int;
        T2[(i-1)*N_C+1:i*N_C] = rep_vector(T2_int[i], N_C);
    }
    K_MC = add_diag(Kernel(x2, x2, T2, T2, order), jitter);",
    )
    .requires(&[
        "N_T", "x2", "N_C", "x2_int", "T2", "T2_int", "K_MC", "Kernel", "order", "jitter",
    ])
}

/// Per known dataset: the map `mu_y_y_MC` and covariance `cov_y_yMC` of the
/// data given the dense surface.
fn conditional_gaussian(spec: ModelSpec) -> Fragment {
    let mut body = String::from(DATASET_RANGE);
    body.push_str(
        "
matrix[N_points[i], N_MC] K_y_yMC = Kernel(x1[lo:hi], x2, T1[lo:hi], T2, order);
matrix[N_points[i], N_points[i]] K_y = Kernel(x1[lo:hi], x1[lo:hi], T1[lo:hi], T1[lo:hi], order);",
    );

    let mut requires = vec![
        "N_known",
        "N_points",
        "N_MC",
        "Kernel",
        "x1",
        "x2",
        "T1",
        "T2",
        "order",
        "mu_y_y_MC",
        "cov_y_yMC",
        "var_data",
    ];

    if spec.variance_mc_known {
        // A B A' with B = L^-T L^-1 is C C' for C = A L^-T, without forming B
        body.push_str(
            "
matrix[N_points[i], N_points[i]] stable_inv;
{
    matrix[N_points[i], N_MC] ss = K_y_yMC * L_y_MC_inv_cov';
    stable_inv = ss * ss';
    stable_inv = (stable_inv + stable_inv') / 2.0; // ensure symmetry
}
mu_y_y_MC[lo:hi, :] = K_y_yMC * y_MC_prec;
cov_y_yMC[lo:hi, :N_points[i]] = add_diag(K_y, var_data[lo:hi]) - stable_inv;",
        );
        requires.extend(["L_y_MC_inv_cov", "y_MC_prec"]);
    } else {
        body.push_str(
            "
mu_y_y_MC[lo:hi, :] = K_y_yMC;
cov_y_yMC[lo:hi, :N_points[i]] = add_diag(K_y, var_data[lo:hi]);",
        );
    }

    if spec.variance_known {
        body.push_str(
            "
cov_y_yMC[lo:hi, :N_points[i]] = add_diag(cov_y_yMC[lo:hi, :N_points[i]], v[i]);",
        );
        requires.push("v");
    }

    let text = format!("    for (i in 1:N_known) {{\n{}\n    }}", indent(&body, 2));
    Fragment::new("conditional_gaussian", text).requires(&requires)
}

fn slices() -> Fragment {
    Fragment::new(
        "slices",
        "    for (i in 1:N_known+N_unknown) {
        N_slice[i] = i;
    }
    for (m in 1:M-1) {
        M_slice[m] = m;
    }",
    )
    .requires(&["N_known", "N_unknown", "N_slice", "M", "M_slice"])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(spec: ModelSpec) -> Vec<&'static str> {
        fragments(spec).iter().map(|f| f.name).collect()
    }

    #[test]
    fn test_precision_precomputed_only_with_known_mc_variance() {
        for spec in ModelSpec::all() {
            let names = names(spec);
            assert_eq!(names.contains(&"precision"), spec.variance_mc_known, "{spec}");
            assert_eq!(
                names.contains(&"precision_declarations"),
                spec.variance_mc_known,
                "{spec}"
            );
        }
    }

    #[test]
    fn test_known_variance_added_in_transformed_data() {
        let text = conditional_gaussian(ModelSpec::new(false, true, false)).text;
        assert!(text.contains("add_diag(cov_y_yMC[lo:hi, :N_points[i]], v[i])"));
        assert!(!text.contains("y_MC_prec"));

        let text = conditional_gaussian(ModelSpec::new(false, false, true)).text;
        assert!(!text.contains("v[i]"));
        assert!(text.contains("K_y_yMC * y_MC_prec"));
    }

    #[test]
    fn test_kernel_jitter_always_applied() {
        for spec in ModelSpec::all() {
            let dense = fragments(spec)
                .into_iter()
                .find(|f| f.name == "dense_grid")
                .unwrap();
            assert!(dense.text.contains("add_diag(Kernel(x2, x2, T2, T2, order), jitter)"));
        }
    }

    #[test]
    fn test_cluster_variance_gated() {
        assert!(names(ModelSpec::new(true, false, false)).contains(&"cluster_variance"));
        assert!(!names(ModelSpec::new(false, true, true)).contains(&"cluster_variance"));
    }
}
