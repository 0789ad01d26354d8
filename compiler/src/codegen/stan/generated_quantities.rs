//! `generated quantities` block: posterior predictions and pointwise
//! log-likelihood

use super::{surface_reconstruction, DATASET_RANGE};
use crate::codegen::program::{indent, Fragment};
use crate::model_spec::ModelSpec;

pub(super) fn fragments(spec: ModelSpec) -> Vec<Fragment> {
    vec![
        Fragment::new(
            "outputs",
            "    vector[sum(N_points)] y_pred;
    vector[N_known] log_lik;
    matrix[N_MC, N_known+N_unknown] y_MC_pred;",
        )
        .provides(&["y_pred", "log_lik", "y_MC_pred"])
        .requires(&["N_points", "N_known", "N_MC", "N_unknown"]),
        known_predictions(spec),
        unknown_predictions(),
    ]
}

fn known_predictions(spec: ModelSpec) -> Fragment {
    let mut body = String::from(DATASET_RANGE);
    body.push('\n');

    let mut requires = vec![
        "N_known",
        "N_points",
        "mu_y_y_MC",
        "cov_y_yMC",
        "y_MC_pred",
        "N_T",
        "M",
        "N_C",
        "U_raw",
        "V_raw",
        "Idx_all",
        "v_ARD",
        "y_pred",
        "y1",
        "log_lik",
    ];

    if spec.variance_mc_known {
        if spec.variance_known {
            body.push_str("matrix[N_points[i], N_points[i]] cov_y = cov_y_yMC[lo:hi, :N_points[i]];");
        } else {
            body.push_str(
                "matrix[N_points[i], N_points[i]] cov_y = add_diag(cov_y_yMC[lo:hi, :N_points[i]], v[i]);",
            );
        }
    } else {
        // Unlike the model block, the cross term is not symmetrised here.
        body.push_str(
            "matrix[N_points[i], N_MC] stable_inv = mu_y_y_MC[lo:hi, :] * L_y_MC_inv_cov';
matrix[N_points[i], N_points[i]] cov_y = cov_y_yMC[lo:hi, :N_points[i]] - stable_inv * stable_inv';",
        );
        if !spec.variance_known {
            body.push_str("\ncov_y = add_diag(cov_y, v[i]);");
        }
        requires.extend(["N_MC", "L_y_MC_inv_cov"]);
    }
    if !spec.variance_known {
        requires.push("v");
    }

    body.push('\n');
    body.push_str(&surface_reconstruction(Some("i"), "i"));
    if spec.variance_mc_known {
        body.push_str("\ny_pred[lo:hi] = mu_y_y_MC[lo:hi, :] * y_MC_pred[:, i];");
    } else {
        body.push_str("\ny_pred[lo:hi] = (mu_y_y_MC[lo:hi, :] * y_MC_prec) * y_MC_pred[:, i];");
        requires.push("y_MC_prec");
    }
    body.push_str("\nlog_lik[i] = multi_normal_lpdf(y1[lo:hi] | y_pred[lo:hi], cov_y);");

    let text = if spec.variance_mc_known {
        format!("    for (i in 1:N_known) {{\n{}\n    }}", indent(&body, 2))
    } else {
        // Local scope keeps the dense-grid factors out of the sampler output.
        format!(
            "    {{
        matrix[N_MC, N_MC] L_y_MC_inv_cov = inverse(cholesky_decompose(add_diag(K_MC, v_MC)));
        matrix[N_MC, N_MC] y_MC_prec = crossprod(L_y_MC_inv_cov);
        for (i in 1:N_known) {{
{}
        }}
    }}",
            indent(&body, 3)
        )
    };

    let mut fragment = Fragment::new("known_predictions", text).requires(&requires);
    if !spec.variance_mc_known {
        fragment = fragment
            .provides(&["L_y_MC_inv_cov", "y_MC_prec"])
            .requires(&["K_MC", "v_MC"]);
    }
    fragment
}

fn unknown_predictions() -> Fragment {
    Fragment::new(
        "unknown_predictions",
        format!(
            "    for (i in 1:N_unknown) {{\n{}\n    }}",
            indent(&surface_reconstruction(Some("N_known+i"), "N_known+i"), 2)
        ),
    )
    .requires(&[
        "N_unknown",
        "N_T",
        "M",
        "N_C",
        "y_MC_pred",
        "U_raw",
        "V_raw",
        "Idx_all",
        "v_ARD",
        "N_known",
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factors_recomputed_locally_without_known_mc_variance() {
        let fragment = known_predictions(ModelSpec::new(false, false, false));
        assert!(fragment.text.starts_with("    {\n"));
        assert!(fragment.provides.contains(&"L_y_MC_inv_cov"));
        assert!(fragment.text.contains("stable_inv * stable_inv'"));
        assert!(!fragment.text.contains("/ 2.0"));

        let fragment = known_predictions(ModelSpec::new(false, false, true));
        assert!(fragment.text.starts_with("    for (i in 1:N_known)"));
        assert!(fragment.provides.is_empty());
        assert!(!fragment.text.contains("L_y_MC_inv_cov"));
    }

    #[test]
    fn test_unknown_predictions_offset_by_known_count() {
        let text = unknown_predictions().text;
        assert!(text.contains("y_MC_pred[M+N_C*(t-1), N_known+i]"));
        assert!(text.contains("Idx_all[N_known+i,1]"));
    }
}
