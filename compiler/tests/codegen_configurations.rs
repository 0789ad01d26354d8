// Generated programs across the eight model configurations
use hybrid_pmf::codegen::stan::{check, generate, generate_stan_code};
use hybrid_pmf::codegen::{BlockKind, GeneratedProgram};
use hybrid_pmf::ModelSpec;

fn declares(program: &GeneratedProgram, kind: BlockKind, ident: &str) -> bool {
    program
        .block(kind)
        .map(|block| block.declares(ident))
        .unwrap_or(false)
}

fn body(program: &GeneratedProgram, kind: BlockKind) -> String {
    program.block(kind).expect("block missing").body()
}

#[test]
fn test_generation_is_deterministic() {
    for spec in ModelSpec::all() {
        let first = generate_stan_code(spec.include_clusters, spec.variance_known, spec.variance_mc_known);
        let second = generate_stan_code(spec.include_clusters, spec.variance_known, spec.variance_mc_known);
        assert_eq!(first, second, "{spec}");
        assert_eq!(first, spec.generate(), "{spec}");
    }
}

#[test]
fn test_all_configurations_resolve_identifiers() {
    for spec in ModelSpec::all() {
        check(spec).unwrap_or_else(|err| panic!("{err}: {:#?}", err.violations));
        generate(spec)
            .check_scoping()
            .unwrap_or_else(|err| panic!("{err}: {:#?}", err.violations));
    }
}

#[test]
fn test_blocks_in_fixed_order() {
    let keywords = [
        "functions {",
        "data {",
        "transformed data {",
        "parameters {",
        "model {",
        "generated quantities {",
    ];
    for spec in ModelSpec::all() {
        let code = spec.generate();
        let positions: Vec<usize> = keywords
            .iter()
            .map(|kw| {
                code.lines()
                    .position(|line| line == *kw)
                    .unwrap_or_else(|| panic!("{spec}: no `{kw}` line"))
            })
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{spec}: {positions:?}");
    }
}

#[test]
fn test_feature_prior_bodies_mutually_exclusive() {
    for spec in ModelSpec::all() {
        let functions = generate(spec);
        let functions = functions.block(BlockKind::Functions).unwrap();
        let clustered = functions.has_fragment("feature_prior_clustered");
        let plain = functions.has_fragment("feature_prior");
        assert!(clustered ^ plain, "{spec}");
        assert_eq!(clustered, spec.include_clusters, "{spec}");
        assert_eq!(spec.generate().matches("real ps_feature_matrices(").count(), 1, "{spec}");
    }
}

#[test]
fn test_variances_are_data_or_parameters() {
    for spec in ModelSpec::all() {
        let program = generate(spec);

        assert_eq!(declares(&program, BlockKind::Data, "v"), spec.variance_known, "{spec}");
        assert_eq!(declares(&program, BlockKind::Parameters, "v"), !spec.variance_known, "{spec}");

        assert_eq!(declares(&program, BlockKind::Data, "v_MC"), spec.variance_mc_known, "{spec}");
        assert_eq!(
            declares(&program, BlockKind::Parameters, "v_MC"),
            !spec.variance_mc_known,
            "{spec}"
        );
    }
}

#[test]
fn test_cluster_identifiers_gated() {
    for spec in ModelSpec::all() {
        let program = generate(spec);
        for ident in ["K", "C", "v_cluster"] {
            assert_eq!(declares(&program, BlockKind::Data, ident), spec.include_clusters, "{spec} {ident}");
        }
        for ident in ["U_raw_means", "V_raw_means"] {
            assert_eq!(
                declares(&program, BlockKind::Parameters, ident),
                spec.include_clusters,
                "{spec} {ident}"
            );
        }

        let code = spec.generate();
        for token in ["v_cluster", "U_raw_means", "V_raw_means", "E_cluster"] {
            assert_eq!(code.contains(token), spec.include_clusters, "{spec} {token}");
        }
    }
}

#[test]
fn test_scenario_nothing_known() {
    let program = generate(ModelSpec::new(false, false, false));

    let data = body(&program, BlockKind::Data);
    assert!(!data.contains("] v;"));
    assert!(!data.contains("v_MC;"));

    let parameters = body(&program, BlockKind::Parameters);
    assert!(parameters.contains("vector<lower=0, upper=5>[N_known] v;"));
    assert!(parameters.contains("real<lower=0, upper=5> v_MC;"));

    let model = body(&program, BlockKind::Model);
    assert!(model.contains("inverse(cholesky_decompose(add_diag(K_MC, v_MC)))"));
    assert!(model.contains("target += (N_known + N_unknown) * log_determinant(L_y_MC_inv_cov);"));
    assert!(model.contains("v ~ exponential(1);"));
    assert!(model.contains("v_MC ~ exponential(1);"));
}

#[test]
fn test_scenario_everything_known() {
    let program = generate(ModelSpec::new(true, true, true));

    for ident in ["v", "K", "C", "v_cluster", "v_MC"] {
        assert!(declares(&program, BlockKind::Data, ident), "{ident}");
    }
    assert!(!declares(&program, BlockKind::Parameters, "v"));
    assert!(!declares(&program, BlockKind::Parameters, "v_MC"));
    assert!(declares(&program, BlockKind::Parameters, "U_raw_means"));
    assert!(declares(&program, BlockKind::Parameters, "V_raw_means"));

    let model = body(&program, BlockKind::Model);
    assert!(model.contains("reduce_sum(ps_feature_matrices, M_slice, grainsize, U_raw_means[t,:]"));
    assert!(!model.contains("log_determinant"));
    assert!(!model.contains("~ exponential(1);"));
}

#[test]
fn test_scenario_observation_variance_known_only() {
    let program = generate(ModelSpec::new(false, true, false));

    assert!(declares(&program, BlockKind::Data, "v"));
    assert!(declares(&program, BlockKind::Parameters, "v_MC"));

    let transformed = program.block(BlockKind::TransformedData).unwrap();
    assert!(!transformed.declares("y_MC_prec"));
    assert!(!transformed.declares("L_y_MC_inv_cov"));
    assert!(!transformed.body().contains("stable_inv"));
    assert!(transformed
        .body()
        .contains("cov_y_yMC[lo:hi, :N_points[i]] = add_diag(cov_y_yMC[lo:hi, :N_points[i]], v[i]);"));
}

#[test]
fn test_stable_correction_symmetrized_before_sampling_only() {
    let precomputed = generate(ModelSpec::new(false, false, true));
    assert!(body(&precomputed, BlockKind::TransformedData)
        .contains("stable_inv = (stable_inv + stable_inv') / 2.0;"));

    let per_draw = generate(ModelSpec::new(false, false, false));
    let gq = body(&per_draw, BlockKind::GeneratedQuantities);
    assert!(gq.contains("stable_inv * stable_inv'"));
    assert!(!gq.contains("/ 2.0"));
    assert!(body(&per_draw, BlockKind::Functions).contains("(stable_inv + stable_inv') / 2.0"));
}

#[test]
fn test_model_block_locals_rebuilt_in_generated_quantities() {
    for spec in ModelSpec::all() {
        let gq = generate(spec);
        let gq = gq.block(BlockKind::GeneratedQuantities).unwrap();
        assert_eq!(gq.declares("L_y_MC_inv_cov"), !spec.variance_mc_known, "{spec}");
    }
}
