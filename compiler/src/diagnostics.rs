//! Posterior summary of a sampling run
//!
//! Per-column mean, sd, quantiles, rank-normalized split R-hat and bulk/tail
//! ESS over the chain CSV files of the sampling stage. R-hat is the maximum
//! of the bulk and folded (`|x - median|`) statistics; ESS uses Geyer's
//! initial monotone sequence on variogram autocorrelations of the split,
//! rank-normalized chains.

use crate::draws::StanCsv;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

const RHAT_THRESHOLD: f64 = 1.01;
const ESS_THRESHOLD: f64 = 400.0;

/// Shortest chain the split diagnostics accept
pub const MIN_DRAWS: usize = 4;

/// Summary of one output column
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSummary {
    pub name: String,
    pub mean: f64,
    pub sd: f64,
    /// Quantiles [5%, 50%, 95%]
    pub quantiles: [f64; 3],
    /// Rank-normalized split R-hat (should be < 1.01 for convergence)
    pub rhat: f64,
    pub ess_bulk: f64,
    pub ess_tail: f64,
}

/// Summary of every model column of a multi-chain run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitSummary {
    pub n_chains: usize,
    pub n_draws: usize,
    pub params: Vec<ParamSummary>,
}

impl FitSummary {
    pub fn param(&self, name: &str) -> Option<&ParamSummary> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Human-readable convergence warnings.
    pub fn warnings(&self) -> Vec<String> {
        let mut out = Vec::new();
        for p in &self.params {
            if p.rhat > RHAT_THRESHOLD {
                out.push(format!("{} has Rhat = {:.3} (should be < {RHAT_THRESHOLD})", p.name, p.rhat));
            }
            if p.ess_bulk < ESS_THRESHOLD {
                out.push(format!("{} has low bulk ESS = {:.0} (should be > {ESS_THRESHOLD})", p.name, p.ess_bulk));
            }
            if p.ess_tail < ESS_THRESHOLD {
                out.push(format!("{} has low tail ESS = {:.0} (should be > {ESS_THRESHOLD})", p.name, p.ess_tail));
            }
        }
        out
    }
}

/// Summarise columns whose base name is in `names` (all model columns when
/// `names` is empty). Every chain must share the header of the first.
pub fn summarize(chains: &[StanCsv], names: &[&str]) -> Result<FitSummary> {
    let Some(first) = chains.first() else {
        bail!("no chains to summarise");
    };
    if chains.iter().any(|c| c.header != first.header) {
        bail!("chains have different columns");
    }
    let n_draws = chains.iter().map(StanCsv::len).min().unwrap_or(0);
    if n_draws < MIN_DRAWS {
        bail!("need at least {MIN_DRAWS} draws per chain, found {n_draws}");
    }

    let mut params = Vec::new();
    for var in first.variables()? {
        if !names.is_empty() && !names.contains(&var.name.as_str()) {
            continue;
        }
        for (col, _) in &var.columns {
            let samples: Vec<Vec<f64>> = chains
                .iter()
                .map(|c| c.draws[..n_draws].iter().map(|row| row[*col]).collect())
                .collect();
            params.push(summarize_column(&first.header[*col], &samples));
        }
    }

    Ok(FitSummary {
        n_chains: chains.len(),
        n_draws,
        params,
    })
}

fn summarize_column(name: &str, chain_samples: &[Vec<f64>]) -> ParamSummary {
    let mut all: Vec<f64> = chain_samples.iter().flatten().copied().collect();
    all.sort_by(f64::total_cmp);
    let total = all.len() as f64;

    let mean = all.iter().sum::<f64>() / total;
    let sd = (all.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (total - 1.0)).sqrt();
    let quantile = |q: f64| all[((all.len() - 1) as f64 * q).round() as usize];

    // a column constant across all chains has converged trivially
    let (rhat, ess_bulk, ess_tail) = if all.first() == all.last() {
        (1.0, total, total)
    } else {
        (
            rank_normalized_rhat(chain_samples),
            ess(&rank_normalize(chain_samples)),
            tail_ess(chain_samples, &all),
        )
    };

    ParamSummary {
        name: name.to_string(),
        mean,
        sd,
        quantiles: [quantile(0.05), quantile(0.50), quantile(0.95)],
        rhat,
        ess_bulk,
        ess_tail,
    }
}

/// Each chain cut into halves of equal length.
fn split_chains(chains: &[Vec<f64>]) -> Vec<&[f64]> {
    let half = chains.iter().map(|c| c.len() / 2).min().unwrap_or(0);
    chains
        .iter()
        .flat_map(|c| [&c[..half], &c[half..2 * half]])
        .collect()
}

fn mean_and_var(chain: &[f64]) -> (f64, f64) {
    let n = chain.len() as f64;
    let mean = chain.iter().sum::<f64>() / n;
    let var = chain.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, var)
}

/// Within-chain variance `W` and marginal variance estimate `var+` of the
/// split chains.
fn variance_components(split: &[&[f64]]) -> (f64, f64) {
    let m = split.len() as f64;
    let n = split[0].len() as f64;
    let (means, vars): (Vec<f64>, Vec<f64>) = split.iter().map(|c| mean_and_var(c)).unzip();

    let grand_mean = means.iter().sum::<f64>() / m;
    let b = n * means.iter().map(|mu| (mu - grand_mean).powi(2)).sum::<f64>() / (m - 1.0);
    let w = vars.iter().sum::<f64>() / m;
    (w, (n - 1.0) / n * w + b / n)
}

fn split_rhat(chains: &[Vec<f64>]) -> f64 {
    let split = split_chains(chains);
    let (w, var_plus) = variance_components(&split);
    if w < 1e-30 {
        return 1.0;
    }
    (var_plus / w).sqrt()
}

/// Replace draws by normal scores of their pooled ranks, ties averaged.
fn rank_normalize(chains: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let normal = Normal::standard();
    let mut flat: Vec<(f64, usize, usize)> = chains
        .iter()
        .enumerate()
        .flat_map(|(c, chain)| chain.iter().enumerate().map(move |(t, &x)| (x, c, t)))
        .collect();
    flat.sort_by(|a, b| a.0.total_cmp(&b.0));

    let n = flat.len();
    let mut out: Vec<Vec<f64>> = chains.iter().map(|c| vec![0.0; c.len()]).collect();
    let mut i = 0;
    while i < n {
        let mut j = i + 1;
        while j < n && flat[j].0 == flat[i].0 {
            j += 1;
        }
        // average 1-based rank of the tie group, offset to stay inside (0, 1)
        let rank = 0.5 * ((i + 1) as f64 + j as f64);
        let p = ((rank - 0.375) / (n as f64 + 0.25)).clamp(1e-12, 1.0 - 1e-12);
        let z = normal.inverse_cdf(p);
        for &(_, c, t) in &flat[i..j] {
            out[c][t] = z;
        }
        i = j;
    }
    out
}

fn rank_normalized_rhat(chains: &[Vec<f64>]) -> f64 {
    let bulk = split_rhat(&rank_normalize(chains));

    let mut pooled: Vec<f64> = chains.iter().flatten().copied().collect();
    pooled.sort_by(f64::total_cmp);
    let median = pooled[pooled.len() / 2];
    let folded: Vec<Vec<f64>> = chains
        .iter()
        .map(|c| c.iter().map(|x| (x - median).abs()).collect())
        .collect();
    let tail = split_rhat(&rank_normalize(&folded));

    bulk.max(tail)
}

/// Effective sample size of the split chains.
fn ess(chains: &[Vec<f64>]) -> f64 {
    let split = split_chains(chains);
    let m = split.len();
    let n = split[0].len();
    let total = (m * n) as f64;

    let (_, var_plus) = variance_components(&split);
    if !var_plus.is_finite() || var_plus < 1e-30 {
        return total;
    }

    // rho_t = 1 - V_t / (2 var+), V_t the mean squared lag-t difference
    let mut rho = Vec::new();
    for lag in 1..n {
        let sum: f64 = split
            .iter()
            .map(|c| c.windows(lag + 1).map(|w| (w[0] - w[lag]).powi(2)).sum::<f64>())
            .sum();
        let variogram = sum / (m * (n - lag)) as f64;
        rho.push((1.0 - variogram / (2.0 * var_plus)).clamp(-1.0, 1.0));

        if rho.len() % 2 == 0 && rho[rho.len() - 2] + rho[rho.len() - 1] < 0.0 {
            break;
        }
    }

    // Geyer: positive paired sums, made monotone
    let mut tau = 1.0;
    let mut previous = f64::INFINITY;
    for pair in rho.chunks_exact(2) {
        let gamma = pair[0] + pair[1];
        if gamma < 0.0 {
            break;
        }
        previous = previous.min(gamma);
        tau += 2.0 * previous;
    }

    (total / tau).clamp(1.0, total)
}

/// Minimum ESS of the 5% and 95% tail indicators.
fn tail_ess(chains: &[Vec<f64>], sorted: &[f64]) -> f64 {
    let at = |q: f64| sorted[((sorted.len() - 1) as f64 * q).round() as usize];
    let (q05, q95) = (at(0.05), at(0.95));
    let indicator = |keep: &dyn Fn(f64) -> bool| -> Vec<Vec<f64>> {
        chains
            .iter()
            .map(|c| c.iter().map(|&x| if keep(x) { 1.0 } else { 0.0 }).collect())
            .collect()
    };
    let lower = indicator(&|x| x <= q05);
    let upper = indicator(&|x| x >= q95);
    ess(&lower).min(ess(&upper))
}

/// Print the summary table and convergence warnings.
pub fn print_summary(summary: &FitSummary) {
    println!("\n{}", "=".repeat(80));
    println!("Posterior summary: {} chains x {} draws", summary.n_chains, summary.n_draws);
    println!("{}", "=".repeat(80));
    println!(
        "\n{:<24} {:>10} {:>10} {:>10} {:>10} {:>10} {:>8} {:>8} {:>8}",
        "Parameter", "Mean", "SD", "5%", "50%", "95%", "Rhat", "ESS_b", "ESS_t"
    );
    println!("{}", "-".repeat(105));
    for p in &summary.params {
        println!(
            "{:<24} {:>10.4} {:>10.4} {:>10.4} {:>10.4} {:>10.4} {:>8.3} {:>8.0} {:>8.0}",
            p.name,
            p.mean,
            p.sd,
            p.quantiles[0],
            p.quantiles[1],
            p.quantiles[2],
            p.rhat,
            p.ess_bulk,
            p.ess_tail
        );
    }

    let warnings = summary.warnings();
    if warnings.is_empty() {
        println!("\nAll parameters converged");
    } else {
        println!("\nConvergence warnings:");
        for w in warnings {
            println!("  {w}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha20Rng;

    fn chain(values: &[f64]) -> StanCsv {
        let mut content = String::from("lp__,scale,v.1\n");
        for (i, scale) in values.iter().enumerate() {
            content.push_str(&format!("-1.0,{scale},{}\n", 0.1 + (i % 3) as f64));
        }
        StanCsv::parse(&content).unwrap()
    }

    fn independent_draws(seed: u64, n: usize) -> Vec<f64> {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        (0..n).map(|_| rng.gen::<f64>()).collect()
    }

    #[test]
    fn test_independent_chains_converge() {
        let chains: Vec<StanCsv> = (0..4).map(|s| chain(&independent_draws(s, 500))).collect();
        let summary = summarize(&chains, &[]).unwrap();

        assert_eq!(summary.n_chains, 4);
        assert_eq!(summary.n_draws, 500);
        let names: Vec<&str> = summary.params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["scale", "v.1"]);

        let scale = summary.param("scale").unwrap();
        assert!((scale.mean - 0.5).abs() < 0.05);
        assert!(scale.rhat < 1.05, "rhat {}", scale.rhat);
        assert!(scale.ess_bulk > 1000.0, "ess {}", scale.ess_bulk);
        assert!(scale.ess_bulk <= 2000.0);
    }

    #[test]
    fn test_autocorrelated_chains_have_low_ess() {
        // constant over blocks of 100 draws: about 10 independent values per chain
        let blocky: Vec<f64> = (0..1000).map(|i| ((i / 100) * 7 % 10) as f64).collect();
        let a = chain(&blocky);
        let b = chain(&blocky);
        let summary = summarize(&[a, b], &["scale"]).unwrap();

        let scale = &summary.params[0];
        assert!(scale.ess_bulk < ESS_THRESHOLD, "ess {}", scale.ess_bulk);
        assert!(scale.ess_bulk < 2000.0);
        assert!(summary
            .warnings()
            .iter()
            .any(|w| w.starts_with("scale has low bulk ESS")));
    }

    #[test]
    fn test_separated_chains_flagged() {
        let low: Vec<f64> = independent_draws(1, 100);
        let high: Vec<f64> = independent_draws(2, 100).iter().map(|x| x + 5.0).collect();
        let summary = summarize(&[chain(&low), chain(&high)], &["scale"]).unwrap();

        assert_eq!(summary.params.len(), 1);
        assert!(summary.params[0].rhat > 1.5);
        assert!(summary.warnings().iter().any(|w| w.starts_with("scale has Rhat")));
    }

    #[test]
    fn test_constant_column() {
        let a = chain(&[1.0, 2.0, 1.0, 2.0]);
        let b = StanCsv::parse("lp__,v_MC\n-1.0,0.5\n-1.0,0.5\n-1.0,0.5\n-1.0,0.5\n").unwrap();
        let summary = summarize(&[b], &["v_MC"]).unwrap();
        assert_eq!(summary.params[0].rhat, 1.0);
        assert_eq!(summary.params[0].sd, 0.0);
        assert_eq!(summary.params[0].ess_bulk, 4.0);
        assert!(summarize(&[a], &["v"]).is_ok());
    }

    #[test]
    fn test_short_or_mismatched_chains_rejected() {
        let a = chain(&[1.0, 2.0, 3.0, 4.0]);
        let b = StanCsv::parse("lp__,scale\n-1.0,1.0\n-1.0,2.0\n-1.0,3.0\n-1.0,4.0\n").unwrap();
        assert!(summarize(&[a, b], &[]).is_err());

        let short = chain(&[1.0, 2.0, 3.0]);
        assert!(summarize(&[short], &[]).is_err());
    }

    #[test]
    fn test_rank_normalize_averages_ties() {
        let z = rank_normalize(&[vec![3.0, 1.0, 3.0], vec![2.0]]);
        assert_eq!(z[0][0], z[0][2]);
        assert!(z[0][1] < z[1][0] && z[1][0] < z[0][0]);
    }
}
