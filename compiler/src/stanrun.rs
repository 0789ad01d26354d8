//! CmdStan execution
//!
//! This module provides functionality to:
//! - Detect the cmdstan installation
//! - Compile generated Stan models with threading enabled
//! - Run Pathfinder for initial values
//! - Run multi-chain NUTS sampling from those initial values
//!
//! Toolchain settings (temporary directory, thread count) are passed to each
//! child process through [`ToolchainEnv`]; the parent's environment is never
//! modified.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// Environment overrides for CmdStan child processes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainEnv {
    /// Temporary directory for the compiler and the model (`TMPDIR`)
    pub tmpdir: Option<PathBuf>,
    /// Total threads available to the model (`STAN_NUM_THREADS`)
    pub num_threads: Option<usize>,
}

impl ToolchainEnv {
    /// Apply the overrides to `cmd` only.
    pub fn apply(&self, cmd: &mut Command) {
        if let Some(tmpdir) = &self.tmpdir {
            cmd.env("TMPDIR", tmpdir);
        }
        if let Some(threads) = self.num_threads {
            cmd.env("STAN_NUM_THREADS", threads.to_string());
        }
    }

    pub fn with_threads(&self, num_threads: usize) -> Self {
        Self {
            num_threads: Some(num_threads),
            ..self.clone()
        }
    }
}

/// Configuration of the Pathfinder stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathfinderConfig {
    /// Number of single-path runs
    pub num_paths: usize,
    /// Draws returned after importance resampling
    pub num_draws: usize,
    pub num_threads: usize,
    pub seed: Option<u32>,
    pub refresh: usize,
}

impl Default for PathfinderConfig {
    fn default() -> Self {
        Self {
            num_paths: 4,
            num_draws: 1000,
            num_threads: 4,
            seed: None,
            refresh: 100,
        }
    }
}

/// Configuration for NUTS sampling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StanConfig {
    /// Number of chains, run in parallel by one CmdStan process
    pub num_chains: usize,
    /// Threads per chain for `reduce_sum`
    pub threads_per_chain: usize,
    /// Number of warmup iterations per chain
    pub num_warmup: usize,
    /// Number of sampling iterations per chain
    pub num_samples: usize,
    /// Random seed for reproducibility
    pub seed: Option<u32>,
    /// Adapt delta (target acceptance rate)
    pub adapt_delta: f64,
    /// Maximum tree depth
    pub max_treedepth: usize,
    /// Metric adapted during warmup (`diag_e`, `dense_e`, `unit_e`)
    pub metric: String,
    /// Significant figures in the output CSV
    pub sig_figs: usize,
    pub refresh: usize,
    /// Write CmdStan profiling output next to the draws
    pub save_profile: bool,
}

impl Default for StanConfig {
    fn default() -> Self {
        Self {
            num_chains: 8,
            threads_per_chain: 3,
            num_warmup: 5000,
            num_samples: 1000,
            seed: None,
            adapt_delta: 0.8,
            max_treedepth: 12,
            metric: "dense_e".to_string(),
            sig_figs: 18,
            refresh: 1,
            save_profile: true,
        }
    }
}

impl StanConfig {
    pub fn total_threads(&self) -> usize {
        self.num_chains * self.threads_per_chain
    }
}

/// Detect cmdstan installation
pub fn detect_cmdstan() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CMDSTAN") {
        let cmdstan_path = PathBuf::from(&path);
        if cmdstan_path.exists() {
            return Ok(cmdstan_path);
        }
    }

    let home = dirs::home_dir().context("no HOME directory found")?;
    let candidates = [
        home.join(".cmdstan"),
        home.join("cmdstan"),
        PathBuf::from("/usr/local/cmdstan"),
        PathBuf::from("/opt/cmdstan"),
    ];

    for root in candidates {
        if !root.exists() {
            continue;
        }
        if root.join("makefile").exists() {
            return Ok(root);
        }
        // cmdstanpy installs versions side by side: ~/.cmdstan/cmdstan-2.xx
        if let Ok(entries) = fs::read_dir(&root) {
            let mut versions: Vec<PathBuf> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect();
            versions.sort();
            if let Some(latest) = versions.pop() {
                return Ok(latest);
            }
        }
    }

    bail!("cmdstan not found. Please set CMDSTAN environment variable or install cmdstan")
}

/// Compile a Stan model to an executable next to the source file.
pub fn compile_stan_model(stan_file: &Path, cmdstan_path: &Path, env: &ToolchainEnv) -> Result<PathBuf> {
    let model_name = stan_file
        .file_stem()
        .context("Invalid Stan file name")?
        .to_string_lossy()
        .into_owned();

    let exe_path = stan_file.with_extension("");

    if exe_path.exists() {
        let stan_modified = fs::metadata(stan_file)?.modified()?;
        let exe_modified = fs::metadata(&exe_path)?.modified()?;
        if exe_modified > stan_modified {
            debug!(model = %model_name, "executable up to date");
            return Ok(exe_path);
        }
    }

    // make resolves the target relative to the cmdstan tree
    let exe_abs = if exe_path.is_absolute() {
        exe_path.clone()
    } else {
        std::env::current_dir()?.join(&exe_path)
    };

    info!(model = %model_name, "compiling Stan model");

    let mut cmd = Command::new("make");
    cmd.current_dir(cmdstan_path)
        .arg("STAN_THREADS=true")
        .arg(exe_abs.to_string_lossy().to_string());
    env.apply(&mut cmd);

    let output = cmd.output().context("Failed to execute make")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("Stan compilation failed:\n{}", stderr);
    }

    info!(model = %model_name, "compilation successful");
    Ok(exe_path)
}

/// CmdStan arguments for a Pathfinder run.
pub fn build_pathfinder_args(data_file: &Path, output_file: &Path, config: &PathfinderConfig) -> Vec<String> {
    let mut args = vec![
        "pathfinder".to_string(),
        format!("num_paths={}", config.num_paths),
        format!("num_psis_draws={}", config.num_draws),
        "data".to_string(),
        format!("file={}", data_file.display()),
        "output".to_string(),
        format!("file={}", output_file.display()),
        format!("refresh={}", config.refresh),
        format!("num_threads={}", config.num_threads),
    ];
    if let Some(seed) = config.seed {
        args.extend(["random".to_string(), format!("seed={seed}")]);
    }
    args
}

/// CmdStan arguments for multi-chain NUTS sampling. With more than one chain
/// CmdStan reads `inits_<k>.json` for an `init=inits.json` argument and
/// writes `<stem>_<k>.csv` for an `output_file` of `<stem>.csv`.
pub fn build_sample_args(
    data_file: &Path,
    init_file: Option<&Path>,
    output_file: &Path,
    config: &StanConfig,
) -> Vec<String> {
    let mut args = vec![
        "sample".to_string(),
        format!("num_samples={}", config.num_samples),
        format!("num_warmup={}", config.num_warmup),
        "adapt".to_string(),
        format!("delta={}", config.adapt_delta),
        "algorithm=hmc".to_string(),
        "engine=nuts".to_string(),
        format!("max_depth={}", config.max_treedepth),
        format!("metric={}", config.metric),
        format!("num_chains={}", config.num_chains),
        "data".to_string(),
        format!("file={}", data_file.display()),
    ];
    if let Some(init) = init_file {
        args.push(format!("init={}", init.display()));
    }
    args.extend([
        "output".to_string(),
        format!("file={}", output_file.display()),
        format!("refresh={}", config.refresh),
        format!("sig_figs={}", config.sig_figs),
    ]);
    if config.save_profile {
        args.push(format!("profile_file={}", profile_file(output_file).display()));
    }
    if let Some(seed) = config.seed {
        args.extend(["random".to_string(), format!("seed={seed}")]);
    }
    args.push(format!("num_threads={}", config.total_threads()));
    args
}

fn profile_file(output_file: &Path) -> PathBuf {
    let stem = output_file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    output_file.with_file_name(format!("{stem}-profile.csv"))
}

/// Run Pathfinder; returns the draws file.
pub fn run_pathfinder(
    exe_path: &Path,
    data_file: &Path,
    output_dir: &Path,
    config: &PathfinderConfig,
    env: &ToolchainEnv,
) -> Result<PathBuf> {
    fs::create_dir_all(output_dir).context("Failed to create output directory")?;
    let output_file = output_dir.join("pathfinder.csv");

    info!(paths = config.num_paths, draws = config.num_draws, "running Pathfinder");
    run_cmdstan(
        exe_path,
        &build_pathfinder_args(data_file, &output_file, config),
        &env.with_threads(config.num_threads),
    )
    .context("Pathfinder failed")?;

    Ok(output_file)
}

/// Run NUTS sampling; returns the per-chain draw files.
pub fn run_sampling(
    exe_path: &Path,
    data_file: &Path,
    init_file: Option<&Path>,
    output_dir: &Path,
    config: &StanConfig,
    env: &ToolchainEnv,
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(output_dir).context("Failed to create output directory")?;
    let output_file = output_dir.join("output.csv");

    info!(
        chains = config.num_chains,
        threads_per_chain = config.threads_per_chain,
        warmup = config.num_warmup,
        samples = config.num_samples,
        "running MCMC sampling"
    );
    run_cmdstan(
        exe_path,
        &build_sample_args(data_file, init_file, &output_file, config),
        &env.with_threads(config.total_threads()),
    )
    .context("Sampling failed")?;

    let chain_files = if config.num_chains == 1 {
        vec![output_file]
    } else {
        (1..=config.num_chains)
            .map(|k| output_dir.join(format!("output_{k}.csv")))
            .collect()
    };
    info!("MCMC sampling complete");
    Ok(chain_files)
}

fn run_cmdstan(exe_path: &Path, args: &[String], env: &ToolchainEnv) -> Result<()> {
    debug!(exe = %exe_path.display(), args = ?args, "launching CmdStan");

    let mut cmd = Command::new(exe_path);
    cmd.args(args);
    env.apply(&mut cmd);

    let output = cmd.output().context("Failed to execute Stan model")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        // CmdStan reports numerical failures on stdout
        let lines: Vec<&str> = stdout.lines().collect();
        let tail = lines[lines.len().saturating_sub(20)..].join("\n");
        bail!("CmdStan exited with {}:\n{}{}", output.status, stderr, tail);
    }
    Ok(())
}
