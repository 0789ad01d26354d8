//! Two-stage inference workflow
//!
//! For one functional-group subset and one [`ModelSpec`]:
//!
//! 1. write the generated Stan program and compile it,
//! 2. run Pathfinder from random initial values (`Step1`), reusing earlier
//!    output when present,
//! 3. pick one Pathfinder draw per chain as initial values,
//! 4. run multi-chain NUTS from those values (`Step2`).
//!
//! Every stage leaves a `run.json` manifest next to its output.

use crate::dataset::HybridPmfData;
use crate::draws::{csv_files_in, StanCsv};
use crate::inits::{create_inits, write_inits};
use crate::model_spec::ModelSpec;
use crate::stanrun::{
    compile_stan_model, run_pathfinder, run_sampling, PathfinderConfig, StanConfig, ToolchainEnv,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Directory layout of a subset's results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    pub root: PathBuf,
    pub groups: Vec<String>,
    pub spec: ModelSpec,
}

impl RunLayout {
    pub fn new(root: impl Into<PathBuf>, groups: Vec<String>, spec: ModelSpec) -> Self {
        Self {
            root: root.into(),
            groups,
            spec,
        }
    }

    /// `<root>/<group>_<group>...`
    pub fn subset_dir(&self) -> PathBuf {
        self.root.join(self.groups.join("_"))
    }

    /// Data file shared by every configuration of the subset.
    pub fn data_file(&self) -> PathBuf {
        self.subset_dir().join("data.json")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.subset_dir().join(self.spec.result_dir())
    }

    pub fn step1_dir(&self) -> PathBuf {
        self.config_dir().join("Step1")
    }

    pub fn step2_dir(&self) -> PathBuf {
        self.config_dir().join("Step2")
    }

    pub fn model_file(&self) -> PathBuf {
        self.root
            .join("models")
            .join(format!("{}.stan", self.spec.model_name()))
    }
}

/// Record of one completed stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageManifest {
    pub stage: String,
    pub spec: ModelSpec,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub config: serde_json::Value,
    pub outputs: Vec<PathBuf>,
}

impl StageManifest {
    pub fn write(&self, dir: &Path) -> Result<()> {
        let path = dir.join("run.json");
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))
    }
}

/// Write the Stan program for `spec` to `path`, leaving an identical file
/// untouched so a compiled executable stays up to date.
pub fn write_model(spec: ModelSpec, path: &Path) -> Result<bool> {
    let code = spec.generate();
    if fs::read_to_string(path).map(|existing| existing == code).unwrap_or(false) {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, code).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(true)
}

/// Turn the Pathfinder draws in `step1_dir` into per-chain init files in
/// `step2_dir`; returns the `init=` argument for CmdStan.
pub fn initialise_from_pathfinder(
    spec: ModelSpec,
    step1_dir: &Path,
    step2_dir: &Path,
    chains: usize,
    seed: u64,
) -> Result<PathBuf> {
    let files = csv_files_in(step1_dir)?;
    if files.is_empty() {
        anyhow::bail!("no Pathfinder output in {}", step1_dir.display());
    }
    let csvs = files
        .iter()
        .map(|f| StanCsv::from_file(f))
        .collect::<Result<Vec<_>, _>>()?;

    let names = crate::codegen::stan::parameter_names(spec);
    let inits = create_inits(&csvs, &names, chains, seed)?;
    write_inits(step2_dir, &inits)
}

/// Pathfinder followed by NUTS for one configuration.
#[derive(Debug, Clone)]
pub struct TwoStageWorkflow {
    pub layout: RunLayout,
    pub cmdstan: PathBuf,
    pub env: ToolchainEnv,
    pub pathfinder: PathfinderConfig,
    pub sampling: StanConfig,
    pub init_seed: u64,
    /// Reuse `Step1` draws from an earlier run instead of rerunning Pathfinder
    pub reuse_pathfinder: bool,
}

/// Files produced by a complete run.
#[derive(Debug, Clone)]
pub struct WorkflowOutcome {
    pub executable: PathBuf,
    pub pathfinder_files: Vec<PathBuf>,
    pub init_file: PathBuf,
    pub chain_files: Vec<PathBuf>,
}

impl TwoStageWorkflow {
    pub fn new(layout: RunLayout, cmdstan: PathBuf) -> Self {
        Self {
            layout,
            cmdstan,
            env: ToolchainEnv::default(),
            pathfinder: PathfinderConfig::default(),
            sampling: StanConfig::default(),
            init_seed: 0,
            reuse_pathfinder: true,
        }
    }

    pub fn run(&self) -> Result<WorkflowOutcome> {
        let spec = self.layout.spec;
        info!(%spec, subset = %self.layout.subset_dir().display(), "starting workflow");

        let data_file = self.layout.data_file();
        let data = HybridPmfData::load(&data_file)
            .with_context(|| format!("Failed to load {}", data_file.display()))?;
        data.validate_for(spec)
            .with_context(|| format!("{} does not fit {spec}", data_file.display()))?;
        let ignored = data.unexpected_inputs(spec);
        if !ignored.is_empty() {
            info!(inputs = ?ignored, "data inputs not declared by this configuration are ignored");
        }

        let model_file = self.layout.model_file();
        if write_model(spec, &model_file)? {
            info!(file = %model_file.display(), "wrote Stan model");
        }
        let executable = compile_stan_model(&model_file, &self.cmdstan, &self.env)?;

        let pathfinder_files = self.pathfinder_stage(&executable, &data_file)?;

        let step2 = self.layout.step2_dir();
        let init_file = initialise_from_pathfinder(
            spec,
            &self.layout.step1_dir(),
            &step2,
            self.sampling.num_chains,
            self.init_seed,
        )?;

        let started_at = Utc::now();
        let chain_files = run_sampling(
            &executable,
            &data_file,
            Some(&init_file),
            &step2,
            &self.sampling,
            &self.env,
        )?;
        StageManifest {
            stage: "sampling".to_string(),
            spec,
            started_at,
            finished_at: Utc::now(),
            config: serde_json::to_value(&self.sampling)?,
            outputs: chain_files.clone(),
        }
        .write(&step2)?;

        Ok(WorkflowOutcome {
            executable,
            pathfinder_files,
            init_file,
            chain_files,
        })
    }

    fn pathfinder_stage(&self, executable: &Path, data_file: &Path) -> Result<Vec<PathBuf>> {
        let step1 = self.layout.step1_dir();

        if self.reuse_pathfinder && step1.exists() {
            let existing = csv_files_in(&step1)?;
            if !existing.is_empty() {
                info!(files = existing.len(), "reusing Pathfinder output");
                return Ok(existing);
            }
            warn!(dir = %step1.display(), "no Pathfinder output to reuse, running Pathfinder");
        }

        let started_at = Utc::now();
        let output = run_pathfinder(executable, data_file, &step1, &self.pathfinder, &self.env)?;
        StageManifest {
            stage: "pathfinder".to_string(),
            spec: self.layout.spec,
            started_at,
            finished_at: Utc::now(),
            config: serde_json::to_value(&self.pathfinder)?,
            outputs: vec![output.clone()],
        }
        .write(&step1)?;

        Ok(vec![output])
    }
}
