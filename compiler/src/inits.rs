//! Initial values for sampling from Pathfinder draws
//!
//! Each chain of the sampling stage starts from a distinct Pathfinder draw,
//! chosen uniformly at random. Only the model's parameters are written, so
//! the files stay small even though Pathfinder output also carries the
//! generated quantities.

use crate::draws::StanCsv;
use anyhow::{bail, Context, Result};
use rand::seq::index;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Initial values of one chain.
pub type ChainInit = Map<String, Value>;

/// Draw `chains` initial values for the parameters `names` from the draws
/// of `csvs`, pooled. Draws are picked without replacement unless there are
/// fewer draws than chains.
pub fn create_inits(csvs: &[StanCsv], names: &[&str], chains: usize, seed: u64) -> Result<Vec<ChainInit>> {
    let pool: Vec<(usize, usize)> = csvs
        .iter()
        .enumerate()
        .flat_map(|(file, csv)| (0..csv.len()).map(move |row| (file, row)))
        .collect();

    if pool.is_empty() {
        bail!("no Pathfinder draws to initialise from");
    }

    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let picks: Vec<usize> = if pool.len() >= chains {
        index::sample(&mut rng, pool.len(), chains).into_vec()
    } else {
        (0..chains).map(|_| rng.gen_range(0..pool.len())).collect()
    };

    picks
        .into_iter()
        .enumerate()
        .map(|(chain, pick)| {
            let (file, row) = pool[pick];
            debug!(chain = chain + 1, file, row, "selected Pathfinder draw");
            csvs[file]
                .draw_json(row, names)
                .with_context(|| format!("building inits for chain {}", chain + 1))
        })
        .collect()
}

/// Path of the init file of `chain` (1-based) for an `init=<dir>/inits.json`
/// argument, following CmdStan's per-chain suffix convention.
pub fn init_file(dir: &Path, chain: usize) -> PathBuf {
    dir.join(format!("inits_{chain}.json"))
}

/// Write one JSON file per chain; returns the base path to pass to CmdStan.
pub fn write_inits(dir: &Path, inits: &[ChainInit]) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create init directory {}", dir.display()))?;

    for (i, init) in inits.iter().enumerate() {
        let path = init_file(dir, i + 1);
        let json = serde_json::to_string(init)?;
        fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    }

    info!(chains = inits.len(), dir = %dir.display(), "wrote initial values");
    Ok(dir.join("inits.json"))
}
