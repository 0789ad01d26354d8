// Hybrid PMF model generator and inference driver
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use hybrid_pmf::codegen::stan::check;
use hybrid_pmf::diagnostics::{print_summary, summarize};
use hybrid_pmf::draws::{csv_files_in, StanCsv};
use hybrid_pmf::model_spec::ModelSpec;
use hybrid_pmf::stanrun::{detect_cmdstan, PathfinderConfig, StanConfig, ToolchainEnv};
use hybrid_pmf::workflow::{initialise_from_pathfinder, write_model, RunLayout, TwoStageWorkflow};
use std::fs;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hpmf")]
#[command(version)]
#[command(about = "Hybrid PMF Stan model generator and Pathfinder/NUTS driver", long_about = None)]
struct Cli {
    /// Verbose output (debug logging)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only report errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// The three flags selecting a model variant
#[derive(Args, Debug, Clone, Copy)]
struct SpecArgs {
    /// Cluster-structured priors on the feature matrices
    #[arg(long)]
    include_clusters: bool,

    /// Observation variances `v` are supplied as data
    #[arg(long)]
    variance_known: bool,

    /// Reconstruction variance `v_MC` is supplied as data
    #[arg(long = "variance-mc-known")]
    variance_mc_known: bool,
}

impl SpecArgs {
    fn spec(self) -> ModelSpec {
        ModelSpec::new(self.include_clusters, self.variance_known, self.variance_mc_known)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Generate Stan code for one configuration, or all eight with --all
    Generate {
        #[command(flatten)]
        spec: SpecArgs,

        /// Output file (defaults to stdout)
        #[arg(short, long, value_name = "OUTPUT", conflicts_with = "all")]
        output: Option<PathBuf>,

        /// Write every configuration to DIR as <model name>.stan
        #[arg(long, value_name = "DIR")]
        all: Option<PathBuf>,
    },

    /// Check declaration scoping of the generated programs
    Check {
        #[command(flatten)]
        spec: SpecArgs,

        /// Check all eight configurations
        #[arg(long)]
        all: bool,
    },

    /// Write per-chain initial values from Pathfinder output
    Inits {
        #[command(flatten)]
        spec: SpecArgs,

        /// Directory holding the Pathfinder CSV files
        #[arg(long = "step1", value_name = "DIR")]
        pathfinder_dir: PathBuf,

        /// Directory for inits_<k>.json
        #[arg(short, long, value_name = "DIR")]
        output: PathBuf,

        #[arg(long, default_value = "8")]
        chains: usize,

        #[arg(long, default_value = "0")]
        seed: u64,
    },

    /// Run Pathfinder then NUTS for one subset and configuration
    Run {
        #[command(flatten)]
        spec: SpecArgs,

        /// Root of the subset result tree
        #[arg(long, value_name = "DIR")]
        root: PathBuf,

        /// Functional groups forming the subset (repeat or comma-separate)
        #[arg(long = "group", value_delimiter = ',', required = true)]
        groups: Vec<String>,

        /// CmdStan installation (detected when unset)
        #[arg(long, env = "CMDSTAN")]
        cmdstan: Option<PathBuf>,

        /// Temporary directory for compilation and sampling
        #[arg(long, env = "HPMF_TMPDIR")]
        tmpdir: Option<PathBuf>,

        #[arg(long, default_value = "8")]
        chains: usize,

        #[arg(long, default_value = "3")]
        threads_per_chain: usize,

        #[arg(long, default_value = "5000")]
        warmup: usize,

        #[arg(long, default_value = "1000")]
        samples: usize,

        #[arg(long, default_value = "0.8")]
        adapt_delta: f64,

        #[arg(long, default_value = "12")]
        max_treedepth: usize,

        /// Pathfinder single-path runs
        #[arg(long, default_value = "4")]
        paths: usize,

        /// Random seed passed to CmdStan and used to pick initial values
        #[arg(long)]
        seed: Option<u32>,

        /// Rerun Pathfinder even when Step1 output exists
        #[arg(long)]
        rerun_pathfinder: bool,
    },

    /// Summarise the chains of a sampling run
    Summarize {
        /// Directory holding the chain CSV files
        #[arg(value_name = "DIR")]
        dir: PathBuf,

        /// Variables to summarise (all model variables by default)
        #[arg(long, value_delimiter = ',')]
        params: Vec<String>,

        /// Write the summary as JSON
        #[arg(long, value_name = "FILE")]
        json: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.quiet {
        Level::ERROR
    } else if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase())),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Generate { spec, output, all } => generate_command(spec.spec(), output, all),
        Commands::Check { spec, all } => check_command(spec.spec(), all),
        Commands::Inits {
            spec,
            pathfinder_dir,
            output,
            chains,
            seed,
        } => {
            let base = initialise_from_pathfinder(spec.spec(), &pathfinder_dir, &output, chains, seed)?;
            println!("✓ Initial values for {} chains: {}", chains, base.display());
            Ok(())
        }
        Commands::Run {
            spec,
            root,
            groups,
            cmdstan,
            tmpdir,
            chains,
            threads_per_chain,
            warmup,
            samples,
            adapt_delta,
            max_treedepth,
            paths,
            seed,
            rerun_pathfinder,
        } => {
            let cmdstan = match cmdstan {
                Some(path) => path,
                None => detect_cmdstan().context(
                    "Failed to detect cmdstan. Please install cmdstan or set CMDSTAN environment variable",
                )?,
            };
            info!(cmdstan = %cmdstan.display(), "using cmdstan");

            let mut workflow = TwoStageWorkflow::new(RunLayout::new(root, groups, spec.spec()), cmdstan);
            workflow.env = ToolchainEnv {
                tmpdir,
                num_threads: None,
            };
            workflow.pathfinder = PathfinderConfig {
                num_paths: paths,
                seed,
                ..PathfinderConfig::default()
            };
            workflow.sampling = StanConfig {
                num_chains: chains,
                threads_per_chain,
                num_warmup: warmup,
                num_samples: samples,
                seed,
                adapt_delta,
                max_treedepth,
                ..StanConfig::default()
            };
            workflow.init_seed = seed.map(u64::from).unwrap_or(0);
            workflow.reuse_pathfinder = !rerun_pathfinder;

            let outcome = workflow.run()?;
            println!("\n✓ Results saved to: {}", workflow.layout.step2_dir().display());
            for file in &outcome.chain_files {
                println!("  {}", file.display());
            }
            Ok(())
        }
        Commands::Summarize { dir, params, json } => summarize_command(dir, params, json),
    }
}

fn generate_command(spec: ModelSpec, output: Option<PathBuf>, all: Option<PathBuf>) -> Result<()> {
    if let Some(dir) = all {
        for spec in ModelSpec::all() {
            let path = dir.join(format!("{}.stan", spec.model_name()));
            write_model(spec, &path)?;
            info!(%spec, file = %path.display(), "generated");
        }
        println!("✓ Generated 8 models in {}", dir.display());
        return Ok(());
    }

    match output {
        Some(path) => {
            write_model(spec, &path)?;
            println!("✓ Generated {}: {}", spec, path.display());
        }
        None => print!("{}", spec.generate()),
    }
    Ok(())
}

fn check_command(spec: ModelSpec, all: bool) -> Result<()> {
    let specs: Vec<ModelSpec> = if all { ModelSpec::all().collect() } else { vec![spec] };

    let mut failed = 0;
    for spec in specs {
        match check(spec) {
            Ok(()) => println!("✓ {spec}"),
            Err(err) => {
                failed += 1;
                println!("✗ {err}");
                for violation in &err.violations {
                    println!("    {violation}");
                }
            }
        }
    }

    if failed > 0 {
        bail!("{failed} configuration(s) failed the scoping check");
    }
    Ok(())
}

fn summarize_command(dir: PathBuf, params: Vec<String>, json: Option<PathBuf>) -> Result<()> {
    let files = csv_files_in(&dir)?;
    if files.is_empty() {
        bail!("no chain files in {}", dir.display());
    }
    let chains = files
        .iter()
        .map(|f| StanCsv::from_file(f))
        .collect::<Result<Vec<_>, _>>()?;

    let names: Vec<&str> = params.iter().map(String::as_str).collect();
    let summary = summarize(&chains, &names)?;
    print_summary(&summary);

    if let Some(path) = json {
        fs::write(&path, serde_json::to_string_pretty(&summary)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("\n✓ Summary written to: {}", path.display());
    }
    Ok(())
}
