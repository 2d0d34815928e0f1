use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use psub::models::host_kpis;
use psub::{
    assemble, create_timestamped_output_dir, write_manifest_json, write_records_csv,
    write_records_jsonl, write_summary_json, ExecutionMode, Executor, ExecutorConfig,
    ExperimentConfig, Manifest, Simulation,
};

#[derive(Debug, Parser)]
#[command(name = "psub-sweep")]
#[command(about = "Parameter sweep of the host KPI model")]
struct Cli {
    /// TOML or JSON experiment file
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "output-psub")]
    outdir: PathBuf,

    #[arg(long)]
    timesteps: Option<usize>,

    #[arg(long)]
    runs: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    workers: Option<usize>,

    #[arg(long, default_value_t = false)]
    sequential: bool,
}

fn resolve_default_config_path() -> PathBuf {
    let local = PathBuf::from("configs").join("host_kpis.toml");
    if local.exists() {
        return local;
    }

    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("configs")
        .join("host_kpis.toml")
}

fn load_config(path: Option<&Path>) -> Result<ExperimentConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => {
            let fallback = resolve_default_config_path();
            if !fallback.exists() {
                tracing::info!("no config file found, using built-in host_kpis sweep");
                return Ok(ExperimentConfig {
                    execution: ExecutorConfig::default(),
                    simulations: vec![host_kpis::default_config()],
                });
            }
            fallback
        }
    };

    tracing::info!(path = %path.display(), "loading config");
    ExperimentConfig::from_path(&path)
        .with_context(|| format!("failed to load config: {}", path.display()))
}

fn apply_cli_overrides(config: &mut ExperimentConfig, cli: &Cli) {
    for sim in &mut config.simulations {
        if let Some(timesteps) = cli.timesteps {
            sim.timesteps = timesteps;
        }
        if let Some(runs) = cli.runs {
            sim.runs = runs;
        }
        if let Some(seed) = cli.seed {
            sim.seed = seed;
        }
    }
    if let Some(workers) = cli.workers {
        config.execution.workers = Some(workers);
    }
    if cli.sequential {
        config.execution.mode = ExecutionMode::Sequential;
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;
    apply_cli_overrides(&mut config, &cli);
    config.validate().context("invalid experiment configuration")?;

    let simulations = config
        .simulations
        .iter()
        .map(|sim| Ok(Simulation::new(host_kpis::model()?, sim.clone())))
        .collect::<Result<Vec<_>>>()?;
    let simulation_count = simulations.len();

    let executor = Executor::new(config.execution.clone(), simulations)
        .context("failed to prepare sweep")?;
    let log = executor.execute().context("sweep execution failed")?;
    let summary = log.summary();
    let trace = assemble(&log);

    let outdir = create_timestamped_output_dir(&cli.outdir).with_context(|| {
        format!("failed to create output directory under {}", cli.outdir.display())
    })?;

    let records_jsonl = outdir.join("records.jsonl");
    write_records_jsonl(&records_jsonl, &trace)
        .with_context(|| format!("failed to write {}", records_jsonl.display()))?;
    let records_csv = outdir.join("records.csv");
    write_records_csv(&records_csv, &trace)
        .with_context(|| format!("failed to write {}", records_csv.display()))?;
    let summary_json = outdir.join("summary.json");
    write_summary_json(&summary_json, &summary)
        .with_context(|| format!("failed to write {}", summary_json.display()))?;

    let mut manifest = Manifest::new(host_kpis::MODEL_NAME, simulation_count, &trace);
    manifest.files = vec![
        "records.jsonl".to_string(),
        "records.csv".to_string(),
        "summary.json".to_string(),
    ];
    write_manifest_json(&outdir, &manifest).context("failed to write manifest")?;

    println!(
        "jobs: {} completed, {} failed, {} cancelled",
        summary.completed, summary.failed, summary.cancelled
    );
    println!("Output directory: {}", outdir.display());
    Ok(())
}
