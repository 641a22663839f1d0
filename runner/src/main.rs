use clap::Parser;
use mapchain_runner::{
    backends::select_backend,
    chain::{Chain, ChainContext},
    chart::ace::AceStore,
    config::{ChainConfig, ConfigErrors},
    orchestrator::{run_chains, OrchestratorError, ReportToStderr},
    runner::Runner,
};
use std::{path::PathBuf, process::ExitCode};
use thiserror::Error;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

/// Build chains of antigenic maps from titer tables
#[derive(Parser, Debug)]
#[command(name = "mapchain", version, about, long_about = None)]
struct Cli {
    /// Chain configuration
    #[arg(default_value = "chain.yaml")]
    config: PathBuf,

    /// Run all commands on this machine, even if a cluster is available
    #[arg(long)]
    local: bool,

    /// Enable verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Error, Debug)]
enum MainError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error("Failed to prepare log directory {0:?}: {1}")]
    LogDir(PathBuf, #[source] std::io::Error),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

impl MainError {
    fn exit_code(&self) -> ExitCode {
        match self {
            Self::Orchestrator(OrchestratorError::PartialFailure { .. }) => ExitCode::from(2),
            _ => ExitCode::from(1),
        }
    }
}

fn run(cli: &Cli) -> Result<(), MainError> {
    let mut config = ChainConfig::load(&cli.config)?;
    config.backend.force_local |= cli.local;

    if config.preflight_checks() {
        return Err(ConfigErrors::Preflight.into());
    }

    let chains = config
        .chains
        .iter()
        .map(|spec| Chain::load(spec, &config))
        .collect::<Result<Vec<_>, _>>()?;

    let backend = select_backend(&config.backend)?;
    let runner = Runner::with_config(backend, &config.log_dir, &config.backend)
        .map_err(|e| MainError::LogDir(config.log_dir.clone(), e))?;
    let store = AceStore::new(config.programs.merge.clone());
    let context = ChainContext::new(&config, &runner, &store);

    info!(
        chains = chains.len(),
        run = runner.run_number(),
        "Starting run, logs in {}",
        runner.log_dir().display()
    );

    let reports = run_chains(&chains, &context, &ReportToStderr)?;
    for report in reports {
        if let Ok(outcome) = report.result {
            info!(chain = %report.name, products = ?outcome.products(), "Done");
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(cli.verbose >= 2)
        .init();

    debug!("Arguments: {cli:?}");

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            e.exit_code()
        }
    }
}
