pub mod incremental;
pub mod individual;

use crate::{
    chart::{ChartError, ChartStore, MinimumColumnBasis},
    collector,
    config::{ChainConfig, ChainSetup, ChainSpec, ConfigErrors, Programs},
    maps::MapError,
    runner::{RunError, Runner},
};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;

pub use incremental::IncrementalChain;
pub use individual::IndividualChain;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Wrong first chart in incremental chain: {0}")]
    WrongFirstChart(String),
    #[error("{0:?} is not a symlink (needs to be a symlink to {1:?})")]
    NotASymlink(PathBuf, PathBuf),
    #[error("Incremental chain with just {0:?} (and no competing map) is not implemented")]
    NotImplemented(PathBuf),
    #[error("Neither {0:?} nor {1:?} was made")]
    NoCandidates(PathBuf, PathBuf),
    #[error("Chart {0:?} has no projection stress")]
    NoStress(PathBuf),
    #[error("Map of the first table {0:?} was not made")]
    SeedMissing(PathBuf),
    #[error("Chain {0} has no tables")]
    NoTables(String),
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Chart(#[from] ChartError),
    #[error(transparent)]
    Run(#[from] RunError),
    #[error("Failed to access {path:?}: {error}")]
    Io {
        path: PathBuf,
        #[source]
        error: io::Error,
    },
}

pub(crate) fn io_error(path: &Path) -> impl FnOnce(io::Error) -> ChainError + '_ {
    move |error| ChainError::Io {
        path: path.to_path_buf(),
        error,
    }
}

/// How a chain ended if it did not fail outright
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainOutcome {
    Completed {
        products: Vec<PathBuf>,
    },
    /// some commands failed, their failures were swallowed to let the chain go on
    PartiallyFailed {
        products: Vec<PathBuf>,
        failures: Vec<String>,
    },
}

impl ChainOutcome {
    pub fn new(products: Vec<PathBuf>, failures: Vec<String>) -> Self {
        if failures.is_empty() {
            Self::Completed { products }
        } else {
            Self::PartiallyFailed { products, failures }
        }
    }

    pub fn products(&self) -> &[PathBuf] {
        match self {
            Self::Completed { products } | Self::PartiallyFailed { products, .. } => products,
        }
    }

    pub fn failures(&self) -> &[String] {
        match self {
            Self::Completed { .. } => &[],
            Self::PartiallyFailed { failures, .. } => failures,
        }
    }
}

/// Everything a chain needs from the outside, shared by all chains of a run
#[derive(Clone, Copy)]
pub struct ChainContext<'a> {
    pub runner: &'a Runner,
    pub store: &'a dyn ChartStore,
    pub setup: &'a ChainSetup,
    pub programs: &'a Programs,
    pub output_root: &'a Path,
}

impl<'a> ChainContext<'a> {
    pub fn new(config: &'a ChainConfig, runner: &'a Runner, store: &'a dyn ChartStore) -> Self {
        Self {
            runner,
            store,
            setup: &config.setup,
            programs: &config.programs,
            output_root: &config.output_root,
        }
    }
}

/// `NNN.` prefix keeping the artifacts of a chain in step order
pub fn output_prefix(step: usize) -> String {
    format!("{step:03}.")
}

#[derive(Clone, Debug)]
pub enum Chain {
    Incremental(IncrementalChain),
    Individual(IndividualChain),
}

impl Chain {
    /// build a chain from its configuration, collecting its tables
    pub fn load(spec: &ChainSpec, config: &ChainConfig) -> Result<Self, ConfigErrors> {
        let tables = collector::collect_tables(spec.tables())?;
        let minimum = config.minimum_column_basis(spec).clone();

        Ok(match spec {
            ChainSpec::Incremental { name, .. } => {
                Self::Incremental(IncrementalChain::new(name, minimum, tables))
            }
            ChainSpec::Individual { name, .. } => {
                Self::Individual(IndividualChain::new(name, minimum, tables))
            }
        })
    }

    /// `<name>-<minimum column basis>`, also the output directory and log name
    pub fn name(&self) -> &str {
        match self {
            Self::Incremental(chain) => chain.name(),
            Self::Individual(chain) => chain.name(),
        }
    }

    pub fn run(&self, context: &ChainContext) -> Result<ChainOutcome, ChainError> {
        match self {
            Self::Incremental(chain) => chain.run(context),
            Self::Individual(chain) => chain.run(context),
        }
    }
}

pub(crate) fn chain_name(name: &str, minimum: &MinimumColumnBasis) -> String {
    format!("{name}-{minimum}")
}

/// `<output_root>/<chain name>`, created if absent
pub(crate) fn output_directory(output_root: &Path, name: &str) -> Result<PathBuf, ChainError> {
    let directory = output_root.join(name);
    fs::create_dir_all(&directory).map_err(io_error(&directory))?;

    Ok(directory)
}
