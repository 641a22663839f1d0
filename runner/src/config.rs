use crate::{
    backends::BackendKind,
    chart::{MinimumColumnBasis, MinimumColumnBasisError},
};
use globset::GlobBuilder;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    env,
    fs::{self, File},
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{error, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read configuration {0}: {1}")]
    Read(PathBuf, #[source] Error),
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Globs were invalid: {0}")]
    InvalidGlobs(#[from] globset::Error),
    #[error("No backend available (tried: {0})")]
    NoBackendAvailable(String),
    #[error("Invalid minimum column basis: {0}")]
    MinimumColumnBasis(#[from] MinimumColumnBasisError),
    #[error("Configuration contains errors, see log")]
    Preflight,
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),
    #[error("Metadata not found: {0}")]
    MetadataNotFound(Error),
    #[error("Failed to collect tables: {0}")]
    Collect(#[from] ignore::Error),
}

/// Everything needed to run a set of chains, as loaded from `chain.yaml`
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ChainConfig {
    // root of all chain output directories, relative to the config file
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,
    // log directory, relative to output_root
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub programs: Programs,
    #[serde(default)]
    pub setup: ChainSetup,
    pub chains: Vec<ChainSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    // order in which backends are probed, see backends::select_backend
    #[serde(default = "BackendKind::preference")]
    pub preference: Vec<BackendKind>,
    #[serde(default)]
    pub force_local: bool,
    #[serde(default = "default_threads_per_job")]
    pub threads_per_job: usize,
    // number of cores the local backend distributes jobs over, detected if absent
    #[serde(default)]
    pub local_cores: Option<usize>,
    // seconds to wait for outputs of remote jobs to become visible
    #[serde(default = "default_wait_for_output_timeout")]
    pub wait_for_output_timeout: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default)]
    pub slurm: SlurmConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SlurmConfig {
    #[serde(default = "default_srun")]
    pub srun: String,
    #[serde(default = "default_sbatch")]
    pub sbatch: String,
    #[serde(default = "default_job_name")]
    pub job_name: String,
    #[serde(default)]
    pub partition: Option<String>,
}

/// External programs doing the numerical work
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Programs {
    #[serde(default = "default_relax_grid")]
    pub relax_grid: String,
    #[serde(default = "default_relax_incremental")]
    pub relax_incremental: String,
    #[serde(default = "default_merge")]
    pub merge: String,
}

/// Parameters shared by all map makers of all chains
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ChainSetup {
    #[serde(default = "default_number_of_optimizations")]
    pub number_of_optimizations: usize,
    #[serde(default = "default_number_of_dimensions")]
    pub number_of_dimensions: usize,
    #[serde(default)]
    pub minimum_column_basis: MinimumColumnBasis,
    #[serde(default = "default_projections_to_keep")]
    pub projections_to_keep: usize,
    #[serde(default)]
    pub reorient_to: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub disconnect_having_few_titers: bool,
    #[serde(default = "default_true")]
    pub ignore_tables_with_too_few_sera: bool,
    #[serde(default)]
    pub combine_cheating_assays: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum ChainSpec {
    Incremental {
        name: String,
        #[serde(default)]
        minimum_column_basis: Option<MinimumColumnBasis>,
        tables: TableSource,
    },
    Individual {
        name: String,
        #[serde(default)]
        minimum_column_basis: Option<MinimumColumnBasis>,
        tables: TableSource,
    },
}

/// Tables of a chain, either listed or collected from directories
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(untagged)]
pub enum TableSource {
    List(Vec<PathBuf>),
    Collect {
        paths: Vec<PathBuf>,
        glob: String,
    },
}

impl ChainSpec {
    pub fn name(&self) -> &str {
        match self {
            Self::Incremental { name, .. } | Self::Individual { name, .. } => name,
        }
    }

    pub fn tables(&self) -> &TableSource {
        match self {
            Self::Incremental { tables, .. } | Self::Individual { tables, .. } => tables,
        }
    }

    pub fn minimum_column_basis(&self) -> Option<&MinimumColumnBasis> {
        match self {
            Self::Incremental {
                minimum_column_basis,
                ..
            }
            | Self::Individual {
                minimum_column_basis,
                ..
            } => minimum_column_basis.as_ref(),
        }
    }
}

impl TableSource {
    fn resolve(&mut self, base: &Path) {
        match self {
            Self::List(tables) => tables.iter_mut().for_each(|table| resolve(table, base)),
            Self::Collect { paths, .. } => paths.iter_mut().for_each(|path| resolve(path, base)),
        }
    }
}

fn resolve(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

impl ChainConfig {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigErrors> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// read the configuration and make all relative paths absolute to its directory
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let text =
            fs::read_to_string(path).map_err(|e| ConfigErrors::Read(path.to_path_buf(), e))?;
        let mut config = Self::from_yaml(&text)?;
        let parent = path.parent().unwrap_or_else(|| Path::new(""));
        // chain directories link to tables relatively, both sides have to be absolute
        let base = if parent.is_absolute() {
            parent.to_path_buf()
        } else {
            let cwd = env::current_dir().map_err(|e| ConfigErrors::Read(path.to_path_buf(), e))?;
            if parent.as_os_str().is_empty() {
                cwd
            } else {
                cwd.join(parent)
            }
        };

        config.resolve_paths(&base);

        Ok(config)
    }

    pub fn resolve_paths(&mut self, base: &Path) {
        resolve(&mut self.output_root, base);

        let output_root = self.output_root.clone();
        resolve(&mut self.log_dir, &output_root);

        if let Some(ref mut reorient_to) = self.setup.reorient_to {
            resolve(reorient_to, base);
        }

        self.chains
            .iter_mut()
            .for_each(|chain| match chain {
                ChainSpec::Incremental { tables, .. } | ChainSpec::Individual { tables, .. } => {
                    tables.resolve(base)
                }
            });
    }

    pub fn preflight_checks(&self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.chains.is_empty() {
            error!("No chain was defined, nothing to do");
            contains_error = true;
        }

        if self.backend.preference.is_empty() && !self.backend.force_local {
            error!("backend.preference is empty, no backend could be selected");
            contains_error = true;
        }

        for (field, value) in [
            ("backend.threads_per_job", self.backend.threads_per_job),
            (
                "setup.number_of_optimizations",
                self.setup.number_of_optimizations,
            ),
            ("setup.number_of_dimensions", self.setup.number_of_dimensions),
        ] {
            if value == 0 {
                error!("{field} cannot be 0");
                contains_error = true;
            }
        }

        // bare program names are looked up in PATH at run time, explicit paths are checked now
        for (field, program) in [
            ("programs.relax_grid", &self.programs.relax_grid),
            ("programs.relax_incremental", &self.programs.relax_incremental),
            ("programs.merge", &self.programs.merge),
        ] {
            let path = Path::new(program);

            if path.components().count() > 1 {
                match check_executable(path) {
                    Ok(true) => {}
                    Ok(false) => {
                        error!("{field} ({program}) is not executable");
                        contains_error = true;
                    }
                    Err(e) => {
                        error!("Failed to determine if {field} ({program}) is an executable: {e}");
                        contains_error = true;
                    }
                }
            }
        }

        if let Some(ref reorient_to) = self.setup.reorient_to {
            if !reorient_to.is_file() {
                error!(
                    "setup.reorient_to ({}) is not a file",
                    reorient_to.to_string_lossy()
                );
                contains_error = true;
            }
        }

        let mut names = BTreeSet::new();

        for chain in self.chains.iter() {
            let name = chain.name();

            if name.is_empty() {
                error!("A chain has an empty name");
                contains_error = true;
            } else if !names.insert(name) {
                error!("Chain {name} is defined more than once");
                contains_error = true;
            }

            match chain.tables() {
                TableSource::List(tables) => {
                    if tables.is_empty() {
                        error!("Chain {name} has no tables");
                        contains_error = true;
                    }

                    for table in tables.iter().filter(|table| !table.is_file()) {
                        error!(
                            "Chain {name} references {} which is not a file",
                            table.to_string_lossy()
                        );
                        contains_error = true;
                    }

                    if matches!(chain, ChainSpec::Incremental { .. }) && tables.len() == 1 {
                        warn!("Incremental chain {name} has a single table, nothing will be merged");
                    }
                }
                TableSource::Collect { paths, glob } => {
                    if paths.is_empty() {
                        error!("Chain {name} contains no 'paths' to collect tables from");
                        contains_error = true;
                    }

                    if let Err(e) = GlobBuilder::new(glob).build() {
                        error!("Failed to compile glob for {name}: {e}");
                        contains_error = true;
                    }
                }
            }
        }

        let duplicate_tables = self
            .chains
            .iter()
            .filter_map(|chain| match chain.tables() {
                TableSource::List(tables) => Some((chain.name(), tables)),
                TableSource::Collect { .. } => None,
            })
            .filter(|(_, tables)| tables.iter().duplicates().next().is_some())
            .map(|(name, _)| name)
            .collect_vec();

        for name in duplicate_tables {
            warn!("Chain {name} lists a table more than once");
        }

        contains_error
    }

    /// minimum column basis of a chain, falling back to the setup default
    pub fn minimum_column_basis<'a>(&'a self, chain: &'a ChainSpec) -> &'a MinimumColumnBasis {
        chain
            .minimum_column_basis()
            .unwrap_or(&self.setup.minimum_column_basis)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            preference: BackendKind::preference(),
            force_local: false,
            threads_per_job: default_threads_per_job(),
            local_cores: None,
            wait_for_output_timeout: default_wait_for_output_timeout(),
            poll_interval_ms: default_poll_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            slurm: SlurmConfig::default(),
        }
    }
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            srun: default_srun(),
            sbatch: default_sbatch(),
            job_name: default_job_name(),
            partition: None,
        }
    }
}

impl Default for Programs {
    fn default() -> Self {
        Self {
            relax_grid: default_relax_grid(),
            relax_incremental: default_relax_incremental(),
            merge: default_merge(),
        }
    }
}

impl Default for ChainSetup {
    fn default() -> Self {
        Self {
            number_of_optimizations: default_number_of_optimizations(),
            number_of_dimensions: default_number_of_dimensions(),
            minimum_column_basis: MinimumColumnBasis::default(),
            projections_to_keep: default_projections_to_keep(),
            reorient_to: None,
            disconnect_having_few_titers: true,
            ignore_tables_with_too_few_sera: true,
            combine_cheating_assays: false,
        }
    }
}

fn default_output_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("log")
}

fn default_threads_per_job() -> usize {
    16
}

fn default_wait_for_output_timeout() -> u64 {
    60
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_probe_timeout_ms() -> u64 {
    10_000
}

fn default_srun() -> String {
    String::from("srun")
}

fn default_sbatch() -> String {
    String::from("sbatch")
}

fn default_job_name() -> String {
    String::from("mapchain")
}

fn default_relax_grid() -> String {
    String::from("chart-relax-grid")
}

fn default_relax_incremental() -> String {
    String::from("chart-relax-incremental")
}

fn default_merge() -> String {
    String::from("chart-merge")
}

fn default_number_of_optimizations() -> usize {
    1000
}

fn default_number_of_dimensions() -> usize {
    2
}

fn default_projections_to_keep() -> usize {
    10
}

fn default_true() -> bool {
    true
}
