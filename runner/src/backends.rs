pub mod local;
pub mod script;
pub mod slurm;

use crate::{
    command::Command,
    config::{BackendConfig, ConfigErrors},
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, io, path::PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to build the local job pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("I/O error while preparing or collecting jobs: {0}")]
    Io(#[from] io::Error),
    #[error("Batch submission with {program} failed ({status}): {output}")]
    Submit {
        program: String,
        status: String,
        output: String,
    },
}

/// Commands of one batch, already annotated with their resource flags
#[derive(Clone, Debug)]
pub struct RunBatch {
    pub name: String,
    pub commands: Vec<Command>,
    pub resources_per_job: usize,
    /// batch log, also used as working area for cluster scripts
    pub log_path: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Exited(i32),
    Signalled(i32),
    /// the command could not be started at all
    SpawnFailed(String),
    /// the backend lost track of the command, e.g. the cluster job hit its time limit
    Lost,
}

impl JobStatus {
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit status {code}"),
            Self::Signalled(signal) => write!(f, "killed by signal {signal}"),
            Self::SpawnFailed(reason) => write!(f, "failed to start: {reason}"),
            Self::Lost => write!(f, "no exit status reported"),
        }
    }
}

/// What a backend knows about one finished command
#[derive(Clone, Debug)]
pub struct CommandReport {
    pub command: Command,
    pub status: JobStatus,
    /// merged stdout and stderr
    pub output: String,
    /// where an operator finds this job: `host:log` locally, job and step id on a cluster
    pub location: String,
}

/// A way of running a batch of commands to completion.
///
/// Implementations must run every command of the batch even if some of them
/// fail, and report one `CommandReport` per command in batch order.
pub trait Backend: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    /// probe whether this backend can be used on the current host
    fn available(&self) -> bool;

    /// outputs written by a remote backend may show up on the submitting host late
    fn remote(&self) -> bool {
        false
    }

    fn run(&self, batch: &RunBatch) -> Result<Vec<CommandReport>, BackendError>;
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Slurm,
    Local,
}

impl BackendKind {
    /// default preference: cluster first, local as the fallback
    pub fn preference() -> Vec<Self> {
        vec![Self::Slurm, Self::Local]
    }

    pub fn build(self, config: &BackendConfig) -> Box<dyn Backend> {
        match self {
            Self::Slurm => Box::new(slurm::SlurmBackend::load(config)),
            Self::Local => Box::new(local::LocalBackend::load(config)),
        }
    }
}

/// pick the first available backend in order of preference
pub fn select_backend(config: &BackendConfig) -> Result<Box<dyn Backend>, ConfigErrors> {
    if config.force_local {
        info!("Local backend forced");
        return Ok(BackendKind::Local.build(config));
    }

    for kind in config.preference.iter() {
        let backend = kind.build(config);

        if backend.available() {
            info!(backend = backend.name(), "Selected backend");
            return Ok(backend);
        }

        debug!(backend = backend.name(), "Backend not available");
    }

    Err(ConfigErrors::NoBackendAvailable(
        config
            .preference
            .iter()
            .map(|kind| format!("{kind:?}").to_lowercase())
            .join(", "),
    ))
}
