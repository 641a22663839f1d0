//! Test doubles for the backend and chart store seams.

use crate::{
    backends::{Backend, BackendError, CommandReport, JobStatus, RunBatch},
    chart::{
        ChartError, ChartStore, ChartSummary, MergeOptions, MinimumColumnBasis, SerumColumnBasis,
    },
    command::Command,
};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use std::{
    collections::HashMap,
    fmt, fs,
    path::{Path, PathBuf},
    sync::Arc,
};

type FailurePredicate = Arc<dyn Fn(&Command) -> bool + Send + Sync>;

/// Backend writing a placeholder for every command output instead of running it
#[derive(Clone, Default)]
pub struct StubBackend {
    remote: bool,
    fail: Option<FailurePredicate>,
    submitted: Arc<Mutex<Vec<Command>>>,
}

impl fmt::Debug for StubBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StubBackend")
            .field("remote", &self.remote)
            .field("submitted", &self.submitted.lock().len())
            .finish()
    }
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// commands matching `predicate` exit with status 1 and produce nothing
    pub fn failing(predicate: impl Fn(&Command) -> bool + Send + Sync + 'static) -> Self {
        Self {
            fail: Some(Arc::new(predicate)),
            ..Self::default()
        }
    }

    pub fn remote(mut self) -> Self {
        self.remote = true;
        self
    }

    /// every command seen so far, shared between clones
    pub fn submitted(&self) -> Vec<Command> {
        self.submitted.lock().clone()
    }
}

impl Backend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn available(&self) -> bool {
        true
    }

    fn remote(&self) -> bool {
        self.remote
    }

    fn run(&self, batch: &RunBatch) -> Result<Vec<CommandReport>, BackendError> {
        self.submitted.lock().extend(batch.commands.iter().cloned());

        batch
            .commands
            .iter()
            .map(|command| -> Result<CommandReport, BackendError> {
                let failed = self.fail.as_ref().map_or(false, |fail| fail(command));

                let status = if failed {
                    JobStatus::Exited(1)
                } else {
                    if let Some(output) = command.output_path() {
                        if let Some(parent) = output.parent() {
                            fs::create_dir_all(parent)?;
                        }
                        fs::write(output, command.command_line())?;
                    }
                    JobStatus::Exited(0)
                };

                Ok(CommandReport {
                    command: command.clone(),
                    output: format!("stub {}", command.name()),
                    location: format!("stub:{}", command.name()),
                    status,
                })
            })
            .collect()
    }
}

static GENERATED_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{3}\.(.+)\.(merge|incremental|scratch|mcb-table|mcb)\.[^.]+$").unwrap()
});

/// Chart store answering from registered summaries.
///
/// Files named like chain artifacts (`NNN.<date>.<kind>.<ext>`) get defaults:
/// two layers, incremental results stress 1.0 and scratch results stress 2.0.
#[derive(Debug, Default)]
pub struct StubStore {
    summaries: Mutex<HashMap<PathBuf, ChartSummary>>,
    column_bases: Mutex<HashMap<PathBuf, Vec<SerumColumnBasis>>>,
    merges: Mutex<Vec<PathBuf>>,
    exports: Mutex<Vec<(PathBuf, Vec<f64>)>>,
}

/// symlinks resolve to the registered chart
fn key(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

pub fn summary(date: &str, layers: usize, projections: usize) -> ChartSummary {
    ChartSummary {
        date: date.to_string(),
        layers,
        projections,
        antigens: 5,
        sera: 3,
        stress: (projections > 0).then_some(10.0),
    }
}

pub fn bases(values: &[(&str, f64)]) -> Vec<SerumColumnBasis> {
    values
        .iter()
        .map(|(serum, column_basis)| SerumColumnBasis {
            serum: serum.to_string(),
            column_basis: *column_basis,
        })
        .collect()
}

impl StubStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// create `path` and register its summary
    pub fn table(&self, path: &Path, summary: ChartSummary) -> PathBuf {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, summary.date.as_bytes()).unwrap();
        self.register(path, summary);
        path.to_path_buf()
    }

    pub fn register(&self, path: &Path, summary: ChartSummary) {
        self.summaries.lock().insert(key(path), summary);
    }

    pub fn register_column_bases(&self, path: &Path, column_bases: Vec<SerumColumnBasis>) {
        self.column_bases.lock().insert(key(path), column_bases);
    }

    pub fn merges(&self) -> Vec<PathBuf> {
        self.merges.lock().clone()
    }

    pub fn exports(&self) -> Vec<(PathBuf, Vec<f64>)> {
        self.exports.lock().clone()
    }
}

impl ChartStore for StubStore {
    fn summary(&self, path: &Path) -> Result<ChartSummary, ChartError> {
        if !path.exists() {
            return Err(ChartError::Io {
                path: path.to_string_lossy().into_owned(),
                source: std::io::ErrorKind::NotFound.into(),
            });
        }

        if let Some(summary) = self.summaries.lock().get(&key(path)) {
            return Ok(summary.clone());
        }

        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let captures = GENERATED_NAME
            .captures(&name)
            .ok_or_else(|| ChartError::Invalid {
                path: name.clone(),
                reason: String::from("not registered with the stub store"),
            })?;

        let (projections, stress) = match &captures[2] {
            "incremental" => (1, Some(1.0)),
            "scratch" => (1, Some(2.0)),
            "mcb" => (1, Some(10.0)),
            _ => (0, None),
        };

        Ok(ChartSummary {
            date: captures[1].to_string(),
            layers: 2,
            projections,
            antigens: 5,
            sera: 3,
            stress,
        })
    }

    fn merge_incremental(
        &self,
        previous: &Path,
        addition: &Path,
        output: &Path,
        _options: &MergeOptions,
    ) -> Result<(), ChartError> {
        fs::write(
            output,
            format!("{} + {}", previous.display(), addition.display()),
        )
        .map_err(|source| ChartError::Io {
            path: output.to_string_lossy().into_owned(),
            source,
        })?;
        self.merges.lock().push(output.to_path_buf());

        Ok(())
    }

    fn column_bases(
        &self,
        path: &Path,
        _minimum: &MinimumColumnBasis,
    ) -> Result<Vec<SerumColumnBasis>, ChartError> {
        Ok(self
            .column_bases
            .lock()
            .get(&key(path))
            .cloned()
            .unwrap_or_default())
    }

    fn export_with_column_bases(
        &self,
        source: &Path,
        column_bases: &[f64],
        output: &Path,
    ) -> Result<(), ChartError> {
        fs::copy(source, output).map_err(|source| ChartError::Io {
            path: output.to_string_lossy().into_owned(),
            source,
        })?;
        self.exports
            .lock()
            .push((output.to_path_buf(), column_bases.to_vec()));

        Ok(())
    }
}
