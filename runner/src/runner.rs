use crate::{
    backends::{Backend, BackendError, CommandReport, RunBatch},
    command::{describe, Command, ResourceFlags},
    config::BackendConfig,
    log::BatchLog,
};
use parking_lot::Mutex;
use std::{
    fs, io,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, info, instrument};

#[derive(Error, Debug)]
pub enum RunError {
    #[error("{failures} command(s) of batch {} failed, see {log:?}", .outcome.batch)]
    RunFailed {
        failures: usize,
        log: PathBuf,
        outcome: RunOutcome,
    },
    #[error("Backend failed to run batch: {0}")]
    Backend(#[from] BackendError),
}

/// Result of one batch: every command's report and the failures among them
#[derive(Clone, Debug)]
pub struct RunOutcome {
    pub batch: String,
    pub reports: Vec<CommandReport>,
    /// backend specific locations of the failed commands
    pub failures: Vec<String>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Runs batches of commands on the selected backend and keeps track of all
/// failures of the whole invocation.
///
/// One runner is shared by all chains, the failure list is the only state
/// written to concurrently.
#[derive(Debug)]
pub struct Runner {
    backend: Box<dyn Backend>,
    log_dir: PathBuf,
    run_number: usize,
    resources_per_job: usize,
    wait_for_output_timeout: Duration,
    poll_interval: Duration,
    failures: Mutex<Vec<String>>,
}

/// one more than the highest `NNN.` prefix of the files in `log_dir`
fn next_run_number(log_dir: &Path) -> io::Result<usize> {
    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(1),
        Err(error) => return Err(error),
    };

    let mut highest = 0;
    for entry in entries {
        let name = entry?.file_name();
        let number = name
            .to_str()
            .and_then(|name| name.split_once('.'))
            .and_then(|(prefix, _)| prefix.parse::<usize>().ok());

        if let Some(number) = number {
            highest = highest.max(number);
        }
    }

    Ok(highest + 1)
}

impl Runner {
    /// create the log directory and pick the run number for this invocation
    pub fn new(backend: Box<dyn Backend>, log_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let log_dir = log_dir.into();
        fs::create_dir_all(&log_dir)?;
        let run_number = next_run_number(&log_dir)?;

        debug!(log_dir = ?log_dir, run_number, backend = backend.name(), "Runner created");

        Ok(Self {
            backend,
            log_dir,
            run_number,
            resources_per_job: 1,
            wait_for_output_timeout: Duration::ZERO,
            poll_interval: Duration::from_secs(1),
            failures: Mutex::new(Vec::new()),
        })
    }

    pub fn with_config(
        backend: Box<dyn Backend>,
        log_dir: impl Into<PathBuf>,
        config: &BackendConfig,
    ) -> io::Result<Self> {
        Ok(Self::new(backend, log_dir)?
            .resources_per_job(config.threads_per_job)
            .wait_for_output(
                Duration::from_secs(config.wait_for_output_timeout),
                Duration::from_millis(config.poll_interval_ms),
            ))
    }

    pub fn resources_per_job(mut self, resources: usize) -> Self {
        self.resources_per_job = resources.max(1);
        self
    }

    pub fn wait_for_output(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.wait_for_output_timeout = timeout;
        self.poll_interval = poll_interval;
        self
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn run_number(&self) -> usize {
        self.run_number
    }

    /// `<log_dir>/<run>.<name>.log`
    pub fn log_path(&self, name: &str) -> PathBuf {
        self.log_dir
            .join(format!("{:03}.{name}.log", self.run_number))
    }

    pub fn open_log(&self, name: &str) -> io::Result<BatchLog> {
        BatchLog::open(self.log_path(name))
    }

    /// Run all `commands` to completion and log their output to `log`.
    ///
    /// Failed commands never stop their siblings. If any command failed, the
    /// failures are added to the runner's list and `RunError::RunFailed` is
    /// returned after the log was flushed.
    #[instrument(skip(self, commands, log, resource_flags, wait_for_output), level = "info")]
    pub fn run(
        &self,
        batch: &str,
        commands: &[Command],
        log: &BatchLog,
        resource_flags: ResourceFlags,
        wait_for_output: &[PathBuf],
    ) -> Result<RunOutcome, RunError> {
        let commands = commands
            .iter()
            .map(|command| resource_flags(command, self.resources_per_job))
            .collect::<Vec<_>>();

        log.info(format_args!(
            "{batch}: running {} command(s) on {} ({})",
            commands.len(),
            self.backend.name(),
            describe(&commands)
        ));

        let start = Instant::now();
        let reports = self.backend.run(&RunBatch {
            name: batch.to_string(),
            commands,
            resources_per_job: self.resources_per_job,
            log_path: log.path().to_path_buf(),
        })?;

        let mut failures = Vec::new();
        for report in reports.iter() {
            log.command_output(
                &format!("{} [{}]", report.command.name(), report.status),
                &report.command.command_line(),
                &report.output,
            );

            if !report.status.success() {
                log.error(format_args!(
                    "{} failed with {}, see {}",
                    report.command.name(),
                    report.status,
                    report.location
                ));
                failures.push(report.location.clone());
            }
        }

        if self.backend.remote() && failures.is_empty() {
            self.wait_for_outputs(wait_for_output, log);
        }

        log.info(format_args!(
            "{batch}: finished in {:.1?}, {} failure(s)",
            start.elapsed(),
            failures.len()
        ));
        log.flush();

        let outcome = RunOutcome {
            batch: batch.to_string(),
            reports,
            failures,
        };

        if outcome.succeeded() {
            Ok(outcome)
        } else {
            self.failures.lock().extend(outcome.failures.iter().cloned());

            Err(RunError::RunFailed {
                failures: outcome.failures.len(),
                log: log.path().to_path_buf(),
                outcome,
            })
        }
    }

    /// Poll until all `paths` are visible or the timeout expired.
    ///
    /// Outputs of cluster jobs may appear on the submitting host only after
    /// the network filesystem caught up. Expiry is only logged, exit statuses
    /// decide about failure.
    fn wait_for_outputs(&self, paths: &[PathBuf], log: &BatchLog) -> bool {
        let deadline = Instant::now() + self.wait_for_output_timeout;

        loop {
            let missing = paths.iter().filter(|path| !path.exists()).count();

            if missing == 0 {
                return true;
            }

            if Instant::now() >= deadline {
                log.warning(format_args!(
                    "{missing} expected output(s) not visible after {:?}",
                    self.wait_for_output_timeout
                ));
                return false;
            }

            debug!(missing, "Waiting for outputs");
            thread::sleep(self.poll_interval);
        }
    }

    /// all failures recorded so far, across all batches and chains
    pub fn failures(&self) -> Vec<String> {
        self.failures.lock().clone()
    }

    pub fn is_failed(&self) -> bool {
        !self.failures.lock().is_empty()
    }

    pub fn report_failures(&self) -> String {
        let failures = self.failures.lock();
        info!(count = failures.len(), "Reporting failures");

        format!(
            "> Logs of {} failed commands:\n    {}",
            failures.len(),
            failures.join("\n    ")
        )
    }
}
