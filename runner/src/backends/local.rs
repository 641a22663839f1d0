use super::{Backend, BackendError, CommandReport, JobStatus, RunBatch};
use crate::{command::Command, config::BackendConfig};
use rayon::{prelude::*, ThreadPoolBuilder};
use std::{
    io::{Read, Seek, SeekFrom},
    num::NonZeroUsize,
    os::unix::process::ExitStatusExt,
    path::Path,
    process::{self, Stdio},
    thread,
    time::Instant,
};
use tracing::{debug, instrument, warn};

/// Backend running every command as a child process on this host
#[derive(Debug, Clone)]
pub struct LocalBackend {
    cores: usize,
}

/// name of this host for failure reports
pub fn hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(hostname) => hostname.to_string_lossy().into_owned(),
        Err(error) => {
            warn!(error = ?error, "Failed to retrieve hostname");
            String::from("localhost")
        }
    }
}

impl LocalBackend {
    pub fn load(config: &BackendConfig) -> Self {
        let cores = config.local_cores.unwrap_or_else(|| {
            thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1)
        });

        Self { cores }
    }

    /// one worker per group of `resources_per_job` cores
    pub fn workers(&self, resources_per_job: usize) -> usize {
        (self.cores / resources_per_job.max(1)).max(1)
    }
}

/// run `command` with stdout and stderr merged into one anonymous file
fn execute(command: &Command) -> (JobStatus, String) {
    let mut capture = match tempfile::tempfile() {
        Ok(file) => file,
        Err(error) => return (JobStatus::SpawnFailed(error.to_string()), String::new()),
    };
    let streams = capture
        .try_clone()
        .and_then(|stdout| capture.try_clone().map(|stderr| (stdout, stderr)));
    let (stdout, stderr) = match streams {
        Ok(streams) => streams,
        Err(error) => return (JobStatus::SpawnFailed(error.to_string()), String::new()),
    };

    let status = match process::Command::new(command.program())
        .args(command.arguments())
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .status()
    {
        Ok(status) => match (status.code(), status.signal()) {
            (Some(code), _) => JobStatus::Exited(code),
            (None, Some(signal)) => JobStatus::Signalled(signal),
            (None, None) => JobStatus::Lost,
        },
        Err(error) => return (JobStatus::SpawnFailed(error.to_string()), String::new()),
    };

    let mut output = Vec::new();
    if let Err(error) = capture
        .seek(SeekFrom::Start(0))
        .and_then(|_| capture.read_to_end(&mut output))
    {
        warn!(command = command.name(), error = ?error, "Failed to read command output");
    }

    (status, String::from_utf8_lossy(&output).into_owned())
}

fn run_one(command: &Command, host: &str, log_path: &Path) -> CommandReport {
    debug!("Running {command}");
    let start = Instant::now();
    let (status, output) = execute(command);

    debug!(
        command = command.name(),
        elapsed = ?start.elapsed(),
        "Finished with {status}"
    );

    CommandReport {
        command: command.clone(),
        status,
        output,
        location: format!("{host}:{} ({})", log_path.display(), command.name()),
    }
}

impl Backend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn available(&self) -> bool {
        true
    }

    /// run all commands of the batch concurrently on a bounded pool
    #[instrument(skip(self, batch), fields(batch = %batch.name), level = "info")]
    fn run(&self, batch: &RunBatch) -> Result<Vec<CommandReport>, BackendError> {
        let workers = self.workers(batch.resources_per_job).min(batch.commands.len().max(1));
        debug!("Starting local pool with {workers} workers");

        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|index| format!("local-job-{index}"))
            .build()?;
        let host = hostname();

        Ok(pool.install(|| {
            batch
                .commands
                .par_iter()
                .map(|command| run_one(command, &host, &batch.log_path))
                .collect()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> Command {
        Command::new("sh").arg("-c").arg(script).named(script)
    }

    #[test]
    fn workers_follow_core_groups() {
        let backend = LocalBackend { cores: 32 };

        assert_eq!(backend.workers(16), 2);
        assert_eq!(backend.workers(64), 1);
        assert_eq!(backend.workers(0), 32);
    }

    #[test]
    fn all_commands_run_and_keep_order() {
        let dir = tempfile::tempdir().unwrap();
        let batch = RunBatch {
            name: "test".into(),
            commands: vec![
                shell("echo one"),
                shell("echo two >&2; exit 3"),
                shell("echo three"),
            ],
            resources_per_job: 1,
            log_path: dir.path().join("batch.log"),
        };

        let reports = LocalBackend { cores: 2 }.run(&batch).unwrap();

        assert_eq!(reports.len(), 3);
        assert_eq!(reports[0].status, JobStatus::Exited(0));
        assert_eq!(reports[0].output, "one\n");
        assert_eq!(reports[1].status, JobStatus::Exited(3));
        assert_eq!(reports[1].output, "two\n");
        assert!(reports[1].location.contains("batch.log"));
        assert_eq!(reports[2].output, "three\n");
    }

    #[test]
    fn missing_program_is_reported_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let batch = RunBatch {
            name: "missing".into(),
            commands: vec![Command::new("/nonexistent/chart-relax-grid")],
            resources_per_job: 1,
            log_path: dir.path().join("batch.log"),
        };

        let reports = LocalBackend { cores: 1 }.run(&batch).unwrap();

        assert!(matches!(reports[0].status, JobStatus::SpawnFailed(_)));
    }
}
