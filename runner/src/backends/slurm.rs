use super::{
    script::{self, BatchScript, Completion},
    Backend, BackendError, CommandReport, JobStatus, RunBatch,
};
use crate::config::BackendConfig;
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
    process::{self, Stdio},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

/// srun and sbatch have to be at least this major version
pub const MINIMUM_SLURM_MAJOR: u32 = 20;

static SLURM_VERSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^slurm(?:-wlm)?\s+(\d+)\.").expect("slurm version pattern is valid")
});

/// Backend submitting each batch as one SLURM job with a job step per command
#[derive(Debug, Clone)]
pub struct SlurmBackend {
    srun: String,
    sbatch: String,
    job_name: String,
    partition: Option<String>,
    probe_timeout: Duration,
    /// how long the batch output may take to show up after sbatch returned
    wait_for_output_timeout: Duration,
    poll_interval: Duration,
}

/// major version from `srun -V`/`sbatch -V` output such as `slurm 23.02.4`
pub fn parse_major_version(output: &str) -> Option<u32> {
    SLURM_VERSION
        .captures(output.trim())
        .and_then(|captures| captures.get(1))
        .and_then(|major| major.as_str().parse().ok())
}

/// job id from `sbatch --parsable` output (`id` or `id;cluster`)
pub fn parse_job_id(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.split(';').next())
        .filter(|id| id.chars().all(|c| c.is_ascii_digit()) && !id.is_empty())
        .map(String::from)
}

impl SlurmBackend {
    pub fn load(config: &BackendConfig) -> Self {
        Self {
            srun: config.slurm.srun.clone(),
            sbatch: config.slurm.sbatch.clone(),
            job_name: config.slurm.job_name.clone(),
            partition: config.slurm.partition.clone(),
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
            wait_for_output_timeout: Duration::from_secs(config.wait_for_output_timeout),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }

    /// run `program -V` with a bounded wait and check its major version
    fn probe(&self, program: &str) -> bool {
        let mut child = match process::Command::new(program)
            .arg("-V")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(error) => {
                debug!(program, error = ?error, "Probe failed to start");
                return false;
            }
        };

        match child.wait_timeout(self.probe_timeout) {
            Ok(Some(status)) if status.success() => {}
            Ok(Some(status)) => {
                debug!(program, "Probe exited with {status}");
                return false;
            }
            Ok(None) => {
                warn!(program, "Probe timed out after {:?}", self.probe_timeout);
                if let Err(error) = child.kill() {
                    warn!(program, error = ?error, "Failed to kill probe");
                }
                if let Err(error) = child.wait() {
                    warn!(program, error = ?error, "Failed to reap probe");
                }
                return false;
            }
            Err(error) => {
                debug!(program, error = ?error, "Failed to wait for probe");
                return false;
            }
        }

        let mut output = String::new();
        if let Some(mut stdout) = child.stdout.take() {
            if stdout.read_to_string(&mut output).is_err() {
                return false;
            }
        }

        match parse_major_version(&output) {
            Some(major) if major >= MINIMUM_SLURM_MAJOR => true,
            Some(major) => {
                info!(program, major, "SLURM too old, need at least {MINIMUM_SLURM_MAJOR}");
                false
            }
            None => {
                debug!(program, output = %output, "Unrecognized version output");
                false
            }
        }
    }

    pub fn script(&self, batch: &RunBatch, work_dir: &Path) -> BatchScript {
        let mut script = BatchScript::new(self.srun.clone())
            .directive("job-name", &self.job_name)
            .directive("output", work_dir.join("batch.out").to_string_lossy())
            .directive("ntasks", batch.commands.len())
            .directive("cpus-per-task", batch.resources_per_job);

        if let Some(ref partition) = self.partition {
            script = script.directive("partition", partition);
        }

        batch
            .commands
            .iter()
            .enumerate()
            .fold(script, |script, (index, command)| {
                script.step(
                    batch.resources_per_job,
                    command.argv(),
                    step_output(work_dir, index),
                )
            })
    }

    fn submit(&self, script_path: &Path) -> Result<String, BackendError> {
        // --wait keeps sbatch alive until the job has finished
        let output = process::Command::new(&self.sbatch)
            .arg("--parsable")
            .arg("--wait")
            .arg(script_path)
            .stdin(Stdio::null())
            .output()?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        match parse_job_id(&stdout) {
            Some(job_id) => {
                if !output.status.success() {
                    warn!(job = %job_id, "sbatch reported {}", output.status);
                }
                Ok(job_id)
            }
            None => Err(BackendError::Submit {
                program: self.sbatch.clone(),
                status: output.status.to_string(),
                output: format!("{stdout}{}", String::from_utf8_lossy(&output.stderr)),
            }),
        }
    }
}

impl SlurmBackend {
    /// Poll `batch_output` until it carries the completion or time limit token.
    ///
    /// The shared filesystem may show the output on this host well after the
    /// job finished. The last content read is returned on timeout.
    fn await_completion(&self, batch_output: &Path, job_id: &str) -> (Completion, String) {
        let deadline = Instant::now() + self.wait_for_output_timeout;

        loop {
            let output = read_lossy(batch_output);
            let completion = script::completion(&output);

            if completion != Completion::Unknown || Instant::now() >= deadline {
                return (completion, output);
            }

            debug!(job = %job_id, "Waiting for batch output");
            thread::sleep(self.poll_interval);
        }
    }
}

fn step_output(work_dir: &Path, index: usize) -> PathBuf {
    work_dir.join(format!("step.{index:03}.out"))
}

fn read_lossy(path: &Path) -> String {
    match fs::read(path) {
        Ok(content) => String::from_utf8_lossy(&content).into_owned(),
        Err(error) => {
            debug!(path = ?path, error = ?error, "No output found");
            String::new()
        }
    }
}

impl Backend for SlurmBackend {
    fn name(&self) -> &'static str {
        "slurm"
    }

    fn available(&self) -> bool {
        self.probe(&self.srun) && self.probe(&self.sbatch)
    }

    fn remote(&self) -> bool {
        true
    }

    #[instrument(skip(self, batch), fields(batch = %batch.name), level = "info")]
    fn run(&self, batch: &RunBatch) -> Result<Vec<CommandReport>, BackendError> {
        // job outputs must be visible from the compute nodes, so they live next to the log
        let log_dir = batch.log_path.parent().unwrap_or_else(|| Path::new("."));
        let work_dir = tempfile::Builder::new()
            .prefix("slurm.")
            .tempdir_in(log_dir)?;

        let script_path = work_dir.path().join("batch.sh");
        fs::write(&script_path, self.script(batch, work_dir.path()).render())?;

        let job_id = self.submit(&script_path)?;
        let (completion, batch_output) =
            self.await_completion(&work_dir.path().join("batch.out"), &job_id);

        match completion {
            Completion::Done => info!(job = %job_id, "All job steps done"),
            Completion::TimeExpired => error!(job = %job_id, "Job hit its time limit"),
            Completion::Unknown => {
                warn!(job = %job_id, output = %batch_output, "Unrecognized batch output")
            }
        }

        let statuses = script::step_statuses(&batch_output);

        Ok(batch
            .commands
            .iter()
            .enumerate()
            .map(|(index, command)| CommandReport {
                command: command.clone(),
                status: statuses
                    .get(&index)
                    .map_or(JobStatus::Lost, |code| JobStatus::Exited(*code)),
                output: read_lossy(&step_output(work_dir.path(), index)),
                location: format!("slurm job {job_id} step {index} ({})", command.name()),
            })
            .collect())
    }
}
