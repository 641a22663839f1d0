//! Structured builder for SLURM batch scripts.
//!
//! The script runs every command as its own job step in the background, echoes
//! a status line per step and finally a completion token once all steps are
//! done. The submitting side only ever parses those lines.

use once_cell::sync::Lazy;
use regex::Regex;
use std::{collections::BTreeMap, path::PathBuf};

/// printed by the script once every job step returned
pub const ALL_JOBS_DONE: &str = "All jobs done.";
/// printed by SLURM into the batch output when the job is killed at its time limit
pub const TIME_EXPIRED: &str = "DUE TO TIME LIMIT";
/// prefix of the per step status lines
pub const STEP_STATUS: &str = "mapchain-step";

static STEP_STATUS_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"^{STEP_STATUS} (\d+) exit (\d+)\s*$"))
        .expect("step status pattern is valid")
});

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Directive {
    pub key: String,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobStep {
    pub cpus: usize,
    pub argv: Vec<String>,
    pub output: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchScript {
    pub interpreter: String,
    pub srun: String,
    pub directives: Vec<Directive>,
    pub steps: Vec<JobStep>,
}

/// How the batch job ended according to its output
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    Done,
    TimeExpired,
    Unknown,
}

impl BatchScript {
    pub fn new(srun: impl Into<String>) -> Self {
        Self {
            interpreter: String::from("/bin/bash"),
            srun: srun.into(),
            directives: Vec::new(),
            steps: Vec::new(),
        }
    }

    pub fn directive(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.directives.push(Directive {
            key: key.into(),
            value: value.to_string(),
        });
        self
    }

    pub fn step<I, S>(mut self, cpus: usize, argv: I, output: PathBuf) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.steps.push(JobStep {
            cpus,
            argv: argv.into_iter().map(Into::into).collect(),
            output,
        });
        self
    }

    fn render_step(&self, index: usize, step: &JobStep) -> String {
        format!(
            "{{ {} --ntasks=1 --nodes=1 --cpus-per-task={} --exclusive --output={} {}; echo \"{STEP_STATUS} {index} exit $?\"; }} &",
            shell_words::quote(&self.srun),
            step.cpus,
            shell_words::quote(&step.output.to_string_lossy()),
            shell_words::join(&step.argv)
        )
    }

    /// the literal script text handed to sbatch
    pub fn render(&self) -> String {
        let mut lines = vec![format!("#!{}", self.interpreter)];

        lines.extend(
            self.directives
                .iter()
                .map(|directive| format!("#SBATCH --{}={}", directive.key, directive.value)),
        );
        lines.push(String::new());
        lines.extend(
            self.steps
                .iter()
                .enumerate()
                .map(|(index, step)| self.render_step(index, step)),
        );
        lines.push(String::from("wait"));
        lines.push(format!("echo \"{ALL_JOBS_DONE}\""));
        lines.push(String::new());

        lines.join("\n")
    }
}

pub fn completion(batch_output: &str) -> Completion {
    if batch_output.lines().any(|line| line.trim() == ALL_JOBS_DONE) {
        Completion::Done
    } else if batch_output.contains(TIME_EXPIRED) {
        Completion::TimeExpired
    } else {
        Completion::Unknown
    }
}

/// exit codes by step index, steps that never reported are absent
pub fn step_statuses(batch_output: &str) -> BTreeMap<usize, i32> {
    batch_output
        .lines()
        .filter_map(|line| STEP_STATUS_LINE.captures(line))
        .filter_map(|captures| {
            let index = captures.get(1)?.as_str().parse().ok()?;
            let code = captures.get(2)?.as_str().parse().ok()?;
            Some((index, code))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_one_background_step_per_command() {
        let script = BatchScript::new("srun")
            .directive("job-name", "mapchain")
            .directive("cpus-per-task", 16)
            .step(
                16,
                ["chart-relax-grid", "-n", "10", "in put.ace"],
                PathBuf::from("/shared/step.000.out"),
            );

        assert_eq!(
            script.render(),
            "#!/bin/bash\n\
             #SBATCH --job-name=mapchain\n\
             #SBATCH --cpus-per-task=16\n\
             \n\
             { srun --ntasks=1 --nodes=1 --cpus-per-task=16 --exclusive --output=/shared/step.000.out \
             chart-relax-grid -n 10 'in put.ace'; echo \"mapchain-step 0 exit $?\"; } &\n\
             wait\n\
             echo \"All jobs done.\"\n"
        );
    }

    #[test]
    fn parses_completion_and_statuses() {
        let output = "mapchain-step 1 exit 0\nnoise\nmapchain-step 0 exit 2\nAll jobs done.\n";

        assert_eq!(completion(output), Completion::Done);
        assert_eq!(
            step_statuses(output),
            BTreeMap::from([(0, 2), (1, 0)])
        );
    }

    #[test]
    fn recognizes_time_limit() {
        let output = "mapchain-step 0 exit 0\nslurmstepd: error: *** JOB 42 ON node7 CANCELLED AT 2021-05-01T10:00:00 DUE TO TIME LIMIT ***\n";

        assert_eq!(completion(output), Completion::TimeExpired);
        assert_eq!(step_statuses(output).get(&1), None);
        assert_eq!(completion(""), Completion::Unknown);
    }
}
