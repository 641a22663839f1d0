use itertools::Itertools;
use std::{
    fmt,
    path::{Path, PathBuf},
};

/// A single external invocation: program, arguments and a display name for logs.
///
/// Commands are built once by the map makers and never mutated afterwards, the
/// resource transforms return a fresh copy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    name: String,
    program: String,
    args: Vec<String>,
    output: Option<PathBuf>,
}

/// Transform injecting the per-job resource allotment into a command
pub type ResourceFlags = fn(&Command, usize) -> Command;

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        let program = program.into();

        Self {
            name: program.clone(),
            program,
            args: Vec::new(),
            output: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn arg(mut self, arg: impl ToString) -> Self {
        self.args.push(arg.to_string());
        self
    }

    /// pass `path` as the final argument and remember it as the produced file
    pub fn output(mut self, path: &Path) -> Self {
        self.output = Some(path.to_path_buf());
        self.path(path)
    }

    pub fn path(self, path: &Path) -> Self {
        let arg = path.to_string_lossy().into_owned();
        self.arg(arg)
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.args.extend(args.into_iter().map(|arg| arg.to_string()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// program followed by all arguments
    pub fn argv(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str))
    }

    pub fn output_path(&self) -> Option<&Path> {
        self.output.as_deref()
    }

    /// shell-quoted command line, as written to logs and batch scripts
    pub fn command_line(&self) -> String {
        shell_words::join(self.argv())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.command_line())
    }
}

/// Result of asking a map maker what has to be done for a target
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepResult {
    /// target exists and is newer than all of its inputs
    Skipped,
    Pending { command: Command, target: PathBuf },
}

impl StepResult {
    pub fn command(self) -> Option<Command> {
        match self {
            Self::Skipped => None,
            Self::Pending { command, .. } => Some(command),
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }
}

/// append `--threads N` as understood by the chart-relax family of programs
pub fn add_threads(command: &Command, threads: usize) -> Command {
    command.clone().arg("--threads").arg(threads)
}

/// keep the command as is, for programs without a thread limit option
pub fn no_resource_flags(command: &Command, _resources: usize) -> Command {
    command.clone()
}

/// human readable list of commands for log headers
pub fn describe(commands: &[Command]) -> String {
    commands.iter().map(Command::name).join(", ")
}
