use chrono::Local;
use parking_lot::Mutex;
use std::{
    fmt::Display,
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};
use tracing::{error, info, warn};

/// maximum width of separator lines in batch logs
pub const SEPARATOR_WIDTH: usize = 72;

/// Append-only log file shared by all batches of one chain.
///
/// Everything an operator needs to diagnose a failed run ends up here: chain
/// decisions as timestamped lines and the complete output of every command.
#[derive(Debug)]
pub struct BatchLog {
    path: PathBuf,
    file: Mutex<BufWriter<File>>,
}

fn timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// a separator line with `title` embedded, never longer than `SEPARATOR_WIDTH`
pub fn separator_line(fill: char, title: &str) -> String {
    if title.is_empty() {
        return fill.to_string().repeat(SEPARATOR_WIDTH);
    }

    let mut title = format!(" {} ", title.trim());
    if title.chars().count() > SEPARATOR_WIDTH - 4 {
        title = title.chars().take(SEPARATOR_WIDTH - 5).collect::<String>() + " ";
    }
    let remaining = SEPARATOR_WIDTH - title.chars().count();
    let left = remaining / 2;

    format!(
        "{}{}{}",
        fill.to_string().repeat(left),
        title,
        fill.to_string().repeat(remaining - left)
    )
}

impl BatchLog {
    /// open `path` for appending, creating parent directories if necessary
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            file: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_lines(&self, text: &str) {
        let mut file = self.file.lock();

        if let Err(error) = writeln!(file, "{text}") {
            error!(log = ?self.path, error = ?error, "Failed to write to batch log");
        }
    }

    fn entry(&self, level: &str, message: &str) {
        self.write_lines(&format!("{} {level} {message}", timestamp()));
    }

    pub fn info(&self, message: impl Display) {
        let message = message.to_string();
        info!(log = ?self.path.file_name(), "{message}");
        self.entry("INFO", &message);
    }

    pub fn warning(&self, message: impl Display) {
        let message = message.to_string();
        warn!(log = ?self.path.file_name(), "{message}");
        self.entry("WARNING", &message);
    }

    pub fn error(&self, message: impl Display) {
        let message = message.to_string();
        error!(log = ?self.path.file_name(), "{message}");
        self.entry("ERROR", &message);
    }

    pub fn separator(&self) {
        self.write_lines(&separator_line('=', ""));
    }

    /// append the captured output of one command, framed by header and footer lines
    pub fn command_output(&self, title: &str, command_line: &str, output: &str) {
        let mut block = String::with_capacity(output.len() + 4 * SEPARATOR_WIDTH);

        block.push_str(&separator_line('-', &format!("{} {title}", timestamp())));
        block.push('\n');
        block.push_str("$ ");
        block.push_str(command_line);
        block.push('\n');
        block.push_str(output);
        if !output.is_empty() && !output.ends_with('\n') {
            block.push('\n');
        }
        block.push_str(&separator_line('-', ""));

        self.write_lines(&block);
    }

    pub fn flush(&self) {
        if let Err(error) = self.file.lock().flush() {
            error!(log = ?self.path, error = ?error, "Failed to flush batch log");
        }
    }
}

impl Drop for BatchLog {
    fn drop(&mut self) {
        self.flush();
    }
}
