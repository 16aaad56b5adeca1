//! The two channels every remote operation is built from.
//!
//! A [`Transport`] runs one shell command line per call and moves whole files
//! by path. Opening sessions, authenticating and keeping connections alive is
//! the implementor's business. [`LocalTransport`] is the implementation used
//! when the database lives on the same host as the driver.

use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::process::Command;

use tracing::debug;

use crate::error::{MvQueryError, Result};

/// Everything one command line produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Remote command execution plus file transfer.
///
/// A non-zero exit status is returned as data in [`CommandOutput`]; an `Err`
/// means the channel itself failed and should be a [`MvQueryError::Transport`].
pub trait Transport: Send + Sync {
    fn run(&self, command_line: &str) -> Result<CommandOutput>;
    fn write(&self, path: &str, contents: &[u8]) -> Result<()>;
    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>>;
    fn remove(&self, path: &str) -> Result<()>;
}

/// Quotes `value` as a single POSIX shell word.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

// ------------- Local -------------
/// Runs command lines through `sh -c` and resolves paths on the local
/// filesystem, optionally below a fixed prefix.
#[derive(Debug, Clone, Default)]
pub struct LocalTransport {
    prefix: Option<PathBuf>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self { prefix: None }
    }
    /// Every path handed to the file operations is resolved below `prefix`.
    pub fn rooted(prefix: impl Into<PathBuf>) -> Self {
        Self { prefix: Some(prefix.into()) }
    }
    fn resolve(&self, path: &str) -> PathBuf {
        match &self.prefix {
            Some(prefix) => prefix.join(path.trim_start_matches('/')),
            None => PathBuf::from(path),
        }
    }
}

fn transport_error(action: &str, path: &str, e: std::io::Error) -> MvQueryError {
    MvQueryError::Transport(format!("failed to {action} {path}: {e}"))
}

impl Transport for LocalTransport {
    fn run(&self, command_line: &str) -> Result<CommandOutput> {
        debug!(command_line, "running local command");
        let output = Command::new("sh")
            .arg("-c")
            .arg(command_line)
            .output()
            .map_err(|e| MvQueryError::Transport(format!("failed to spawn sh: {e}")))?;
        Ok(CommandOutput {
            // killed by a signal: report like the shell does
            status: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
    fn write(&self, path: &str, contents: &[u8]) -> Result<()> {
        fs::write(self.resolve(path), contents).map_err(|e| transport_error("write", path, e))
    }
    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        let file = fs::File::open(self.resolve(path)).map_err(|e| transport_error("open", path, e))?;
        Ok(Box::new(file))
    }
    fn remove(&self, path: &str) -> Result<()> {
        fs::remove_file(self.resolve(path)).map_err(|e| transport_error("remove", path, e))
    }
}
