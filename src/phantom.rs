//! Detached ("phantom") process execution on the database host.
//!
//! A phantom is started through the `udt` launcher, which answers on its
//! diagnostic stream with a banner naming the process id and the COMO file
//! capturing its output. Once the process has exited, the COMO file is read
//! back through a [`TruncatingReader`] that strips the runtime's closing
//! banner, and deleted when the caller closes the stream.

use std::io::{self, Read};
use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::RemoteEnv;
use crate::error::{MvQueryError, Result};
use crate::record::ByteSource;
use crate::transport::{shell_quote, Transport};
use crate::truncate::TruncatingReader;

// exit status of `wait` when the pid is unknown, i.e. the process already ended
pub const WAIT_NOT_FOUND: i32 = 127;

lazy_static! {
    static ref START_BANNER: Regex =
        Regex::new(r"(\w+) process (\d+) started\.\r?\nCOMO file is '([^']+)'\.").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhantomHandle {
    pub kind: String,
    pub pid: u32,
    /// COMO file path as reported by the server, relative to the account.
    pub output_path: String,
}

impl PhantomHandle {
    /// The line the runtime appends to the COMO file when the process ends.
    pub fn completion_banner(&self) -> String {
        format!("{} process {} has completed.\n", self.kind, self.pid)
    }
}

/// Finds the start banner in launcher output.
pub fn parse_start_banner(output: &str) -> Option<PhantomHandle> {
    let captures = START_BANNER.captures(output)?;
    Some(PhantomHandle {
        kind: captures[1].to_string(),
        pid: captures[2].parse().ok()?,
        output_path: captures[3].to_string(),
    })
}

// ------------- Remote output -------------
/// Stream over a remote file that is deleted when the stream is closed.
///
/// Closing is idempotent. Dropping an unclosed stream closes it and logs any
/// failure, so the file is never left behind silently.
pub struct RemoteOutput {
    reader: Option<Box<dyn Read + Send>>,
    path: String,
    transport: Arc<dyn Transport>,
    closed: bool,
}

impl RemoteOutput {
    fn new(reader: Box<dyn Read + Send>, path: String, transport: Arc<dyn Transport>) -> Self {
        Self { reader: Some(reader), path, transport, closed: false }
    }
    pub fn path(&self) -> &str {
        &self.path
    }
    pub fn read_to_string_lossy(&mut self) -> Result<String> {
        let mut buf = Vec::new();
        self.read_to_end(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

impl Read for RemoteOutput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.reader.as_mut() {
            Some(reader) => reader.read(buf),
            None => Err(io::Error::other(format!("remote output {} is closed", self.path))),
        }
    }
}

impl ByteSource for RemoteOutput {
    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.reader = None;
        debug!(path = %self.path, "removing remote output");
        self.transport.remove(&self.path)
    }
}

impl Drop for RemoteOutput {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = ByteSource::close(self) {
                warn!(path = %self.path, error = %e, "failed to remove remote output on drop");
            }
        }
    }
}

impl std::fmt::Debug for RemoteOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteOutput").field("path", &self.path).field("closed", &self.closed).finish()
    }
}

// ------------- Executor -------------
#[derive(Clone)]
pub struct PhantomExecutor {
    transport: Arc<dyn Transport>,
    env: RemoteEnv,
}

impl PhantomExecutor {
    pub fn new(transport: Arc<dyn Transport>, env: RemoteEnv) -> Result<Self> {
        env.validate()?;
        Ok(Self { transport, env })
    }
    pub fn env(&self) -> &RemoteEnv {
        &self.env
    }
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    fn launch_line(&self, cmd: &str) -> String {
        format!(
            "UDTHOME={};UDTBIN={}; export UDTHOME UDTBIN; cd {} && \"$UDTBIN\"/udt PHANTOM {}",
            shell_quote(&self.env.home),
            shell_quote(&self.env.bin),
            shell_quote(&self.env.account),
            shell_quote(cmd),
        )
    }

    /// Starts `cmd` as a phantom and returns as soon as the launcher answers.
    pub fn start_async(&self, cmd: &str) -> Result<PhantomHandle> {
        let output = self.transport.run(&self.launch_line(cmd))?;
        let diagnostics = output.stderr_lossy();
        // some launchers print the banner on stdout instead
        let handle = parse_start_banner(&diagnostics).or_else(|| parse_start_banner(&output.stdout_lossy()));
        match handle {
            Some(handle) => {
                info!(pid = handle.pid, output = %handle.output_path, cmd, "phantom started");
                Ok(handle)
            }
            None => Err(MvQueryError::protocol(
                format!("no phantom start banner for command '{cmd}' (exit status {})", output.status),
                format!("{}{}", diagnostics, output.stdout_lossy()),
            )),
        }
    }

    /// Blocks until the phantom has exited. There is no timeout.
    pub fn wait(&self, handle: &PhantomHandle) -> Result<()> {
        let output = self.transport.run(&format!("/usr/bin/wait {}", handle.pid))?;
        match output.status {
            0 | WAIT_NOT_FOUND => {
                debug!(pid = handle.pid, status = output.status, "phantom finished");
                Ok(())
            }
            status => Err(MvQueryError::Wait { pid: handle.pid, status }),
        }
    }

    /// Opens the phantom's COMO file without its completion banner.
    pub fn retrieve_output(&self, handle: &PhantomHandle) -> Result<RemoteOutput> {
        let path = self.env.account_path(&handle.output_path);
        let file = self.transport.open(&path)?;
        let reader = TruncatingReader::new(file, handle.completion_banner());
        Ok(RemoteOutput::new(Box::new(reader), path, Arc::clone(&self.transport)))
    }

    /// Opens any file below the account; it is deleted when the stream closes.
    pub fn retrieve_file(&self, relative: &str) -> Result<RemoteOutput> {
        let path = self.env.account_path(relative);
        let file = self.transport.open(&path)?;
        Ok(RemoteOutput::new(file, path, Arc::clone(&self.transport)))
    }

    /// Start, wait and retrieve in one step.
    pub fn execute_sync(&self, cmd: &str) -> Result<RemoteOutput> {
        let handle = self.start_async(cmd)?;
        if let Err(e) = self.wait(&handle) {
            let path = self.env.account_path(&handle.output_path);
            if let Err(cleanup) = self.transport.remove(&path) {
                warn!(%path, error = %cleanup, "failed to remove phantom output after wait error");
            }
            return Err(e);
        }
        self.retrieve_output(&handle)
    }
}
