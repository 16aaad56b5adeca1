//! Generated programs: upload, compile, run, delete.
//!
//! Sources live at `<account>/<file>/<name>`, the compiler writes the object
//! code next to them as `_<name>`.

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::{MvQueryError, Result};
use crate::phantom::{PhantomExecutor, RemoteOutput};
use crate::record::ByteSource;

pub const COMPILE_SUCCESS: &str = "compilation finished";

lazy_static! {
    static ref SAVED_LIST: Regex = Regex::new(r"(\d+) key\(s\) saved to (\d+) record\(s\)\.").unwrap();
}

/// Returns a dialect expression evaluating to `value`.
///
/// Literals are single-quoted; every embedded `'` closes the literal, is
/// concatenated as `"'"` and the literal is reopened:
/// `it's` becomes `'it':"'":'s'`.
pub fn quote_string(value: &str) -> String {
    format!("'{}'", value.split('\'').collect::<Vec<_>>().join("':\"'\":'"))
}

/// Parses the confirmation printed by `SAVE.LIST`, returning the key count.
pub fn parse_saved_list(output: &str) -> Option<usize> {
    SAVED_LIST.captures(output).and_then(|c| c[1].parse().ok())
}

fn require(what: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(MvQueryError::Usage(format!("{what} must not be blank")));
    }
    Ok(())
}

#[derive(Clone)]
pub struct ProgramRunner {
    executor: PhantomExecutor,
}

impl ProgramRunner {
    pub fn new(executor: PhantomExecutor) -> Self {
        Self { executor }
    }
    pub fn executor(&self) -> &PhantomExecutor {
        &self.executor
    }
    pub fn source_path(&self, file: &str, name: &str) -> String {
        self.executor.env().account_path(&format!("{file}/{name}"))
    }
    pub fn object_path(&self, file: &str, name: &str) -> String {
        self.executor.env().account_path(&format!("{file}/_{name}"))
    }

    pub fn compile(&self, file: &str, name: &str, source: &str) -> Result<()> {
        require("program file", file)?;
        require("program name", name)?;
        let path = self.source_path(file, name);
        self.executor.transport().write(&path, source.as_bytes())?;
        debug!(%path, bytes = source.len(), "uploaded program source");

        let mut output = self.executor.execute_sync(&format!("BASIC {file} {name}"))?;
        let text = output.read_to_string_lossy();
        let closed = output.close();
        let text = text?;
        if !text.contains(COMPILE_SUCCESS) {
            return Err(MvQueryError::Compile { program: format!("{file} {name}"), output: text });
        }
        closed?;
        info!(file, name, "compiled program");
        Ok(())
    }

    /// Deletes object code and source. Both deletions are attempted; the first
    /// failure is returned.
    pub fn remove(&self, file: &str, name: &str) -> Result<()> {
        require("program file", file)?;
        require("program name", name)?;
        let transport = self.executor.transport();
        let object = transport.remove(&self.object_path(file, name));
        let source = transport.remove(&self.source_path(file, name));
        if let Err(e) = &object {
            warn!(file, name, error = %e, "failed to remove compiled program");
        }
        if let Err(e) = &source {
            warn!(file, name, error = %e, "failed to remove program source");
        }
        object.and(source)?;
        debug!(file, name, "removed program");
        Ok(())
    }

    pub fn run(&self, file: &str, name: &str, args: &[&str]) -> Result<RemoteOutput> {
        require("program file", file)?;
        require("program name", name)?;
        let mut cmd = format!("RUN {file} {name}");
        for arg in args {
            cmd.push(' ');
            cmd.push_str(arg);
        }
        self.executor.execute_sync(&cmd)
    }

    pub fn delete_saved_list(&self, list: &str) -> Result<()> {
        require("saved list name", list)?;
        let mut output = self.executor.execute_sync(&format!("DELETELIST {}", quote_string(list)))?;
        let text = output.read_to_string_lossy();
        let closed = output.close();
        let text = text?;
        if !text.contains(&format!("'{list}' deleted.")) {
            return Err(MvQueryError::protocol(format!("saved list '{list}' was not deleted"), text));
        }
        closed?;
        info!(list, "deleted saved list");
        Ok(())
    }
}
