use tracing::debug;

use crate::decode::{Charset, RecordDecoder};
use crate::error::{MvQueryError, Result};
use crate::phantom::{PhantomExecutor, RemoteOutput};

/// One retrieval statement whose whole output is a single XML document,
/// e.g. `LIST CLIENTS NAME COMPANY TOXML`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    statement: String,
    charset: Charset,
}

impl Query {
    pub fn new(statement: impl Into<String>) -> Self {
        Self { statement: statement.into(), charset: Charset::default() }
    }
    pub fn with_charset(mut self, charset: Charset) -> Self {
        self.charset = charset;
        self
    }
    pub fn statement(&self) -> &str {
        &self.statement
    }

    /// Runs the statement to completion and returns a decoder over its
    /// output. Closing the decoder deletes the output file.
    pub fn run(&self, executor: &PhantomExecutor) -> Result<RecordDecoder<RemoteOutput>> {
        if self.statement.trim().is_empty() {
            return Err(MvQueryError::Usage("query statement must not be blank".into()));
        }
        debug!(statement = %self.statement, "running query");
        let output = executor.execute_sync(&self.statement)?;
        Ok(RecordDecoder::with_charset(output, self.charset))
    }
}
