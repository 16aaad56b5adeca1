
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum MvQueryError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Protocol error: {message}\n===\n{output}\n===")]
    Protocol { message: String, output: String },
    #[error("Wait failed for process {pid}: exit status {status}")]
    Wait { pid: u32, status: i32 },
    #[error("Compilation of {program} failed:\n{output}")]
    Compile { program: String, output: String },
    #[error("Select failed: {message}")]
    Select {
        message: String,
        #[source]
        source: Option<Box<MvQueryError>>,
    },
    #[error("Unexpected element <{tag}>: {message}")]
    Structure { tag: String, message: String },
    #[error("Unexpected end of input inside a record")]
    UnexpectedEof,
    #[error("XML error: {0}")]
    Xml(String),
    #[error("Usage error: {0}")]
    Usage(String),
    #[error("Query worker error: {0}")]
    Worker(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),
    #[error("Batch {index} failed: {source}")]
    Batch {
        index: usize,
        #[source]
        source: Box<MvQueryError>,
    },
}

pub type Result<T> = std::result::Result<T, MvQueryError>;

impl MvQueryError {
    pub fn protocol(message: impl Into<String>, output: impl Into<String>) -> Self {
        Self::Protocol { message: message.into(), output: output.into() }
    }
    pub fn structure(tag: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Structure { tag: tag.into(), message: message.into() }
    }
    /// Strips any `Batch`/`Select` context and returns the originating error.
    pub fn root_cause(&self) -> &MvQueryError {
        match self {
            Self::Batch { source, .. } => source.root_cause(),
            Self::Select { source: Some(source), .. } => source.root_cause(),
            other => other,
        }
    }
}

// Helper conversions
impl From<std::io::Error> for MvQueryError {
    fn from(e: std::io::Error) -> Self { Self::Io(Arc::new(e)) }
}
impl From<config::ConfigError> for MvQueryError {
    fn from(e: config::ConfigError) -> Self { Self::Config(e.to_string()) }
}
impl From<quick_xml::Error> for MvQueryError {
    fn from(e: quick_xml::Error) -> Self { Self::Xml(e.to_string()) }
}
impl From<quick_xml::events::attributes::AttrError> for MvQueryError {
    fn from(e: quick_xml::events::attributes::AttrError) -> Self { Self::Xml(e.to_string()) }
}
