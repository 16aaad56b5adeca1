//! mvquery – a query driver for multivalue databases that only expose a
//! command shell and a file channel.
//!
//! The database has no query protocol of its own. Every query is turned into
//! a program in the database's BASIC dialect, which is uploaded, compiled and
//! run as a detached *phantom* process; its output is then read back from the
//! file the runtime captured it in.
//!
//! ## Modules
//! * [`transport`] – The [`transport::Transport`] seam (command line plus
//!   file transfer) and a local implementation.
//! * [`truncate`] – [`truncate::TruncatingReader`], which strips a known
//!   trailing pattern from a stream with bounded lookahead.
//! * [`phantom`] – Starting, waiting for and collecting phantom processes.
//! * [`program`] – Generated programs: compile, run, remove, and dialect
//!   string quoting.
//! * [`decode`] – [`decode::RecordDecoder`], a streaming decoder for the
//!   multivalue/subvalue XML listing format.
//! * [`batched`] – [`batched::BatchedQuery`], selection plus paginated
//!   retrieval with bounded memory on both ends.
//! * [`query`] – A single retrieval statement decoded in one pass.
//! * [`interface`] – Background execution with cancellation and deadlines.
//! * [`config`] – Layered settings.
//!
//! ## Records
//! Every reader yields [`record::Record`]s: ordered maps from field name to
//! either element text or a list of nested groups. Fields whose name ends in
//! `_MV` hold multivalue groups, and inside those, fields ending in `_MS` hold
//! subvalue groups.
//!
//! ## Quick Start
//! ```no_run
//! use std::sync::Arc;
//! use mvquery::batched::{BatchedQuery, QueryConfig};
//! use mvquery::config::RemoteEnv;
//! use mvquery::phantom::PhantomExecutor;
//! use mvquery::program::ProgramRunner;
//! use mvquery::record::RecordReader;
//! use mvquery::transport::LocalTransport;
//!
//! let env = RemoteEnv::new("/usr/udthome/bin", "/usr/udthome", "/usr/udthome/demo");
//! let executor = PhantomExecutor::new(Arc::new(LocalTransport::new()), env)?;
//! let config = QueryConfig::new(["SELECT ORDERS"], "ORDERS").fields(["ORD_DATE", "PRODUCT_NO"]);
//! let mut query = BatchedQuery::start(ProgramRunner::new(executor), config)?;
//! for record in query.records() {
//!     println!("{}", record?);
//! }
//! query.close()?;
//! # Ok::<(), mvquery::error::MvQueryError>(())
//! ```

pub mod batched;
pub mod config;
pub mod decode;
pub mod error;
pub mod interface;
pub mod phantom;
pub mod program;
pub mod query;
pub mod record;
pub mod transport;
pub mod truncate;
