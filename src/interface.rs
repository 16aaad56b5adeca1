//! Threaded interface for running batched queries in the background.
//!
//! A thread-per-query runner: each submitted [`QueryConfig`] is selected and
//! paged on its own worker thread, and records are streamed back over a
//! bounded channel so a slow consumer throttles the remote fetches.
//! Cancellation is cooperative through an `Arc<AtomicBool>` and is observed
//! between records, as is the optional deadline. A remote phantom that is
//! already running cannot be aborted; the worker stops at the next record
//! boundary instead.
//!
//! Whatever ends a query (end of results, an error, cancellation, deadline,
//! or the receiver going away) the worker closes it, so every remote artifact
//! is cleaned up.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard,
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::batched::{BatchedQuery, QueryConfig};
use crate::config::RemoteEnv;
use crate::decode::Charset;
use crate::error::{MvQueryError, Result};
use crate::phantom::PhantomExecutor;
use crate::program::ProgramRunner;
use crate::record::{Record, RecordReader};
use crate::transport::Transport;

/// Cancellation token shared with the worker thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);
impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Opaque handle identifier, local to one [`QueryInterface`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(u64);

/// How a background query ended.
#[derive(Debug, Clone)]
pub enum Outcome {
    Completed { records: usize },
    Cancelled { records: usize },
    TimedOut { records: usize },
    /// The receiver was dropped before all records were delivered.
    Abandoned { records: usize },
    Failed(MvQueryError),
}

/// Handle to a running or completed query.
pub struct QueryHandle {
    pub id: HandleId,
    cancel: CancelToken,
    started: Instant,
    join: Option<JoinHandle<Outcome>>,
    /// Records in selection order. A failure is delivered as the last item.
    pub results: Receiver<Result<Record>>,
}
impl QueryHandle {
    /// Request cancellation. The worker observes it at the next record.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
    /// Waits for the worker to finish and close the query. Records not yet
    /// received are discarded.
    pub fn join(mut self) -> Outcome {
        let join = self.join.take();
        // unblock a worker waiting on a full channel
        drop(self.results);
        match join.map(JoinHandle::join) {
            Some(Ok(outcome)) => outcome,
            Some(Err(_)) => Outcome::Failed(MvQueryError::Worker("query worker panicked".into())),
            None => Outcome::Failed(MvQueryError::Worker("query worker already joined".into())),
        }
    }
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Query submission options.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Records buffered ahead of the consumer.
    pub buffer: usize,
    /// Measured from submission, checked between records.
    pub timeout: Option<Duration>,
    pub charset: Charset,
}
impl Default for QueryOptions {
    fn default() -> Self {
        Self { buffer: 1024, timeout: None, charset: Charset::default() }
    }
}

/// Registry managing background query lifecycles for one account.
pub struct QueryInterface {
    runner: ProgramRunner,
    next_id: Mutex<u64>,
    active: Arc<Mutex<HashMap<HandleId, CancelToken>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // the maps stay consistent even if a holder panicked
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl QueryInterface {
    pub fn new(transport: Arc<dyn Transport>, env: RemoteEnv) -> Result<Self> {
        let executor = PhantomExecutor::new(transport, env)?;
        Ok(Self {
            runner: ProgramRunner::new(executor),
            next_id: Mutex::new(0),
            active: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn allocate_id(&self) -> HandleId {
        let mut g = lock(&self.next_id);
        *g += 1;
        HandleId(*g)
    }

    /// Number of queries whose worker has not finished yet.
    pub fn active(&self) -> usize {
        lock(&self.active).len()
    }

    /// Submits a query for execution on a background thread.
    pub fn start_query(&self, config: QueryConfig, options: QueryOptions) -> QueryHandle {
        let id = self.allocate_id();
        let cancel = CancelToken::new();
        lock(&self.active).insert(id, cancel.clone());

        let (tx, rx) = mpsc::sync_channel(options.buffer.max(1));
        let runner = self.runner.clone();
        let active = Arc::clone(&self.active);
        let token = cancel.clone();
        let started = Instant::now();
        let deadline = options.timeout.map(|d| started + d);
        let charset = options.charset;
        let join = std::thread::spawn(move || {
            let outcome = run_worker(runner, config, charset, &token, deadline, &tx);
            lock(&active).remove(&id);
            debug!(?id, ?outcome, "query worker finished");
            outcome
        });

        QueryHandle { id, cancel, started, join: Some(join), results: rx }
    }

    /// Runs a query on the current thread and collects every record.
    pub fn run_sync(&self, config: QueryConfig, charset: Charset) -> Result<Vec<Record>> {
        let mut query = BatchedQuery::start(self.runner.clone(), config)?.with_charset(charset);
        let collected: Result<Vec<Record>> = query.records().collect();
        let closed = query.close();
        let records = collected?;
        closed?;
        Ok(records)
    }

    /// Cancel a query by id.
    pub fn cancel(&self, id: HandleId) -> bool {
        match lock(&self.active).get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

fn run_worker(
    runner: ProgramRunner,
    config: QueryConfig,
    charset: Charset,
    cancel: &CancelToken,
    deadline: Option<Instant>,
    tx: &SyncSender<Result<Record>>,
) -> Outcome {
    let expired = || deadline.is_some_and(|d| Instant::now() >= d);
    if cancel.is_cancelled() {
        return Outcome::Cancelled { records: 0 };
    }
    if expired() {
        return Outcome::TimedOut { records: 0 };
    }
    let mut query = match BatchedQuery::start(runner, config) {
        Ok(query) => query.with_charset(charset),
        Err(e) => {
            let _ = tx.send(Err(e.clone()));
            return Outcome::Failed(e);
        }
    };
    info!(query = query.query_id(), count = query.record_count(), "background query selected");

    let mut records = 0;
    let outcome = loop {
        if cancel.is_cancelled() {
            break Outcome::Cancelled { records };
        }
        if expired() {
            break Outcome::TimedOut { records };
        }
        match query.read_record() {
            Ok(Some(record)) => {
                if tx.send(Ok(record)).is_err() {
                    break Outcome::Abandoned { records };
                }
                records += 1;
            }
            Ok(None) => break Outcome::Completed { records },
            Err(e) => {
                let _ = tx.send(Err(e.clone()));
                break Outcome::Failed(e);
            }
        }
    };

    match query.close() {
        Ok(()) => outcome,
        Err(e) => {
            warn!(query = query.query_id(), error = %e, "closing background query failed");
            match outcome {
                Outcome::Completed { .. } => {
                    let _ = tx.send(Err(e.clone()));
                    Outcome::Failed(e)
                }
                other => other,
            }
        }
    }
}
