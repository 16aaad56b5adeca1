//! Paginated retrieval over a server-side selection.
//!
//! A [`BatchedQuery`] runs the selection once, learns how many records it
//! produced and then fetches them slice by slice, decoding each slice as it
//! is read. Neither side ever holds the whole result.
//!
//! Two wire strategies are supported behind the same type:
//! * [`SelectStrategy::SavedList`]: a short program selects and saves the
//!   list under the query id (`N key(s) saved to M record(s).`), and every
//!   batch compiles and runs a listing program over its slice of that list.
//! * [`SelectStrategy::StatusLines`]: one program selects and lists every
//!   batch into its own XML file, reporting progress with `|SELECTED|`,
//!   `|RESULTBATCH|`, `|DONE` and `|ERROR|` lines; batches are fetched as
//!   the markers are consumed.
//!
//! Lifecycle: `Created -> Selected -> {Paging, Exhausted} -> Closed`.

use std::io::{BufRead, BufReader};

use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::decode::{Charset, RecordDecoder};
use crate::error::{MvQueryError, Result};
use crate::phantom::RemoteOutput;
use crate::program::{parse_saved_list, quote_string, ProgramRunner};
use crate::record::{ByteSource, Record, RecordReader};

pub const DEFAULT_BATCH_SIZE: usize = 10_000;
/// Directory (relative to the account) the status-line program lists into.
pub const RESULT_BATCH_DIR: &str = "_XML_/";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectStrategy {
    #[default]
    SavedList,
    StatusLines,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryConfig {
    /// Statements run in order to build the active select list. Empty means
    /// every record of `file`.
    pub select: Vec<String>,
    pub file: String,
    pub fields: Vec<String>,
    /// Values `<= 0` mean [`DEFAULT_BATCH_SIZE`].
    pub batch_size: i64,
    pub strategy: SelectStrategy,
}

impl QueryConfig {
    pub fn new<I, S>(select: I, file: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            select: select.into_iter().map(Into::into).collect(),
            file: file.into(),
            fields: Vec::new(),
            batch_size: 0,
            strategy: SelectStrategy::default(),
        }
    }
    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }
    pub fn batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }
    pub fn strategy(mut self, strategy: SelectStrategy) -> Self {
        self.strategy = strategy;
        self
    }
    pub fn effective_batch_size(&self) -> usize {
        if self.batch_size <= 0 { DEFAULT_BATCH_SIZE } else { self.batch_size as usize }
    }
}

// ------------- Generated programs -------------
fn select_script(config: &QueryConfig) -> String {
    let mut script = String::from("SELECTSCRIPT = ''\n");
    for statement in &config.select {
        script += &format!("SELECTSCRIPT = INSERT(SELECTSCRIPT, -1, 0, 0, {})\n", quote_string(statement));
    }
    script += "IF SELECTSCRIPT = '' THEN SELECTSCRIPT = 'SELECT ':LISTFILE\n";
    script
}

pub(crate) fn render_select_program(config: &QueryConfig, query_id: &str) -> String {
    format!(
        r#"$BASICTYPE "U"
LISTFILE = {file}
LISTNAME = {list}
{script}
EXECUTE SELECTSCRIPT
IF SYSTEM(11) = 0 THEN
  PRINT '|SELECTED|0'
  STOP
END
EXECUTE 'SAVE.LIST ':LISTNAME
"#,
        file = quote_string(&config.file),
        list = quote_string(query_id),
        script = select_script(config),
    )
}

pub(crate) fn render_listing_program(config: &QueryConfig, query_id: &str, first: usize, count: usize) -> String {
    format!(
        r#"$BASICTYPE "U"
LISTNAME = {list}
LISTFILE = {file}
FILEFIELDS = {fields}
FIRST = {first}
COUNT = {count}
EXECUTE 'GET.LIST ':LISTNAME
RECORDIDS = ''
I = 0
LOOP
  READNEXT RECORD.ID ELSE EXIT
  IF I >= FIRST THEN RECORDIDS = INSERT(RECORDIDS, -1, 0, 0, RECORD.ID)
  I += 1
WHILE I < FIRST + COUNT REPEAT
FORMLIST RECORDIDS TO 0
EXECUTE 'LIST ':LISTFILE:' ':FILEFIELDS:' TOXML'
"#,
        list = quote_string(query_id),
        file = quote_string(&config.file),
        fields = quote_string(&config.fields.join(" ")),
    )
}

pub(crate) fn render_status_program(config: &QueryConfig, query_id: &str) -> String {
    format!(
        r#"$BASICTYPE "U"
LISTFILE = {file}
FILEFIELDS = {fields}
QUERYID = {list}
BATCHSIZE = {batch_size}
{script}
EXECUTE SELECTSCRIPT
RECORDCOUNT = SYSTEM(11)
PRINT '|SELECTED|':RECORDCOUNT
IF RECORDCOUNT = 0 THEN
  PRINT '|DONE'
  STOP
END
EXECUTE 'SAVE.LIST ':QUERYID
EXECUTE 'GET.LIST ':QUERYID:' TO 1'
EXECUTE 'DELETE.LIST ':QUERYID
CURSOR = 0
BATCHI = 0
LOOP WHILE CURSOR < RECORDCOUNT DO
  RECORDIDS = ''
  LASTI = CURSOR + BATCHSIZE - 1
  IF LASTI > RECORDCOUNT - 1 THEN LASTI = RECORDCOUNT - 1
  LOOP WHILE CURSOR <= LASTI DO
    READNEXT RECORD.ID FROM 1 ELSE
      PRINT '|ERROR|failed to READNEXT for record number ':CURSOR
      STOP
    END
    RECORDIDS = INSERT(RECORDIDS, -1, 0, 0, RECORD.ID)
    CURSOR += 1
  REPEAT
  FORMLIST RECORDIDS TO 0
  OUTFILENAME = QUERYID:'_':BATCHI
  EXECUTE 'LIST ':LISTFILE:' ':FILEFIELDS:' TOXML TO ':OUTFILENAME
  PRINT '|RESULTBATCH|':BATCHI:'|{dir}':OUTFILENAME:'.xml'
  BATCHI += 1
REPEAT
PRINT '|DONE'
"#,
        file = quote_string(&config.file),
        fields = quote_string(&config.fields.join(" ")),
        list = quote_string(query_id),
        batch_size = config.effective_batch_size(),
        script = select_script(config),
        dir = RESULT_BATCH_DIR,
    )
}

// ------------- Status lines -------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Status {
    Selected(usize),
    ResultBatch { index: usize, path: String },
    Done,
    Error(String),
}

/// Lines not starting with `|`, and unknown markers such as `|DEBUG|`, are `None`.
pub(crate) fn parse_status(line: &str) -> Result<Option<Status>> {
    let Some(body) = line.strip_prefix('|') else {
        return Ok(None);
    };
    let parts: Vec<&str> = body.split('|').collect();
    let number = |i: usize| parts.get(i).and_then(|p| p.trim().parse::<usize>().ok());
    let malformed = || MvQueryError::protocol("malformed status line", line);
    match parts[0] {
        "SELECTED" => number(1).map(|n| Some(Status::Selected(n))).ok_or_else(malformed),
        "RESULTBATCH" => match (number(1), parts.get(2)) {
            (Some(index), Some(path)) => Ok(Some(Status::ResultBatch { index, path: path.trim().to_string() })),
            _ => Err(malformed()),
        },
        "DONE" => Ok(Some(Status::Done)),
        "ERROR" => Ok(Some(Status::Error(parts[1..].join("|")))),
        _ => Ok(None),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SelectOutput {
    Saved(usize),
    Empty,
    Rejected(String),
}

fn parse_select_output(text: &str) -> Result<SelectOutput> {
    if let Some(count) = parse_saved_list(text) {
        return Ok(SelectOutput::Saved(count));
    }
    for line in text.lines() {
        match parse_status(line.trim_end())? {
            Some(Status::Selected(0)) => return Ok(SelectOutput::Empty),
            Some(Status::Error(message)) => return Ok(SelectOutput::Rejected(message)),
            _ => {}
        }
    }
    Err(MvQueryError::Select {
        message: "no saved-list confirmation".into(),
        source: Some(Box::new(MvQueryError::protocol("expected 'N key(s) saved to M record(s).'", text))),
    })
}

fn select_error(e: MvQueryError) -> MvQueryError {
    match e {
        MvQueryError::Select { .. } => e,
        other => MvQueryError::Select { message: "selection aborted".into(), source: Some(Box::new(other)) },
    }
}

fn batch_error(index: usize, e: MvQueryError) -> MvQueryError {
    match e {
        MvQueryError::Batch { .. } => e,
        other => MvQueryError::Batch { index, source: Box::new(other) },
    }
}

// ------------- Engine -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Created,
    Selected,
    Paging,
    Exhausted,
    Failed,
    Closed,
}

struct ActiveBatch {
    index: usize,
    decoder: RecordDecoder<RemoteOutput>,
    expected: usize,
    seen: usize,
}

pub struct BatchedQuery {
    runner: ProgramRunner,
    config: QueryConfig,
    charset: Charset,
    query_id: String,
    state: QueryState,
    failure: Option<MvQueryError>,
    record_count: usize,
    cursor: usize,
    batches: usize,
    batch: Option<ActiveBatch>,
    // saved-list strategy
    list_saved: bool,
    // status-line strategy
    status_lines: Option<BufReader<RemoteOutput>>,
    status_eof: bool,
    // programs whose removal failed after a successful run
    leftover_programs: Vec<String>,
}

impl BatchedQuery {
    pub fn new(runner: ProgramRunner, config: QueryConfig) -> Result<Self> {
        if config.file.trim().is_empty() {
            return Err(MvQueryError::Usage("query file must not be blank".into()));
        }
        Ok(Self {
            runner,
            config,
            charset: Charset::default(),
            query_id: Uuid::new_v4().to_string(),
            state: QueryState::Created,
            failure: None,
            record_count: 0,
            cursor: 0,
            batches: 0,
            batch: None,
            list_saved: false,
            status_lines: None,
            status_eof: false,
            leftover_programs: Vec::new(),
        })
    }
    pub fn with_charset(mut self, charset: Charset) -> Self {
        self.charset = charset;
        self
    }
    /// Creates the query and runs the selection. On failure everything the
    /// selection left on the server is removed before the error is returned.
    pub fn start(runner: ProgramRunner, config: QueryConfig) -> Result<Self> {
        let mut query = Self::new(runner, config)?;
        if let Err(e) = query.select() {
            if let Err(cleanup) = query.close() {
                warn!(query = %query.query_id, error = %cleanup, "cleanup after failed select");
            }
            return Err(e);
        }
        Ok(query)
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }
    pub fn record_count(&self) -> usize {
        self.record_count
    }
    pub fn cursor(&self) -> usize {
        self.cursor
    }
    pub fn batches_fetched(&self) -> usize {
        self.batches
    }
    pub fn state(&self) -> QueryState {
        self.state
    }
    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    fn program_file(&self) -> String {
        self.runner.executor().env().program_file.clone()
    }
    fn program_name(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.query_id)
    }

    // Compiles, runs and removes one program. A removal failure after a
    // successful run is remembered for close().
    fn run_program(&mut self, name: &str, source: &str, args: &[&str]) -> Result<RemoteOutput> {
        let file = self.program_file();
        let outcome = self
            .runner
            .compile(&file, name, source)
            .and_then(|()| self.runner.run(&file, name, args));
        if let Err(e) = self.runner.remove(&file, name) {
            warn!(query = %self.query_id, program = name, error = %e, "generated program left on server");
            if outcome.is_ok() {
                self.leftover_programs.push(name.to_string());
            }
        }
        outcome
    }

    pub fn select(&mut self) -> Result<usize> {
        if self.state != QueryState::Created {
            return Err(MvQueryError::Usage(format!("select cannot run in state {:?}", self.state)));
        }
        let selected = match self.config.strategy {
            SelectStrategy::SavedList => self.select_saved_list(),
            SelectStrategy::StatusLines => self.select_status_lines(),
        };
        match selected {
            Ok(count) => {
                self.record_count = count;
                self.state = QueryState::Selected;
                info!(query = %self.query_id, file = %self.config.file, count, "selected records");
                Ok(count)
            }
            Err(e) => {
                let e = select_error(e);
                self.fail(e.clone());
                Err(e)
            }
        }
    }

    fn select_saved_list(&mut self) -> Result<usize> {
        let name = self.program_name("SEL");
        let source = render_select_program(&self.config, &self.query_id);
        let mut output = self.run_program(&name, &source, &[])?;
        let text = output.read_to_string_lossy();
        let closed = output.close();

        match text.and_then(|text| parse_select_output(&text)) {
            Ok(SelectOutput::Saved(count)) => {
                self.list_saved = true;
                closed?;
                Ok(count)
            }
            Ok(SelectOutput::Empty) => closed.map(|()| 0),
            Ok(SelectOutput::Rejected(message)) => Err(MvQueryError::Select { message, source: None }),
            Err(e) => {
                // SAVE.LIST may have run even though its confirmation was lost
                if let Err(cleanup) = self.runner.delete_saved_list(&self.query_id) {
                    warn!(query = %self.query_id, error = %cleanup, "could not delete unconfirmed saved list");
                }
                Err(e)
            }
        }
    }

    fn select_status_lines(&mut self) -> Result<usize> {
        let name = self.program_name("ETL");
        let source = render_status_program(&self.config, &self.query_id);
        // -N disables output paging
        let output = self.run_program(&name, &source, &["-N"])?;
        self.status_lines = Some(BufReader::new(output));
        match self.next_status()? {
            Some(Status::Selected(count)) => Ok(count),
            Some(Status::Error(message)) => Err(MvQueryError::Select { message, source: None }),
            Some(Status::Done) | None => {
                Err(MvQueryError::Select { message: "program ended without a SELECTED line".into(), source: None })
            }
            Some(Status::ResultBatch { .. }) => {
                Err(MvQueryError::Select { message: "RESULTBATCH before SELECTED".into(), source: None })
            }
        }
    }

    fn next_status(&mut self) -> Result<Option<Status>> {
        let Some(lines) = self.status_lines.as_mut() else {
            return Err(MvQueryError::Usage("no program output to read status lines from".into()));
        };
        if self.status_eof {
            return Ok(None);
        }
        let mut line = Vec::new();
        loop {
            line.clear();
            if lines.read_until(b'\n', &mut line)? == 0 {
                self.status_eof = true;
                return Ok(None);
            }
            let text = String::from_utf8_lossy(&line);
            if let Some(status) = parse_status(text.trim_end())? {
                return Ok(Some(status));
            }
        }
    }

    fn fetch_listing(&mut self, first: usize, count: usize) -> Result<RemoteOutput> {
        let name = self.program_name("LST");
        let source = render_listing_program(&self.config, &self.query_id, first, count);
        self.run_program(&name, &source, &[])
    }

    fn fetch_result_batch(&mut self, index: usize) -> Result<RemoteOutput> {
        loop {
            match self.next_status()? {
                Some(Status::ResultBatch { index: reported, path }) => {
                    if !path.starts_with(RESULT_BATCH_DIR) {
                        return Err(MvQueryError::protocol(
                            format!("result batch outside {RESULT_BATCH_DIR}"),
                            path,
                        ));
                    }
                    let opened = if reported != index {
                        Err(MvQueryError::protocol(format!("expected result batch {index}"), path.clone()))
                    } else {
                        self.runner.executor().retrieve_file(&path)
                    };
                    if opened.is_err() {
                        // the marker is consumed, so close() would never see this file
                        if let Err(e) = self.remove_result_batch(&path) {
                            warn!(query = %self.query_id, %path, error = %e, "failed to remove result batch");
                        }
                    }
                    return opened;
                }
                Some(Status::Error(message)) => return Err(MvQueryError::protocol("program reported an error", message)),
                Some(Status::Selected(_)) => {}
                Some(Status::Done) | None => {
                    return Err(MvQueryError::protocol(format!("expected RESULTBATCH {index}"), "end of program output"));
                }
            }
        }
    }

    fn next_batch(&mut self) -> Result<()> {
        let index = self.batches;
        let first = self.cursor;
        let count = self.config.effective_batch_size().min(self.record_count - self.cursor);
        debug!(query = %self.query_id, index, first, count, "fetching batch");
        let output = match self.config.strategy {
            SelectStrategy::SavedList => self.fetch_listing(first, count)?,
            SelectStrategy::StatusLines => self.fetch_result_batch(index)?,
        };
        self.batch = Some(ActiveBatch {
            index,
            decoder: RecordDecoder::with_charset(output, self.charset),
            expected: count,
            seen: 0,
        });
        self.batches += 1;
        self.cursor += count;
        self.state = QueryState::Paging;
        Ok(())
    }

    fn pull(&mut self) -> Result<Option<Record>> {
        loop {
            let Some(batch) = self.batch.as_mut() else {
                if self.cursor >= self.record_count {
                    self.state = QueryState::Exhausted;
                    return Ok(None);
                }
                let index = self.batches;
                self.next_batch().map_err(|e| batch_error(index, e))?;
                continue;
            };
            let index = batch.index;
            match batch.decoder.read_record() {
                Ok(Some(record)) => {
                    batch.seen += 1;
                    if batch.seen > batch.expected {
                        let message = format!("batch holds more than the {} records requested", batch.expected);
                        return Err(batch_error(index, MvQueryError::protocol(message, record.to_string())));
                    }
                    return Ok(Some(record));
                }
                Ok(None) => {
                    let (seen, expected) = (batch.seen, batch.expected);
                    let closed = match self.batch.take() {
                        Some(mut finished) => finished.decoder.close(),
                        None => Ok(()),
                    };
                    if seen < expected {
                        let message = format!("batch returned {seen} of {expected} records");
                        return Err(batch_error(index, MvQueryError::protocol(message, "")));
                    }
                    closed.map_err(|e| batch_error(index, e))?;
                    debug!(query = %self.query_id, index, seen, "batch exhausted");
                }
                Err(e) => return Err(batch_error(index, e)),
            }
        }
    }

    fn fail(&mut self, e: MvQueryError) {
        self.state = QueryState::Failed;
        self.failure = Some(e);
    }

    fn remove_result_batch(&self, relative: &str) -> Result<()> {
        let executor = self.runner.executor();
        executor.transport().remove(&executor.env().account_path(relative))
    }

    fn discard_status_output(&mut self) -> Result<()> {
        let mut first: Option<MvQueryError> = None;
        loop {
            match self.next_status() {
                Ok(Some(Status::ResultBatch { path, .. })) if path.starts_with(RESULT_BATCH_DIR) => {
                    if let Err(e) = self.remove_result_batch(&path) {
                        warn!(query = %self.query_id, %path, error = %e, "failed to remove result batch");
                        first.get_or_insert(e);
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(e) => {
                    first.get_or_insert(e);
                    break;
                }
            }
        }
        if let Some(mut lines) = self.status_lines.take() {
            if let Err(e) = lines.get_mut().close() {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

impl RecordReader for BatchedQuery {
    fn read_record(&mut self) -> Result<Option<Record>> {
        match self.state {
            QueryState::Closed => return Err(MvQueryError::Usage("query is closed".into())),
            QueryState::Created => return Err(MvQueryError::Usage("select has not run".into())),
            QueryState::Failed => {
                return Err(self.failure.clone().unwrap_or_else(|| MvQueryError::Usage("query failed".into())));
            }
            QueryState::Exhausted => return Ok(None),
            QueryState::Selected | QueryState::Paging => {}
        }
        self.pull().inspect_err(|e| self.fail(e.clone()))
    }

    /// Releases everything the query holds on the server. Every step is
    /// attempted; the first failure is returned. Closing twice is an error.
    fn close(&mut self) -> Result<()> {
        if self.state == QueryState::Closed {
            return Err(MvQueryError::Usage("query has already been closed".into()));
        }
        self.state = QueryState::Closed;
        let mut first: Option<MvQueryError> = None;
        let mut keep = |step: &str, result: Result<()>| {
            if let Err(e) = result {
                warn!(step, error = %e, "cleanup step failed");
                first.get_or_insert(e);
            }
        };

        if let Some(mut batch) = self.batch.take() {
            keep("close batch", batch.decoder.close());
        }
        if self.status_lines.is_some() {
            keep("discard result batches", self.discard_status_output());
        }
        if self.list_saved {
            self.list_saved = false;
            keep("delete saved list", self.runner.delete_saved_list(&self.query_id));
        }
        let file = self.program_file();
        for name in std::mem::take(&mut self.leftover_programs) {
            keep("remove program", self.runner.remove(&file, &name));
        }
        info!(query = %self.query_id, batches = self.batches, "query closed");
        first.map_or(Ok(()), Err)
    }
}

impl Drop for BatchedQuery {
    fn drop(&mut self) {
        if self.state != QueryState::Closed {
            if let Err(e) = self.close() {
                warn!(query = %self.query_id, error = %e, "cleanup on drop failed");
            }
        }
    }
}
