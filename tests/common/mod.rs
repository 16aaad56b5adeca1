#![allow(dead_code)]
//! An in-memory database host understanding just enough of the phantom
//! launcher, the compiler and the generated programs to drive the driver
//! end to end.

use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex, MutexGuard};

use mvquery::config::RemoteEnv;
use mvquery::error::{MvQueryError, Result};
use mvquery::phantom::PhantomExecutor;
use mvquery::program::ProgramRunner;
use mvquery::transport::{CommandOutput, Transport};

pub const ACCOUNT: &str = "/data/demo";
pub const HOME: &str = "/usr/ud82";
pub const BIN: &str = "/usr/ud82/bin";

/// Misbehaviour to inject.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Programs whose name starts with this prefix fail to compile.
    pub compile_error: Option<&'static str>,
    /// Select programs print `|ERROR|<message>`.
    pub select_error: Option<String>,
    /// The batch with this index is missing its last record.
    pub short_batch: Option<usize>,
    /// The batch with this index carries one record too many.
    pub long_batch: Option<usize>,
    pub missing_banner: bool,
    pub wait_status: Option<i32>,
    /// The status line for this batch reports the next index.
    pub misnumber_batch: Option<usize>,
    /// The select program saves its list but prints no confirmation.
    pub garbled_select: bool,
    /// Result batches are written outside `_XML_/`.
    pub escape_batch_dir: bool,
    /// Removing any path containing this fails.
    pub fail_remove: Option<&'static str>,
}

#[derive(Default)]
struct State {
    files: BTreeMap<String, Vec<u8>>,
    lines: Vec<String>,
    commands: Vec<String>,
    removed: Vec<String>,
    saved_lists: HashMap<String, Vec<usize>>,
    selects: Vec<Vec<String>>,
    listings: Vec<(usize, usize)>,
    next_pid: u32,
    faults: Faults,
}

pub struct SimulatedServer {
    file: String,
    records: Vec<String>,
    state: Mutex<State>,
}

pub fn path(relative: &str) -> String {
    format!("{ACCOUNT}/{relative}")
}

pub fn env() -> RemoteEnv {
    RemoteEnv::new(BIN, HOME, ACCOUNT)
}

/// `<ORDERS>` records with one order line each.
pub fn order_records(count: usize) -> Vec<String> {
    (1..=count)
        .map(|i| {
            format!(
                r#"<ORDERS _ID="{i}" ORD_DATE="10/25/2000"><LINE_MV PRODUCT_NO="P{i}"><QTY>{i}</QTY></LINE_MV></ORDERS>"#
            )
        })
        .collect()
}

impl SimulatedServer {
    pub fn new(file: &str, records: Vec<String>) -> Arc<Self> {
        Arc::new(Self { file: file.to_string(), records, state: Mutex::new(State::default()) })
    }
    pub fn orders(count: usize) -> Arc<Self> {
        Self::new("ORDERS", order_records(count))
    }
    pub fn with_faults(self: Arc<Self>, faults: Faults) -> Arc<Self> {
        self.lock().faults = faults;
        self
    }

    pub fn executor(self: &Arc<Self>) -> PhantomExecutor {
        let transport: Arc<dyn Transport> = self.clone();
        PhantomExecutor::new(transport, env()).expect("valid env")
    }
    pub fn runner(self: &Arc<Self>) -> ProgramRunner {
        ProgramRunner::new(self.executor())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("server state")
    }
    /// Raw command lines handed to the transport.
    pub fn lines(&self) -> Vec<String> {
        self.lock().lines.clone()
    }
    /// Commands run as phantoms, shell quoting removed.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }
    pub fn commands_starting(&self, prefix: &str) -> Vec<String> {
        self.commands().into_iter().filter(|c| c.starts_with(prefix)).collect()
    }
    pub fn removed(&self) -> Vec<String> {
        self.lock().removed.clone()
    }
    pub fn files(&self) -> Vec<String> {
        self.lock().files.keys().cloned().collect()
    }
    pub fn saved_lists(&self) -> Vec<String> {
        self.lock().saved_lists.keys().cloned().collect()
    }
    /// Statements each select program ran, after evaluating their quoting.
    pub fn selects(&self) -> Vec<Vec<String>> {
        self.lock().selects.clone()
    }
    /// `(first, count)` of every listing program run.
    pub fn listings(&self) -> Vec<(usize, usize)> {
        self.lock().listings.clone()
    }
    pub fn put_file(&self, relative: &str, contents: &str) {
        self.lock().files.insert(path(relative), contents.as_bytes().to_vec());
    }

    fn document(&self, indices: &[usize]) -> String {
        let mut doc = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<ROOT>\n");
        for &i in indices {
            doc += &self.records[i];
            doc.push('\n');
        }
        doc + "</ROOT>\n"
    }

    fn execute(&self, state: &mut State, cmd: &str) -> String {
        let words: Vec<&str> = cmd.split_whitespace().collect();
        match words.as_slice() {
            ["BASIC", file, name] => self.compile(state, file, name),
            ["RUN", file, name, ..] => self.run_program(state, file, name),
            ["DELETELIST", ..] => {
                let list = evaluate(cmd["DELETELIST".len()..].trim());
                match state.saved_lists.remove(&list) {
                    Some(_) => format!("'{list}' deleted.\n"),
                    None => format!("'{list}' not found.\n"),
                }
            }
            ["LIST", ..] => {
                let all: Vec<usize> = (0..self.records.len()).collect();
                self.document(&all)
            }
            [] => String::new(),
            [verb, ..] => format!("Verb \"{verb}\" is not in your VOC.\n"),
        }
    }

    fn compile(&self, state: &mut State, file: &str, name: &str) -> String {
        if !state.files.contains_key(&path(&format!("{file}/{name}"))) {
            return format!("Cannot open {file}/{name}\n");
        }
        let banner = format!("Compiling Unibasic: {file}/{name} in mode 'u'.\n");
        if state.faults.compile_error.is_some_and(|prefix| name.starts_with(prefix)) {
            return banner + "syntax error at or before line 3\n";
        }
        state.files.insert(path(&format!("{file}/_{name}")), b"object".to_vec());
        banner + "compilation finished\n"
    }

    fn run_program(&self, state: &mut State, file: &str, name: &str) -> String {
        if !state.files.contains_key(&path(&format!("{file}/_{name}"))) {
            return format!("Program '_{name}' not found.\n");
        }
        let source = String::from_utf8_lossy(&state.files[&path(&format!("{file}/{name}"))]).into_owned();
        let vars = assignments(&source);
        let var = |key: &str| vars.get(key).cloned().unwrap_or_default();
        let number = |key: &str| var(key).parse::<usize>().expect("numeric parameter");

        if name.starts_with("SEL-") {
            state.selects.push(select_statements(&source));
            if let Some(message) = &state.faults.select_error {
                return format!("|ERROR|{message}\n");
            }
            if self.records.is_empty() {
                return "|SELECTED|0\n".to_string();
            }
            let ids: Vec<usize> = (0..self.records.len()).collect();
            let count = ids.len();
            state.saved_lists.insert(var("LISTNAME"), ids);
            if state.faults.garbled_select {
                return "Record locked by another user\n".to_string();
            }
            format!("\n{count} key(s) saved to 1 record(s).\n")
        } else if name.starts_with("LST-") {
            let Some(ids) = state.saved_lists.get(&var("LISTNAME")).cloned() else {
                return "List not found.\n".to_string();
            };
            assert_eq!(var("LISTFILE"), self.file, "listing targets the selected file");
            let (first, count) = (number("FIRST"), number("COUNT"));
            let batch = state.listings.len();
            state.listings.push((first, count));
            let end = (first + count).min(ids.len());
            let mut slice = ids[first..end].to_vec();
            if state.faults.short_batch == Some(batch) {
                slice.pop();
            }
            if state.faults.long_batch == Some(batch) {
                slice.push(ids[0]);
            }
            format!("{} records retrieved to list 0.\n{}", slice.len(), self.document(&slice))
        } else if name.starts_with("ETL-") {
            state.selects.push(select_statements(&source));
            if let Some(message) = &state.faults.select_error {
                return format!("|ERROR|{message}\n");
            }
            let count = self.records.len();
            let mut out = format!("|DEBUG|select done\n|SELECTED|{count}\n");
            let ids: Vec<usize> = (0..count).collect();
            let query_id = var("QUERYID");
            for (i, chunk) in ids.chunks(number("BATCHSIZE")).enumerate() {
                let mut chunk = chunk.to_vec();
                if state.faults.short_batch == Some(i) {
                    chunk.pop();
                }
                let relative = if state.faults.escape_batch_dir {
                    format!("{query_id}_{i}.xml")
                } else {
                    format!("_XML_/{query_id}_{i}.xml")
                };
                state.files.insert(path(&relative), self.document(&chunk).into_bytes());
                let reported = if state.faults.misnumber_batch == Some(i) { i + 1 } else { i };
                out += &format!("|RESULTBATCH|{reported}|{relative}\n");
            }
            out + "|DONE\n"
        } else {
            format!("{name} ran\n")
        }
    }
}

impl Transport for SimulatedServer {
    fn run(&self, command_line: &str) -> Result<CommandOutput> {
        let mut state = self.lock();
        state.lines.push(command_line.to_string());
        if command_line.starts_with("/usr/bin/wait ") {
            let status = state.faults.wait_status.unwrap_or(127);
            return Ok(CommandOutput { status, ..CommandOutput::default() });
        }
        let marker = "/udt PHANTOM ";
        let Some(at) = command_line.find(marker) else {
            return Ok(CommandOutput { status: 127, stderr: b"sh: command not found\n".to_vec(), ..CommandOutput::default() });
        };
        let cmd = shell_unquote(&command_line[at + marker.len()..]);
        state.commands.push(cmd.clone());
        if state.faults.missing_banner {
            return Ok(CommandOutput { status: 1, stderr: b"udt: license limit reached\n".to_vec(), ..CommandOutput::default() });
        }
        state.next_pid += 1;
        let pid = 4100 + state.next_pid;
        let output = self.execute(&mut state, &cmd);
        let como = format!("_PH_/dbuser{pid}_{}", state.next_pid * 7);
        state
            .files
            .insert(path(&como), format!("{output}PHANTOM process {pid} has completed.\n").into_bytes());
        Ok(CommandOutput {
            status: 0,
            stdout: Vec::new(),
            stderr: format!("PHANTOM process {pid} started.\nCOMO file is '{como}'.\n").into_bytes(),
        })
    }

    fn write(&self, path: &str, contents: &[u8]) -> Result<()> {
        self.lock().files.insert(path.to_string(), contents.to_vec());
        Ok(())
    }

    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        match self.lock().files.get(path) {
            Some(bytes) => Ok(Box::new(Cursor::new(bytes.clone()))),
            None => Err(MvQueryError::Transport(format!("no such file: {path}"))),
        }
    }

    fn remove(&self, path: &str) -> Result<()> {
        let mut state = self.lock();
        if state.faults.fail_remove.is_some_and(|part| path.contains(part)) {
            return Err(MvQueryError::Transport(format!("permission denied: {path}")));
        }
        match state.files.remove(path) {
            Some(_) => {
                state.removed.push(path.to_string());
                Ok(())
            }
            None => Err(MvQueryError::Transport(format!("no such file: {path}"))),
        }
    }
}

/// Undoes POSIX single-quote escaping.
pub fn shell_unquote(word: &str) -> String {
    let mut out = String::new();
    let mut quoted = false;
    let mut chars = word.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => quoted = !quoted,
            '\\' if !quoted => out.extend(chars.next()),
            c => out.push(c),
        }
    }
    out
}

/// Evaluates a concatenation of `'...'` and `"..."` literals joined by `:`,
/// or a bare number.
pub fn evaluate(expr: &str) -> String {
    let mut out = String::new();
    let mut chars = expr.trim().chars().peekable();
    while let Some(delim) = chars.next() {
        if delim != '\'' && delim != '"' {
            out.push(delim);
            continue;
        }
        for c in chars.by_ref() {
            if c == delim {
                break;
            }
            out.push(c);
        }
        if chars.peek() == Some(&':') {
            chars.next();
        }
    }
    out
}

// `NAME = <literal>` lines of a generated program.
fn assignments(source: &str) -> HashMap<String, String> {
    source
        .lines()
        .filter_map(|line| line.split_once(" = "))
        .filter(|(name, expr)| {
            name.chars().all(|c| c.is_ascii_uppercase() || c == '.' || c == '_')
                && expr.starts_with(|c: char| c == '\'' || c == '"' || c.is_ascii_digit())
        })
        .map(|(name, expr)| (name.to_string(), evaluate(expr)))
        .collect()
}

fn select_statements(source: &str) -> Vec<String> {
    source
        .lines()
        .filter_map(|line| line.strip_prefix("SELECTSCRIPT = INSERT(SELECTSCRIPT, -1, 0, 0, "))
        .filter_map(|rest| rest.strip_suffix(')'))
        .map(evaluate)
        .collect()
}
