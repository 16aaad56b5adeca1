use std::collections::BTreeMap;
use std::fmt;
use std::io::{Cursor, Read};

use serde::Serialize;

use crate::error::Result;

// ------------- Value -------------
/// A field value is either plain element text or an ordered list of nested
/// groups (multivalue groups at record level, subvalue groups inside those).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Scalar(String),
    Groups(Vec<Record>),
}

impl Value {
    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            Value::Scalar(s) => Some(s),
            Value::Groups(_) => None,
        }
    }
    pub fn as_groups(&self) -> Option<&[Record]> {
        match self {
            Value::Scalar(_) => None,
            Value::Groups(groups) => Some(groups),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Scalar(s.to_string())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Scalar(s)
    }
}
impl From<Vec<Record>> for Value {
    fn from(groups: Vec<Record>) -> Self {
        Value::Groups(groups)
    }
}

// ------------- Record -------------
/// Field name to value. Used for whole records and for every nested group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Record {
    fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
    pub fn scalar(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_scalar)
    }
    pub fn groups(&self, name: &str) -> Option<&[Record]> {
        self.get(name).and_then(Value::as_groups)
    }
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(name.into(), value.into())
    }
    pub fn groups_mut(&mut self, name: &str) -> Option<&mut Vec<Record>> {
        match self.fields.get_mut(name) {
            Some(Value::Groups(groups)) => Some(groups),
            _ => None,
        }
    }
    /// Group list stored under `name`, created empty if absent. `None` when
    /// `name` already holds a scalar.
    pub fn entry_groups(&mut self, name: &str) -> Option<&mut Vec<Record>> {
        match self
            .fields
            .entry(name.to_string())
            .or_insert_with(|| Value::Groups(Vec::new()))
        {
            Value::Groups(groups) => Some(groups),
            Value::Scalar(_) => None,
        }
    }
    pub fn len(&self) -> usize {
        self.fields.len()
    }
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => write!(f, "{json}"),
            Err(_) => write!(f, "{:?}", self.fields),
        }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

// ------------- Reader contract -------------
/// Pull-based access to a sequence of records, the same for a single query
/// and a batched one.
pub trait RecordReader {
    /// `Ok(None)` marks the end of the sequence.
    fn read_record(&mut self) -> Result<Option<Record>>;
    fn close(&mut self) -> Result<()>;

    fn records(&mut self) -> Records<'_, Self>
    where
        Self: Sized,
    {
        Records { reader: self, done: false }
    }
}

pub struct Records<'r, R: RecordReader> {
    reader: &'r mut R,
    done: bool,
}

impl<R: RecordReader> Iterator for Records<'_, R> {
    type Item = Result<Record>;
    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// A byte stream whose release may itself fail, e.g. because closing it
/// deletes a remote file.
pub trait ByteSource: Read {
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl ByteSource for &[u8] {}
impl<T: AsRef<[u8]>> ByteSource for Cursor<T> {}
