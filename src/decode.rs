//! Streaming decoder for the XML produced by `LIST ... TOXML`.
//!
//! The document looks like
//! ```text
//! <ROOT>
//!   <ORDERS _ID="1">
//!     <ORD_DATE>10/25/2000</ORD_DATE>
//!     <LINE_MV ITEM="A1">
//!       <QTY>2</QTY>
//!       <SERIAL_MS SERIAL="S-1"/>
//!     </LINE_MV>
//!   </ORDERS>
//! </ROOT>
//! ```
//! The record element's name is whatever the first child of the root is
//! called. Elements ending in `_MV` open a multivalue group, elements ending
//! in `_MS` open a subvalue group inside one. Attributes merge into the
//! mapping of the level they appear on.
//!
//! The decoder pulls one token at a time from `quick_xml` and never holds more
//! than the record being assembled.

use std::io::{self, BufReader, Read};

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde::Deserialize;

use crate::error::{MvQueryError, Result};
use crate::record::{ByteSource, Record, RecordReader};

pub const MULTIVALUE_SUFFIX: &str = "_MV";
pub const SUBVALUE_SUFFIX: &str = "_MS";

// ------------- Charset -------------
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Charset {
    /// ISO-8859-1, every byte is the code point of the same value.
    #[default]
    Latin1,
    Utf8,
}

/// Transcodes the underlying bytes to UTF-8 on the fly.
pub struct CharsetReader<R> {
    inner: R,
    charset: Charset,
    scratch: Vec<u8>,
    // continuation byte of a two-byte sequence that did not fit the last read
    pending: Option<u8>,
    // the inner reader may not be read again once it reported end of stream
    eof: bool,
}

impl<R: Read> CharsetReader<R> {
    pub fn new(inner: R, charset: Charset) -> Self {
        Self { inner, charset, scratch: vec![0; 4096], pending: None, eof: false }
    }
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }
}

impl<R: Read> Read for CharsetReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || (self.eof && self.pending.is_none()) {
            return Ok(0);
        }
        if self.charset == Charset::Utf8 {
            let n = self.inner.read(buf)?;
            self.eof = n == 0;
            return Ok(n);
        }
        let mut n = 0;
        if let Some(b) = self.pending.take() {
            buf[0] = b;
            n = 1;
            if buf.len() == 1 || self.eof {
                return Ok(1);
            }
        }
        let want = ((buf.len() - n) / 2).clamp(1, self.scratch.len());
        let m = self.inner.read(&mut self.scratch[..want])?;
        self.eof = m == 0;
        for &b in &self.scratch[..m] {
            if b < 0x80 {
                buf[n] = b;
                n += 1;
            } else {
                buf[n] = 0xC0 | (b >> 6);
                n += 1;
                let continuation = 0x80 | (b & 0x3F);
                if n < buf.len() {
                    buf[n] = continuation;
                    n += 1;
                } else {
                    self.pending = Some(continuation);
                }
            }
        }
        Ok(n)
    }
}

// ------------- Tokens -------------
enum Token {
    Open { name: String, attrs: Vec<(String, String)>, empty: bool },
    Close(String),
    Text(String),
    Eof,
}

fn utf8_name(bytes: &[u8]) -> Result<String> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| MvQueryError::Xml(format!("element name is not valid UTF-8: {e}")))
}

fn attributes(e: &BytesStart) -> Result<Vec<(String, String)>> {
    e.attributes()
        .map(|attr| {
            let attr = attr?;
            Ok((utf8_name(attr.key.local_name().as_ref())?, attr.unescape_value()?.into_owned()))
        })
        .collect()
}

fn is_multivalue(name: &str) -> bool {
    name.ends_with(MULTIVALUE_SUFFIX)
}
fn is_subvalue(name: &str) -> bool {
    name.ends_with(SUBVALUE_SUFFIX)
}

fn group_from(attrs: Vec<(String, String)>) -> Record {
    attrs.into_iter().collect()
}

fn push_group(into: &mut Record, name: &str, group: Record) -> Result<()> {
    match into.entry_groups(name) {
        Some(groups) => {
            groups.push(group);
            Ok(())
        }
        None => Err(MvQueryError::structure(name, "field already holds a scalar value")),
    }
}

fn open_group<'a>(record: &'a mut Record, name: &str) -> Result<&'a mut Record> {
    record
        .groups_mut(name)
        .and_then(|groups| groups.last_mut())
        .ok_or_else(|| MvQueryError::structure(name, "group is not open"))
}

// ------------- Decoder -------------
#[derive(Debug)]
enum Phase {
    // before the root element
    Prolog,
    // between records
    Root,
    Finished,
    Errored(MvQueryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Nesting {
    InRecord,
    InMultiValueGroup,
    InSubValueGroup,
}

pub struct RecordDecoder<S: ByteSource> {
    reader: Reader<BufReader<CharsetReader<S>>>,
    buf: Vec<u8>,
    phase: Phase,
    root: Option<String>,
    record_tag: Option<String>,
    closed: bool,
}

impl<S: ByteSource> RecordDecoder<S> {
    pub fn new(source: S) -> Self {
        Self::with_charset(source, Charset::default())
    }
    pub fn with_charset(source: S, charset: Charset) -> Self {
        let mut reader = Reader::from_reader(BufReader::new(CharsetReader::new(source, charset)));
        // nesting is checked here so the error can name the offending tag
        reader.config_mut().check_end_names = false;
        Self {
            reader,
            buf: Vec::new(),
            phase: Phase::Prolog,
            root: None,
            record_tag: None,
            closed: false,
        }
    }
    /// Name of the record element, known once the first record was seen.
    pub fn record_tag(&self) -> Option<&str> {
        self.record_tag.as_deref()
    }

    fn next_token(&mut self) -> Result<Token> {
        loop {
            self.buf.clear();
            let token = match self.reader.read_event_into(&mut self.buf)? {
                Event::Start(e) => Token::Open {
                    name: utf8_name(e.local_name().as_ref())?,
                    attrs: attributes(&e)?,
                    empty: false,
                },
                Event::Empty(e) => Token::Open {
                    name: utf8_name(e.local_name().as_ref())?,
                    attrs: attributes(&e)?,
                    empty: true,
                },
                Event::End(e) => Token::Close(utf8_name(e.local_name().as_ref())?),
                // program chatter ahead of the document is not XML text
                Event::Text(_) if matches!(self.phase, Phase::Prolog) => continue,
                Event::Text(e) => Token::Text(e.unescape()?.into_owned()),
                Event::CData(e) => Token::Text(
                    String::from_utf8(e.into_inner().into_owned())
                        .map_err(|e| MvQueryError::Xml(format!("CDATA is not valid UTF-8: {e}")))?,
                ),
                Event::Eof => Token::Eof,
                _ => continue,
            };
            return Ok(token);
        }
    }

    fn read_text(&mut self, field: &str) -> Result<String> {
        let mut text = String::new();
        loop {
            match self.next_token()? {
                Token::Text(t) => text.push_str(&t),
                Token::Close(name) if name == field => return Ok(text),
                Token::Close(name) => {
                    return Err(MvQueryError::structure(name, format!("expected </{field}>")));
                }
                Token::Open { name, .. } => {
                    return Err(MvQueryError::structure(name, format!("element inside scalar field <{field}>")));
                }
                Token::Eof => return Err(MvQueryError::UnexpectedEof),
            }
        }
    }

    fn scalar(&mut self, name: &str, empty: bool) -> Result<String> {
        if empty { Ok(String::new()) } else { self.read_text(name) }
    }

    fn read_body(&mut self, tag: &str, mut record: Record) -> Result<Record> {
        let mut nesting = Nesting::InRecord;
        let mut multivalue = String::new();
        let mut subvalue = String::new();
        loop {
            match self.next_token()? {
                Token::Open { name, attrs, empty } => match nesting {
                    Nesting::InRecord if is_multivalue(&name) => {
                        push_group(&mut record, &name, group_from(attrs))?;
                        if !empty {
                            nesting = Nesting::InMultiValueGroup;
                            multivalue = name;
                        }
                    }
                    Nesting::InRecord if is_subvalue(&name) => {
                        return Err(MvQueryError::structure(name, "subvalue group outside a multivalue group"));
                    }
                    Nesting::InRecord => {
                        let text = self.scalar(&name, empty)?;
                        record.insert(name, text);
                    }
                    Nesting::InMultiValueGroup if is_subvalue(&name) => {
                        let group = open_group(&mut record, &multivalue)?;
                        push_group(group, &name, group_from(attrs))?;
                        if !empty {
                            nesting = Nesting::InSubValueGroup;
                            subvalue = name;
                        }
                    }
                    Nesting::InMultiValueGroup if is_multivalue(&name) => {
                        return Err(MvQueryError::structure(
                            name,
                            format!("multivalue group nested inside <{multivalue}>"),
                        ));
                    }
                    Nesting::InMultiValueGroup => {
                        let text = self.scalar(&name, empty)?;
                        open_group(&mut record, &multivalue)?.insert(name, text);
                    }
                    Nesting::InSubValueGroup if is_multivalue(&name) || is_subvalue(&name) => {
                        return Err(MvQueryError::structure(
                            name,
                            format!("group nested inside subvalue group <{subvalue}>"),
                        ));
                    }
                    Nesting::InSubValueGroup => {
                        let text = self.scalar(&name, empty)?;
                        let group = open_group(&mut record, &multivalue)?;
                        open_group(group, &subvalue)?.insert(name, text);
                    }
                },
                Token::Close(name) => match nesting {
                    Nesting::InRecord if name == tag => return Ok(record),
                    Nesting::InMultiValueGroup if name == multivalue => nesting = Nesting::InRecord,
                    Nesting::InSubValueGroup if name == subvalue => nesting = Nesting::InMultiValueGroup,
                    _ => {
                        return Err(MvQueryError::structure(name, "closing tag does not match the open element"));
                    }
                },
                Token::Text(_) => {}
                Token::Eof => return Err(MvQueryError::UnexpectedEof),
            }
        }
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            match self.next_token()? {
                Token::Open { name, attrs, empty } => match self.phase {
                    Phase::Prolog => {
                        self.root = Some(name);
                        if empty {
                            self.phase = Phase::Finished;
                            return Ok(None);
                        }
                        self.phase = Phase::Root;
                    }
                    _ => {
                        let tag = self.record_tag.get_or_insert_with(|| name.clone()).clone();
                        if name != tag {
                            return Err(MvQueryError::structure(name, format!("expected record element <{tag}>")));
                        }
                        let record = group_from(attrs);
                        if empty {
                            return Ok(Some(record));
                        }
                        return self.read_body(&tag, record).map(Some);
                    }
                },
                Token::Close(name) => {
                    if matches!(self.phase, Phase::Root) && self.root.as_deref() == Some(name.as_str()) {
                        self.phase = Phase::Finished;
                        return Ok(None);
                    }
                    return Err(MvQueryError::structure(name, "closing tag does not match the open element"));
                }
                Token::Text(_) => {}
                Token::Eof if matches!(self.phase, Phase::Prolog) => {
                    self.phase = Phase::Finished;
                    return Ok(None);
                }
                Token::Eof => return Err(MvQueryError::UnexpectedEof),
            }
        }
    }
}

impl<S: ByteSource> RecordReader for RecordDecoder<S> {
    fn read_record(&mut self) -> Result<Option<Record>> {
        match &self.phase {
            Phase::Errored(e) => return Err(e.clone()),
            _ if self.closed => return Err(MvQueryError::Usage("record decoder is closed".into())),
            Phase::Finished => return Ok(None),
            Phase::Prolog | Phase::Root => {}
        }
        self.next_record().inspect_err(|e| self.phase = Phase::Errored(e.clone()))
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.reader.get_mut().get_mut().get_mut().close()
    }
}
