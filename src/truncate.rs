//! Online removal of a known trailer from the end of a byte stream.
//!
//! The phantom runtime appends a completion banner to every output file. The
//! banner must disappear from what callers read, but only when it really is
//! the last thing in the file: the same bytes showing up earlier are data.
//! [`TruncatingReader`] therefore holds back at most `pattern.len()` bytes and
//! decides what to do with them once the inner reader reports end of stream.

use std::io::{self, Read};

#[derive(Debug, PartialEq, Eq)]
enum Phase {
    Streaming,
    // inner reader is exhausted; what is left in `held` is being handed out
    Draining { pos: usize },
    Finished,
}

#[derive(Debug)]
pub struct TruncatingReader<R> {
    inner: R,
    pattern: Vec<u8>,
    held: Vec<u8>,
    phase: Phase,
}

impl<R: Read> TruncatingReader<R> {
    pub fn new(inner: R, pattern: impl Into<Vec<u8>>) -> Self {
        let pattern = pattern.into();
        Self {
            inner,
            held: Vec::with_capacity(pattern.len()),
            pattern,
            phase: Phase::Streaming,
        }
    }
    pub fn pattern(&self) -> &[u8] {
        &self.pattern
    }
    pub fn get_ref(&self) -> &R {
        &self.inner
    }
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }
    pub fn into_inner(self) -> R {
        self.inner
    }

    // `held` plus the first `n` bytes of `buf` form one contiguous run. Everything
    // but its last `pattern.len()` bytes is released into the front of `buf`.
    fn release(&mut self, buf: &mut [u8], n: usize) -> usize {
        let keep = self.pattern.len();
        let total = self.held.len() + n;
        if total <= keep {
            self.held.extend_from_slice(&buf[..n]);
            return 0;
        }
        let out = total - keep;
        if n >= keep {
            let tail = buf[n - keep..n].to_vec();
            let h = self.held.len();
            buf.copy_within(0..n - keep, h);
            buf[..h].copy_from_slice(&self.held);
            self.held = tail;
        } else {
            // out < held.len() here, so the released bytes all come from `held`
            let mut next = Vec::with_capacity(keep);
            next.extend_from_slice(&self.held[out..]);
            next.extend_from_slice(&buf[..n]);
            buf[..out].copy_from_slice(&self.held[..out]);
            self.held = next;
        }
        out
    }
}

impl<R: Read> Read for TruncatingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.phase {
                Phase::Finished => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "read past the end of a truncated stream",
                    ));
                }
                Phase::Draining { pos } => {
                    let left = &self.held[pos..];
                    if left.is_empty() {
                        self.phase = Phase::Finished;
                        self.held.clear();
                        return Ok(0);
                    }
                    let n = left.len().min(buf.len());
                    buf[..n].copy_from_slice(&left[..n]);
                    self.phase = Phase::Draining { pos: pos + n };
                    return Ok(n);
                }
                Phase::Streaming => {
                    let n = self.inner.read(buf)?;
                    if n == 0 {
                        if self.held == self.pattern {
                            self.held.clear();
                        }
                        self.phase = Phase::Draining { pos: 0 };
                        continue;
                    }
                    let out = self.release(buf, n);
                    if out > 0 {
                        return Ok(out);
                    }
                }
            }
        }
    }
}
