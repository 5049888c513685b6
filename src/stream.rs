//! Streaming primitives shared by the backup and restore pipelines
//!
//! [`LineSplitter`] turns arbitrary byte chunks into numbered text lines,
//! splitting on `\n` only. [`Batcher`] accumulates items and cuts batches at
//! a fixed capacity. Concurrency-bounded mapping over these is composed with
//! `futures::StreamExt::buffer_unordered` at the pipeline call sites.

use crate::error::{Error, Result};
use std::borrow::Cow;

/// A line of input with its 1-based position
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NumberedLine {
    /// 1-based line number
    pub number: u64,
    /// Line content, without the terminating `\n`
    pub text: String,
}

/// Incremental `\n`-only line splitter with a 1-based line counter
///
/// JSON permits raw U+2028/U+2029 inside strings, and historically some
/// line-oriented readers have treated those code points as terminators.
/// This splitter never does; with [`LineSplitter::sanitizing`] it
/// additionally escapes them inside yielded lines so downstream
/// line-separator-sensitive consumers stay safe.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: Vec<u8>,
    lines_read: u64,
    sanitize: bool,
}

impl LineSplitter {
    /// Create a splitter that yields lines verbatim
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a splitter that escapes U+2028/U+2029 within yielded lines
    pub fn sanitizing() -> Self {
        Self {
            sanitize: true,
            ..Self::default()
        }
    }

    /// Number of complete lines yielded so far, for diagnostics
    pub fn lines_read(&self) -> u64 {
        self.lines_read
    }

    /// Feed a chunk of bytes, returning every line completed by it.
    ///
    /// A multi-byte UTF-8 sequence can straddle chunk boundaries; decoding
    /// happens per complete line, where `\n` cannot fall inside a sequence.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<NumberedLine>> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let rest = self.buf.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.buf, rest);
            line.pop(); // the '\n'
            lines.push(self.make_line(line)?);
        }
        Ok(lines)
    }

    /// Yield the unterminated tail, if any, once the input is exhausted.
    pub fn finish(&mut self) -> Result<Option<NumberedLine>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let tail = std::mem::take(&mut self.buf);
        Ok(Some(self.make_line(tail)?))
    }

    fn make_line(&mut self, bytes: Vec<u8>) -> Result<NumberedLine> {
        let text = String::from_utf8(bytes).map_err(|e| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid UTF-8 on line {}: {e}", self.lines_read + 1),
            ))
        })?;
        self.lines_read += 1;
        let text = if self.sanitize {
            escape_line_separators(&text).into_owned()
        } else {
            text
        };
        Ok(NumberedLine {
            number: self.lines_read,
            text,
        })
    }
}

/// Escape U+2028/U+2029 as JSON `\uXXXX` sequences.
///
/// Borrows unchanged input; allocates only when an escape is needed.
pub fn escape_line_separators(s: &str) -> Cow<'_, str> {
    if !s.contains(['\u{2028}', '\u{2029}']) {
        return Cow::Borrowed(s);
    }
    let mut out = String::with_capacity(s.len() + 10);
    for c in s.chars() {
        match c {
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            other => out.push(other),
        }
    }
    Cow::Owned(out)
}

/// Accumulates items and cuts batches of a fixed capacity
#[derive(Debug)]
pub struct Batcher<T> {
    capacity: usize,
    buf: Vec<T>,
}

impl<T> Batcher<T> {
    /// Create a batcher cutting batches of `capacity` items
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            buf: Vec::with_capacity(capacity.max(1)),
        }
    }

    /// Add an item; returns a full batch when capacity is reached.
    pub fn push(&mut self, item: T) -> Option<Vec<T>> {
        self.buf.push(item);
        if self.buf.len() >= self.capacity {
            Some(std::mem::replace(
                &mut self.buf,
                Vec::with_capacity(self.capacity),
            ))
        } else {
            None
        }
    }

    /// Yield the partial final batch, if any, once the input is exhausted.
    pub fn finish(&mut self) -> Option<Vec<T>> {
        if self.buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buf))
        }
    }

    /// Items currently buffered
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
