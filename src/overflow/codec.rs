//! Overflow log chunk grammar
//!
//! The overflow log is plain text. Each failed batch becomes one chunk:
//!
//! ```text
//! #connection reset by peer            <- comment lines describe the failure
//! #failed at 2024-01-01T00:00:00.000Z
//! 5;10;7;1000;1.2.3.4;a=1&b=2          <- one canonical line per event
//! 6;10;7;1001;1.2.3.4;
//! #next failure ...                    <- a comment after events starts a new chunk
//! ```
//!
//! Blank lines are ignored. A chunk without events ends the log, so comments
//! left dangling at the end of a file (an interrupted append) are not data.
//! Nothing here touches the filesystem.

use std::error::Error;
use std::fmt;
use std::io::{self, Write};
use std::iter::{Enumerate, Peekable};
use std::str::Lines;

use thiserror::Error;

use crate::types::{AccessEvent, EventCodecError};

/// Marks a line as a non-data comment
pub const COMMENT_PREFIX: char = '#';

/// Errors produced while parsing an overflow log
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkCodecError {
    #[error("malformed event on line {line}: {source}")]
    MalformedLine {
        /// 1-based line number in the parsed text
        line: usize,
        #[source]
        source: EventCodecError,
    },
}

/// Result type for chunk parsing
pub type ChunkCodecResult<T> = Result<T, ChunkCodecError>;

/// The durable record of one failed batch: why it failed, then its events
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OverflowChunk {
    /// Comment lines, each including the leading `#`
    pub comments: Vec<String>,
    pub events: Vec<AccessEvent>,
}

impl OverflowChunk {
    /// Create a chunk, prefixing comments with `#` where needed
    pub fn new<I, S>(comments: I, events: Vec<AccessEvent>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut chunk = Self {
            comments: Vec::new(),
            events,
        };
        for comment in comments {
            chunk.push_comment(comment.as_ref());
        }
        chunk
    }

    /// Build the chunk for a batch that failed with `error`.
    ///
    /// Comments hold the error message, every cause in its source chain and
    /// the time of failure.
    pub fn from_failure(error: &(dyn Error + 'static), events: Vec<AccessEvent>) -> Self {
        let mut chunk = Self {
            comments: Vec::new(),
            events,
        };
        chunk.push_comment(&error.to_string());
        let mut source = error.source();
        while let Some(cause) = source {
            chunk.push_comment(&format!("caused by: {}", cause));
            source = cause.source();
        }
        chunk.push_comment(&format!("failed at {}", crate::utils::now_rfc3339()));
        chunk
    }

    /// Append a comment. Multi-line text becomes one comment per line.
    pub fn push_comment(&mut self, text: &str) {
        let mut pushed = false;
        for line in text.lines() {
            self.comments.push(as_comment(line));
            pushed = true;
        }
        if !pushed {
            self.comments.push(COMMENT_PREFIX.to_string());
        }
    }

    /// A chunk with no events carries no data
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Number of events in the chunk
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Comments then event lines, each newline-terminated
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for comment in &self.comments {
            out.push_str(comment);
            out.push('\n');
        }
        for event in &self.events {
            out.push_str(&event.to_line());
            out.push('\n');
        }
        out
    }

    /// Write the encoded chunk to `out`
    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(self.encode().as_bytes())
    }
}

impl fmt::Display for OverflowChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

fn as_comment(line: &str) -> String {
    if line.starts_with(COMMENT_PREFIX) {
        line.to_string()
    } else {
        format!("{}{}", COMMENT_PREFIX, line)
    }
}

/// Reads chunks one at a time from overflow log text.
///
/// A comment line seen after at least one event belongs to the next chunk;
/// the reader peeks at it without consuming it.
pub struct ChunkReader<'a> {
    lines: Peekable<Enumerate<Lines<'a>>>,
    done: bool,
}

impl<'a> ChunkReader<'a> {
    pub fn new(text: &'a str) -> Self {
        Self {
            lines: text.lines().enumerate().peekable(),
            done: false,
        }
    }

    /// Read the next chunk. An empty chunk means the log is exhausted.
    pub fn next_chunk(&mut self) -> ChunkCodecResult<OverflowChunk> {
        let mut chunk = OverflowChunk::default();

        while let Some(&(index, raw)) = self.lines.peek() {
            let line = raw.trim();
            if line.starts_with(COMMENT_PREFIX) {
                if !chunk.events.is_empty() {
                    break;
                }
                chunk.comments.push(line.to_string());
            } else if !line.is_empty() {
                let event = AccessEvent::from_line(raw).map_err(|source| {
                    ChunkCodecError::MalformedLine {
                        line: index + 1,
                        source,
                    }
                })?;
                chunk.events.push(event);
            }
            self.lines.next();
        }

        Ok(chunk)
    }
}

impl Iterator for ChunkReader<'_> {
    type Item = ChunkCodecResult<OverflowChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_chunk() {
            Ok(chunk) if chunk.is_empty() => {
                self.done = true;
                None
            }
            Ok(chunk) => Some(Ok(chunk)),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Parse a whole overflow log. Any malformed event line fails the parse.
pub fn parse_chunks(text: &str) -> ChunkCodecResult<Vec<OverflowChunk>> {
    ChunkReader::new(text).collect()
}

/// Encode chunks back to overflow log text
pub fn encode_chunks(chunks: &[OverflowChunk]) -> String {
    chunks.iter().map(OverflowChunk::encode).collect()
}
