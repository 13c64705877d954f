//! Append-only byte accumulator with line scanning.
//!
//! Everything above the socket layer parses out of a [`ByteBuffer`]: bytes are
//! appended as they arrive, scanned for delimiters, and dropped from the front
//! once consumed.

use std::ops::Range;

use bytes::{Buf, BytesMut};

/// Result of scanning for the next line terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineScan {
    /// A full line. `content` excludes the terminator, `next` is the offset of
    /// the first byte after it.
    Line { content: Range<usize>, next: usize },
    /// No terminator yet, or a CR sits at the very end of the buffer and the
    /// following byte decides whether it is CR or CRLF.
    Incomplete,
}

#[derive(Debug, Default)]
pub struct ByteBuffer {
    bytes: BytesMut,
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self {
            bytes: BytesMut::with_capacity(4096),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn append(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Bytes in `range`, clamped to what is buffered.
    pub fn slice(&self, range: Range<usize>) -> &[u8] {
        let end = range.end.min(self.bytes.len());
        let start = range.start.min(end);
        &self.bytes[start..end]
    }

    /// Drops `n` bytes from the front.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.bytes.len());
        self.bytes.advance(n);
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    /// Offset of the first `needle` at or after `from`.
    pub fn find_byte(&self, from: usize, needle: u8) -> Option<usize> {
        self.bytes
            .get(from..)?
            .iter()
            .position(|b| *b == needle)
            .map(|pos| from + pos)
    }

    /// Finds the next line starting at `from`. CR, LF and CRLF all end a line.
    pub fn scan_line(&self, from: usize) -> LineScan {
        let buf = &self.bytes[..];
        let mut i = from;

        while i < buf.len() {
            match buf[i] {
                b'\n' => {
                    return LineScan::Line {
                        content: from..i,
                        next: i + 1,
                    };
                }
                b'\r' => {
                    return match buf.get(i + 1) {
                        None => LineScan::Incomplete,
                        Some(b'\n') => LineScan::Line {
                            content: from..i,
                            next: i + 2,
                        },
                        Some(_) => LineScan::Line {
                            content: from..i,
                            next: i + 1,
                        },
                    };
                }
                _ => i += 1,
            }
        }

        LineScan::Incomplete
    }
}
