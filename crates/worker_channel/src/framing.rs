//! Newline framing for the worker's stdout.
//!
//! The framer is pure: no I/O, no tasks. The channel's single reader task owns
//! one [`LineFramer`] and feeds it every chunk it reads, so no locking is needed.

use serde_json::Value;

use crate::error::FramingError;
use crate::jsonrpc::Message;

/// Default ceiling for buffered, not-yet-parsed bytes (10 MiB).
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 10 * 1024 * 1024;

pub type Framed = Result<Message, FramingError>;

#[derive(Debug)]
pub struct LineFramer {
    /// Bytes after the last newline.
    partial: Vec<u8>,
    /// How much of `partial` is already known to contain no newline.
    scanned: usize,
    /// Complete lines that did not parse yet, joined with `\n`.
    carry: Option<Vec<u8>>,
    carry_error: String,
    max_buffer_bytes: usize,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFER_BYTES)
    }
}

impl LineFramer {
    pub fn new(max_buffer_bytes: usize) -> Self {
        Self {
            partial: Vec::new(),
            scanned: 0,
            carry: None,
            carry_error: String::new(),
            max_buffer_bytes,
        }
    }

    /// Bytes currently held: unterminated tail plus any carried fragment.
    pub fn buffered_len(&self) -> usize {
        self.partial.len() + self.carry.as_ref().map_or(0, Vec::len)
    }

    /// Append a chunk and return every message (or framing error) it completes,
    /// in stream order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Framed> {
        let mut out = Vec::new();
        self.partial.extend_from_slice(chunk);

        while let Some(offset) = self.partial[self.scanned..].iter().position(|b| *b == b'\n') {
            let end = self.scanned + offset;
            let line: Vec<u8> = self.partial.drain(..=end).collect();
            self.scanned = 0;
            self.feed_line(&line[..line.len() - 1], &mut out);
            if self.check_overflow(&mut out) {
                return out;
            }
        }
        self.scanned = self.partial.len();
        self.check_overflow(&mut out);
        out
    }

    /// Flush whatever is left at end of stream. Leftovers can only be malformed.
    pub fn finish(&mut self) -> Vec<Framed> {
        let mut out = Vec::new();
        let tail = std::mem::take(&mut self.partial);
        self.scanned = 0;
        if !tail.trim_ascii().is_empty() {
            self.feed_line(&tail, &mut out);
        }
        if let Some(carry) = self.carry.take() {
            out.push(Err(FramingError::Malformed {
                bytes: carry.len(),
                reason: std::mem::take(&mut self.carry_error),
            }));
        }
        out
    }

    fn check_overflow(&mut self, out: &mut Vec<Framed>) -> bool {
        if self.buffered_len() <= self.max_buffer_bytes {
            return false;
        }
        self.partial.clear();
        self.scanned = 0;
        self.carry = None;
        self.carry_error.clear();
        out.push(Err(FramingError::Overflow {
            max_bytes: self.max_buffer_bytes,
        }));
        true
    }

    fn feed_line(&mut self, line: &[u8], out: &mut Vec<Framed>) {
        let line = line.trim_ascii();
        if line.is_empty() {
            return;
        }

        let Some(mut carry) = self.carry.take() else {
            self.parse_fresh(line, out);
            return;
        };

        carry.push(b'\n');
        carry.extend_from_slice(line);
        match serde_json::from_slice::<Value>(&carry) {
            Ok(value) => {
                self.carry_error.clear();
                out.push(classify(value));
            }
            // still an unfinished document: keep waiting for more lines
            Err(joined_err) if joined_err.is_eof() => {
                self.carry = Some(carry);
                self.carry_error = joined_err.to_string();
            }
            // the carried fragment can never complete; give this line its own chance
            Err(_) => {
                let fragment_len = carry.len() - line.len() - 1;
                out.push(Err(FramingError::Malformed {
                    bytes: fragment_len,
                    reason: std::mem::take(&mut self.carry_error),
                }));
                self.parse_fresh(line, out);
            }
        }
    }

    /// Parse a line with nothing carried. Only an unfinished document is carried;
    /// anything else is reported right away.
    fn parse_fresh(&mut self, line: &[u8], out: &mut Vec<Framed>) {
        match serde_json::from_slice::<Value>(line) {
            Ok(value) => out.push(classify(value)),
            Err(e) if e.is_eof() => {
                self.carry = Some(line.to_vec());
                self.carry_error = e.to_string();
            }
            Err(e) => out.push(Err(FramingError::Malformed {
                bytes: line.len(),
                reason: e.to_string(),
            })),
        }
    }
}

fn classify(value: Value) -> Framed {
    Message::from_value(value).map_err(|e| FramingError::NotJsonRpc {
        reason: e.to_string(),
    })
}
