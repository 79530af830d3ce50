//! Line decoder for continuous changes feeds.
//!
//! A continuous feed body is a sequence of JSON records separated by `\n`.
//! Records may be split across chunks arbitrarily, and heartbeats arrive as
//! bare newlines. [`LineDecoder`] buffers the trailing partial line between
//! chunks and yields every complete record.
//!
//! # Examples
//!
//! ```
//! use couch_stream_http::client::LineDecoder;
//!
//! let mut decoder = LineDecoder::new();
//! assert!(decoder.feed(b"{\"seq\":1,\"id\":").is_empty());
//!
//! let records = decoder.feed(b"\"a\"}\n\n{\"last_seq\":1}\n");
//! assert_eq!(records.len(), 2);
//! assert_eq!(records[0]["id"], "a");
//! ```

use bytes::BytesMut;
use serde_json::Value;

/// Incremental newline-delimited JSON decoder.
///
/// Lines that fail to parse are logged and skipped; they never stop the
/// stream.
#[derive(Debug, Default)]
pub struct LineDecoder {
    /// Bytes after the last newline seen
    buffer: BytesMut,
    /// Lines skipped because they were not valid JSON
    skipped: usize,
}

impl LineDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            skipped: 0,
        }
    }

    /// Feed a chunk and return the records it completed.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Value> {
        self.buffer.extend_from_slice(data);
        let mut records = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line = self.buffer.split_to(pos + 1);
            if let Some(record) = self.parse_line(&line[..pos]) {
                records.push(record);
            }
        }

        records
    }

    /// Decode whatever remains in the buffer once the stream has ended.
    pub fn finish(&mut self) -> Option<Value> {
        let rest = self.buffer.split();
        self.parse_line(&rest)
    }

    /// Bytes waiting for their terminating newline
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Number of undecodable lines seen so far
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn parse_line(&mut self, line: &[u8]) -> Option<Value> {
        if line.iter().all(u8::is_ascii_whitespace) {
            return None;
        }

        match serde_json::from_slice(line) {
            Ok(record) => Some(record),
            Err(e) => {
                self.skipped += 1;
                tracing::warn!(
                    "Skipping undecodable feed line {:?}: {}",
                    String::from_utf8_lossy(line),
                    e
                );
                None
            }
        }
    }
}
