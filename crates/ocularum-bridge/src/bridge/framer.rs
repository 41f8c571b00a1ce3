//! Newline framing for the worker's stdout.
//!
//! Chunks arrive with arbitrary boundaries: a read may carry half a message,
//! exactly one, or several. Everything up to the last `\n` is emitted as
//! complete lines; the tail stays buffered for the next read.

use std::io;

use tokio_util::bytes::BytesMut;
use tokio_util::codec::Decoder;

/// Default cap on a single line. Anything longer is discarded.
pub const DEFAULT_MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

/// Splits a byte stream into non-blank lines (without the terminator).
#[derive(Debug)]
pub struct LineFramer {
    max_line_bytes: usize,
    /// Buffer offset already scanned for `\n`, so partial reads aren't rescanned.
    next_index: usize,
    /// Set while skipping the remainder of an oversized line.
    discarding: bool,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES)
    }
}

impl LineFramer {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            max_line_bytes,
            next_index: 0,
            discarding: false,
        }
    }

    pub fn max_line_bytes(&self) -> usize {
        self.max_line_bytes
    }

    fn finish_line(&mut self, mut line: BytesMut) -> Option<BytesMut> {
        if self.discarding {
            self.discarding = false;
            return None;
        }
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        if line.len() > self.max_line_bytes {
            tracing::warn!(
                target: "ocularum::protocol",
                line_bytes = line.len(),
                max_line_bytes = self.max_line_bytes,
                "Discarding oversized line"
            );
            return None;
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        Some(line)
    }
}

impl Decoder for LineFramer {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let scan_from = self.next_index.min(src.len());
            let Some(offset) = src[scan_from..].iter().position(|b| *b == b'\n') else {
                if src.len() > self.max_line_bytes {
                    if !self.discarding {
                        tracing::warn!(
                            target: "ocularum::protocol",
                            buffered_bytes = src.len(),
                            max_line_bytes = self.max_line_bytes,
                            "Line exceeds limit, discarding until next newline"
                        );
                    }
                    self.discarding = true;
                    src.clear();
                    self.next_index = 0;
                } else {
                    self.next_index = src.len();
                }
                return Ok(None);
            };

            let newline = scan_from + offset;
            let mut line = src.split_to(newline + 1);
            line.truncate(newline);
            self.next_index = 0;

            if let Some(line) = self.finish_line(line) {
                return Ok(Some(line));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.is_empty() {
            return Ok(None);
        }
        // Unterminated final message from a worker that exited mid-write.
        let line = src.split_to(src.len());
        self.next_index = 0;
        Ok(self.finish_line(line))
    }
}
