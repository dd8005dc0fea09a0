//! Newline-delimited JSON framing.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Result, SyncError};
use crate::messages::SyncMessage;

/// Encode one message as a JSON line.
pub fn encode_line(message: &SyncMessage) -> Result<Bytes> {
    let mut line =
        serde_json::to_vec(message).map_err(|e| SyncError::InvalidMessage(e.to_string()))?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}

/// Incremental decoder for a byte stream of JSON lines.
#[derive(Debug)]
pub struct LineDecoder {
    buf: BytesMut,
    max_line_bytes: usize,
}

impl LineDecoder {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_line_bytes,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet terminated by a newline.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Next complete message, if a full line is buffered.
    ///
    /// A malformed line is consumed and reported as an error, so the caller
    /// may skip it and keep decoding. An unterminated line longer than the
    /// limit is an error that leaves the buffer unusable.
    pub fn next_message(&mut self) -> Result<Option<SyncMessage>> {
        loop {
            let Some(pos) = self.buf.iter().position(|&b| b == b'\n') else {
                if self.buf.len() > self.max_line_bytes {
                    return Err(SyncError::InvalidMessage(format!(
                        "line exceeds {} bytes",
                        self.max_line_bytes
                    )));
                }
                return Ok(None);
            };

            let mut line = self.buf.split_to(pos);
            self.buf.advance(1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            if line.len() > self.max_line_bytes {
                return Err(SyncError::InvalidMessage(format!(
                    "line exceeds {} bytes",
                    self.max_line_bytes
                )));
            }
            return serde_json::from_slice(&line)
                .map(Some)
                .map_err(|e| SyncError::InvalidMessage(e.to_string()));
        }
    }
}
