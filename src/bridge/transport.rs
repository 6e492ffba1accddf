//! Newline-delimited JSON framing over a backend's byte streams.
//!
//! - Writing: one serialized JSON document followed by `\n` per frame
//! - Reading: one document per line; partial lines stay buffered until the
//!   newline arrives and are never handed out early

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use super::errors::BridgeError;

/// Largest frame accepted from a backend. Longer lines are skipped.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Boxed write half of a backend channel.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Boxed read half of a backend channel.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Serialize `frame` into one complete line, newline included.
pub fn encode_frame<T: Serialize>(service: &str, frame: &T) -> Result<Vec<u8>, BridgeError> {
    let mut bytes = serde_json::to_vec(frame).map_err(|e| BridgeError::ProtocolError {
        name: service.to_string(),
        reason: format!("failed to serialize frame: {e}"),
    })?;
    bytes.push(b'\n');
    Ok(bytes)
}

// ─── Writer ──────────────────────────────────────────────────────────────────

/// Write side of a framed channel. Owned by a single writer task.
pub struct FrameWriter {
    service: String,
    inner: BoxedWriter,
}

impl FrameWriter {
    pub fn new(service: &str, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            service: service.to_string(),
            inner: Box::new(writer),
        }
    }

    /// Write an already encoded line and flush it.
    pub async fn write_line(&mut self, line: &[u8]) -> Result<(), BridgeError> {
        self.inner
            .write_all(line)
            .await
            .map_err(|e| self.write_failed(e))?;
        self.inner.flush().await.map_err(|e| self.write_failed(e))
    }

    /// Close the write side so the child sees end-of-input.
    pub async fn close(&mut self) -> std::io::Result<()> {
        self.inner.shutdown().await
    }

    fn write_failed(&self, e: std::io::Error) -> BridgeError {
        BridgeError::ProcessExited {
            name: self.service.clone(),
            reason: format!("failed to write to backend input: {e}"),
        }
    }
}

// ─── Reader ──────────────────────────────────────────────────────────────────

/// Read side of a framed channel, owned by exactly one read loop.
pub struct FrameReader {
    service: String,
    inner: BufReader<BoxedReader>,
    line: Vec<u8>,
    max_frame_bytes: usize,
}

impl FrameReader {
    pub fn new(service: &str, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self::with_max_frame(service, reader, MAX_FRAME_BYTES)
    }

    /// Reader that skips any line longer than `max_frame_bytes`.
    pub fn with_max_frame(
        service: &str,
        reader: impl AsyncRead + Send + Unpin + 'static,
        max_frame_bytes: usize,
    ) -> Self {
        let boxed: BoxedReader = Box::new(reader);
        Self {
            service: service.to_string(),
            inner: BufReader::new(boxed),
            line: Vec::with_capacity(1024),
            max_frame_bytes,
        }
    }

    /// Read the next complete, non-blank line (without its terminator).
    ///
    /// Returns `Ok(None)` at end-of-stream. Bytes after the last newline at
    /// end-of-stream are an incomplete frame and are dropped.
    pub async fn next_frame(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        while self.next_line().await? {
            let trimmed = trim_whitespace(&self.line);
            if !trimmed.is_empty() {
                return Ok(Some(trimmed.to_vec()));
            }
        }
        Ok(None)
    }

    /// Fill `self.line` with the next newline-terminated line. `false` at
    /// end-of-stream. Oversized lines are consumed and discarded.
    async fn next_line(&mut self) -> std::io::Result<bool> {
        self.line.clear();
        let mut skipped: usize = 0;

        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                if !self.line.is_empty() || skipped > 0 {
                    tracing::warn!(
                        service = %self.service,
                        bytes = self.line.len() + skipped,
                        "dropping unterminated frame at end of stream"
                    );
                }
                return Ok(false);
            }

            let (used, complete) = match available.iter().position(|&b| b == b'\n') {
                Some(i) => (i + 1, true),
                None => (available.len(), false),
            };
            if skipped == 0 && self.line.len() + used <= self.max_frame_bytes {
                self.line.extend_from_slice(&available[..used]);
            } else {
                skipped += self.line.len() + used;
                self.line.clear();
            }
            self.inner.consume(used);

            if !complete {
                continue;
            }
            if skipped == 0 {
                return Ok(true);
            }
            let err = BridgeError::ProtocolError {
                name: self.service.clone(),
                reason: format!(
                    "frame of {skipped} bytes exceeds the {} byte limit",
                    self.max_frame_bytes
                ),
            };
            tracing::warn!(service = %self.service, error = %err, "skipping oversized frame");
            skipped = 0;
        }
    }
}

fn trim_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

// ─── Tests ───────────────────────────────────────────────────────────────────
