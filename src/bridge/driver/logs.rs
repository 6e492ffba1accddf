//! Bounded in-memory capture of a backend's diagnostic output.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Lines retained per service.
pub const LOG_CAPACITY: usize = 500;

/// Ring buffer of the most recent output lines. Cloning shares the buffer.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::with_capacity(LOG_CAPACITY)
    }
}

impl LogBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(64)))),
            capacity: capacity.max(1),
        }
    }

    /// Append one line, evicting the oldest when full.
    pub fn push(&self, line: impl Into<String>) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    /// All retained lines joined with newlines.
    pub fn text(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = String::new();
        for line in lines.iter() {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    pub fn len(&self) -> usize {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain `stream` line by line into this buffer until it closes.
    ///
    /// Spawned once per backend; the stream must be read continuously or a
    /// chatty child blocks on a full pipe. Bytes that are not UTF-8 are
    /// replaced, never treated as the end of the stream.
    pub fn capture<R>(&self, service: &str, stream: R) -> tokio::task::JoinHandle<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let buffer = self.clone();
        let service = service.to_string();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stream);
            let mut raw = Vec::with_capacity(256);
            loop {
                raw.clear();
                match reader.read_until(b'\n', &mut raw).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&raw);
                        let line = line.trim_end_matches(|c: char| c == '\n' || c == '\r');
                        tracing::trace!(service = %service, line = %line, "backend stderr");
                        buffer.push(line);
                    }
                    Err(e) => {
                        tracing::debug!(service = %service, error = %e, "stderr capture ended");
                        break;
                    }
                }
            }
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
