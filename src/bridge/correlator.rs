//! Request/response correlation over one framed channel.
//!
//! Many callers share one backend. Frames are encoded by the caller and
//! handed to a dedicated writer task through a bounded queue, so a frame
//! reaches the wire whole even if its caller goes away mid-request. Request
//! ids are allocated, registered, and enqueued under one lock, which keeps
//! them in order on the wire. Responses are read by one dedicated loop that
//! routes each frame to the caller whose request id it carries. Frames
//! without a matching pending id are dropped.
//!
//! A request is registered in the pending set *before* its frame is queued,
//! so a response can never arrive for an id nobody is waiting on yet.

use std::collections::HashMap;
use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use super::errors::BridgeError;
use super::transport::{encode_frame, FrameReader, FrameWriter};
use super::types::{IncomingFrame, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// Encoded frames waiting for the writer task.
pub const OUTBOUND_QUEUE: usize = 64;

/// What a pending caller eventually receives.
type Delivery = Result<JsonRpcResponse, BridgeError>;

// ─── Channel State ───────────────────────────────────────────────────────────

/// A request that has been registered and is waiting for its response.
struct PendingRequest {
    method: String,
    slot: oneshot::Sender<Delivery>,
    created_at: Instant,
}

/// Everything about the channel that changes per request, behind one lock.
struct ChannelState {
    next_id: u64,
    pending: HashMap<u64, PendingRequest>,
    /// Set once the read side is gone; nothing may register afterwards.
    closed: bool,
    /// Queue into the writer task. `None` once input has been closed.
    outbound: Option<mpsc::Sender<Vec<u8>>>,
}

// ─── Correlator ──────────────────────────────────────────────────────────────

/// Demultiplexes one backend channel among concurrent callers.
pub struct Correlator {
    service: String,
    state: StdMutex<ChannelState>,
}

impl Correlator {
    /// Take ownership of the write half and spawn its writer task.
    /// Request ids start at 1. Must be called inside a tokio runtime.
    pub fn new(service: &str, writer: FrameWriter) -> Self {
        let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE);
        tokio::spawn(run_writer(service.to_string(), writer, queue));
        Self {
            service: service.to_string(),
            state: StdMutex::new(ChannelState {
                next_id: 1,
                pending: HashMap::new(),
                closed: false,
                outbound: Some(outbound),
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Send a request and wait for the response carrying its id.
    ///
    /// `timeout` bounds the whole exchange: waiting for queue space and
    /// waiting for the response. On timeout the pending entry is removed and
    /// a late response for that id is discarded by the read loop. A frame
    /// already queued is still written in full.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, BridgeError> {
        match tokio::time::timeout(timeout, self.exchange(method, params)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let timeout_ms = timeout.as_millis() as u64;
                tracing::warn!(service = %self.service, method, timeout_ms, "request timed out");
                Err(BridgeError::Timeout {
                    name: self.service.clone(),
                    method: method.to_string(),
                    timeout_ms,
                })
            }
        }
    }

    /// Queue one request and wait for its response, with no deadline.
    async fn exchange(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, BridgeError> {
        let (slot, delivery) = oneshot::channel();
        let outbound = self.outbound()?;
        let permit = outbound.reserve().await.map_err(|_| self.input_closed())?;
        let id = self.register_and_queue(method, params, slot, permit)?;
        drop(outbound);
        // Removes the entry however this exchange ends: response, timeout,
        // or the caller dropping the future.
        let _guard = PendingGuard { correlator: self, id };

        delivery.await.unwrap_or_else(|_| {
            Err(BridgeError::ProcessExited {
                name: self.service.clone(),
                reason: "request abandoned before a response arrived".into(),
            })
        })
    }

    /// Queue a notification. No id is consumed and no response is awaited;
    /// `timeout` bounds the wait for queue space.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<(), BridgeError> {
        let line = encode_frame(&self.service, &JsonRpcNotification::new(method, params))?;
        let outbound = self.outbound()?;
        match tokio::time::timeout(timeout, outbound.send(line)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(self.input_closed()),
            Err(_) => Err(BridgeError::Timeout {
                name: self.service.clone(),
                method: method.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Close the write side. The writer task flushes what is queued, then
    /// closes the backend's input. Later requests fail with `NotRunning`.
    pub fn close_writer(&self) {
        if self.state().outbound.take().is_some() {
            tracing::debug!(service = %self.service, "closing backend input");
        }
    }

    /// Drive the read side until end-of-stream or a read error.
    ///
    /// Exactly one task runs this per channel. On exit every outstanding
    /// request is failed with `ProcessExited` and the pending set is closed.
    /// Returns a description of why the stream ended.
    pub async fn run_reader(&self, mut reader: FrameReader) -> String {
        let reason = loop {
            match reader.next_frame().await {
                Ok(Some(line)) => self.dispatch(&line),
                Ok(None) => break "backend closed its output stream".to_string(),
                Err(e) => break format!("failed to read backend output: {e}"),
            }
        };
        self.fail_all(&reason);
        reason
    }

    /// Fail every pending request with `ProcessExited` and refuse new ones.
    pub fn fail_all(&self, reason: &str) {
        let drained: Vec<(u64, PendingRequest)> = {
            let mut state = self.state();
            state.closed = true;
            state.pending.drain().collect()
        };

        if !drained.is_empty() {
            tracing::warn!(
                service = %self.service,
                count = drained.len(),
                reason,
                "failing outstanding requests"
            );
        }
        for (_, request) in drained {
            let _ = request.slot.send(Err(BridgeError::ProcessExited {
                name: self.service.clone(),
                reason: reason.to_string(),
            }));
        }
    }

    /// Whether the read side has ended.
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    // ─── Internals ───────────────────────────────────────────────────────

    fn dispatch(&self, line: &[u8]) {
        let frame: IncomingFrame = match serde_json::from_slice(line) {
            Ok(frame) => frame,
            Err(e) => {
                let preview: String = String::from_utf8_lossy(line).chars().take(200).collect();
                tracing::warn!(
                    service = %self.service,
                    error = %e,
                    line = %preview,
                    "discarding unparseable frame"
                );
                return;
            }
        };

        if let Some(method) = frame.method.as_deref() {
            tracing::debug!(service = %self.service, method, "discarding server-initiated message");
            return;
        }

        let Some(id) = frame.response_id() else {
            tracing::debug!(service = %self.service, "discarding frame without a usable id");
            return;
        };

        let Some(request) = self.state().pending.remove(&id) else {
            tracing::debug!(
                service = %self.service,
                request_id = id,
                "discarding response for unknown request id"
            );
            return;
        };

        tracing::debug!(
            service = %self.service,
            request_id = id,
            method = %request.method,
            elapsed_ms = request.created_at.elapsed().as_millis() as u64,
            "response delivered"
        );
        let _ = request.slot.send(Ok(frame.into_response(id)));
    }

    /// Allocate an id, register it, and queue its frame, all under one lock.
    fn register_and_queue(
        &self,
        method: &str,
        params: Option<Value>,
        slot: oneshot::Sender<Delivery>,
        permit: mpsc::Permit<'_, Vec<u8>>,
    ) -> Result<u64, BridgeError> {
        let mut state = self.state();
        if state.closed {
            return Err(self.not_running());
        }

        let id = state.next_id;
        let line = encode_frame(&self.service, &JsonRpcRequest::new(id, method, params))?;
        state.next_id += 1;
        state.pending.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                slot,
                created_at: Instant::now(),
            },
        );
        permit.send(line);

        tracing::debug!(service = %self.service, request_id = id, method, "request queued");
        Ok(id)
    }

    fn outbound(&self) -> Result<mpsc::Sender<Vec<u8>>, BridgeError> {
        self.state()
            .outbound
            .clone()
            .ok_or_else(|| self.not_running())
    }

    fn forget(&self, id: u64) {
        self.state().pending.remove(&id);
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        // Consistent after every statement, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn not_running(&self) -> BridgeError {
        BridgeError::NotRunning {
            name: self.service.clone(),
        }
    }

    fn input_closed(&self) -> BridgeError {
        BridgeError::ProcessExited {
            name: self.service.clone(),
            reason: "backend input is closed".into(),
        }
    }
}

/// Removes a pending entry when the requesting call finishes or is dropped.
struct PendingGuard<'a> {
    correlator: &'a Correlator,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.forget(self.id);
    }
}

/// Write queued frames in order until the queue closes or a write fails,
/// then close the backend's input.
async fn run_writer(service: String, mut writer: FrameWriter, mut queue: mpsc::Receiver<Vec<u8>>) {
    while let Some(line) = queue.recv().await {
        if let Err(e) = writer.write_line(&line).await {
            tracing::warn!(service = %service, error = %e, "backend input failed, writer stopping");
            return;
        }
    }
    if let Err(e) = writer.close().await {
        tracing::debug!(service = %service, error = %e, "closing backend input failed");
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    use crate::bridge::errors::ErrorKind;

    const LONG: Duration = Duration::from_secs(5);

    /// Correlator wired to an in-memory child. Returns the child's ends.
    fn wire() -> (Arc<Correlator>, BufReader<DuplexStream>, DuplexStream) {
        wire_with_input(64 * 1024)
    }

    /// Like `wire`, with `capacity` bytes of buffering on the child's input.
    fn wire_with_input(capacity: usize) -> (Arc<Correlator>, BufReader<DuplexStream>, DuplexStream) {
        let (ours_w, child_r) = tokio::io::duplex(capacity);
        let (child_w, ours_r) = tokio::io::duplex(64 * 1024);

        let correlator = Arc::new(Correlator::new("svc", FrameWriter::new("svc", ours_w)));
        let reader = Arc::clone(&correlator);
        tokio::spawn(async move { reader.run_reader(FrameReader::new("svc", ours_r)).await });

        (correlator, BufReader::new(child_r), child_w)
    }

    async fn read_request(child_in: &mut BufReader<DuplexStream>) -> Value {
        let mut line = String::new();
        child_in.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn reply(child_out: &mut DuplexStream, frame: Value) {
        let mut bytes = serde_json::to_vec(&frame).unwrap();
        bytes.push(b'\n');
        child_out.write_all(&bytes).await.unwrap();
    }

    #[tokio::test]
    async fn test_ids_start_at_one_and_increase() {
        let (correlator, mut child_in, mut child_out) = wire();

        let caller = {
            let c = Arc::clone(&correlator);
            tokio::spawn(async move { c.request("tools/list", None, LONG).await })
        };
        let first = read_request(&mut child_in).await;
        assert_eq!(first["id"], 1);
        assert_eq!(first["method"], "tools/list");
        reply(&mut child_out, serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": {}})).await;
        caller.await.unwrap().unwrap();

        let caller = {
            let c = Arc::clone(&correlator);
            tokio::spawn(async move { c.request("tools/list", None, LONG).await })
        };
        let second = read_request(&mut child_in).await;
        assert_eq!(second["id"], 2);
        reply(&mut child_out, serde_json::json!({"jsonrpc": "2.0", "id": 2, "result": {}})).await;
        caller.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_out_of_order_responses_reach_their_callers() {
        let (correlator, mut child_in, mut child_out) = wire();

        let mut callers = Vec::new();
        for n in 0..8u64 {
            let c = Arc::clone(&correlator);
            callers.push(tokio::spawn(async move {
                let params = serde_json::json!({"n": n});
                (n, c.request("tools/call", Some(params), LONG).await)
            }));
        }

        let mut received = Vec::new();
        for _ in 0..8 {
            received.push(read_request(&mut child_in).await);
        }
        // Answer in reverse order of arrival, echoing each caller's `n`.
        for req in received.iter().rev() {
            reply(
                &mut child_out,
                serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": req["id"],
                    "result": {"n": req["params"]["n"]},
                }),
            )
            .await;
        }

        for caller in callers {
            let (n, outcome) = caller.await.unwrap();
            let response = outcome.unwrap();
            assert_eq!(response.result.unwrap()["n"], n);
        }
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_and_unsolicited_frames_are_ignored() {
        let (correlator, mut child_in, mut child_out) = wire();

        let caller = {
            let c = Arc::clone(&correlator);
            tokio::spawn(async move { c.request("tools/call", None, LONG).await })
        };
        let req = read_request(&mut child_in).await;

        child_out.write_all(b"not json at all\n").await.unwrap();
        reply(&mut child_out, serde_json::json!({"jsonrpc": "2.0", "id": 999, "result": {}})).await;
        reply(
            &mut child_out,
            serde_json::json!({"jsonrpc": "2.0", "method": "notifications/message", "params": {}}),
        )
        .await;
        reply(
            &mut child_out,
            serde_json::json!({"jsonrpc": "2.0", "id": req["id"], "result": {"ok": true}}),
        )
        .await;

        let response = caller.await.unwrap().unwrap();
        assert_eq!(response.result.unwrap()["ok"], true);
        assert!(!correlator.is_closed());
    }

    #[tokio::test]
    async fn test_end_of_stream_fails_pending_and_closes() {
        let (correlator, mut child_in, child_out) = wire();

        let callers: Vec<_> = (0..3)
            .map(|_| {
                let c = Arc::clone(&correlator);
                tokio::spawn(async move { c.request("tools/call", None, LONG).await })
            })
            .collect();
        for _ in 0..3 {
            read_request(&mut child_in).await;
        }
        drop(child_out);

        for caller in callers {
            let err = caller.await.unwrap().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ProcessExited);
        }
        assert!(correlator.is_closed());

        let err = correlator.request("tools/list", None, LONG).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotRunning);
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_entry() {
        let (correlator, mut child_in, mut child_out) = wire();

        let started = Instant::now();
        let caller = {
            let c = Arc::clone(&correlator);
            tokio::spawn(async move {
                c.request("tools/call", None, Duration::from_millis(50)).await
            })
        };
        let req = read_request(&mut child_in).await;

        let err = caller.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(correlator.pending_count(), 0);

        // The late answer is discarded and the channel keeps working.
        reply(&mut child_out, serde_json::json!({"jsonrpc": "2.0", "id": req["id"], "result": {}})).await;
        let next = {
            let c = Arc::clone(&correlator);
            tokio::spawn(async move { c.request("tools/list", None, LONG).await })
        };
        let req = read_request(&mut child_in).await;
        reply(&mut child_out, serde_json::json!({"jsonrpc": "2.0", "id": req["id"], "result": {"tools": []}})).await;
        assert!(next.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_notify_does_not_consume_an_id() {
        let (correlator, mut child_in, mut child_out) = wire();

        correlator.notify("notifications/initialized", None, LONG).await.unwrap();
        let note = read_request(&mut child_in).await;
        assert!(note.get("id").is_none());

        let caller = {
            let c = Arc::clone(&correlator);
            tokio::spawn(async move { c.request("tools/list", None, LONG).await })
        };
        let req = read_request(&mut child_in).await;
        assert_eq!(req["id"], 1);
        reply(&mut child_out, serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": {}})).await;
        caller.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_closed_writer_rejects_requests() {
        let (correlator, _child_in, _child_out) = wire();
        correlator.close_writer();

        let err = correlator.request("tools/list", None, LONG).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotRunning);
        let err = correlator
            .notify("notifications/initialized", None, LONG)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotRunning);
    }

    #[tokio::test]
    async fn test_abandoned_request_is_written_whole() {
        let (correlator, mut child_in, mut child_out) = wire_with_input(256);

        // Larger than the pipe, so the write is still in progress when the
        // caller goes away.
        let blob = "x".repeat(2048);
        let abandoned = {
            let c = Arc::clone(&correlator);
            let params = serde_json::json!({"blob": blob});
            tokio::spawn(async move { c.request("tools/call", Some(params), LONG).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        abandoned.abort();
        let _ = abandoned.await;

        let next = {
            let c = Arc::clone(&correlator);
            tokio::spawn(async move { c.request("tools/list", None, LONG).await })
        };

        let first = read_request(&mut child_in).await;
        assert_eq!(first["id"], 1);
        assert_eq!(first["params"]["blob"].as_str().unwrap().len(), 2048);
        let second = read_request(&mut child_in).await;
        assert_eq!(second["id"], 2);
        assert_eq!(second["method"], "tools/list");

        reply(&mut child_out, serde_json::json!({"jsonrpc": "2.0", "id": 2, "result": {}})).await;
        assert!(next.await.unwrap().is_ok());
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_holds_when_child_stops_reading() {
        // The child never reads its input, so the pipe fills and the queue
        // behind it fills too.
        let (correlator, _child_in, _child_out) = wire_with_input(1024);

        let started = Instant::now();
        let callers: Vec<_> = (0..OUTBOUND_QUEUE * 2)
            .map(|_| {
                let c = Arc::clone(&correlator);
                let params = serde_json::json!({"blob": "y".repeat(8192)});
                tokio::spawn(async move {
                    c.request("tools/call", Some(params), Duration::from_millis(50)).await
                })
            })
            .collect();

        for caller in callers {
            let err = caller.await.unwrap().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Timeout);
        }
        assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
        assert_eq!(correlator.pending_count(), 0);
    }
}
