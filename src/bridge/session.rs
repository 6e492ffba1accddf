//! One live binding between a service name and its stdio backend.
//!
//! A Session owns the child process, its Correlator, and the reader task,
//! and drives the `initialize` / `notifications/initialized` handshake.
//!
//! ```text
//! Idle → Starting → Handshaking → Ready → Stopping → Stopped
//!            └──────────┴───────────┴─→ Failed
//! ```

use std::sync::{Arc, Mutex as StdMutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::correlator::Correlator;
use super::driver::{LocalProcessDriver, LogBuffer, ProcessBackend};
use super::errors::BridgeError;
use super::transport::{FrameReader, FrameWriter};
use super::types::{
    methods, CallToolParams, InitializeParams, InitializeResult, JsonRpcResponse, McpTool,
    ToolsListResult,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for the initialize handshake.
///
/// Generous so that servers importing large frameworks at startup still make it.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default per-call timeout for `tools/list` and `tools/call`.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period at each step of the stop sequence.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Longest stderr excerpt attached to a handshake failure.
const STDERR_EXCERPT_CHARS: usize = 2000;

// ─── State ───────────────────────────────────────────────────────────────────

/// Lifecycle state of a Session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Starting,
    Handshaking,
    Ready,
    Stopping,
    Stopped,
    Failed,
}

impl SessionState {
    /// Starting, handshaking, or ready: a start request is a no-op.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Starting | SessionState::Handshaking | SessionState::Ready
        )
    }

    /// Status reported through the facade.
    pub fn status(self) -> ServiceStatus {
        match self {
            SessionState::Starting | SessionState::Handshaking => ServiceStatus::Starting,
            SessionState::Ready => ServiceStatus::Running,
            SessionState::Failed => ServiceStatus::Failed,
            SessionState::Idle | SessionState::Stopping | SessionState::Stopped => {
                ServiceStatus::Stopped
            }
        }
    }
}

/// Coarse service status exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Stopped,
    Starting,
    Running,
    Failed,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::Failed => "failed",
        })
    }
}

/// Timeouts applied by a Session.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub handshake_timeout: Duration,
    pub call_timeout: Duration,
    pub stop_grace: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

// ─── Session ─────────────────────────────────────────────────────────────────

/// Handle to a Session. Clones share the same backend.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    service: String,
    id: Uuid,
    options: SessionOptions,
    state: StdMutex<SessionState>,
    failure: StdMutex<Option<String>>,
    correlator: OnceLock<Arc<Correlator>>,
    /// Taken by whichever exit path reaches cleanup first.
    process: Mutex<Option<ProcessBackend>>,
    logs: LogBuffer,
    tools: StdMutex<Option<Vec<McpTool>>>,
    started_at: DateTime<Utc>,
}

impl Session {
    pub fn new(service: &str, options: SessionOptions) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                service: service.to_string(),
                id: Uuid::new_v4(),
                options,
                state: StdMutex::new(SessionState::Idle),
                failure: StdMutex::new(None),
                correlator: OnceLock::new(),
                process: Mutex::new(None),
                logs: LogBuffer::default(),
                tools: StdMutex::new(None),
                started_at: Utc::now(),
            }),
        }
    }

    /// Spawn the backend process and complete the handshake.
    pub async fn launch(
        &self,
        driver: &LocalProcessDriver,
        command: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<(), BridgeError> {
        self.transition(&[SessionState::Idle], SessionState::Starting);
        tracing::info!(
            service = %self.inner.service,
            session_id = %self.inner.id,
            command,
            "starting service"
        );

        let mut backend = match driver.start(&self.inner.service, command, args, env, &self.inner.logs) {
            Ok(backend) => backend,
            Err(e) => {
                self.fail(&e.to_string());
                return Err(e);
            }
        };
        let Some((stdin, stdout)) = backend.take_stdio() else {
            let reason = "backend stdio already taken".to_string();
            self.fail(&reason);
            return Err(BridgeError::LaunchFailed {
                name: self.inner.service.clone(),
                reason,
            });
        };
        *self.inner.process.lock().await = Some(backend);

        self.connect(stdout, stdin).await
    }

    /// Attach a framed channel and run the handshake over it.
    ///
    /// `launch` calls this with the child's pipes; anything byte-stream
    /// shaped works.
    pub async fn connect<R, W>(&self, reader: R, writer: W) -> Result<(), BridgeError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let service = self.inner.service.clone();
        if !self.transition(&[SessionState::Idle, SessionState::Starting], SessionState::Handshaking) {
            return Err(BridgeError::AlreadyRunning { name: service });
        }

        let correlator = Arc::new(Correlator::new(&service, FrameWriter::new(&service, writer)));
        if self.inner.correlator.set(Arc::clone(&correlator)).is_err() {
            return Err(BridgeError::AlreadyRunning { name: service });
        }
        self.spawn_reader(Arc::clone(&correlator), FrameReader::new(&service, reader));

        match self.handshake(&correlator).await {
            Ok(init) => {
                if !self.transition(&[SessionState::Handshaking], SessionState::Ready) {
                    let reason = self
                        .failure_reason()
                        .unwrap_or_else(|| "session closed during handshake".into());
                    return Err(BridgeError::HandshakeFailed { name: service, reason });
                }
                tracing::info!(
                    service = %service,
                    session_id = %self.inner.id,
                    protocol_version = init.protocol_version.as_deref().unwrap_or("unknown"),
                    server_name = init
                        .server_info
                        .as_ref()
                        .and_then(|s| s.name.as_deref())
                        .unwrap_or("unknown"),
                    "service ready"
                );
                Ok(())
            }
            Err(e) => {
                self.fail(&e.to_string());
                self.cleanup().await;
                let reason = format!("{e}{}", stderr_suffix(&self.inner.logs.text()));
                tracing::warn!(service = %service, reason = %reason, "handshake failed");
                Err(BridgeError::HandshakeFailed { name: service, reason })
            }
        }
    }

    /// Query the backend's tools and cache them.
    pub async fn list_tools(&self) -> Result<Vec<McpTool>, BridgeError> {
        let correlator = self.ready_correlator()?;
        let response = correlator
            .request(methods::TOOLS_LIST, None, self.inner.options.call_timeout)
            .await?;
        let result = extract_result(&self.inner.service, response)?;

        let listed: ToolsListResult =
            serde_json::from_value(result).map_err(|e| BridgeError::ProtocolError {
                name: self.inner.service.clone(),
                reason: format!("failed to parse tools/list response: {e}"),
            })?;

        *lock(&self.inner.tools) = Some(listed.tools.clone());
        Ok(listed.tools)
    }

    /// Invoke `tool` and return the backend's `result` unchanged.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, BridgeError> {
        let correlator = self.ready_correlator()?;
        let params = serde_json::to_value(CallToolParams { name: tool, arguments }).map_err(|e| {
            BridgeError::ProtocolError {
                name: self.inner.service.clone(),
                reason: format!("failed to encode tools/call params: {e}"),
            }
        })?;

        let timeout = timeout.unwrap_or(self.inner.options.call_timeout);
        let response = correlator
            .request(methods::TOOLS_CALL, Some(params), timeout)
            .await?;
        extract_result(&self.inner.service, response)
    }

    /// Close input, give the child a grace period, force-terminate, and
    /// resolve anything still pending with `ProcessExited`.
    pub async fn stop(&self) -> Result<(), BridgeError> {
        {
            let mut state = lock(&self.inner.state);
            if !state.is_active() {
                return Err(BridgeError::NotRunning {
                    name: self.inner.service.clone(),
                });
            }
            *state = SessionState::Stopping;
        }
        tracing::info!(service = %self.inner.service, session_id = %self.inner.id, "stopping service");

        self.cleanup().await;
        if let Some(correlator) = self.inner.correlator.get() {
            correlator.fail_all("service stopped");
        }

        *lock(&self.inner.state) = SessionState::Stopped;
        tracing::info!(service = %self.inner.service, session_id = %self.inner.id, "service stopped");
        Ok(())
    }

    // ─── Accessors ───────────────────────────────────────────────────────

    pub fn service(&self) -> &str {
        &self.inner.service
    }

    pub fn session_id(&self) -> Uuid {
        self.inner.id
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.inner.state)
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    /// Captured stderr of the backend.
    pub fn logs(&self) -> String {
        self.inner.logs.text()
    }

    /// Tools from the last successful `list_tools`.
    pub fn cached_tools(&self) -> Option<Vec<McpTool>> {
        lock(&self.inner.tools).clone()
    }

    /// Why the session failed, if it did.
    pub fn failure_reason(&self) -> Option<String> {
        lock(&self.inner.failure).clone()
    }

    /// Number of requests waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.get().map_or(0, |c| c.pending_count())
    }

    // ─── Internals ───────────────────────────────────────────────────────

    async fn handshake(&self, correlator: &Correlator) -> Result<InitializeResult, BridgeError> {
        let service = &self.inner.service;
        let params = serde_json::to_value(InitializeParams::default()).map_err(|e| {
            BridgeError::ProtocolError {
                name: service.clone(),
                reason: format!("failed to encode initialize params: {e}"),
            }
        })?;

        let response = correlator
            .request(methods::INITIALIZE, Some(params), self.inner.options.handshake_timeout)
            .await?;
        let result = extract_result(service, response)?;
        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| BridgeError::ProtocolError {
                name: service.clone(),
                reason: format!("failed to parse initialize response: {e}"),
            })?;

        correlator
            .notify(methods::INITIALIZED, None, self.inner.options.handshake_timeout)
            .await?;
        Ok(init)
    }

    /// One reader task per session. It holds only a weak reference so a
    /// dropped Session is not kept alive by its own reader.
    fn spawn_reader(&self, correlator: Arc<Correlator>, reader: FrameReader) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let reason = correlator.run_reader(reader).await;
            if let Some(inner) = weak.upgrade() {
                Session { inner }.on_stream_closed(&reason).await;
            }
        });
    }

    /// The read side ended. Unless a stop is under way this is a crash.
    async fn on_stream_closed(&self, reason: &str) {
        let crashed = {
            let mut state = lock(&self.inner.state);
            match *state {
                SessionState::Stopping | SessionState::Stopped | SessionState::Failed => false,
                _ => {
                    *state = SessionState::Failed;
                    true
                }
            }
        };
        if !crashed {
            return;
        }

        *lock(&self.inner.failure) = Some(reason.to_string());
        tracing::warn!(
            service = %self.inner.service,
            session_id = %self.inner.id,
            reason,
            "backend exited unexpectedly"
        );
        self.cleanup().await;
    }

    /// Release the channel and reap the child. Runs its effect once no
    /// matter how many exit paths reach it.
    async fn cleanup(&self) {
        if let Some(correlator) = self.inner.correlator.get() {
            correlator.close_writer();
        }
        let process = self.inner.process.lock().await.take();
        if let Some(process) = process {
            let code = process.terminate(self.inner.options.stop_grace).await;
            tracing::debug!(service = %self.inner.service, code, "backend reaped");
        }
    }

    fn ready_correlator(&self) -> Result<&Arc<Correlator>, BridgeError> {
        let not_running = || BridgeError::NotRunning {
            name: self.inner.service.clone(),
        };
        if self.state() != SessionState::Ready {
            return Err(not_running());
        }
        self.inner.correlator.get().ok_or_else(not_running)
    }

    fn fail(&self, reason: &str) {
        *lock(&self.inner.state) = SessionState::Failed;
        lock(&self.inner.failure).get_or_insert_with(|| reason.to_string());
    }

    /// Compare-and-set on the state. Returns whether the move happened.
    fn transition(&self, from: &[SessionState], to: SessionState) -> bool {
        let mut state = lock(&self.inner.state);
        if from.contains(&*state) {
            tracing::debug!(service = %self.inner.service, from = ?*state, to = ?to, "session transition");
            *state = to;
            true
        } else {
            false
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Unwrap a response into its `result`, or the child's error object.
fn extract_result(service: &str, response: JsonRpcResponse) -> Result<Value, BridgeError> {
    if let Some(err) = response.error {
        return Err(BridgeError::RemoteError {
            name: service.to_string(),
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }
    response.result.ok_or_else(|| BridgeError::ProtocolError {
        name: service.to_string(),
        reason: format!("response {} has neither result nor error", response.id),
    })
}

/// Format captured stderr for an error message (empty when there is none).
fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let mut excerpt: String = trimmed.chars().take(STDERR_EXCERPT_CHARS).collect();
    if excerpt.len() < trimmed.len() {
        excerpt.push_str("...(truncated)");
    }
    format!(" | stderr: {excerpt}")
}

// ─── Tests ───────────────────────────────────────────────────────────────────
