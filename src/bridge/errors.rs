//! Service Bridge error types.
//!
//! Every error carries the service it concerns and a human-readable reason.
//! The HTTP collaborator maps [`ErrorKind`] to a status code; nothing in this
//! crate retries or restarts on its own.

use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by the Bridge facade, the Registry, and the Sessions below it.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// The service name is not present in configuration.
    #[error("service '{name}' is not configured")]
    ConfigMissing { name: String },

    /// The operation requires the service to be stopped.
    #[error("service '{name}' is already running")]
    AlreadyRunning { name: String },

    /// The operation requires a running, handshaken service.
    #[error("service '{name}' is not running")]
    NotRunning { name: String },

    /// The backend could not be launched.
    #[error("failed to launch service '{name}': {reason}")]
    LaunchFailed { name: String, reason: String },

    /// The `initialize` exchange did not complete.
    #[error("service '{name}' handshake failed: {reason}")]
    HandshakeFailed { name: String, reason: String },

    /// No response arrived within the caller's deadline.
    #[error("'{method}' on service '{name}' timed out after {timeout_ms}ms")]
    Timeout {
        name: String,
        method: String,
        timeout_ms: u64,
    },

    /// A frame or payload could not be encoded or understood.
    #[error("protocol error on service '{name}': {reason}")]
    ProtocolError { name: String, reason: String },

    /// The backend's output stream closed while the request was outstanding.
    #[error("service '{name}' exited: {reason}")]
    ProcessExited { name: String, reason: String },

    /// No driver can run this descriptor.
    #[error("no usable backend for service '{name}': {reason}")]
    BackendUnavailable { name: String, reason: String },

    /// The child answered with a JSON-RPC error object.
    #[error("service '{name}' returned error [{code}]: {message}")]
    RemoteError {
        name: String,
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },
}

/// Taxonomy kind of a [`BridgeError`], stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    ConfigMissing,
    AlreadyRunning,
    NotRunning,
    LaunchFailed,
    HandshakeFailed,
    Timeout,
    ProtocolError,
    ProcessExited,
    BackendUnavailable,
    RemoteError,
}

impl ErrorKind {
    /// The kind name as it appears on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ConfigMissing => "ConfigMissing",
            ErrorKind::AlreadyRunning => "AlreadyRunning",
            ErrorKind::NotRunning => "NotRunning",
            ErrorKind::LaunchFailed => "LaunchFailed",
            ErrorKind::HandshakeFailed => "HandshakeFailed",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::ProtocolError => "ProtocolError",
            ErrorKind::ProcessExited => "ProcessExited",
            ErrorKind::BackendUnavailable => "BackendUnavailable",
            ErrorKind::RemoteError => "RemoteError",
        }
    }

    /// Conventional HTTP status for this kind.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::ConfigMissing => 404,
            ErrorKind::AlreadyRunning | ErrorKind::NotRunning => 409,
            ErrorKind::LaunchFailed
            | ErrorKind::HandshakeFailed
            | ErrorKind::ProtocolError
            | ErrorKind::ProcessExited
            | ErrorKind::RemoteError => 502,
            ErrorKind::BackendUnavailable => 503,
            ErrorKind::Timeout => 504,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl BridgeError {
    /// The taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::ConfigMissing { .. } => ErrorKind::ConfigMissing,
            BridgeError::AlreadyRunning { .. } => ErrorKind::AlreadyRunning,
            BridgeError::NotRunning { .. } => ErrorKind::NotRunning,
            BridgeError::LaunchFailed { .. } => ErrorKind::LaunchFailed,
            BridgeError::HandshakeFailed { .. } => ErrorKind::HandshakeFailed,
            BridgeError::Timeout { .. } => ErrorKind::Timeout,
            BridgeError::ProtocolError { .. } => ErrorKind::ProtocolError,
            BridgeError::ProcessExited { .. } => ErrorKind::ProcessExited,
            BridgeError::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            BridgeError::RemoteError { .. } => ErrorKind::RemoteError,
        }
    }

    /// The service this error concerns.
    pub fn service(&self) -> &str {
        match self {
            BridgeError::ConfigMissing { name }
            | BridgeError::AlreadyRunning { name }
            | BridgeError::NotRunning { name }
            | BridgeError::LaunchFailed { name, .. }
            | BridgeError::HandshakeFailed { name, .. }
            | BridgeError::Timeout { name, .. }
            | BridgeError::ProtocolError { name, .. }
            | BridgeError::ProcessExited { name, .. }
            | BridgeError::BackendUnavailable { name, .. }
            | BridgeError::RemoteError { name, .. } => name,
        }
    }

    /// JSON body for an HTTP error response: `{kind, service, message}`.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": self.kind(),
            "service": self.service(),
            "message": self.to_string(),
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
