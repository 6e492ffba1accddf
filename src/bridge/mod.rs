//! Service Bridge.
//!
//! Runs MCP servers as local processes or containers and exposes their tools
//! through a request/response facade. Concurrent callers share one stdio
//! channel per service; responses are routed back by JSON-RPC request id.

pub mod correlator;
pub mod driver;
pub mod errors;
pub mod facade;
pub mod registry;
pub mod session;
pub mod transport;
pub mod types;

pub use errors::{BridgeError, ErrorKind};
pub use facade::{Bridge, HealthReport, ServiceInfo};
pub use registry::ServiceRegistry;
pub use session::{ServiceStatus, Session, SessionOptions, SessionState};
