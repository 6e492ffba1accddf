//! MCP gateway.
//!
//! Bridges MCP servers that speak newline-delimited JSON-RPC over stdio
//! (local processes) or run as containers, and exposes them through the
//! [`Bridge`] facade: list, start, stop, remove, call tools, read logs.

pub mod bridge;
pub mod config;
pub mod logging;

pub use bridge::{Bridge, BridgeError, ErrorKind, ServiceInfo, ServiceStatus};
pub use config::{load_config, GatewayConfig, ServiceDescriptor};
