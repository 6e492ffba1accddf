//! Public operation set consumed by the HTTP collaborator.
//!
//! Every operation is safe to call concurrently. Errors carry an
//! [`ErrorKind`](super::errors::ErrorKind) that maps to a status code.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::driver::{plan_launch, ContainerDriver, ContainerSettings, LaunchPlan};
use super::errors::BridgeError;
use super::registry::{ServiceRegistry, ServiceSnapshot};
use super::session::{ServiceStatus, SessionOptions};
use super::types::McpTool;
use crate::config::{GatewayConfig, ServiceDescriptor};

// ─── DTOs ────────────────────────────────────────────────────────────────────

/// One service as shown to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub status: ServiceStatus,
    pub port: Option<u16>,
    pub tools: Vec<McpTool>,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<ServiceSnapshot> for ServiceInfo {
    fn from(snap: ServiceSnapshot) -> Self {
        let d = snap.descriptor;
        Self {
            display_name: d.display_name().to_string(),
            tools: snap.live_tools.unwrap_or(d.tools),
            name: d.name,
            description: d.description,
            status: snap.status,
            port: snap.port,
            enabled: d.enabled,
            backend: snap.backend,
            session_id: snap.session_id.map(|id| id.to_string()),
            started_at: snap.started_at,
            error: snap.error,
        }
    }
}

/// Gateway liveness summary.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub services: usize,
    pub running: usize,
}

// ─── Bridge ──────────────────────────────────────────────────────────────────

/// The Service Bridge.
pub struct Bridge {
    registry: ServiceRegistry,
}

impl Bridge {
    /// Build from configuration, probing for a container engine.
    pub async fn from_config(config: &GatewayConfig) -> Self {
        let settings = ContainerSettings {
            network: config.docker.network.clone(),
            restart_policy: config.docker.restart_policy.clone(),
        };
        let engine = if needs_container_engine(&config.mcp.enabled) {
            ContainerDriver::detect(config.docker.socket_path.as_deref(), settings).await
        } else {
            None
        };

        Self::new(ServiceRegistry::new(
            config.mcp.enabled.clone(),
            engine,
            config.timeouts.session_options(),
        ))
    }

    pub fn new(registry: ServiceRegistry) -> Self {
        Self { registry }
    }

    /// Bridge over local processes only, with the given timeouts.
    pub fn local(config: &GatewayConfig, options: SessionOptions) -> Self {
        Self::new(ServiceRegistry::new(config.mcp.enabled.clone(), None, options))
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Every configured service with its live status.
    pub async fn list_services(&self) -> Vec<ServiceInfo> {
        self.registry
            .snapshots()
            .await
            .into_iter()
            .map(ServiceInfo::from)
            .collect()
    }

    pub async fn get_service(&self, name: &str) -> Result<ServiceInfo, BridgeError> {
        self.registry.snapshot(name).await.map(ServiceInfo::from)
    }

    /// Start `name` and report its status afterwards. Idempotent.
    pub async fn start_service(&self, name: &str) -> Result<ServiceInfo, BridgeError> {
        self.registry.start_service(name).await?;
        self.get_service(name).await
    }

    pub async fn stop_service(&self, name: &str) -> Result<(), BridgeError> {
        self.registry.stop_service(name).await
    }

    pub async fn remove_service(&self, name: &str) -> Result<(), BridgeError> {
        self.registry.remove_service(name).await
    }

    /// Live tool list of a running service.
    pub async fn list_tools(&self, name: &str) -> Result<Vec<McpTool>, BridgeError> {
        self.registry.list_tools(name).await
    }

    /// Call a tool with the configured call timeout.
    pub async fn call_tool(
        &self,
        name: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<Value, BridgeError> {
        self.registry.call_tool(name, tool, arguments, None).await
    }

    /// Call a tool with an explicit timeout.
    pub async fn call_tool_with_timeout(
        &self,
        name: &str,
        tool: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        self.registry
            .call_tool(name, tool, arguments, Some(timeout))
            .await
    }

    pub async fn get_logs(&self, name: &str) -> Result<String, BridgeError> {
        self.registry.get_logs(name).await
    }

    /// Start every enabled service. Returns the ones that failed.
    pub async fn start_enabled(&self) -> Vec<(String, BridgeError)> {
        self.registry.start_enabled().await
    }

    pub async fn shutdown(&self) {
        self.registry.shutdown().await
    }

    pub async fn health(&self) -> HealthReport {
        let services = self.list_services().await;
        HealthReport {
            status: "healthy",
            timestamp: Utc::now(),
            running: services
                .iter()
                .filter(|s| s.status == ServiceStatus::Running)
                .count(),
            services: services.len(),
        }
    }
}

/// Whether any service would run as a container given an engine.
fn needs_container_engine(services: &[ServiceDescriptor]) -> bool {
    services
        .iter()
        .any(|s| matches!(plan_launch(s, true), Ok(LaunchPlan::Container { .. })))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
