//! Container backend via the local container engine.
//!
//! Containers speak the protocol through their own entrypoint, so the gateway
//! only creates, starts, stops, removes, and inspects them. No stdio bridging.

use std::collections::HashMap;

use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::models::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use futures::StreamExt;
use serde::Serialize;

use crate::bridge::errors::BridgeError;
use crate::bridge::session::ServiceStatus;
use crate::config::ServiceDescriptor;

/// Label marking containers owned by this gateway.
pub const OWNER_LABEL: &str = "mcp-gateway";

/// Label carrying the service name.
pub const SERVICE_LABEL: &str = "service";

/// Log lines fetched from the engine per request.
const LOG_TAIL: &str = "100";

/// Seconds the engine waits between SIGTERM and SIGKILL on stop.
const DEFAULT_STOP_SECS: i64 = 10;

/// Engine timeout in seconds for socket connections.
const CONNECT_TIMEOUT_SECS: u64 = 120;

/// Deterministic container name for a service.
pub fn container_name(service: &str) -> String {
    format!("mcp-gateway-{service}")
}

// ─── Settings ────────────────────────────────────────────────────────────────

/// Engine-wide options applied to every container the gateway creates.
#[derive(Debug, Clone, Default)]
pub struct ContainerSettings {
    pub network: Option<String>,
    pub restart_policy: String,
}

fn restart_policy(name: &str) -> RestartPolicy {
    let name = match name {
        "always" => RestartPolicyNameEnum::ALWAYS,
        "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        _ => RestartPolicyNameEnum::NO,
    };
    RestartPolicy {
        name: Some(name),
        maximum_retry_count: None,
    }
}

// ─── Engine State ────────────────────────────────────────────────────────────

/// What the engine reports about one service's container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInfo {
    pub id: String,
    /// Engine state string (`running`, `exited`, `created`, ...).
    pub state: String,
    /// First published host port, if any.
    pub public_port: Option<u16>,
}

impl ContainerInfo {
    /// Facade status derived from the engine's own state field.
    pub fn status(&self) -> ServiceStatus {
        match self.state.as_str() {
            "running" => ServiceStatus::Running,
            "created" | "restarting" => ServiceStatus::Starting,
            "dead" => ServiceStatus::Failed,
            _ => ServiceStatus::Stopped,
        }
    }
}

// ─── Driver ──────────────────────────────────────────────────────────────────

/// Manages service containers through the engine API.
#[derive(Clone)]
pub struct ContainerDriver {
    docker: Docker,
    settings: ContainerSettings,
}

impl ContainerDriver {
    /// Connect to the engine and verify it answers. `None` when unavailable.
    pub async fn detect(socket_path: Option<&str>, settings: ContainerSettings) -> Option<Self> {
        let connected = match socket_path {
            Some(path) => {
                Docker::connect_with_socket(path, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            }
            None => Docker::connect_with_local_defaults(),
        };
        let docker = match connected {
            Ok(docker) => docker,
            Err(e) => {
                tracing::info!(error = %e, "container engine not reachable, containers disabled");
                return None;
            }
        };
        if let Err(e) = docker.ping().await {
            tracing::info!(error = %e, "container engine did not answer ping, containers disabled");
            return None;
        }
        tracing::info!("container engine available");
        Some(Self { docker, settings })
    }

    /// Create the service's container if needed and start it.
    ///
    /// An existing container with the same name is reused.
    pub async fn start(
        &self,
        descriptor: &ServiceDescriptor,
        image: &str,
        env: &[(String, String)],
    ) -> Result<ContainerInfo, BridgeError> {
        let service = descriptor.name.as_str();
        let name = container_name(service);

        let existing = self.find(service).await?;
        let id = match existing {
            Some(info) if info.state == "running" => {
                tracing::info!(service, container = %name, "container already running");
                return Ok(info);
            }
            Some(info) => info.id,
            None => self.create(descriptor, image, env, &name).await?,
        };

        self.docker
            .start_container::<String>(&id, None)
            .await
            .map_err(|e| BridgeError::LaunchFailed {
                name: service.to_string(),
                reason: format!("failed to start container {name}: {e}"),
            })?;
        tracing::info!(service, container = %name, "container started");

        Ok(self.find(service).await?.unwrap_or(ContainerInfo {
            id,
            state: "running".into(),
            public_port: descriptor.port,
        }))
    }

    /// Stop the service's container. Already stopped is success.
    pub async fn stop(&self, service: &str) -> Result<(), BridgeError> {
        let name = container_name(service);
        let options = StopContainerOptions { t: DEFAULT_STOP_SECS };
        match self.docker.stop_container(&name, Some(options)).await {
            Ok(()) => {
                tracing::info!(service, container = %name, "container stopped");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(BridgeError::NotRunning {
                name: service.to_string(),
            }),
            Err(e) => Err(self.engine_error(service, e)),
        }
    }

    /// Force-remove the service's container. Missing is success.
    pub async fn remove(&self, service: &str) -> Result<(), BridgeError> {
        let name = container_name(service);
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(&name, Some(options)).await {
            Ok(()) => {
                tracing::info!(service, container = %name, "container removed");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(self.engine_error(service, e)),
        }
    }

    /// The last lines of the container's output.
    pub async fn logs(&self, service: &str) -> Result<String, BridgeError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: LOG_TAIL.to_string(),
            follow: false,
            ..Default::default()
        };
        let mut stream = self.docker.logs(&container_name(service), Some(options));
        let mut output = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => output.extend_from_slice(&chunk.into_bytes()),
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => {
                    return Err(BridgeError::NotRunning {
                        name: service.to_string(),
                    })
                }
                Err(e) => {
                    tracing::warn!(service, error = %e, "error reading container logs");
                    break;
                }
            }
        }
        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    /// Engine state of every gateway-owned container, keyed by service name.
    pub async fn states(&self) -> HashMap<String, ContainerInfo> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{OWNER_LABEL}=true")]);
        match self.list(filters).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list gateway containers");
                HashMap::new()
            }
        }
    }

    /// Engine state of one service's container, if it exists.
    pub async fn find(&self, service: &str) -> Result<Option<ContainerInfo>, BridgeError> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![container_name(service)]);
        filters.insert("label".to_string(), vec![format!("{SERVICE_LABEL}={service}")]);
        let mut found = self
            .list(filters)
            .await
            .map_err(|e| self.engine_error(service, e))?;
        Ok(found.remove(service))
    }

    // ─── Internals ───────────────────────────────────────────────────────

    async fn create(
        &self,
        descriptor: &ServiceDescriptor,
        image: &str,
        env: &[(String, String)],
        name: &str,
    ) -> Result<String, BridgeError> {
        let service = descriptor.name.as_str();

        let mut labels = HashMap::new();
        labels.insert(OWNER_LABEL.to_string(), "true".to_string());
        labels.insert(SERVICE_LABEL.to_string(), service.to_string());

        let mut host_config = HostConfig {
            restart_policy: Some(restart_policy(&self.settings.restart_policy)),
            network_mode: self.settings.network.clone(),
            ..Default::default()
        };

        let mut exposed_ports = HashMap::new();
        if let Some(port) = descriptor.port {
            let key = format!("{port}/tcp");
            exposed_ports.insert(key.clone(), HashMap::new());
            let mut bindings = HashMap::new();
            bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(port.to_string()),
                }]),
            );
            host_config.port_bindings = Some(bindings);
        }

        let config = Config {
            image: Some(image.to_string()),
            cmd: (!descriptor.args.is_empty()).then(|| descriptor.args.clone()),
            env: Some(env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
            labels: Some(labels),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => BridgeError::LaunchFailed {
                    name: service.to_string(),
                    reason: format!("image not found: {image}"),
                },
                _ => BridgeError::LaunchFailed {
                    name: service.to_string(),
                    reason: format!("failed to create container {name}: {e}"),
                },
            })?;

        tracing::info!(service, container = %name, id = %response.id, "container created");
        Ok(response.id)
    }

    async fn list(
        &self,
        filters: HashMap<String, Vec<String>>,
    ) -> Result<HashMap<String, ContainerInfo>, bollard::errors::Error> {
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let service = c.labels.as_ref()?.get(SERVICE_LABEL)?.clone();
                let public_port = c
                    .ports
                    .as_ref()
                    .and_then(|ports| ports.iter().find_map(|p| p.public_port));
                let info = ContainerInfo {
                    id: c.id.unwrap_or_default(),
                    state: c.state.unwrap_or_default(),
                    public_port,
                };
                Some((service, info))
            })
            .collect())
    }

    fn engine_error(&self, service: &str, e: bollard::errors::Error) -> BridgeError {
        BridgeError::BackendUnavailable {
            name: service.to_string(),
            reason: format!("container engine error: {e}"),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
