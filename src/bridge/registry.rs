//! Service registry: name → live backend, with per-name serialization.
//!
//! The set of names is fixed by configuration at construction, so the map
//! itself is never mutated and needs no lock. Each name has its own slot:
//! lifecycle operations (start/stop/remove) hold the slot's operation lock,
//! while tool calls only clone the current backend out of it and never wait
//! on a lifecycle operation of another service.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::driver::env::resolve_from_process;
use super::driver::{plan_launch, ContainerDriver, ContainerInfo, LaunchPlan, LocalProcessDriver};
use super::errors::BridgeError;
use super::session::{ServiceStatus, Session, SessionOptions, SessionState};
use super::types::McpTool;
use crate::config::ServiceDescriptor;

// ─── Slots ───────────────────────────────────────────────────────────────────

/// What currently runs under a service name.
#[derive(Clone)]
pub enum Backend {
    /// Local child speaking the protocol over stdio.
    Process(Session),
    /// Container started through the engine. Status/logs/stop only.
    Container(ContainerInfo),
}

#[derive(Default)]
struct ServiceSlot {
    /// Held for the whole of a start, stop, or remove.
    op: Mutex<()>,
    backend: StdMutex<Option<Backend>>,
}

impl ServiceSlot {
    fn current(&self) -> Option<Backend> {
        self.backend
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set(&self, backend: Option<Backend>) -> Option<Backend> {
        let mut slot = self.backend.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, backend)
    }
}

/// Point-in-time view of one configured service.
#[derive(Debug, Clone)]
pub struct ServiceSnapshot {
    pub descriptor: ServiceDescriptor,
    pub status: ServiceStatus,
    /// `process` or `container` when a backend is known.
    pub backend: Option<&'static str>,
    pub session_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Tools from the last live `tools/list`, if any.
    pub live_tools: Option<Vec<McpTool>>,
    pub port: Option<u16>,
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Owns every Session and container handle the gateway knows about.
pub struct ServiceRegistry {
    services: Vec<ServiceDescriptor>,
    slots: HashMap<String, Arc<ServiceSlot>>,
    process_driver: LocalProcessDriver,
    container_driver: Option<ContainerDriver>,
    options: SessionOptions,
}

impl ServiceRegistry {
    pub fn new(
        services: Vec<ServiceDescriptor>,
        container_driver: Option<ContainerDriver>,
        options: SessionOptions,
    ) -> Self {
        let slots = services
            .iter()
            .map(|s| (s.name.clone(), Arc::new(ServiceSlot::default())))
            .collect();
        Self {
            services,
            slots,
            process_driver: LocalProcessDriver,
            container_driver,
            options,
        }
    }

    /// Configured services in configuration order.
    pub fn descriptors(&self) -> &[ServiceDescriptor] {
        &self.services
    }

    pub fn container_engine_available(&self) -> bool {
        self.container_driver.is_some()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Start `name`. A service that is already starting or running is left
    /// alone and the call succeeds.
    pub async fn start_service(&self, name: &str) -> Result<(), BridgeError> {
        let (descriptor, slot) = self.lookup(name)?;
        let _op = slot.op.lock().await;

        match slot.current() {
            Some(Backend::Process(session)) if session.state().is_active() => {
                tracing::debug!(service = name, session_id = %session.session_id(), "already running");
                return Ok(());
            }
            Some(Backend::Container(_)) => {
                if let Some(info) = self.engine_state(name).await? {
                    if info.status() == ServiceStatus::Running {
                        slot.set(Some(Backend::Container(info)));
                        return Ok(());
                    }
                }
            }
            _ => {}
        }

        let plan = plan_launch(descriptor, self.container_driver.is_some())?;
        let env = resolve_from_process(&descriptor.env);
        tracing::debug!(service = name, backend = plan.backend_name(), env_vars = env.len(), "launch planned");

        match plan {
            LaunchPlan::LocalProcess { command, args } => {
                let session = Session::new(name, self.options);
                // Visible as `starting` while the handshake runs. A failed
                // session stays in the slot until the next start.
                slot.set(Some(Backend::Process(session.clone())));
                session
                    .launch(&self.process_driver, &command, &args, &env)
                    .await
            }
            LaunchPlan::Container { image } => {
                let driver = self.container_driver(name)?;
                let info = driver.start(descriptor, &image, &env).await?;
                slot.set(Some(Backend::Container(info)));
                Ok(())
            }
        }
    }

    /// Stop `name`. Stopping a failed service clears the failure.
    pub async fn stop_service(&self, name: &str) -> Result<(), BridgeError> {
        let (descriptor, slot) = self.lookup(name)?;
        let _op = slot.op.lock().await;

        match slot.set(None) {
            Some(Backend::Process(session)) => {
                if session.state() == SessionState::Failed {
                    tracing::info!(service = name, "cleared failed service");
                    return Ok(());
                }
                session.stop().await
            }
            Some(Backend::Container(_)) => self.container_driver(name)?.stop(name).await,
            None => {
                // A container left behind by an earlier gateway run.
                if self.runs_in_container(descriptor) {
                    if let Some(info) = self.engine_state(name).await? {
                        if info.status() == ServiceStatus::Running {
                            return self.container_driver(name)?.stop(name).await;
                        }
                    }
                }
                Err(BridgeError::NotRunning {
                    name: name.to_string(),
                })
            }
        }
    }

    /// Stop `name` if running, forget it, and delete its container if any.
    pub async fn remove_service(&self, name: &str) -> Result<(), BridgeError> {
        let (descriptor, slot) = self.lookup(name)?;
        let _op = slot.op.lock().await;

        if let Some(Backend::Process(session)) = slot.set(None) {
            match session.stop().await {
                Ok(()) | Err(BridgeError::NotRunning { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        if self.runs_in_container(descriptor) {
            self.container_driver(name)?.remove(name).await?;
        }
        tracing::info!(service = name, "service removed");
        Ok(())
    }

    /// Start every service whose descriptor is enabled, concurrently.
    ///
    /// Returns the failures; the rest keep running.
    pub async fn start_enabled(&self) -> Vec<(String, BridgeError)> {
        let starts = self
            .services
            .iter()
            .filter(|s| s.enabled)
            .map(|s| async move { (s.name.clone(), self.start_service(&s.name).await) });

        let mut failures = Vec::new();
        for (name, outcome) in join_all(starts).await {
            match outcome {
                Ok(()) => tracing::info!(service = %name, "service started"),
                Err(e) => {
                    tracing::warn!(service = %name, error = %e, "service failed to start");
                    failures.push((name, e));
                }
            }
        }
        failures
    }

    /// Stop every local process session. Containers keep running under the
    /// engine's restart policy.
    pub async fn shutdown(&self) {
        let stops = self.slots.iter().map(|(name, slot)| async move {
            let _op = slot.op.lock().await;
            if let Some(Backend::Process(session)) = slot.set(None) {
                if session.state().is_active() {
                    if let Err(e) = session.stop().await {
                        tracing::warn!(service = %name, error = %e, "stop during shutdown failed");
                    }
                }
            }
        });
        join_all(stops).await;
        tracing::info!("all sessions stopped");
    }

    // ─── Protocol ────────────────────────────────────────────────────────

    /// Call `tool` on `name` and return the backend's result.
    pub async fn call_tool(
        &self,
        name: &str,
        tool: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, BridgeError> {
        self.session(name)?.call_tool(tool, arguments, timeout).await
    }

    /// Ask `name` for its tools.
    pub async fn list_tools(&self, name: &str) -> Result<Vec<McpTool>, BridgeError> {
        self.session(name)?.list_tools().await
    }

    /// Recent diagnostic output of `name`.
    pub async fn get_logs(&self, name: &str) -> Result<String, BridgeError> {
        let (descriptor, slot) = self.lookup(name)?;
        match slot.current() {
            Some(Backend::Process(session)) => Ok(session.logs()),
            Some(Backend::Container(_)) => self.container_driver(name)?.logs(name).await,
            None if self.runs_in_container(descriptor) => {
                self.container_driver(name)?.logs(name).await
            }
            None => Err(BridgeError::NotRunning {
                name: name.to_string(),
            }),
        }
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// Status of every configured service, in configuration order.
    pub async fn snapshots(&self) -> Vec<ServiceSnapshot> {
        let engine = match &self.container_driver {
            Some(driver) => driver.states().await,
            None => HashMap::new(),
        };
        self.services
            .iter()
            .map(|descriptor| {
                let backend = self
                    .slots
                    .get(&descriptor.name)
                    .and_then(|slot| slot.current());
                snapshot(descriptor, backend, engine.get(&descriptor.name))
            })
            .collect()
    }

    /// Status of one service.
    pub async fn snapshot(&self, name: &str) -> Result<ServiceSnapshot, BridgeError> {
        let (descriptor, slot) = self.lookup(name)?;
        let backend = slot.current();
        let engine = match backend {
            Some(Backend::Process(_)) => None,
            _ if self.container_driver.is_some() => self.engine_state(name).await?,
            _ => None,
        };
        Ok(snapshot(descriptor, backend, engine.as_ref()))
    }

    // ─── Internals ───────────────────────────────────────────────────────

    fn lookup(&self, name: &str) -> Result<(&ServiceDescriptor, &Arc<ServiceSlot>), BridgeError> {
        let missing = || BridgeError::ConfigMissing {
            name: name.to_string(),
        };
        let descriptor = self.services.iter().find(|s| s.name == name).ok_or_else(missing)?;
        let slot = self.slots.get(name).ok_or_else(missing)?;
        Ok((descriptor, slot))
    }

    /// The protocol session for `name`, if one is live.
    fn session(&self, name: &str) -> Result<Session, BridgeError> {
        let (_, slot) = self.lookup(name)?;
        match slot.current() {
            Some(Backend::Process(session)) => Ok(session),
            Some(Backend::Container(_)) => Err(BridgeError::BackendUnavailable {
                name: name.to_string(),
                reason: "container backends do not expose the stdio protocol".into(),
            }),
            None => Err(BridgeError::NotRunning {
                name: name.to_string(),
            }),
        }
    }

    fn container_driver(&self, name: &str) -> Result<&ContainerDriver, BridgeError> {
        self.container_driver
            .as_ref()
            .ok_or_else(|| BridgeError::BackendUnavailable {
                name: name.to_string(),
                reason: "no container engine available".into(),
            })
    }

    fn runs_in_container(&self, descriptor: &ServiceDescriptor) -> bool {
        matches!(
            plan_launch(descriptor, self.container_driver.is_some()),
            Ok(LaunchPlan::Container { .. })
        )
    }

    async fn engine_state(&self, name: &str) -> Result<Option<ContainerInfo>, BridgeError> {
        match &self.container_driver {
            Some(driver) => driver.find(name).await,
            None => Ok(None),
        }
    }
}

fn snapshot(
    descriptor: &ServiceDescriptor,
    backend: Option<Backend>,
    engine: Option<&ContainerInfo>,
) -> ServiceSnapshot {
    let mut snap = ServiceSnapshot {
        descriptor: descriptor.clone(),
        status: ServiceStatus::Stopped,
        backend: None,
        session_id: None,
        started_at: None,
        error: None,
        live_tools: None,
        port: descriptor.port,
    };

    match backend {
        Some(Backend::Process(session)) => {
            let state = session.state();
            snap.status = state.status();
            snap.backend = Some("process");
            snap.session_id = Some(session.session_id());
            snap.started_at = Some(session.started_at());
            if state == SessionState::Failed {
                snap.error = session.failure_reason();
            }
            snap.live_tools = session.cached_tools();
        }
        Some(Backend::Container(_)) | None => {
            if let Some(info) = engine {
                snap.status = info.status();
                snap.backend = Some("container");
                snap.port = info.public_port.or(descriptor.port);
            }
        }
    }
    snap
}

// ─── Tests ───────────────────────────────────────────────────────────────────
