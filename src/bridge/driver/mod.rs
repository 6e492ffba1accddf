//! Backend drivers: how a service descriptor becomes a running program.
//!
//! Two variants exist. `LocalProcess` children speak the protocol over stdio
//! and get a Session; `Container` backends are status/logs/stop only.

pub mod container;
pub mod env;
pub mod logs;
pub mod process;

pub use container::{ContainerDriver, ContainerInfo, ContainerSettings};
pub use logs::LogBuffer;
pub use process::{LocalProcessDriver, ProcessBackend};

use crate::bridge::errors::BridgeError;
use crate::config::ServiceDescriptor;

/// Which driver runs a descriptor, and with what.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchPlan {
    LocalProcess { command: String, args: Vec<String> },
    Container { image: String },
}

impl LaunchPlan {
    pub fn backend_name(&self) -> &'static str {
        match self {
            LaunchPlan::LocalProcess { .. } => "process",
            LaunchPlan::Container { .. } => "container",
        }
    }
}

/// Pick a driver for `descriptor`.
///
/// An explicit `command` always runs locally. An `image` that is a launcher
/// command line (`uvx pkg`, `npx -y pkg`) also runs locally, split on
/// whitespace. Any other image needs the container engine.
pub fn plan_launch(
    descriptor: &ServiceDescriptor,
    engine_available: bool,
) -> Result<LaunchPlan, BridgeError> {
    if let Some(command) = descriptor.command.as_deref().filter(|c| !c.trim().is_empty()) {
        return Ok(LaunchPlan::LocalProcess {
            command: command.to_string(),
            args: descriptor.args.clone(),
        });
    }

    let Some(image) = descriptor.image.as_deref().map(str::trim).filter(|i| !i.is_empty()) else {
        return Err(BridgeError::BackendUnavailable {
            name: descriptor.name.clone(),
            reason: "descriptor has neither a command nor an image".into(),
        });
    };

    if let Some((command, launcher_args)) = launcher_command(image) {
        let mut args = launcher_args;
        args.extend(descriptor.args.iter().cloned());
        return Ok(LaunchPlan::LocalProcess { command, args });
    }

    if engine_available {
        return Ok(LaunchPlan::Container {
            image: image.to_string(),
        });
    }

    Err(BridgeError::BackendUnavailable {
        name: descriptor.name.clone(),
        reason: format!("image '{image}' needs a container engine and none is available"),
    })
}

/// Split a launcher command line into program and arguments.
fn launcher_command(image: &str) -> Option<(String, Vec<String>)> {
    let mut parts = image.split_whitespace();
    let program = parts.next()?;
    let rest: Vec<String> = parts.map(str::to_string).collect();
    if rest.is_empty() {
        return None;
    }
    Some((program.to_string(), rest))
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::errors::ErrorKind;

    fn descriptor(command: Option<&str>, image: Option<&str>) -> ServiceDescriptor {
        ServiceDescriptor {
            name: "svc".into(),
            command: command.map(Into::into),
            image: image.map(Into::into),
            ..Default::default()
        }
    }

    #[test]
    fn test_command_wins_over_image() {
        let plan = plan_launch(&descriptor(Some("node"), Some("ghcr.io/x/y:1")), true).unwrap();
        assert_eq!(
            plan,
            LaunchPlan::LocalProcess {
                command: "node".into(),
                args: vec![]
            }
        );
    }

    #[test]
    fn test_launcher_image_runs_locally() {
        let mut d = descriptor(None, Some("npx -y @modelcontextprotocol/server-memory"));
        d.args = vec!["--verbose".into()];
        let plan = plan_launch(&d, false).unwrap();
        assert_eq!(
            plan,
            LaunchPlan::LocalProcess {
                command: "npx".into(),
                args: vec![
                    "-y".into(),
                    "@modelcontextprotocol/server-memory".into(),
                    "--verbose".into()
                ]
            }
        );
    }

    #[test]
    fn test_plain_image_needs_engine() {
        let d = descriptor(None, Some("mcp/github:latest"));
        assert_eq!(
            plan_launch(&d, true).unwrap(),
            LaunchPlan::Container {
                image: "mcp/github:latest".into()
            }
        );
        let err = plan_launch(&d, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
    }

    #[test]
    fn test_nothing_to_launch() {
        let err = plan_launch(&descriptor(None, None), true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
    }
}
