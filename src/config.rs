//! Gateway configuration loading and validation.
//!
//! Reads a YAML file describing the server, the container engine, and the
//! services to bridge. Env files listed in the config are loaded into the
//! process environment first, then `${VAR}` / `${VAR:-default}` references in
//! the file are interpolated.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::bridge::session::SessionOptions;
use crate::bridge::types::McpTool;

/// Config file used when neither `--config` nor `MCP_GATEWAY_CONFIG` is set.
pub const DEFAULT_CONFIG_PATH: &str = "./config.yaml";

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    /// `.env`-style files loaded before `valueFrom: env:` is resolved.
    #[serde(default)]
    pub env_files: Vec<String>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// Address the HTTP collaborator binds to.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    8080
}

/// Container engine settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerConfig {
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default = "default_restart_policy")]
    pub restart_policy: String,
    /// Engine socket; platform default when unset.
    #[serde(default)]
    pub socket_path: Option<String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            network: None,
            restart_policy: default_restart_policy(),
            socket_path: None,
        }
    }
}

fn default_restart_policy() -> String {
    "no".into()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub enabled: Vec<ServiceDescriptor>,
}

/// Protocol timeouts, in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutConfig {
    #[serde(default = "default_handshake_ms")]
    pub handshake_ms: u64,
    #[serde(default = "default_call_ms")]
    pub call_ms: u64,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handshake_ms: default_handshake_ms(),
            call_ms: default_call_ms(),
            stop_grace_ms: default_stop_grace_ms(),
        }
    }
}

fn default_handshake_ms() -> u64 {
    30_000
}

fn default_call_ms() -> u64 {
    30_000
}

fn default_stop_grace_ms() -> u64 {
    5_000
}

impl TimeoutConfig {
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            handshake_timeout: Duration::from_millis(self.handshake_ms),
            call_timeout: Duration::from_millis(self.call_ms),
            stop_grace: Duration::from_millis(self.stop_grace_ms),
        }
    }
}

/// One bridged service. Read-only to the bridge.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: String,
    /// Container image, or a launcher command line such as `uvx pkg`.
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvBinding>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Tools reported before a live `tools/list` has been made.
    #[serde(default)]
    pub tools: Vec<McpTool>,
}

fn default_enabled() -> bool {
    true
}

impl Default for ServiceDescriptor {
    fn default() -> Self {
        Self {
            name: String::new(),
            display_name: None,
            description: String::new(),
            image: None,
            command: None,
            args: Vec::new(),
            env: Vec::new(),
            port: None,
            enabled: default_enabled(),
            tools: Vec::new(),
        }
    }
}

impl ServiceDescriptor {
    /// Display name, falling back to the service name.
    pub fn display_name(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|d| !d.is_empty())
            .unwrap_or(&self.name)
    }
}

/// Environment variable passed to a backend.
///
/// `value` is a literal; `value_from` is an indirect reference such as
/// `env:GITHUB_TOKEN`. A literal wins when both are present.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvBinding {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub value_from: Option<String>,
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Only the env file list, read before interpolation.
#[derive(Deserialize)]
struct EnvFilesOnly {
    #[serde(default, rename = "envFiles")]
    env_files: Vec<String>,
}

/// Load, interpolate, and validate the configuration file at `path`.
pub fn load_config(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    // Env files must be in the environment before `${VAR}` is expanded.
    let prelude: EnvFilesOnly = parse_yaml(path, &raw)?;
    load_env_files(&prelude.env_files);

    let config: GatewayConfig = parse_yaml(path, &interpolate_env(&raw))?;
    config.validate()?;

    tracing::info!(
        path = %path.display(),
        services = config.mcp.enabled.len(),
        "configuration loaded"
    );
    Ok(config)
}

fn parse_yaml<T: serde::de::DeserializeOwned>(path: &Path, raw: &str) -> Result<T, ConfigError> {
    serde_yaml::from_str(raw).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Load each env file into the process environment. Variables already set
/// are left alone. A missing or malformed file is a warning.
pub fn load_env_files(files: &[String]) {
    for file in files {
        let path = PathBuf::from(home_relative(file));
        match dotenvy::from_path(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "env file loaded"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to load env file"),
        }
    }
}

impl GatewayConfig {
    /// Parse a YAML document without touching the filesystem or environment.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = parse_yaml(Path::new("<inline>"), raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the bridge cannot serve.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for service in &self.mcp.enabled {
            let name = service.name.trim();
            if name.is_empty() {
                return Err(ConfigError::Invalid {
                    reason: "service with an empty name".into(),
                });
            }
            if !seen.insert(name) {
                return Err(ConfigError::Invalid {
                    reason: format!("duplicate service name '{name}'"),
                });
            }
            let has = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
            if !has(&service.command) && !has(&service.image) {
                return Err(ConfigError::Invalid {
                    reason: format!("service '{name}' has neither a command nor an image"),
                });
            }
        }
        Ok(())
    }

    /// Look up a service by name.
    pub fn service(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.mcp.enabled.iter().find(|s| s.name == name)
    }
}

// ─── Placeholders ────────────────────────────────────────────────────────────

/// Expand `${NAME}` and `${NAME:-fallback}` from the process environment.
fn interpolate_env(raw: &str) -> String {
    expand_placeholders(raw, |name| std::env::var(name).ok())
}

/// Expand placeholders using `lookup`. Unknown names without a fallback
/// become empty; an unterminated `${` is kept as written.
fn expand_placeholders<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let body = &rest[open + 2..];
        let Some(close) = body.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        let expr = &body[..close];
        let value = match expr.split_once(":-") {
            Some((name, fallback)) => lookup(name).unwrap_or_else(|| home_relative(fallback)),
            None => lookup(expr).unwrap_or_default(),
        };
        out.push_str(&value);
        rest = &body[close + 1..];
    }
    out.push_str(rest);
    out
}

/// Resolve a leading `~` against the home directory.
fn home_relative(path: &str) -> String {
    match (path.strip_prefix('~'), dirs::home_dir()) {
        (Some(tail), Some(home)) => format!("{}{tail}", home.display()),
        _ => path.to_string(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    const SAMPLE: &str = r#"
server:
  port: 9090
docker:
  network: mcp-net
mcp:
  enabled:
    - name: github
      displayName: GitHub
      description: Repository tools
      image: mcp/github:latest
      port: 3001
      env:
        - name: GITHUB_TOKEN
          valueFrom: env:GITHUB_TOKEN
    - name: memory
      image: npx -y @modelcontextprotocol/server-memory
      enabled: false
      tools:
        - name: remember
          description: Store a fact
          inputSchema: {type: object}
    - name: local
      command: ./bin/server
      args: ["--stdio"]
timeouts:
  callMs: 1500
"#;

    #[test]
    fn test_parse_sample_with_defaults() {
        let config = GatewayConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.docker.network.as_deref(), Some("mcp-net"));
        assert_eq!(config.docker.restart_policy, "no");
        assert_eq!(config.mcp.enabled.len(), 3);

        let github = config.service("github").unwrap();
        assert_eq!(github.display_name(), "GitHub");
        assert_eq!(github.port, Some(3001));
        assert!(github.enabled);
        assert_eq!(github.env[0].value_from.as_deref(), Some("env:GITHUB_TOKEN"));

        let memory = config.service("memory").unwrap();
        assert!(!memory.enabled);
        assert_eq!(memory.display_name(), "memory");
        assert_eq!(memory.tools[0].name, "remember");

        let options = config.timeouts.session_options();
        assert_eq!(options.call_timeout, Duration::from_millis(1500));
        assert_eq!(options.handshake_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let yaml = "mcp:\n  enabled:\n    - {name: a, command: x}\n    - {name: a, command: y}\n";
        let err = GatewayConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate service name 'a'"));
    }

    #[test]
    fn test_descriptor_needs_command_or_image() {
        let yaml = "mcp:\n  enabled:\n    - {name: empty}\n";
        let err = GatewayConfig::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = load_config(Path::new("/nonexistent/mcp-gateway.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_with_env_file_and_interpolation() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("gateway.env");
        std::fs::write(&env_path, "MCPGW_TEST_STUB_CMD=/usr/bin/true\n").unwrap();

        let mut file = tempfile::NamedTempFile::new_in(dir.path()).unwrap();
        write!(
            file,
            "envFiles: [\"{}\"]\nmcp:\n  enabled:\n    - name: stub\n      command: ${{MCPGW_TEST_STUB_CMD}}\n      description: ${{MCPGW_TEST_UNSET:-fallback}}\n",
            env_path.display()
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        let stub = config.service("stub").unwrap();
        assert_eq!(stub.command.as_deref(), Some("/usr/bin/true"));
        assert_eq!(stub.description, "fallback");
    }

    #[test]
    fn test_placeholders_use_lookup_and_fallbacks() {
        let vars: HashMap<&str, &str> = [("A", "1"), ("HOST", "db")].into_iter().collect();
        let lookup = |name: &str| vars.get(name).map(|v| v.to_string());

        assert_eq!(expand_placeholders("plain: value", lookup), "plain: value");
        assert_eq!(expand_placeholders("${A}-${B:-dflt}-${C}", lookup), "1-dflt-");
        assert_eq!(expand_placeholders("url: ${HOST:-x}:5432", lookup), "url: db:5432");
        assert_eq!(expand_placeholders("cost: $5 ${A}", lookup), "cost: $5 1");
    }

    #[test]
    fn test_unterminated_placeholder_is_kept() {
        let lookup = |_: &str| Some("never".to_string());
        assert_eq!(expand_placeholders("a: ${OPEN\nb: 2", lookup), "a: ${OPEN\nb: 2");
    }

    #[test]
    fn test_fallback_and_env_file_paths_resolve_home() {
        let expanded = home_relative("~/mcp.env");
        assert!(!expanded.starts_with('~'));
        assert!(expanded.ends_with("/mcp.env"));
        assert_eq!(home_relative("/etc/mcp.env"), "/etc/mcp.env");

        let from_fallback = expand_placeholders("${NOPE:-~/data}", |_| None);
        assert!(from_fallback.ends_with("/data") && !from_fallback.starts_with('~'));
    }
}
