//! mcp-gateway: runs configured MCP servers behind the Service Bridge.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use mcp_gateway::config::{load_config, DEFAULT_CONFIG_PATH};
use mcp_gateway::logging::{default_log_dir, init_tracing, LogOptions};
use mcp_gateway::{Bridge, BridgeError};
use serde_json::Value;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "mcp-gateway")]
#[command(about = "Bridge stdio MCP servers and containers behind one facade")]
#[command(version)]
struct Cli {
    /// Path to the YAML config file
    #[arg(short, long, env = "MCP_GATEWAY_CONFIG", default_value = DEFAULT_CONFIG_PATH, global = true)]
    config: PathBuf,

    /// Directory for log files (serve defaults to the platform data dir)
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start enabled services and run until interrupted
    Serve,

    /// Print every configured service with its status
    List,

    /// Start a service and print its tools
    Tools {
        /// Service name
        service: String,
    },

    /// Start a service, call one tool, and print the result
    Call {
        /// Service name
        service: String,

        /// Tool name
        tool: String,

        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,

        /// Per-call timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Serve);

    let log_dir = match command {
        Commands::Serve => Some(cli.log_dir.unwrap_or_else(default_log_dir)),
        _ => cli.log_dir,
    };
    init_tracing(&LogOptions {
        dir: log_dir,
        json: cli.log_json,
    })?;

    let config = load_config(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    let bridge = Bridge::from_config(&config).await;

    match command {
        Commands::Serve => serve(&bridge).await,
        Commands::List => print_json(&bridge.list_services().await),
        Commands::Tools { service } => {
            let outcome: Result<_, BridgeError> = async {
                bridge.start_service(&service).await?;
                bridge.list_tools(&service).await
            }
            .await;
            finish_one_shot(&bridge, &service).await;
            print_json(&outcome?)
        }
        Commands::Call {
            service,
            tool,
            args,
            timeout_ms,
        } => {
            let arguments: Value =
                serde_json::from_str(&args).context("--args must be valid JSON")?;
            if !arguments.is_object() {
                bail!("--args must be a JSON object");
            }
            let outcome: Result<_, BridgeError> = async {
                bridge.start_service(&service).await?;
                match timeout_ms {
                    Some(ms) => {
                        bridge
                            .call_tool_with_timeout(&service, &tool, arguments, Duration::from_millis(ms))
                            .await
                    }
                    None => bridge.call_tool(&service, &tool, arguments).await,
                }
            }
            .await;
            finish_one_shot(&bridge, &service).await;
            print_json(&outcome?)
        }
    }
}

async fn serve(bridge: &Bridge) -> anyhow::Result<()> {
    let failures = bridge.start_enabled().await;
    for service in bridge.list_services().await {
        info!(
            service = %service.name,
            status = %service.status,
            backend = service.backend.unwrap_or("-"),
            tools = service.tools.len(),
            "service"
        );
    }
    if !failures.is_empty() {
        warn!(count = failures.len(), "some services failed to start");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    bridge.shutdown().await;
    Ok(())
}

/// Stop a service started for a one-shot command, logging instead of failing.
async fn finish_one_shot(bridge: &Bridge, service: &str) {
    if let Err(e) = bridge.stop_service(service).await {
        tracing::debug!(service, error = %e, "stop after one-shot command");
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
