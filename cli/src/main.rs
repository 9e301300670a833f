//! Gateway CLI — operational harness for the tool-server runtime.
//!
//! Four subcommands:
//! - `gatewayctl serve`: boot every configured server and drain a stdin-fed
//!   priority queue of tool calls, standing in for a real chat/front-end
//!   adapter during manual testing.
//! - `gatewayctl call`: boot, make one tool call, print the result, exit.
//! - `gatewayctl list`: boot and print the discovered tool prompt catalog.
//! - `gatewayctl status`: boot and print per-server connection/circuit state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nimbus_gateway::{
    ChannelEventSink, ConnectionPool, EnqueueMeta, GatewayConfig, MessageQueue, MessageQueueConfig,
    RetryPolicy, ToolCall, ToolManager, ToolRegistry,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gatewayctl", version, about = "Operational harness for the tool-server gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot all configured servers and drain a stdin-fed priority queue of
    /// tool calls (one JSON object per line: `{"server","tool","arguments"}`).
    Serve {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Boot, call a single tool, print the result, and exit.
    Call {
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(long)]
        server: String,
        #[arg(long)]
        tool: String,
        #[arg(long, default_value = "{}")]
        arguments: String,
    },
    /// Boot and print the discovered tool prompt catalog.
    List {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Boot and print per-server connection and circuit-breaker status.
    Status {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    print_banner();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();

    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutting down gateway");
        cancel_for_signal.cancel();
    });

    match cli.command {
        Commands::Serve { config } => run_serve(resolve_config(config)?, cancel).await,
        Commands::Call { config, server, tool, arguments } => {
            run_call(resolve_config(config)?, server, tool, arguments).await
        }
        Commands::List { config } => run_list(resolve_config(config)?).await,
        Commands::Status { config } => run_status(resolve_config(config)?).await,
    }
}

/// Build a `ToolManager` from a config file and initialize every configured
/// server's pool.
async fn build_manager(config_path: &Path) -> Result<Arc<ToolManager>> {
    let config = load_config(config_path).await?;
    let servers = config.validate().context("invalid gateway configuration")?;

    let events = ChannelEventSink::new(1024);
    let events: nimbus_gateway::SharedEventSink = Arc::new(events);
    let pool = Arc::new(ConnectionPool::new(config.pool.clone(), events.clone()));
    let registry = Arc::new(ToolRegistry::new());
    let manager = Arc::new(ToolManager::new(pool, registry, RetryPolicy::default(), events));

    let results = manager.initialize_with_configs(servers).await;
    for (server_id, outcome) in &results {
        match outcome {
            Ok(()) => tracing::info!(server = %server_id, "server initialized"),
            Err(e) => tracing::warn!(server = %server_id, error = %e, "server failed to initialize"),
        }
    }

    Ok(manager)
}

/// Boot every configured server, then drain a stdin-fed priority queue of
/// tool calls until EOF or cancellation.
async fn run_serve(config_path: PathBuf, cancel: CancellationToken) -> Result<()> {
    let manager = build_manager(&config_path).await?;
    let config = load_config(&config_path).await?;

    let queue = Arc::new(MessageQueue::new(
        MessageQueueConfig { max_queue_size: config.queue.max_queue_size, ..queue_config_from(&config) },
        nimbus_gateway::events::noop_sink(),
    ));

    let manager_for_processor = manager.clone();
    let processor: nimbus_gateway::Processor = Arc::new(move |message| {
        let manager = manager_for_processor.clone();
        Box::pin(async move {
            let call: ToolCall = serde_json::from_value(message.payload).map_err(|e| e.to_string())?;
            let result = manager.execute_tool(call).await.map_err(|e| e.to_string())?;
            println!("{}", serde_json::to_string(&serialize_result(&result)).unwrap_or_default());
            if result.success {
                Ok(())
            } else {
                Err(result.error.unwrap_or_else(|| "tool execution failed".to_string()))
            }
        })
    });
    queue.start(processor).await;

    tracing::info!("gateway serving; reading tool calls from stdin (one JSON object per line)");

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) if !line.trim().is_empty() => {
                        match serde_json::from_str::<serde_json::Value>(&line) {
                            Ok(payload) => {
                                if let Err(e) = queue.enqueue(payload, None, EnqueueMeta::default()).await {
                                    tracing::warn!(error = %e, "failed to enqueue tool call");
                                }
                            }
                            Err(e) => tracing::warn!(error = %e, "failed to parse stdin line as JSON"),
                        }
                    }
                    Ok(Some(_)) => continue,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(error = %e, "error reading stdin");
                        break;
                    }
                }
            }
        }
    }

    queue.stop().await;
    manager.shutdown().await;
    Ok(())
}

fn queue_config_from(config: &GatewayConfig) -> MessageQueueConfig {
    MessageQueueConfig {
        max_queue_size: config.queue.max_queue_size,
        worker_pool: nimbus_gateway::WorkerPoolConfig {
            min_workers: config.queue.min_workers,
            max_workers: config.queue.max_workers,
            worker_idle_timeout: std::time::Duration::from_millis(config.queue.worker_idle_timeout_ms),
            autoscale: config.queue.autoscale,
            scaling_threshold: config.queue.scaling_threshold,
        },
        priority_boost: nimbus_gateway::PriorityBoostConfig::default(),
        dead_letter: nimbus_gateway::DeadLetterConfig {
            enabled: config.queue.dead_letter_enabled,
            max_retries: config.queue.dead_letter_max_retries,
        },
    }
}

async fn run_call(config_path: PathBuf, server: String, tool: String, arguments: String) -> Result<()> {
    let manager = build_manager(&config_path).await?;
    let arguments: serde_json::Value = serde_json::from_str(&arguments).context("--arguments must be valid JSON")?;
    let tool_id = format!("{server}/{tool}");

    let result = manager
        .execute_tool(ToolCall { server_id: server, tool_id, arguments })
        .await
        .context("tool execution failed")?;

    println!("{}", serde_json::to_string_pretty(&serialize_result(&result))?);
    manager.shutdown().await;
    Ok(())
}

async fn run_list(config_path: PathBuf) -> Result<()> {
    let manager = build_manager(&config_path).await?;
    print!("{}", manager.registry().generate_prompt_catalog());
    manager.shutdown().await;
    Ok(())
}

async fn run_status(config_path: PathBuf) -> Result<()> {
    let manager = build_manager(&config_path).await?;
    for status in manager.all_server_statuses().await {
        let breaker = manager.circuit_breaker_status(&status.server_id).await;
        println!(
            "{}: {:?} (tools={}, circuit={:?})",
            status.server_id,
            status.status,
            status.tool_count,
            breaker.map(|b| b.state)
        );
    }
    manager.shutdown().await;
    Ok(())
}

fn serialize_result(result: &nimbus_gateway::ToolResult) -> serde_json::Value {
    serde_json::json!({
        "toolId": result.tool_id,
        "success": result.success,
        "output": result.output,
        "error": result.error,
        "executionTimeMs": result.execution_time_ms,
    })
}

/// Resolve config file path: explicit flag → ./gateway.json → ~/.config/gateway/gateway.json.
fn resolve_config(explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }

    let local = Path::new("gateway.json");
    if local.exists() {
        return Ok(local.to_path_buf());
    }

    if let Some(config_dir) = dirs::config_dir() {
        let xdg = config_dir.join("gateway").join("gateway.json");
        if xdg.exists() {
            return Ok(xdg);
        }
    }

    Err(anyhow::anyhow!(
        "No gateway.json found. Searched ./gateway.json and ~/.config/gateway/gateway.json. \
         Use --config to specify a path."
    ))
}

async fn load_config(config_path: &Path) -> Result<GatewayConfig> {
    let content = tokio::fs::read_to_string(config_path)
        .await
        .with_context(|| format!("failed to read config file {config_path:?}"))?;
    let config: GatewayConfig =
        serde_json::from_str(&content).with_context(|| format!("failed to parse config file {config_path:?}"))?;
    Ok(config)
}

/// Print the gateway startup banner to stderr. Respects NO_COLOR and skips
/// output when stderr is not a terminal.
fn print_banner() {
    use std::io::IsTerminal;

    if !std::io::stderr().is_terminal() || std::env::var_os("NO_COLOR").is_some() {
        return;
    }

    eprintln!(
        "\n\x1b[1;36mnimbus-gateway\x1b[0m v{}\n",
        env!("CARGO_PKG_VERSION")
    );
}
