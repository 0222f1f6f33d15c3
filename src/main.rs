use std::sync::Arc;

use agent_backend::backend::local::LocalBackend;
use agent_backend::backend::memory::MemoryBackend;
use agent_backend::backend::remote::{Closeable, RemoteBackend, RemoteConfig};
use agent_backend::backend::{Backend, BackendKind};
use agent_backend::chat::{run_chat_loop, OpenRouterClient, PlainRenderer, ToolDef};
use agent_backend::config::Config;
use agent_backend::mcp::{build_descriptor, DaemonLaunchOptions, McpSession, RemoteDescriptorArgs};
use anyhow::Result;
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agent-backend", about = "Agent execution backend client")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Backend kind when no subcommand is given (spec §6 second invocation form)
    #[arg(long)]
    backend: Option<String>,
    #[arg(long = "rootDir")]
    root_dir: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Run as an MCP stdio daemon over the local filesystem (spec §6 first invocation form)
    Daemon {
        #[arg(long = "rootDir")]
        root_dir: String,
        #[arg(long = "local-only")]
        local_only: bool,
        #[arg(long)]
        isolation: Option<String>,
        #[arg(long)]
        shell: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("agent_backend=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_tree::HierarchicalLayer::new(2).with_targets(true).with_bracketed_fields(false))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Command::Daemon { root_dir, local_only, isolation, shell }) => {
            run_daemon(root_dir, local_only, isolation, shell).await
        }
        None => run_backend_cli(cli.backend, cli.root_dir).await,
    }
}

/// `agent-backend daemon --rootDir <root> --local-only [...]`: builds the
/// MCP transport descriptor a launcher would use to spawn this process as a
/// stdio child, then stands up the corresponding backend in-process.
async fn run_daemon(
    root_dir: String,
    local_only: bool,
    isolation: Option<String>,
    shell: Option<String>,
) -> Result<()> {
    if !local_only {
        tracing::warn!("daemon currently only supports --local-only; ignoring remote request");
    }

    let launch = DaemonLaunchOptions { isolation, shell };
    let descriptor = build_descriptor(
        BackendKind::LocalFilesystem,
        "agent-backend",
        &root_dir,
        &launch,
        None,
    );
    tracing::info!(?descriptor, "daemon transport descriptor");

    let backend: Arc<dyn Backend> = Arc::new(LocalBackend::new(root_dir));
    tracing::info!(root_dir = backend.root_dir(), "local backend ready");

    // The stdio transport itself (reading MCP frames from stdin, writing to
    // stdout) is owned by whatever process embeds this binary as a child —
    // see mcp::session::McpSession::open for the client side of that pairing.
    std::future::pending::<()>().await;
    Ok(())
}

/// `agent-backend --backend {memory,local,remote} --rootDir <root>`: builds
/// the selected backend, opens an MCP session over it, and drives an
/// interactive chat loop against stdin — the Rust analogue of
/// `examples/original_source/examples/PyBasic/main.py`'s
/// `create_backend()` → `get_mcp_client()` → `run_chat()` pipeline.
async fn run_backend_cli(
    backend_flag: Option<String>,
    root_dir_flag: Option<String>,
) -> Result<()> {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "missing required environment");
            std::process::exit(1);
        }
    };

    let root_dir = root_dir_flag.unwrap_or_else(|| config.root_dir.clone());
    let kind = match backend_flag.as_deref() {
        Some("memory") => BackendKind::Memory,
        Some("local") => BackendKind::LocalFilesystem,
        Some("remote") => BackendKind::RemoteFilesystem,
        Some(other) => {
            tracing::error!(backend = other, "unknown --backend value (expected memory, local, or remote)");
            std::process::exit(1);
        }
        None => config.backend_type,
    };

    let remote_args = if kind == BackendKind::RemoteFilesystem {
        let host = config.remote_host.clone().unwrap_or_else(|| "localhost".to_string());
        let port = config.remote_port.unwrap_or(3001);
        Some(RemoteDescriptorArgs {
            url: format!("http://{host}:{port}"),
            auth_token: config.auth_token.clone(),
            scope_path: None,
        })
    } else {
        None
    };

    let backend: Arc<dyn Backend> = match kind {
        BackendKind::Memory => Arc::new(MemoryBackend::new(root_dir.clone())),
        BackendKind::LocalFilesystem => Arc::new(LocalBackend::new(root_dir.clone())),
        BackendKind::RemoteFilesystem => {
            let host = config.remote_host.clone().unwrap_or_else(|| "localhost".to_string());
            let port = config.remote_port.unwrap_or(3001);
            RemoteBackend::new(RemoteConfig {
                root_dir: root_dir.clone(),
                ws_url: format!("ws://{host}:{port}/ssh"),
                host,
                port,
                auth_token: config.auth_token.clone(),
                max_output_length: None,
                prevent_dangerous: false,
                reconnect: Default::default(),
                ssh: Default::default(),
            })
        }
    };

    tracing::info!(kind = ?backend.kind(), root_dir = backend.root_dir(), "backend ready");

    let descriptor = build_descriptor(
        kind,
        "agent-backend",
        &root_dir,
        &DaemonLaunchOptions::default(),
        remote_args.as_ref(),
    );
    tracing::info!(?descriptor, "mcp transport descriptor");

    let session = Arc::new(McpSession::open(&descriptor).await?);

    let tools: Vec<ToolDef> = session
        .list_tools()
        .await?
        .iter()
        .map(tool_to_def)
        .collect();
    tracing::info!(tool_count = tools.len(), "mcp session ready");

    let completion_client = OpenRouterClient::new(config.openrouter_api_key.clone(), config.model.clone());
    let renderer = PlainRenderer;
    let mut history = Vec::new();
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());

    let result = run_chat_loop(stdin, &mut history, &tools, &completion_client, session.as_ref(), &renderer).await;

    session.close().await;
    backend.destroy().await;

    result?;
    Ok(())
}

/// MCP tool metadata has no behavioural depth of its own here (spec §1) —
/// just enough shape to hand the chat loop a name, description, and schema.
fn tool_to_def(tool: &rmcp::model::Tool) -> ToolDef {
    ToolDef {
        name: tool.name.to_string(),
        description: tool.description.as_ref().map(|d| d.to_string()),
        input_schema: serde_json::Value::Object((*tool.input_schema).clone()),
    }
}
