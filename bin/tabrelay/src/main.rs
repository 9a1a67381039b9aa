use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tabrelay_bridge::{CommandRegistry, Dispatcher, Executor, WsConnector};
use tabrelay_core::BridgeConfig;

#[derive(Parser)]
#[command(name = "tabrelay")]
#[command(about = "RPC bridge between a tool-calling client and a browser extension", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the executor peer: accept the extension connection and answer
    /// calls against the built-in diagnostic operations
    Listen {
        /// Address to listen on (overrides config listenAddr)
        #[arg(long)]
        addr: Option<String>,
    },

    /// Submit one operation over the bridge and print the result
    Call {
        /// Operation name
        operation: String,

        /// Arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        arguments: String,

        /// Executor endpoint (overrides config endpoint)
        #[arg(short, long)]
        endpoint: Option<String>,
    },
}

/// Diagnostic operations available before an extension registers real
/// browser handlers; they let the channel be exercised end to end.
fn diagnostic_registry() -> CommandRegistry {
    let mut registry = CommandRegistry::new();
    registry.register_fn("ping", |_| async { Ok(json!("pong")) });
    registry.register_fn("echo", |arguments| async move { Ok(arguments) });
    registry
}

async fn run_listen(config: BridgeConfig, addr: Option<String>) -> anyhow::Result<()> {
    let addr = addr.unwrap_or(config.listen_addr);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Listening for the extension connection");

    let registry = diagnostic_registry();
    let mut names = registry.operation_names();
    names.sort();
    info!(operations = ?names, "Registry ready");

    let executor = Executor::new(registry);
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(());
    });
    executor.listen(listener, shutdown_rx).await?;
    Ok(())
}

async fn run_call(
    config: BridgeConfig,
    operation: String,
    arguments: String,
    endpoint: Option<String>,
) -> anyhow::Result<()> {
    let arguments: Value = serde_json::from_str(&arguments)
        .map_err(|e| anyhow::anyhow!("--arguments is not valid JSON: {}", e))?;
    let endpoint = endpoint.unwrap_or_else(|| config.endpoint.clone());

    let connector = Arc::new(WsConnector::new(endpoint)?);
    let dispatcher = Dispatcher::new(&config);
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.run(connector, shutdown_rx).await });
    }

    let result = dispatcher.submit(&operation, arguments).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    let _ = shutdown_tx.send(());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config_path = cli
        .config
        .unwrap_or_else(|| PathBuf::from("tabrelay.json"));
    let config = BridgeConfig::load(&config_path)?;

    match cli.command {
        Commands::Listen { addr } => run_listen(config, addr).await,
        Commands::Call {
            operation,
            arguments,
            endpoint,
        } => run_call(config, operation, arguments, endpoint).await,
    }
}
