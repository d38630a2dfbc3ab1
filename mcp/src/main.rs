//! # mcp-relayctl
//!
//! MCP (Model Context Protocol) server that turns tool calls into machine
//! operations sent through an Azure Relay hybrid connection. Runs as a stdio
//! JSON-RPC server launched by an agent host.
//!
//! ## Architecture
//!
//! ```text
//! main.rs    entry point, config loading, MCP server launch
//! mcp.rs     MCP JSON-RPC protocol handler (stdio)
//! tools.rs   tool definitions and handlers
//! ```
//!
//! ## Tools
//!
//! - `start_machine`, `stop_machine`, `get_machine_status`: forwarded to the
//!   relay listener via [`RelayForwarder`]
//! - `echo`: local connectivity check

mod mcp;
mod tools;

use std::sync::Arc;

use clap::Parser;
use relayctl::{Config, RelayConnection, RelayForwarder};
use tracing::info;

/// CLI arguments parsed by `clap`.
#[derive(Parser)]
#[command(name = "mcp-relayctl", about = "MCP server for relay-controlled machines")]
struct Cli {
    /// Path to TOML config file (default `relayctl.toml` in CWD)
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("mcp-relayctl: configuration error: {e}");
            std::process::exit(1);
        }
    };
    relayctl::init_tracing(&config.logging.level, true);

    let forwarder = match RelayConnection::from_config(&config.relay)
        .map_err(|e| e.to_string())
        .and_then(|c| {
            RelayForwarder::new(Arc::new(c), &config.forwarder).map_err(|e| e.to_string())
        }) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("mcp-relayctl: {e}");
            std::process::exit(1);
        }
    };

    info!(
        relay = %forwarder.connection().base_url(),
        "mcp-relayctl ready"
    );

    mcp::run_stdio(&forwarder).await;
}
