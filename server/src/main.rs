#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # relayctl
//!
//! Machine power control through an Azure Relay hybrid connection.
//!
//! The listener runs next to the machines, holds an outbound WebSocket to the
//! relay, and serves the relayed requests below against a JSON state file.
//! Callers never reach the listener directly; they post to the relay's public
//! endpoint with a SAS token.
//!
//! ## Subcommands
//!
//! - `relayctl listen` (default): run the listener until SIGINT/SIGTERM
//! - `relayctl send <route> <machine>`: forward one request, print the body
//!
//! ## Relayed API
//!
//! | Method | Path                    | Query            | Response                         |
//! |--------|-------------------------|------------------|----------------------------------|
//! | POST   | `/<channel>/start`      | `machine=<id>`   | `{"machine", "status":"started"}`|
//! | POST   | `/<channel>/stop`       | `machine=<id>`   | `{"machine", "status":"stopped"}`|
//! | POST   | `/<channel>/get_status` | `machine=<id>`   | `{"machine", "isOn": bool}`      |
//!
//! ## Architecture
//!
//! ```text
//! main.rs               entry point, clap subcommands, graceful shutdown
//! config.rs             TOML + env-var configuration
//! util.rs               query string and route parsing
//! machines/
//!   mod.rs              MachineRoute, MachineStore (single-writer guard)
//!   store.rs            state file load/save
//!   routes.rs           relayed request dispatch and status mapping
//! relay/
//!   mod.rs              RelayConnection (addresses + token provider)
//!   token.rs            SAS token issuing
//!   protocol.rs         control channel messages
//!   listener.rs         control channel loop, per-request tasks
//!   forwarder.rs        caller-side HTTPS forwarding
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use relayctl::{
    Config, MachineRoute, MachineStore, RelayConnection, RelayForwarder, RelayListener, StateFile,
};

/// Machine power control through an Azure Relay hybrid connection.
#[derive(Parser)]
#[command(name = "relayctl", version)]
struct Cli {
    /// Path to TOML config file (default `relayctl.toml` in CWD).
    #[arg(long, global = true)]
    config: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay listener (default when no subcommand given).
    Listen,
    /// Forward one request through the relay and print the response body.
    Send {
        /// `start`, `stop` or `get_status`.
        route: String,
        /// Machine identifier.
        machine: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("relayctl: configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command.unwrap_or(Commands::Listen) {
        Commands::Listen => run_listener(config).await,
        Commands::Send { route, machine } => run_send(config, &route, &machine).await,
    }
}

async fn run_listener(config: Config) -> ExitCode {
    relayctl::init_tracing(&config.logging.level, false);

    info!("relayctl v{} starting", env!("CARGO_PKG_VERSION"));
    let connection = match RelayConnection::from_config(&config.relay) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            tracing::error!("Configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!(
        namespace = %config.relay.namespace,
        path = %config.relay.hybrid_connection_path,
        state_file = %config.state.path,
        "Starting machine listener"
    );

    let store = Arc::new(MachineStore::new(StateFile::new(&config.state.path)));
    let listener = RelayListener::new(connection, store, config.listener.clone());

    let cancel = CancellationToken::new();
    let signal_task = tokio::spawn(cancel_on_signal(cancel.clone()));

    let result = listener.run(cancel).await;
    signal_task.abort();

    match result {
        Ok(()) => {
            info!("Goodbye");
            ExitCode::SUCCESS
        }
        Err(_) => ExitCode::FAILURE,
    }
}

async fn run_send(config: Config, route: &str, machine: &str) -> ExitCode {
    relayctl::init_tracing(&config.logging.level, true);

    let Some(route) = MachineRoute::parse(route) else {
        eprintln!("relayctl: unknown route '{route}' (expected start, stop or get_status)");
        return ExitCode::from(2);
    };
    let forwarder = match RelayConnection::from_config(&config.relay)
        .map_err(|e| e.to_string())
        .and_then(|c| {
            RelayForwarder::new(Arc::new(c), &config.forwarder).map_err(|e| e.to_string())
        }) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("relayctl: {e}");
            return ExitCode::FAILURE;
        }
    };

    match forwarder.send(route, machine).await {
        Ok(body) => {
            println!("{body}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("relayctl: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Fire `cancel` on SIGINT, or SIGTERM on unix.
async fn cancel_on_signal(cancel: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
    cancel.cancel();
}
