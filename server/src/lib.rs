#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]

//! relayctl library, shared by the `relayctl` binary and `mcp-relayctl`.
//!
//! - `relay`: hybrid connection listener, forwarder and SAS tokens
//! - `machines`: route dispatch and machine state persistence
//! - `config`: configuration loading
//! - `util`: request target parsing

pub mod config;
pub mod machines;
pub mod relay;
pub mod util;

// Re-export key types at crate root for convenience.
pub use config::{Config, ConfigError};
pub use machines::{MachineRoute, MachineStore, StateFile};
pub use relay::forwarder::{ForwardError, RelayForwarder};
pub use relay::listener::{ListenerState, RelayListener};
pub use relay::RelayConnection;

/// Install the global tracing subscriber. `RUST_LOG` wins over `level`.
pub fn init_tracing(level: &str, to_stderr: bool) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| level.to_string());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if to_stderr {
        builder.with_writer(std::io::stderr).init();
    } else {
        builder.init();
    }
}
