//! Machine power state: routes, persistence, and the serialized access path.

pub mod routes;
pub mod store;

use std::fmt;
use std::path::Path;

use tokio::sync::Mutex;

pub use store::{MachineStates, StateFile};

/// The operations a relayed request can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MachineRoute {
    Start,
    Stop,
    GetStatus,
}

impl MachineRoute {
    pub const ALL: [MachineRoute; 3] = [Self::Start, Self::Stop, Self::GetStatus];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::GetStatus => "get_status",
        }
    }

    /// Case-insensitive exact match on the route name.
    pub fn parse(route: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(route))
    }
}

impl fmt::Display for MachineRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single-writer access to the state file.
///
/// Every operation reloads the file, so the file stays the source of truth,
/// and runs under one async mutex, so concurrent start/stop requests cannot
/// interleave their load-mutate-save cycles.
#[derive(Debug)]
pub struct MachineStore {
    file: StateFile,
    guard: Mutex<()>,
}

impl MachineStore {
    pub fn new(file: StateFile) -> Self {
        Self {
            file,
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Record `machine` as on or off and persist the whole mapping.
    pub async fn set_power(&self, machine: &str, is_on: bool) {
        let _guard = self.guard.lock().await;
        let mut states = self.file.load().await;
        states.set(machine, is_on);
        self.file.save(&states).await;
    }

    /// Current state read fresh from disk. No record reads as off.
    pub async fn is_on(&self, machine: &str) -> bool {
        let _guard = self.guard.lock().await;
        self.file.load().await.get(machine).unwrap_or(false)
    }

    /// Full mapping read fresh from disk.
    pub async fn snapshot(&self) -> MachineStates {
        let _guard = self.guard.lock().await;
        self.file.load().await
    }
}
