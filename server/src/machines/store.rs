//! Flat-file persistence of machine power state.
//!
//! The file is a JSON array of records, rewritten wholesale on every save:
//!
//! ```json
//! [
//!   {
//!     "MachineName": "PUMP-7",
//!     "State": "on"
//!   }
//! ]
//! ```
//!
//! Faults never reach the caller. A missing, unreadable or corrupt file loads
//! as an empty mapping and a failed save is only logged, so a corrupt file
//! loses all state and the next successful save overwrites it.
//!
//! Saves write a temp file in the same directory and rename it over the
//! target, so readers never see a partial file.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// One persisted record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MachineRecord {
    #[serde(rename = "MachineName")]
    machine_name: String,
    #[serde(rename = "State")]
    state: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MachineEntry {
    /// Spelling the machine was first recorded under.
    name: String,
    is_on: bool,
}

/// Case-insensitive machine name → power state mapping, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineStates {
    entries: IndexMap<String, MachineEntry>,
}

fn fold(machine: &str) -> String {
    machine.to_lowercase()
}

impl MachineStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Some(is_on)` if a record exists for `machine` in any letter case.
    pub fn get(&self, machine: &str) -> Option<bool> {
        self.entries.get(&fold(machine)).map(|e| e.is_on)
    }

    /// Insert or update. An existing record keeps its original spelling.
    pub fn set(&mut self, machine: &str, is_on: bool) {
        self.entries
            .entry(fold(machine))
            .and_modify(|e| e.is_on = is_on)
            .or_insert_with(|| MachineEntry {
                name: machine.to_string(),
                is_on,
            });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(name, is_on)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.entries.values().map(|e| (e.name.as_str(), e.is_on))
    }

    fn from_records(records: Vec<MachineRecord>) -> Self {
        let mut states = Self::new();
        for record in records {
            let is_on = record.state.eq_ignore_ascii_case("on");
            // Later duplicates win, matching a plain keyed assignment.
            states
                .entries
                .entry(fold(&record.machine_name))
                .and_modify(|e| e.is_on = is_on)
                .or_insert(MachineEntry {
                    name: record.machine_name,
                    is_on,
                });
        }
        states
    }

    fn to_records(&self) -> Vec<MachineRecord> {
        self.iter()
            .map(|(name, is_on)| MachineRecord {
                machine_name: name.to_string(),
                state: if is_on { "on" } else { "off" }.to_string(),
            })
            .collect()
    }
}

/// Monotonic counter for unique temp file names within this process.
static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// The backing file. Does no locking of its own; see
/// [`MachineStore`](super::MachineStore) for the serialized access path.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole mapping. Absent or unreadable files yield an empty mapping.
    pub async fn load(&self) -> MachineStates {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "State file absent, starting empty");
                return MachineStates::new();
            }
            Err(e) => {
                error!(path = %self.path.display(), "Error loading machine state: {e}");
                return MachineStates::new();
            }
        };

        match serde_json::from_str::<Option<Vec<MachineRecord>>>(&content) {
            Ok(records) => MachineStates::from_records(records.unwrap_or_default()),
            Err(e) => {
                error!(path = %self.path.display(), "Error parsing machine state: {e}");
                MachineStates::new()
            }
        }
    }

    /// Write the whole mapping, replacing the file. Failures are logged only.
    pub async fn save(&self, states: &MachineStates) {
        if let Err(e) = self.try_save(states).await {
            error!(path = %self.path.display(), "Error saving machine state: {e}");
        }
    }

    async fn try_save(&self, states: &MachineStates) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(&states.to_records())?;

        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = self
            .path
            .file_name()
            .map_or_else(|| "state".into(), |n| n.to_string_lossy().into_owned());
        let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let temp_path = parent.join(format!(".{file_name}.tmp_{}_{seq}", std::process::id()));

        if let Err(e) = tokio::fs::write(&temp_path, json.as_bytes()).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e);
        }
        if let Err(e) = tokio::fs::rename(&temp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e);
        }
        Ok(())
    }
}
