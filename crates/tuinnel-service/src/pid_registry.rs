//! On-disk pid registry
//!
//! Maps tunnel names to the connector processes backing them, so a second
//! tuinnel invocation can refuse to double-start a tunnel, adopt a running
//! connector, or stop one started by an earlier process. The whole file is
//! read and rewritten atomically on every touch; entries whose process has
//! died are reaped as they are seen.

use crate::error::ServiceError;
use crate::fs_util::{data_dir, write_atomic};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;
use tuinnel_connector::pid_is_alive;

const PID_FILE: &str = ".pids.json";

/// One registry entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidEntry {
    pub pid: u32,
    #[serde(rename = "startedAt")]
    pub started_at: i64,
}

/// On-disk shape: the legacy format stored a bare pid per name; the current
/// format stores `{pid, startedAt}`. Both are accepted on read, the current
/// shape is always written.
#[derive(Deserialize)]
#[serde(untagged)]
enum PidEntryOnDisk {
    Current(PidEntry),
    Legacy(u32),
}

impl From<PidEntryOnDisk> for PidEntry {
    fn from(on_disk: PidEntryOnDisk) -> Self {
        match on_disk {
            PidEntryOnDisk::Current(entry) => entry,
            PidEntryOnDisk::Legacy(pid) => PidEntry { pid, started_at: 0 },
        }
    }
}

/// The registry file handle
#[derive(Debug, Clone)]
pub struct PidRegistry {
    path: PathBuf,
}

impl PidRegistry {
    pub fn new() -> Result<Self, ServiceError> {
        Ok(Self {
            path: data_dir()?.join(PID_FILE),
        })
    }

    /// Custom location (tests)
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> Result<BTreeMap<String, PidEntry>, ServiceError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let json = std::fs::read_to_string(&self.path)?;
        let on_disk: BTreeMap<String, PidEntryOnDisk> =
            serde_json::from_str(&json).map_err(|source| ServiceError::Parse {
                path: self.path.display().to_string(),
                source,
            })?;
        Ok(on_disk
            .into_iter()
            .map(|(name, entry)| (name, entry.into()))
            .collect())
    }

    fn save(&self, entries: &BTreeMap<String, PidEntry>) -> Result<(), ServiceError> {
        let json =
            serde_json::to_string_pretty(entries).map_err(|source| ServiceError::Parse {
                path: self.path.display().to_string(),
                source,
            })?;
        write_atomic(&self.path, json.as_bytes())
    }

    /// Record a freshly spawned connector
    pub fn record(&self, name: &str, pid: u32) -> Result<(), ServiceError> {
        let mut entries = self.load()?;
        entries.insert(
            name.to_string(),
            PidEntry {
                pid,
                started_at: chrono::Utc::now().timestamp_millis(),
            },
        );
        self.save(&entries)
    }

    /// Drop an entry; absent entries are fine
    pub fn remove(&self, name: &str) -> Result<(), ServiceError> {
        let mut entries = self.load()?;
        if entries.remove(name).is_some() {
            self.save(&entries)?;
        }
        Ok(())
    }

    /// The raw entry, dead or alive
    pub fn get(&self, name: &str) -> Result<Option<PidEntry>, ServiceError> {
        Ok(self.load()?.get(name).copied())
    }

    /// Entries whose process is still alive; stale entries are removed from
    /// disk as a side effect
    pub fn get_running(&self) -> Result<BTreeMap<String, PidEntry>, ServiceError> {
        let entries = self.load()?;
        let mut running = BTreeMap::new();
        let mut reaped = false;

        for (name, entry) in entries {
            if pid_is_alive(entry.pid) {
                running.insert(name, entry);
            } else {
                debug!("reaping stale pid entry for {} (pid {})", name, entry.pid);
                reaped = true;
            }
        }

        if reaped {
            self.save(&running)?;
        }
        Ok(running)
    }

    /// Guard against a concurrent instance of the same tunnel
    pub fn assert_not_running(&self, name: &str) -> Result<(), ServiceError> {
        if let Some(entry) = self.get_running()?.get(name) {
            return Err(ServiceError::AlreadyRunning {
                name: name.to_string(),
                pid: entry.pid,
            });
        }
        Ok(())
    }
}
