//! Persistent device ownership ledger
//!
//! The ledger is a JSON file shared by every hostlet process on the host.
//! Every access goes through an advisory lock on a sidecar `<ledger>.lock`
//! file: mutations hold it exclusively for the whole read-modify-write,
//! snapshots hold it shared. The ledger itself is replaced by renaming a
//! fully written temp file over it, so a crash mid-write leaves the previous
//! contents intact. The lock lives on the sidecar because the rename swaps
//! the ledger's inode.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use hostlet_core::{HostletError, Owner, PciAddress};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

/// Current ledger file format version
pub const LEDGER_VERSION: u32 = 1;

/// Errors raised by ledger storage
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("I/O error on {}: {}", .0.display(), .1)]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to lock {}: {}", .0.display(), .1)]
    Lock(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse ledger {}: {}", .0.display(), .1)]
    Parse(PathBuf, String),

    #[error("Failed to write ledger {}: {}", .0.display(), .1)]
    Write(PathBuf, String),
}

impl From<LedgerError> for HostletError {
    fn from(err: LedgerError) -> Self {
        HostletError::Ledger(err.to_string())
    }
}

/// Who holds a device, and since when
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub owner: Owner,
    pub acquired_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(owner: Owner) -> Self {
        Self {
            owner,
            acquired_at: Utc::now(),
        }
    }

    /// Whether the entry was acquired at least `age` ago
    pub fn is_older_than(&self, age: std::time::Duration) -> bool {
        match chrono::Duration::from_std(age) {
            Ok(age) => Utc::now() - self.acquired_at >= age,
            Err(_) => false,
        }
    }
}

/// Full ledger contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerState {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    /// A device with no entry is free
    #[serde(default)]
    pub allocations: BTreeMap<PciAddress, LedgerEntry>,
}

fn default_version() -> u32 {
    LEDGER_VERSION
}

impl Default for LedgerState {
    fn default() -> Self {
        Self {
            version: LEDGER_VERSION,
            last_updated: None,
            allocations: BTreeMap::new(),
        }
    }
}

impl LedgerState {
    /// Current holder of a device
    pub fn get(&self, device: &PciAddress) -> Option<&LedgerEntry> {
        self.allocations.get(device)
    }

    /// Devices held by an owner
    pub fn held_by(&self, owner: &Owner) -> Vec<PciAddress> {
        self.allocations
            .iter()
            .filter(|(_, entry)| &entry.owner == owner)
            .map(|(device, _)| device.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }
}

/// Handle to the ledger file
///
/// Cheap to create; every operation opens, locks and closes the files, so
/// nothing is cached between calls.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
    lock_path: PathBuf,
}

impl Ledger {
    /// Create a handle for the ledger at `path`
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_path),
        }
    }

    /// Path of the ledger file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    fn open_lock_file(&self) -> Result<File, LedgerError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| LedgerError::Io(self.lock_path.clone(), e))
    }

    fn read_state(&self) -> Result<LedgerState, LedgerError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LedgerState::default())
            }
            Err(e) => return Err(LedgerError::Io(self.path.clone(), e)),
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(LedgerState::default());
        }

        let state: LedgerState = serde_json::from_slice(&bytes)
            .map_err(|e| LedgerError::Parse(self.path.clone(), e.to_string()))?;

        if state.version > LEDGER_VERSION {
            return Err(LedgerError::Parse(
                self.path.clone(),
                format!("unsupported ledger version {}", state.version),
            ));
        }

        Ok(state)
    }

    fn write_state(&self, state: &LedgerState) -> Result<(), LedgerError> {
        let dir = self.dir();
        let mut tmp =
            NamedTempFile::new_in(dir).map_err(|e| LedgerError::Io(dir.to_path_buf(), e))?;

        serde_json::to_writer_pretty(&mut tmp, state)
            .map_err(|e| LedgerError::Write(self.path.clone(), e.to_string()))?;
        tmp.write_all(b"\n")
            .map_err(|e| LedgerError::Write(self.path.clone(), e.to_string()))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| LedgerError::Io(tmp.path().to_path_buf(), e))?;

        tmp.persist(&self.path)
            .map_err(|e| LedgerError::Write(self.path.clone(), e.error.to_string()))?;

        Ok(())
    }

    /// Read the whole ledger under a shared lock
    pub fn snapshot(&self) -> Result<LedgerState, LedgerError> {
        if !self.dir().exists() {
            return Ok(LedgerState::default());
        }

        let lock = self.open_lock_file()?;
        FileExt::lock_shared(&lock).map_err(|e| LedgerError::Lock(self.lock_path.clone(), e))?;
        let state = self.read_state();
        FileExt::unlock(&lock).map_err(|e| LedgerError::Lock(self.lock_path.clone(), e))?;

        state
    }

    /// Run `f` over the ledger under the exclusive lock
    ///
    /// The ledger is rewritten only if `f` changed it. The lock is held for
    /// the whole call, so `f` must not block on anything slow.
    pub fn transaction<T, F>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut LedgerState) -> T,
    {
        let dir = self.dir();
        std::fs::create_dir_all(dir).map_err(|e| LedgerError::Io(dir.to_path_buf(), e))?;

        let lock = self.open_lock_file()?;
        FileExt::lock_exclusive(&lock)
            .map_err(|e| LedgerError::Lock(self.lock_path.clone(), e))?;

        let result = self.read_state().and_then(|before| {
            let mut state = before.clone();
            let value = f(&mut state);
            if state != before {
                state.version = LEDGER_VERSION;
                state.last_updated = Some(Utc::now());
                self.write_state(&state)?;
                debug!(
                    path = %self.path.display(),
                    entries = state.allocations.len(),
                    "Ledger updated"
                );
            }
            Ok(value)
        });

        FileExt::unlock(&lock).map_err(|e| LedgerError::Lock(self.lock_path.clone(), e))?;

        result
    }

    /// Current holder of a device
    pub fn get(&self, device: &PciAddress) -> Result<Option<LedgerEntry>, LedgerError> {
        Ok(self.snapshot()?.allocations.remove(device))
    }

    /// Record `owner` as the holder of `device`, replacing any entry
    pub fn set(&self, device: &PciAddress, owner: Owner) -> Result<(), LedgerError> {
        self.transaction(|state| {
            state
                .allocations
                .insert(device.clone(), LedgerEntry::new(owner));
        })
    }

    /// Remove a device's entry, returning it if there was one
    pub fn clear(&self, device: &PciAddress) -> Result<Option<LedgerEntry>, LedgerError> {
        self.transaction(|state| state.allocations.remove(device))
    }

    /// Remove every entry whose owner matches `pred`
    pub fn clear_where<P>(&self, pred: P) -> Result<Vec<(PciAddress, LedgerEntry)>, LedgerError>
    where
        P: Fn(&Owner) -> bool,
    {
        self.transaction(|state| {
            let (removed, kept) = std::mem::take(&mut state.allocations)
                .into_iter()
                .partition(|(_, entry)| pred(&entry.owner));
            state.allocations = kept;
            removed.into_iter().collect()
        })
    }

    /// Remove every entry
    pub fn clear_all(&self) -> Result<usize, LedgerError> {
        self.transaction(|state| {
            let count = state.allocations.len();
            state.allocations.clear();
            count
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> PciAddress {
        s.parse().unwrap()
    }

    #[test]
    fn test_missing_ledger_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("state").join("ledger.json"));

        let state = ledger.snapshot().unwrap();
        assert!(state.is_empty());
        assert_eq!(state.version, LEDGER_VERSION);
        assert!(!ledger.path().exists());
    }

    #[test]
    fn test_entry_age() {
        let mut entry = LedgerEntry::new(Owner::cluster("hpc"));
        assert!(entry.is_older_than(std::time::Duration::ZERO));
        assert!(!entry.is_older_than(std::time::Duration::from_secs(60)));

        entry.acquired_at = Utc::now() - chrono::Duration::seconds(120);
        assert!(entry.is_older_than(std::time::Duration::from_secs(60)));
    }

    #[test]
    fn test_set_get_clear() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("ledger.json"));
        let gpu = addr("0000:01:00.0");

        ledger.set(&gpu, Owner::vm("hpc-compute-01")).unwrap();
        let entry = ledger.get(&gpu).unwrap().unwrap();
        assert_eq!(entry.owner, Owner::vm("hpc-compute-01"));

        // Another handle sees the same state
        let other = Ledger::new(ledger.path());
        assert!(other.snapshot().unwrap().last_updated.is_some());

        assert!(ledger.clear(&gpu).unwrap().is_some());
        assert!(ledger.clear(&gpu).unwrap().is_none());
        assert!(ledger.get(&gpu).unwrap().is_none());
    }

    #[test]
    fn test_file_format() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("ledger.json"));
        ledger
            .set(&addr("0000:01:00.0"), Owner::cluster("hpc"))
            .unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(ledger.path()).unwrap()).unwrap();
        assert_eq!(raw["version"], 1);
        assert_eq!(raw["allocations"]["0000:01:00.0"]["owner"]["kind"], "cluster");
        assert_eq!(raw["allocations"]["0000:01:00.0"]["owner"]["name"], "hpc");
    }

    #[test]
    fn test_clear_where() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("ledger.json"));
        ledger.set(&addr("0000:01:00.0"), Owner::vm("a")).unwrap();
        ledger.set(&addr("0000:02:00.0"), Owner::vm("b")).unwrap();
        ledger.set(&addr("0000:03:00.0"), Owner::cluster("hpc")).unwrap();

        let removed = ledger
            .clear_where(|owner| matches!(owner, Owner::Cluster(_)) || owner.name() == "a")
            .unwrap();
        assert_eq!(removed.len(), 2);

        let state = ledger.snapshot().unwrap();
        assert_eq!(state.held_by(&Owner::vm("b")), vec![addr("0000:02:00.0")]);

        assert_eq!(ledger.clear_all().unwrap(), 1);
        assert!(ledger.snapshot().unwrap().is_empty());
    }

    #[test]
    fn test_unchanged_transaction_does_not_write() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("ledger.json"));

        let count = ledger.transaction(|state| state.allocations.len()).unwrap();
        assert_eq!(count, 0);
        assert!(!ledger.path().exists());
    }

    #[test]
    fn test_corrupt_ledger_is_not_reset() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("ledger.json"));
        std::fs::write(ledger.path(), "{ not json").unwrap();

        assert!(matches!(ledger.snapshot(), Err(LedgerError::Parse(..))));
        let result = ledger.set(&addr("0000:01:00.0"), Owner::vm("a"));
        assert!(matches!(result, Err(LedgerError::Parse(..))));
        assert_eq!(std::fs::read_to_string(ledger.path()).unwrap(), "{ not json");
    }

    #[test]
    fn test_empty_file_is_empty_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("ledger.json"));
        std::fs::write(ledger.path(), "\n").unwrap();

        assert!(ledger.snapshot().unwrap().is_empty());
    }

    #[test]
    fn test_newer_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("ledger.json"));
        std::fs::write(ledger.path(), r#"{"version": 9, "allocations": {}}"#).unwrap();

        assert!(matches!(ledger.snapshot(), Err(LedgerError::Parse(..))));
    }
}
