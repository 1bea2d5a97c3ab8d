//! # Persistence
//!
//! Handle records live one file per handle under `<statedir>/handles/`, named
//! after the hex fingerprint. The session config lives in
//! `<statedir>/sessconfig`. Everything is bincode; reads are size bounded.
//!
//! All functions here block. Actors call them through `spawn_blocking`.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::handle::{Fingerprint, HandleRecord};
use crate::messages::deserialize_bounded;
use crate::protocols::HandleStore;

const RECORD_EXT: &str = "handle";

#[derive(Debug)]
pub enum StoreError {
    Corrupt { path: PathBuf, reason: String },
    Poisoned,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Corrupt { path, reason } => {
                write!(f, "corrupt record {}: {reason}", path.display())
            }
            StoreError::Poisoned => write!(f, "store lock poisoned"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Write `bytes` to `path` through a sibling temp file and a rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to rename into {}", path.display()))
}

// ============================================================================
// FileStore
// ============================================================================

#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, fingerprint: Fingerprint) -> PathBuf {
        self.dir.join(format!("{}.{RECORD_EXT}", fingerprint.to_hex()))
    }

    fn read_record(path: &Path) -> Result<HandleRecord> {
        let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        deserialize_bounded(&bytes).map_err(|e| {
            anyhow::Error::new(StoreError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
        })
    }
}

impl HandleStore for FileStore {
    /// Records sorted by `last_index`. Unreadable files are skipped with a
    /// warning so one bad record cannot block startup.
    fn load_all(&self) -> Result<Vec<HandleRecord>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to list {}", self.dir.display()));
            }
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            match Self::read_record(&path) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping handle record"),
            }
        }
        records.sort_by_key(|r| r.last_index);
        debug!(count = records.len(), dir = %self.dir.display(), "loaded handle records");
        Ok(records)
    }

    fn save_all(&self, records: &[HandleRecord]) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;

        let mut stale: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(RECORD_EXT))
            .collect();

        for record in records {
            let path = self.record_path(record.fingerprint);
            stale.retain(|p| p != &path);
            let bytes = bincode::serialize(record).context("failed to encode handle record")?;
            write_atomic(&path, &bytes)?;
        }
        for path in stale {
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
        Ok(())
    }

    fn delete(&self, fingerprint: Fingerprint) -> Result<()> {
        let path = self.record_path(fingerprint);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
        }
    }
}

// ============================================================================
// MemoryStore
// ============================================================================

/// In-memory store for tests and ephemeral nodes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<Fingerprint, HandleRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = HandleRecord>) -> Self {
        let map = records.into_iter().map(|r| (r.fingerprint, r)).collect();
        Self {
            records: Mutex::new(map),
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HandleStore for MemoryStore {
    fn load_all(&self) -> Result<Vec<HandleRecord>> {
        let records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        let mut out: Vec<_> = records.values().cloned().collect();
        out.sort_by_key(|r| r.last_index);
        Ok(out)
    }

    fn save_all(&self, records: &[HandleRecord]) -> Result<()> {
        let mut map = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        *map = records.iter().map(|r| (r.fingerprint, r.clone())).collect();
        Ok(())
    }

    fn delete(&self, fingerprint: Fingerprint) -> Result<()> {
        let mut map = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        map.remove(&fingerprint);
        Ok(())
    }
}

// ============================================================================
// Session config
// ============================================================================

pub fn load_session_config(path: &Path) -> Result<Option<SessionConfig>> {
    match fs::read(path) {
        Ok(bytes) => {
            let config = deserialize_bounded(&bytes).map_err(|e| StoreError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
            Ok(Some(config))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
    }
}

pub fn save_session_config(path: &Path, config: &SessionConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let bytes = bincode::serialize(config).context("failed to encode session config")?;
    write_atomic(path, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{PerDir, Priority};

    fn record(seed: u8, index: usize) -> HandleRecord {
        HandleRecord {
            fingerprint: Fingerprint::from_bytes([seed; 20]),
            sources: vec![format!("magnet:?xt=urn:btih:{seed}")],
            reserved_up: 12.5,
            reserved_down: 40.0,
            local_cap: PerDir::new(0.0, 100.0),
            priority: Priority::High,
            last_index: index,
            stopped: false,
        }
    }

    #[test]
    fn file_store_restores_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("handles"));
        assert!(store.load_all().unwrap().is_empty());

        store.save_all(&[record(3, 2), record(1, 0), record(2, 1)]).unwrap();
        let loaded = store.load_all().unwrap();
        let order: Vec<usize> = loaded.iter().map(|r| r.last_index).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(loaded[0], record(1, 0));
    }

    #[test]
    fn save_all_drops_stale_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.save_all(&[record(1, 0), record(2, 1)]).unwrap();
        store.save_all(&[record(2, 0)]).unwrap();
        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].fingerprint, Fingerprint::from_bytes([2; 20]));
    }

    #[test]
    fn corrupt_record_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.save_all(&[record(1, 0)]).unwrap();
        fs::write(dir.path().join(format!("{}.handle", "ab".repeat(20))), b"junk").unwrap();
        assert_eq!(store.load_all().unwrap().len(), 1);
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.save_all(&[record(1, 0)]).unwrap();
        store.delete(Fingerprint::from_bytes([1; 20])).unwrap();
        store.delete(Fingerprint::from_bytes([1; 20])).unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn memory_store_behaves_like_file_store() {
        let store = MemoryStore::new();
        store.save_all(&[record(2, 1), record(1, 0)]).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.load_all().unwrap()[0].last_index, 0);
        store.delete(Fingerprint::from_bytes([1; 20])).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn session_config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessconfig");
        assert!(load_session_config(&path).unwrap().is_none());

        let mut config = SessionConfig::with_statedir(dir.path());
        config.socks_port = 4080;
        config.bootstrap = vec!["10.0.0.1:7759".parse().unwrap()];
        save_session_config(&path, &config).unwrap();
        assert_eq!(load_session_config(&path).unwrap(), Some(config));
    }
}
