//! Durable map of blocked addresses.
//!
//! The map is held in memory behind a single reader/writer lock and the
//! whole file is rewritten after every mutation. Expiry is evaluated at
//! query time against the injected [`Clock`]; nothing here schedules
//! unblocks, the orchestrator owns that.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::TblockerError;

pub const STORE_FILE: &str = "blocked_ips.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedAddress {
    #[serde(rename = "ip", alias = "address", default)]
    pub address: String,
    #[serde(default)]
    pub username: String,
    pub blocked_until: DateTime<Utc>,
}

impl BlockedAddress {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.blocked_until
    }
}

pub struct BlockStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, BlockedAddress>>,
    /// Serializes snapshot+write so an older snapshot never lands last.
    save_lock: Mutex<()>,
    clock: Arc<dyn Clock>,
}

impl BlockStore {
    /// Open the store in `dir`, creating the directory if needed.
    /// A missing file is an empty store.
    pub fn open(dir: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create storage directory {}", dir.display()))?;

        let path = dir.join(STORE_FILE);
        let entries = match fs::read_to_string(&path) {
            Ok(content) => parse_entries(&content).map_err(|e| {
                TblockerError::Persistence(format!("{}: {:#}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No store file at {}, starting empty", path.display());
                HashMap::new()
            }
            Err(e) => {
                return Err(TblockerError::Persistence(format!("{}: {}", path.display(), e)).into())
            }
        };

        if !entries.is_empty() {
            info!("Loaded {} blocked address(es) from {}", entries.len(), path.display());
        }

        Ok(Self {
            path,
            entries: RwLock::new(entries),
            save_lock: Mutex::new(()),
            clock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Insert or replace the entry for `address`, expiring `ttl` from now.
    ///
    /// The in-memory map is updated before the file is written, so a
    /// persistence error leaves the entry active in memory.
    pub fn add(&self, address: &str, username: &str, ttl: Duration) -> Result<BlockedAddress> {
        if ttl <= Duration::zero() {
            return Err(TblockerError::InvalidDuration(format!(
                "ttl must be positive, got {}s",
                ttl.num_seconds()
            ))
            .into());
        }

        let now = self.clock.now();
        let blocked_until = now.checked_add_signed(ttl).ok_or_else(|| {
            TblockerError::InvalidDuration(format!(
                "ttl of {}s from {} is out of range",
                ttl.num_seconds(),
                now
            ))
        })?;

        let entry = BlockedAddress {
            address: address.to_string(),
            username: username.to_string(),
            blocked_until,
        };

        self.write_entries()
            .insert(address.to_string(), entry.clone());
        self.save()?;

        Ok(entry)
    }

    /// Delete `address`. Returns whether it was present.
    pub fn remove(&self, address: &str) -> Result<bool> {
        let removed = self.write_entries().remove(address).is_some();
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    /// Delete `address` only if its deadline is still `blocked_until`.
    /// Returns false when the entry is gone or was renewed meanwhile.
    pub fn remove_if(&self, address: &str, blocked_until: DateTime<Utc>) -> Result<bool> {
        let removed = {
            let mut entries = self.write_entries();
            match entries.get(address) {
                Some(entry) if entry.blocked_until == blocked_until => {
                    entries.remove(address);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    /// Present and not yet expired.
    pub fn is_blocked(&self, address: &str) -> bool {
        let now = self.clock.now();
        self.read_entries()
            .get(address)
            .map(|entry| entry.is_active(now))
            .unwrap_or(false)
    }

    pub fn get(&self, address: &str) -> Option<BlockedAddress> {
        self.read_entries().get(address).cloned()
    }

    /// Snapshot of every entry, expired or not, ordered by deadline.
    pub fn list(&self) -> Vec<BlockedAddress> {
        let mut entries: Vec<_> = self.read_entries().values().cloned().collect();
        entries.sort_by(|a, b| {
            a.blocked_until
                .cmp(&b.blocked_until)
                .then_with(|| a.address.cmp(&b.address))
        });
        entries
    }

    /// Entries still in force at `now`.
    pub fn active(&self, now: DateTime<Utc>) -> Vec<BlockedAddress> {
        self.list().into_iter().filter(|e| e.is_active(now)).collect()
    }

    /// Entries whose deadline has passed at `now`.
    pub fn expired(&self, now: DateTime<Utc>) -> Vec<BlockedAddress> {
        self.list().into_iter().filter(|e| !e.is_active(now)).collect()
    }

    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, BlockedAddress>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_entries(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, BlockedAddress>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Rewrite the whole file atomically (tempfile in the same directory,
    /// then rename).
    fn save(&self) -> Result<()> {
        let _guard = self.save_lock.lock().unwrap_or_else(|e| e.into_inner());

        let content = {
            let entries = self.read_entries();
            serde_json::to_string_pretty(&*entries).context("Failed to serialize store")?
        };

        self.write_file(&content).map_err(|e| {
            TblockerError::Persistence(format!("{}: {:#}", self.path.display(), e)).into()
        })
    }

    fn write_file(&self, content: &str) -> Result<()> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp_file =
            NamedTempFile::new_in(parent).context("Failed to create temporary store file")?;

        temp_file.write_all(content.as_bytes())?;
        temp_file.as_file().sync_all()?;

        temp_file
            .persist(&self.path)
            .context("Failed to persist store file")?;

        debug!("Store saved to {}", self.path.display());
        Ok(())
    }
}

/// Decode the persisted map; entries without an address take their key.
fn parse_entries(content: &str) -> Result<HashMap<String, BlockedAddress>> {
    if content.trim().is_empty() {
        return Ok(HashMap::new());
    }

    let raw: HashMap<String, BlockedAddress> =
        serde_json::from_str(content).context("Failed to parse store file")?;

    Ok(raw
        .into_iter()
        .map(|(key, mut entry)| {
            if entry.address.is_empty() {
                entry.address = key.clone();
            }
            (key, entry)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn manual_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ))
    }

    #[test]
    fn test_missing_file_is_empty_store() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(&dir.path().join("nested"), Arc::new(SystemClock)).unwrap();
        assert!(store.is_empty());
        assert!(!store.is_blocked("10.0.0.5"));
        assert!(!store.path().exists());
    }

    #[test]
    fn test_add_remove() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(dir.path(), Arc::new(SystemClock)).unwrap();

        store.add("10.0.0.5", "alice", Duration::minutes(10)).unwrap();
        assert!(store.is_blocked("10.0.0.5"));
        assert_eq!(store.get("10.0.0.5").unwrap().username, "alice");

        assert!(store.remove("10.0.0.5").unwrap());
        assert!(!store.is_blocked("10.0.0.5"));
        assert!(store.list().is_empty());

        // Second removal is a no-op.
        assert!(!store.remove("10.0.0.5").unwrap());
    }

    #[test]
    fn test_add_rejects_non_positive_ttl() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(dir.path(), Arc::new(SystemClock)).unwrap();

        let err = store.add("10.0.0.5", "alice", Duration::zero()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TblockerError>(),
            Some(TblockerError::InvalidDuration(_))
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_add_rejects_out_of_range_deadline() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(dir.path(), manual_clock()).unwrap();

        let err = store.add("10.0.0.5", "alice", Duration::MAX).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TblockerError>(),
            Some(TblockerError::InvalidDuration(_))
        ));
        assert!(store.is_empty());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_remove_if_keeps_renewed_entry() {
        let dir = tempdir().unwrap();
        let clock = manual_clock();
        let store = BlockStore::open(dir.path(), clock.clone()).unwrap();

        let first = store.add("10.0.0.5", "alice", Duration::minutes(10)).unwrap();
        clock.advance(Duration::minutes(11));
        let renewed = store.add("10.0.0.5", "alice", Duration::minutes(10)).unwrap();

        assert!(!store.remove_if("10.0.0.5", first.blocked_until).unwrap());
        assert_eq!(store.get("10.0.0.5").unwrap(), renewed);

        assert!(store.remove_if("10.0.0.5", renewed.blocked_until).unwrap());
        assert!(store.is_empty());
        assert!(!store.remove_if("10.0.0.5", renewed.blocked_until).unwrap());

        let reopened = BlockStore::open(dir.path(), clock).unwrap();
        assert!(reopened.is_empty());
    }

    #[test]
    fn test_add_upserts() {
        let dir = tempdir().unwrap();
        let clock = manual_clock();
        let store = BlockStore::open(dir.path(), clock.clone()).unwrap();

        store.add("10.0.0.5", "alice", Duration::minutes(10)).unwrap();
        clock.advance(Duration::minutes(1));
        let second = store.add("10.0.0.5", "bob", Duration::minutes(10)).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("10.0.0.5").unwrap(), second);
    }

    #[test]
    fn test_expiry_computed_at_query_time() {
        let dir = tempdir().unwrap();
        let clock = manual_clock();
        let store = BlockStore::open(dir.path(), clock.clone()).unwrap();

        store.add("10.0.0.5", "alice", Duration::minutes(10)).unwrap();

        clock.advance(Duration::minutes(9) + Duration::seconds(59));
        assert!(store.is_blocked("10.0.0.5"));

        clock.advance(Duration::seconds(1));
        assert!(!store.is_blocked("10.0.0.5"));

        // Still listed until removed.
        assert_eq!(store.list().len(), 1);
        assert_eq!(store.expired(clock.now()).len(), 1);
        assert!(store.active(clock.now()).is_empty());
    }

    #[test]
    fn test_persisted_round_trip() {
        let dir = tempdir().unwrap();
        let clock = manual_clock();

        let saved = {
            let store = BlockStore::open(dir.path(), clock.clone()).unwrap();
            store.add("10.0.0.5", "alice", Duration::minutes(10)).unwrap();
            store.add("10.0.0.6", "bob", Duration::minutes(20)).unwrap();
            store.add("2001:db8::1", "carol", Duration::minutes(30)).unwrap();
            store.list()
        };

        let reopened = BlockStore::open(dir.path(), clock).unwrap();
        assert_eq!(reopened.list(), saved);
    }

    #[test]
    fn test_file_format() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(dir.path(), manual_clock()).unwrap();
        store.add("10.0.0.5", "alice", Duration::minutes(10)).unwrap();

        let content = fs::read_to_string(store.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        let entry = &value["10.0.0.5"];
        assert_eq!(entry["ip"], "10.0.0.5");
        assert_eq!(entry["username"], "alice");
        assert_eq!(entry["blocked_until"], "2024-05-01T12:10:00Z");
    }

    #[test]
    fn test_load_ignores_unknown_fields() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(STORE_FILE),
            r#"{
  "10.0.0.5": {"ip": "10.0.0.5", "username": "alice", "blocked_until": "2030-01-01T00:00:00Z", "reason": "torrent"},
  "10.0.0.6": {"address": "10.0.0.6", "username": "bob", "blocked_until": "2030-01-01T00:00:00+02:00"},
  "10.0.0.7": {"blocked_until": "2030-01-01T00:00:00Z"}
}"#,
        )
        .unwrap();

        let store = BlockStore::open(dir.path(), manual_clock()).unwrap();
        assert_eq!(store.len(), 3);
        assert!(store.is_blocked("10.0.0.5"));
        assert_eq!(store.get("10.0.0.6").unwrap().address, "10.0.0.6");
        assert_eq!(store.get("10.0.0.7").unwrap().address, "10.0.0.7");
    }

    #[test]
    fn test_corrupt_file_is_persistence_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(STORE_FILE), "{not json").unwrap();

        let err = BlockStore::open(dir.path(), manual_clock()).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<TblockerError>(),
            Some(TblockerError::Persistence(_))
        ));
    }

    #[test]
    fn test_concurrent_adds() {
        let dir = tempdir().unwrap();
        let store = Arc::new(BlockStore::open(dir.path(), Arc::new(SystemClock)).unwrap());

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .add(&format!("10.0.0.{}", i), "user", Duration::minutes(10))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.list().len(), 10);

        // The last write carries every entry.
        let reopened = BlockStore::open(dir.path(), Arc::new(SystemClock)).unwrap();
        assert_eq!(reopened.len(), 10);
    }
}
