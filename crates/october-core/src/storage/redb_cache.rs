//! # redb-backed Cache Store
//!
//! A disk-backed `CacheStore` using the redb embedded database, so route
//! tables, parsed objects and component property maps survive process
//! restarts and are shared by every worker pointing at the same file.
//!
//! Each value is stored with an 8-byte big-endian expiry timestamp
//! (seconds since the Unix epoch) in front of the payload. Expired entries
//! are dropped when read.

use crate::CmsError;
use crate::cache::CacheStore;
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Table for entries: key -> expiry (8 bytes) ++ payload
const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("cache_entries");

/// A disk-backed cache store.
pub struct RedbStore {
    db: Database,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore").finish_non_exhaustive()
    }
}

fn io(e: impl std::fmt::Display) -> CmsError {
    CmsError::Io(e.to_string())
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl RedbStore {
    /// Open or create a cache database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CmsError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io)?;
            }
        }
        let db = Database::create(path.as_ref()).map_err(io)?;

        // Initialize the table if it doesn't exist
        {
            let write_txn = db.begin_write().map_err(io)?;
            let _ = write_txn.open_table(ENTRIES).map_err(io)?;
            write_txn.commit().map_err(io)?;
        }

        Ok(Self { db })
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> Result<u64, CmsError> {
        let read_txn = self.db.begin_read().map_err(io)?;
        let table = read_txn.open_table(ENTRIES).map_err(io)?;
        table.len().map_err(io)
    }

    pub fn is_empty(&self) -> Result<bool, CmsError> {
        Ok(self.len()? == 0)
    }

    /// Remove every expired entry.
    pub fn purge_expired(&self) -> Result<usize, CmsError> {
        let now = now_secs();
        let expired: Vec<String> = {
            let read_txn = self.db.begin_read().map_err(io)?;
            let table = read_txn.open_table(ENTRIES).map_err(io)?;
            let mut keys = Vec::new();
            for entry in table.iter().map_err(io)? {
                let (key, value) = entry.map_err(io)?;
                if decode_expiry(value.value()).is_none_or(|at| at <= now) {
                    keys.push(key.value().to_string());
                }
            }
            keys
        };

        if expired.is_empty() {
            return Ok(0);
        }
        let write_txn = self.db.begin_write().map_err(io)?;
        {
            let mut table = write_txn.open_table(ENTRIES).map_err(io)?;
            for key in &expired {
                table.remove(key.as_str()).map_err(io)?;
            }
        }
        write_txn.commit().map_err(io)?;
        Ok(expired.len())
    }
}

fn decode_expiry(raw: &[u8]) -> Option<u64> {
    let head: [u8; 8] = raw.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(head))
}

impl CacheStore for RedbStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CmsError> {
        let live = {
            let read_txn = self.db.begin_read().map_err(io)?;
            let table = read_txn.open_table(ENTRIES).map_err(io)?;
            let Some(guard) = table.get(key).map_err(io)? else {
                return Ok(None);
            };
            let raw = guard.value();
            match decode_expiry(raw) {
                Some(expires) if expires > now_secs() => Some(raw[8..].to_vec()),
                _ => None,
            }
        };

        if live.is_none() {
            self.forget(key)?;
        }
        Ok(live)
    }

    fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CmsError> {
        let expires = now_secs().saturating_add(ttl.as_secs());
        let mut record = Vec::with_capacity(8 + value.len());
        record.extend_from_slice(&expires.to_be_bytes());
        record.extend_from_slice(value);

        let write_txn = self.db.begin_write().map_err(io)?;
        {
            let mut table = write_txn.open_table(ENTRIES).map_err(io)?;
            table.insert(key, record.as_slice()).map_err(io)?;
        }
        write_txn.commit().map_err(io)?;
        Ok(())
    }

    fn forget(&self, key: &str) -> Result<(), CmsError> {
        let write_txn = self.db.begin_write().map_err(io)?;
        {
            let mut table = write_txn.open_table(ENTRIES).map_err(io)?;
            table.remove(key).map_err(io)?;
        }
        write_txn.commit().map_err(io)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), CmsError> {
        let write_txn = self.db.begin_write().map_err(io)?;
        write_txn.delete_table(ENTRIES).map_err(io)?;
        let _ = write_txn.open_table(ENTRIES).map_err(io)?;
        write_txn.commit().map_err(io)?;
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
