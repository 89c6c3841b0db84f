//! sled-backed `config.db` wrapper

use std::path::Path;
use std::sync::Arc;

use crate::error::{StorageError, StorageResult};

/// Tree names inside `config.db`
pub(crate) const TREE_TOKENS: &str = "tokens";
pub(crate) const TREE_ACTIVITY: &str = "activity";
pub(crate) const TREE_SERVER_LOGS: &str = "server_logs";
pub(crate) const TREE_COUNTERS: &str = "counters";

/// Handle to the proxy's key-value store
///
/// Cheap to clone; all trees share one underlying sled instance. Writers are
/// serialized by sled per key, readers take snapshots.
#[derive(Clone)]
pub struct ProxyDb {
    db: Arc<sled::Db>,
}

impl ProxyDb {
    /// Open (or create) `config.db` under the data directory
    ///
    /// A lock held by another live process surfaces as `StorageError::Locked`
    /// so the CLI can map it to its dedicated exit code.
    pub fn open(data_dir: &Path) -> StorageResult<Self> {
        let path = data_dir.join("config.db");
        let db = sled::Config::new().path(&path).open().map_err(|e| match e {
            sled::Error::Io(ref io) if io.kind() == std::io::ErrorKind::WouldBlock => {
                StorageError::Locked {
                    path: path.display().to_string(),
                }
            }
            other => StorageError::Database(other),
        })?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Open an ephemeral in-memory store (tests)
    pub fn open_temporary() -> StorageResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db: Arc::new(db) })
    }

    pub(crate) fn tree(&self, name: &str) -> StorageResult<sled::Tree> {
        Ok(self.db.open_tree(name)?)
    }

    /// Monotonic counter, used for activity record ordering
    pub(crate) fn next_sequence(&self) -> StorageResult<u64> {
        let tree = self.tree(TREE_COUNTERS)?;
        let value = tree.update_and_fetch("activity_seq", |old| {
            let current = old
                .map(|bytes| {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(bytes);
                    u64::from_be_bytes(buf)
                })
                .unwrap_or(0);
            Some((current + 1).to_be_bytes().to_vec())
        })?;

        let bytes = value.ok_or_else(|| StorageError::NotFound("activity_seq".into()))?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes);
        Ok(u64::from_be_bytes(buf))
    }

    /// Flush all trees to disk
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_is_monotonic() {
        let db = ProxyDb::open_temporary().unwrap();
        let a = db.next_sequence().unwrap();
        let b = db.next_sequence().unwrap();
        let c = db.next_sequence().unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_open_creates_db_file() {
        let tmp = tempfile::tempdir().unwrap();
        let db = ProxyDb::open(tmp.path()).unwrap();
        db.flush().unwrap();
        assert!(tmp.path().join("config.db").exists());
    }
}
