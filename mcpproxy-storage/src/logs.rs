//! Per-server log ring buffers
//!
//! Stdio upstreams write diagnostics to stderr; the last N lines per server
//! are kept for the `/servers/{name}/logs` endpoint and mirrored to
//! `logs/server-<name>.log` under the data directory.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;

use crate::db::{ProxyDb, TREE_SERVER_LOGS};
use crate::error::StorageResult;

/// Lines kept per server
const DEFAULT_CAPACITY: usize = 500;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Ring {
    lines: VecDeque<String>,
}

/// Ring-buffer store for upstream process output
#[derive(Clone)]
pub struct LogRingStore {
    db: ProxyDb,
    capacity: usize,
    log_dir: Option<PathBuf>,
}

impl LogRingStore {
    pub fn new(db: ProxyDb) -> Self {
        Self {
            db,
            capacity: DEFAULT_CAPACITY,
            log_dir: None,
        }
    }

    /// Mirror appended lines into `<log_dir>/server-<name>.log`
    pub fn with_log_dir(mut self, log_dir: PathBuf) -> Self {
        self.log_dir = Some(log_dir);
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    fn load(&self, server: &str) -> StorageResult<Ring> {
        let tree = self.db.tree(TREE_SERVER_LOGS)?;
        match tree.get(server.as_bytes())? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Ring::default()),
        }
    }

    fn save(&self, server: &str, ring: &Ring) -> StorageResult<()> {
        let tree = self.db.tree(TREE_SERVER_LOGS)?;
        tree.insert(server.as_bytes(), serde_json::to_vec(ring)?)?;
        Ok(())
    }

    /// Append one line to a server's ring
    pub fn push_line(&self, server: &str, line: &str) -> StorageResult<()> {
        let mut ring = self.load(server)?;
        ring.lines.push_back(line.to_string());
        while ring.lines.len() > self.capacity {
            ring.lines.pop_front();
        }
        self.save(server, &ring)?;

        if let Some(dir) = &self.log_dir {
            let path = dir.join(format!("server-{}.log", server));
            if let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(&path) {
                let _ = writeln!(file, "{}", line);
            }
        }

        Ok(())
    }

    /// Return the last `n` lines for a server, oldest first
    pub fn tail(&self, server: &str, n: usize) -> StorageResult<Vec<String>> {
        let ring = self.load(server)?;
        let skip = ring.lines.len().saturating_sub(n);
        Ok(ring.lines.iter().skip(skip).cloned().collect())
    }

    /// Drop a server's ring (server removed)
    pub fn remove(&self, server: &str) -> StorageResult<()> {
        let tree = self.db.tree(TREE_SERVER_LOGS)?;
        tree.remove(server.as_bytes())?;
        Ok(())
    }
}

impl std::fmt::Debug for LogRingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogRingStore")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_returns_last_lines_in_order() {
        let store = LogRingStore::new(ProxyDb::open_temporary().unwrap());
        for i in 0..10 {
            store.push_line("fs", &format!("line-{}", i)).unwrap();
        }

        let tail = store.tail("fs", 3).unwrap();
        assert_eq!(tail, vec!["line-7", "line-8", "line-9"]);
    }

    #[test]
    fn test_ring_is_bounded() {
        let store = LogRingStore::new(ProxyDb::open_temporary().unwrap()).with_capacity(5);
        for i in 0..20 {
            store.push_line("fs", &format!("line-{}", i)).unwrap();
        }

        let tail = store.tail("fs", 100).unwrap();
        assert_eq!(tail.len(), 5);
        assert_eq!(tail[0], "line-15");
    }

    #[test]
    fn test_remove_clears_ring() {
        let store = LogRingStore::new(ProxyDb::open_temporary().unwrap());
        store.push_line("fs", "hello").unwrap();
        store.remove("fs").unwrap();
        assert!(store.tail("fs", 10).unwrap().is_empty());
    }
}
