//! Persistent state for MCPProxy
//!
//! Everything under the data directory goes through this crate: the sled
//! `config.db` key-value store with its trees for token sets, the append-only
//! activity log, per-server log rings, and the startup permission gate on the
//! data directory itself.

pub mod activity;
pub mod datadir;
pub mod db;
pub mod error;
pub mod logs;
pub mod tokens;

pub use activity::{
    ActivityFilter, ActivityRecord, ActivityStatus, ActivityStore, ActivitySummary, ActivityType,
    ExportFormat, TokenCounts,
};
pub use datadir::ensure_data_dir;
pub use db::ProxyDb;
pub use error::{StorageError, StorageResult};
pub use logs::LogRingStore;
pub use tokens::{TokenSet, TokenStore};
