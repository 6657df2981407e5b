//! Persistence adapter.
//!
//! The core persists four kinds of state: plan cache entries, learned
//! mappings, navigation trees, and execution history. All of them go
//! through this narrow adapter so the storage engine stays swappable.
//! The core deliberately uses only four operations: `upsert`,
//! `get_by_key`, `list_by_filter`, and `delete_older_than`.

mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::Result;

/// Logical table names used by the core.
pub mod tables {
    pub const PLAN_CACHE: &str = "plan_cache";
    pub const LEARNED_MAPPING: &str = "learned_mapping";
    pub const NAVIGATION_TREE: &str = "navigation_tree";
    pub const EXECUTION_HISTORY: &str = "execution_history";
    pub const TESTCASES: &str = "testcases";
}

/// A stored record: composite key, JSON payload, last-write timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub key: Vec<String>,
    pub payload: Value,
    pub updated_at: DateTime<Utc>,
}

/// Key-value / tabular store used for plan cache, learned mappings,
/// navigation trees, and execution history.
///
/// Keys are ordered composites (up to three parts); `list_by_filter` and
/// `delete_older_than` match on a key prefix, so `(team_id,)` selects
/// every record of a team and `(team_id, interface)` narrows further.
/// Upserts are last-write-wins on the full key, which absorbs concurrent
/// writers racing on the same fingerprint.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Insert or replace the record at `key`.
    async fn upsert(&self, table: &str, key: &[&str], payload: Value) -> Result<()>;

    /// Fetch one record by its full key.
    async fn get_by_key(&self, table: &str, key: &[&str]) -> Result<Option<StoredRecord>>;

    /// List records whose key starts with `key_prefix` (empty prefix lists
    /// the whole table), ordered by key.
    async fn list_by_filter(&self, table: &str, key_prefix: &[&str]) -> Result<Vec<StoredRecord>>;

    /// Delete records whose key starts with `key_prefix` and whose
    /// `updated_at` is before `cutoff`. Returns the number removed.
    async fn delete_older_than(
        &self,
        table: &str,
        key_prefix: &[&str],
        cutoff: DateTime<Utc>,
    ) -> Result<u64>;
}
