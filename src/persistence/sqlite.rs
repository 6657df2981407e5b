//! SQLite-backed persistence implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::persistence::{Persistence, StoredRecord};

/// All logical tables share one physical table keyed by
/// (table_name, k1, k2, k3); unused key parts are empty strings.
fn initialize_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS records (
            table_name TEXT NOT NULL,
            k1 TEXT NOT NULL DEFAULT '',
            k2 TEXT NOT NULL DEFAULT '',
            k3 TEXT NOT NULL DEFAULT '',
            payload TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (table_name, k1, k2, k3)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_records_updated
         ON records(table_name, updated_at)",
        [],
    )?;

    Ok(())
}

fn key_parts(key: &[&str]) -> Result<(String, String, String)> {
    if key.len() > 3 {
        return Err(Error::Storage(format!(
            "composite keys support at most 3 parts, got {}",
            key.len()
        )));
    }
    let get = |i: usize| key.get(i).map(|s| s.to_string()).unwrap_or_default();
    Ok((get(0), get(1), get(2)))
}

/// SQLite-backed store.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::Storage(e.to_string()))?;
        initialize_schema(&conn).map_err(|e| Error::Storage(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::Storage(e.to_string()))?;
        initialize_schema(&conn).map_err(|e| Error::Storage(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock connection: {}", e)))?;
        f(&conn).map_err(|e| Error::Storage(e.to_string()))
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<StoredRecord> {
        let k1: String = row.get(0)?;
        let k2: String = row.get(1)?;
        let k3: String = row.get(2)?;
        let payload_str: String = row.get(3)?;
        let updated_str: String = row.get(4)?;

        let mut key = vec![k1, k2, k3];
        while key.last().map(|s| s.is_empty()).unwrap_or(false) {
            key.pop();
        }

        Ok(StoredRecord {
            key,
            payload: serde_json::from_str(&payload_str).unwrap_or(Value::Null),
            updated_at: DateTime::parse_from_rfc3339(&updated_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }
}

#[async_trait]
impl Persistence for SqliteStore {
    async fn upsert(&self, table: &str, key: &[&str], payload: Value) -> Result<()> {
        let (k1, k2, k3) = key_parts(key)?;
        let payload_str = serde_json::to_string(&payload)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO records (table_name, k1, k2, k3, payload, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (table_name, k1, k2, k3)
                 DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
                params![table, k1, k2, k3, payload_str, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    async fn get_by_key(&self, table: &str, key: &[&str]) -> Result<Option<StoredRecord>> {
        let (k1, k2, k3) = key_parts(key)?;
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT k1, k2, k3, payload, updated_at FROM records
                 WHERE table_name = ?1 AND k1 = ?2 AND k2 = ?3 AND k3 = ?4",
                params![table, k1, k2, k3],
                Self::row_to_record,
            )
            .optional()
        })
    }

    async fn list_by_filter(&self, table: &str, key_prefix: &[&str]) -> Result<Vec<StoredRecord>> {
        if key_prefix.len() > 3 {
            return Err(Error::Storage("key prefix too long".into()));
        }
        let prefix: Vec<String> = key_prefix.iter().map(|s| s.to_string()).collect();
        self.with_conn(|conn| {
            let mut sql = String::from(
                "SELECT k1, k2, k3, payload, updated_at FROM records WHERE table_name = ?1",
            );
            for (i, _) in prefix.iter().enumerate() {
                sql.push_str(&format!(" AND k{} = ?{}", i + 1, i + 2));
            }
            sql.push_str(" ORDER BY k1, k2, k3");

            let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(table.to_string())];
            for part in &prefix {
                params_vec.push(Box::new(part.clone()));
            }
            let params_refs: Vec<&dyn rusqlite::ToSql> =
                params_vec.iter().map(|b| b.as_ref()).collect();

            let mut stmt = conn.prepare(&sql)?;
            let records = stmt
                .query_map(params_refs.as_slice(), Self::row_to_record)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(records)
        })
    }

    async fn delete_older_than(
        &self,
        table: &str,
        key_prefix: &[&str],
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        if key_prefix.len() > 3 {
            return Err(Error::Storage("key prefix too long".into()));
        }
        let prefix: Vec<String> = key_prefix.iter().map(|s| s.to_string()).collect();
        self.with_conn(|conn| {
            let mut sql =
                String::from("DELETE FROM records WHERE table_name = ?1 AND updated_at < ?2");
            for (i, _) in prefix.iter().enumerate() {
                sql.push_str(&format!(" AND k{} = ?{}", i + 1, i + 3));
            }

            let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![
                Box::new(table.to_string()),
                Box::new(cutoff.to_rfc3339()),
            ];
            for part in &prefix {
                params_vec.push(Box::new(part.clone()));
            }
            let params_refs: Vec<&dyn rusqlite::ToSql> =
                params_vec.iter().map(|b| b.as_ref()).collect();

            let removed = conn.execute(&sql, params_refs.as_slice())?;
            Ok(removed as u64)
        })
    }
}
