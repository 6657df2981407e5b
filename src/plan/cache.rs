//! Plan cache.
//!
//! Approved graphs are stored per (fingerprint, team) and returned
//! byte-identical on every hit, use_count and last_used aside. Entries
//! older than the configured horizon are removed by `cleanup`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::control::Ctx;
use crate::error::Result;
use crate::persistence::{tables, Persistence};
use crate::plan::graph::PlanGraph;

/// One cached plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanCacheEntry {
    pub fingerprint: String,
    pub team_id: String,
    pub graph: PlanGraph,
    pub analysis: String,
    pub use_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

/// Hit/miss counters for operational queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanCacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl PlanCacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Configuration for the plan cache.
#[derive(Debug, Clone)]
pub struct PlanCacheConfig {
    /// Entries unused for longer than this are removed by cleanup
    pub max_age: Duration,
}

impl Default for PlanCacheConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::days(90),
        }
    }
}

/// Store-backed plan cache.
pub struct PlanCache {
    store: Arc<dyn Persistence>,
    hits: AtomicU64,
    misses: AtomicU64,
    config: PlanCacheConfig,
}

impl PlanCache {
    pub fn new(store: Arc<dyn Persistence>, config: PlanCacheConfig) -> Self {
        Self {
            store,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            config,
        }
    }

    /// Look up a fingerprint, bumping use_count and last_used on a hit.
    pub async fn lookup(&self, ctx: &Ctx, fingerprint: &str) -> Result<Option<PlanCacheEntry>> {
        let key = [fingerprint, ctx.team_id.as_str()];
        let Some(record) = self.store.get_by_key(tables::PLAN_CACHE, &key).await? else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let mut entry: PlanCacheEntry = serde_json::from_value(record.payload)?;
        entry.use_count += 1;
        entry.last_used = Utc::now();
        self.store
            .upsert(tables::PLAN_CACHE, &key, json!(entry))
            .await?;

        self.hits.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(fingerprint, use_count = entry.use_count, "plan cache hit");
        Ok(Some(entry))
    }

    /// Store a freshly generated plan with use_count = 1.
    pub async fn store(
        &self,
        ctx: &Ctx,
        fingerprint: &str,
        graph: &PlanGraph,
        analysis: &str,
    ) -> Result<()> {
        let now = Utc::now();
        let entry = PlanCacheEntry {
            fingerprint: fingerprint.to_string(),
            team_id: ctx.team_id.clone(),
            graph: graph.clone(),
            analysis: analysis.to_string(),
            use_count: 1,
            created_at: now,
            last_used: now,
        };
        self.store
            .upsert(
                tables::PLAN_CACHE,
                &[fingerprint, ctx.team_id.as_str()],
                json!(entry),
            )
            .await
    }

    /// Remove entries unused past the configured horizon. Returns the
    /// number removed.
    pub async fn cleanup(&self) -> Result<u64> {
        let cutoff = Utc::now() - self.config.max_age;
        self.store
            .delete_older_than(tables::PLAN_CACHE, &[], cutoff)
            .await
    }

    /// Current counters.
    pub fn stats(&self) -> PlanCacheStats {
        PlanCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
