//! Per-(team, interface) unified graph cache.
//!
//! Navigation trees mutate frequently; stale paths surface as
//! node-not-found at runtime, so the TTL stays short and every tree
//! write invalidates its slot eagerly.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::navigation::tree::NavigationTree;
use crate::navigation::unified::UnifiedGraph;
use crate::persistence::{tables, Persistence};

/// Configuration for the navigation cache.
#[derive(Debug, Clone)]
pub struct NavigationCacheConfig {
    /// Maximum slot age before a rebuild is forced
    pub ttl: Duration,
}

impl Default for NavigationCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::minutes(5),
        }
    }
}

#[derive(Clone)]
struct Slot {
    graph: Arc<UnifiedGraph>,
    built_at: DateTime<Utc>,
}

/// Cache of unified graphs keyed by (team_id, interface).
///
/// Slots are built lazily from the persisted tree, memoized until TTL
/// expiry or explicit invalidation, and swapped atomically: readers hold
/// an `Arc` to whichever build they resolved.
pub struct NavigationCache {
    slots: RwLock<HashMap<(String, String), Slot>>,
    versions: AtomicU64,
    config: NavigationCacheConfig,
}

impl NavigationCache {
    pub fn new(config: NavigationCacheConfig) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            versions: AtomicU64::new(0),
            config,
        }
    }

    /// Get the unified graph for (team, interface), rebuilding from the
    /// persisted tree when the slot is missing or expired.
    pub async fn get_or_build(
        &self,
        team_id: &str,
        interface: &str,
        store: &dyn Persistence,
    ) -> Result<Arc<UnifiedGraph>> {
        let key = (team_id.to_string(), interface.to_string());

        {
            let slots = self.slots.read().await;
            if let Some(slot) = slots.get(&key) {
                if Utc::now() - slot.built_at < self.config.ttl {
                    return Ok(slot.graph.clone());
                }
            }
        }

        let tree = self.load_tree(team_id, interface, store).await?;
        let version = self.versions.fetch_add(1, Ordering::SeqCst) + 1;
        let graph = Arc::new(UnifiedGraph::build(&tree, version)?);

        let mut slots = self.slots.write().await;
        slots.insert(
            key,
            Slot {
                graph: graph.clone(),
                built_at: Utc::now(),
            },
        );
        Ok(graph)
    }

    /// Drop the cached slot for (team, interface).
    pub async fn invalidate(&self, team_id: &str, interface: &str) {
        let mut slots = self.slots.write().await;
        slots.remove(&(team_id.to_string(), interface.to_string()));
    }

    /// Persist a tree and invalidate its slot (event-driven invalidation:
    /// every node/edge write goes through here).
    pub async fn store_tree(
        &self,
        team_id: &str,
        tree: &NavigationTree,
        store: &dyn Persistence,
    ) -> Result<()> {
        store
            .upsert(
                tables::NAVIGATION_TREE,
                &[team_id, &tree.interface],
                json!(tree),
            )
            .await?;
        self.invalidate(team_id, &tree.interface).await;
        tracing::debug!(team_id, interface = %tree.interface, "navigation tree updated, slot invalidated");
        Ok(())
    }

    /// Load the persisted tree for (team, interface).
    pub async fn load_tree(
        &self,
        team_id: &str,
        interface: &str,
        store: &dyn Persistence,
    ) -> Result<NavigationTree> {
        let record = store
            .get_by_key(tables::NAVIGATION_TREE, &[team_id, interface])
            .await?
            .ok_or_else(|| Error::not_found("navigation_tree", interface))?;
        Ok(serde_json::from_value(record.payload)?)
    }
}

impl Default for NavigationCache {
    fn default() -> Self {
        Self::new(NavigationCacheConfig::default())
    }
}
