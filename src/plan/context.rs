//! Plan-builder context loading.
//!
//! The context of a generation request is everything the pipeline may
//! reference: available navigation nodes, the device's action and
//! verification catalogs, and the device model. Loading goes through
//! the registry and the navigation cache and is memoized briefly so a
//! disambiguation round-trip does not rebuild it.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::control::Ctx;
use crate::error::Result;
use crate::navigation::NavigationCache;
use crate::persistence::Persistence;
use crate::plan::fingerprint::ContextSignature;
use crate::registry::{
    actions_for_device, verifications_for_device, DeviceKey, DeviceRegistry,
};

/// Everything the plan pipeline may reference for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanContext {
    pub interface: String,
    pub device_model: String,
    /// Node labels of the unified graph, insertion-ordered
    pub nodes: Vec<String>,
    /// Action commands available on the device
    pub actions: Vec<String>,
    /// Verification types available on the device
    pub verifications: Vec<String>,
}

impl PlanContext {
    /// The signature half of the plan-cache fingerprint.
    pub fn signature(&self) -> ContextSignature {
        ContextSignature::new(
            self.device_model.clone(),
            self.interface.clone(),
            self.nodes.clone(),
        )
    }
}

/// Configuration for the context loader.
#[derive(Debug, Clone)]
pub struct ContextLoaderConfig {
    pub ttl: Duration,
}

impl Default for ContextLoaderConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::minutes(5),
        }
    }
}

type MemoKey = (String, DeviceKey, String);

/// TTL-memoized context loader.
pub struct ContextLoader {
    registry: Arc<DeviceRegistry>,
    nav_cache: Arc<NavigationCache>,
    store: Arc<dyn Persistence>,
    memo: RwLock<HashMap<MemoKey, (PlanContext, DateTime<Utc>)>>,
    config: ContextLoaderConfig,
}

impl ContextLoader {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        nav_cache: Arc<NavigationCache>,
        store: Arc<dyn Persistence>,
        config: ContextLoaderConfig,
    ) -> Self {
        Self {
            registry,
            nav_cache,
            store,
            memo: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Load (or reuse) the context for (device, interface, team).
    pub async fn load(
        &self,
        ctx: &Ctx,
        device: &DeviceKey,
        interface: &str,
    ) -> Result<PlanContext> {
        let key = (ctx.team_id.clone(), device.clone(), interface.to_string());

        {
            let memo = self.memo.read().await;
            if let Some((context, loaded_at)) = memo.get(&key) {
                if Utc::now() - *loaded_at < self.config.ttl {
                    return Ok(context.clone());
                }
            }
        }

        let device_info = self.registry.device(device)?;
        let graph = self
            .nav_cache
            .get_or_build(&ctx.team_id, interface, self.store.as_ref())
            .await?;

        let context = PlanContext {
            interface: interface.to_string(),
            device_model: device_info.device_model.clone(),
            nodes: graph.labels(),
            actions: actions_for_device(&device_info)
                .into_iter()
                .map(|a| a.command)
                .collect(),
            verifications: verifications_for_device(&device_info)
                .into_iter()
                .map(|v| v.verification_type)
                .collect(),
        };

        let mut memo = self.memo.write().await;
        memo.insert(key, (context.clone(), Utc::now()));
        Ok(context)
    }

    /// Drop memoized contexts for a team/interface (tree mutation).
    pub async fn invalidate(&self, team_id: &str, interface: &str) {
        let mut memo = self.memo.write().await;
        memo.retain(|(team, _, iface), _| !(team == team_id && iface == interface));
    }
}
