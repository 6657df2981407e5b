//! Device control and session lifecycle.
//!
//! A session is exclusive ownership of one device. Acquiring a session
//! for a device that is already owned revokes the prior session: its
//! token stops authorizing new submissions, while in-flight executions
//! drain to a terminal state. Release is idempotent and a no-op for
//! callers that no longer own the device.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::navigation::NavigationCache;
use crate::persistence::{tables, Persistence};
use crate::registry::{DeviceKey, DeviceRegistry, HostStatus};

/// Opaque session ownership token. Submissions carry it; a revoked
/// token never authorizes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionToken(pub Uuid);

impl SessionToken {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Explicit request context threaded through every core operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ctx {
    pub team_id: String,
    /// Session token, present once the caller has taken control
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<SessionToken>,
}

impl Ctx {
    pub fn new(team_id: impl Into<String>) -> Self {
        Self {
            team_id: team_id.into(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: SessionToken) -> Self {
        self.token = Some(token);
        self
    }
}

/// An exclusive ownership record over one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlSession {
    pub session_id: Uuid,
    pub owner_token: SessionToken,
    pub team_id: String,
    pub device: DeviceKey,
    pub created_at: DateTime<Utc>,
    /// Whether the navigation cache was confirmed for this session
    pub cache_ready: bool,
    /// Interface the cache was built for, when a tree was pinned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
}

/// Result of a successful `take_control`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeControlResult {
    pub session_id: Uuid,
    pub token: SessionToken,
    pub cache_ready: bool,
}

/// Configuration for the session layer.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Sessions idle longer than this are reaped by the watchdog
    pub session_ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::hours(1),
        }
    }
}

/// Mutually exclusive device ownership.
pub struct SessionManager {
    registry: Arc<DeviceRegistry>,
    nav_cache: Arc<NavigationCache>,
    store: Arc<dyn Persistence>,
    sessions: RwLock<HashMap<DeviceKey, ControlSession>>,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        nav_cache: Arc<NavigationCache>,
        store: Arc<dyn Persistence>,
        config: SessionConfig,
    ) -> Self {
        Self {
            registry,
            nav_cache,
            store,
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Acquire exclusive control of a device.
    ///
    /// Non-blocking: succeeds (revoking any prior session) or fails if
    /// the device is unregistered or its host is unreachable. When
    /// `tree_ref` names a navigation tree (by tree id or interface), the
    /// unified graph is built or confirmed and `cache_ready` reports it.
    pub async fn take_control(
        &self,
        ctx: &Ctx,
        host_name: &str,
        device_id: &str,
        tree_ref: Option<&str>,
    ) -> Result<TakeControlResult> {
        let key = DeviceKey::new(host_name, device_id);
        self.registry.device(&key)?;

        let host = self.registry.host(host_name)?;
        if host.status != HostStatus::Online {
            return Err(Error::host_unreachable(host_name, "host is offline"));
        }

        let mut cache_ready = false;
        let mut interface = None;
        if let Some(tree_ref) = tree_ref {
            let resolved = self.resolve_interface(&ctx.team_id, tree_ref).await?;
            cache_ready = self
                .nav_cache
                .get_or_build(&ctx.team_id, &resolved, self.store.as_ref())
                .await
                .is_ok();
            interface = Some(resolved);
        }

        let session = ControlSession {
            session_id: Uuid::new_v4(),
            owner_token: SessionToken::generate(),
            team_id: ctx.team_id.clone(),
            device: key.clone(),
            created_at: Utc::now(),
            cache_ready,
            interface,
        };

        let result = TakeControlResult {
            session_id: session.session_id,
            token: session.owner_token,
            cache_ready,
        };

        let mut sessions = self.sessions.write().await;
        if let Some(prior) = sessions.insert(key.clone(), session) {
            tracing::info!(
                device = %key,
                revoked_session = %prior.session_id,
                "prior session revoked by new take_control"
            );
        }
        Ok(result)
    }

    /// Release the caller's lock. Idempotent; a caller that no longer
    /// owns the device changes nothing.
    pub async fn release_control(&self, ctx: &Ctx, host_name: &str, device_id: &str) {
        let key = DeviceKey::new(host_name, device_id);
        let mut sessions = self.sessions.write().await;
        let owns = sessions
            .get(&key)
            .map(|s| Some(s.owner_token) == ctx.token)
            .unwrap_or(false);
        if owns {
            sessions.remove(&key);
            tracing::info!(device = %key, "session released");
        }
    }

    /// Check that the token in `ctx` currently owns the device.
    pub async fn verify_owner(&self, ctx: &Ctx, device: &DeviceKey) -> Result<()> {
        let sessions = self.sessions.read().await;
        match sessions.get(device) {
            Some(session) if Some(session.owner_token) == ctx.token => Ok(()),
            _ => Err(Error::not_owner(device.to_string())),
        }
    }

    /// Snapshot of currently locked devices.
    pub async fn locked_devices(&self) -> Vec<ControlSession> {
        let sessions = self.sessions.read().await;
        sessions.values().cloned().collect()
    }

    /// Watchdog sweep: drop sessions whose host went offline and
    /// sessions older than the TTL. Returns the dropped sessions.
    pub async fn reap_orphans(&self) -> Vec<ControlSession> {
        let cutoff = Utc::now() - self.config.session_ttl;
        let mut reaped = Vec::new();
        let mut sessions = self.sessions.write().await;
        sessions.retain(|key, session| {
            let host_online = self
                .registry
                .host(&key.host_name)
                .map(|h| h.status == HostStatus::Online)
                .unwrap_or(false);
            let keep = host_online && session.created_at >= cutoff;
            if !keep {
                tracing::warn!(device = %key, session = %session.session_id, "reaping orphaned session");
                reaped.push(session.clone());
            }
            keep
        });
        reaped
    }

    /// Resolve a tree reference (tree id or interface name) to the
    /// interface owning it for this team.
    async fn resolve_interface(&self, team_id: &str, tree_ref: &str) -> Result<String> {
        let records = self
            .store
            .list_by_filter(tables::NAVIGATION_TREE, &[team_id])
            .await?;
        for record in records {
            let interface = record.key.get(1).cloned().unwrap_or_default();
            if interface == tree_ref {
                return Ok(interface);
            }
            if record
                .payload
                .get("tree_id")
                .and_then(|v| v.as_str())
                .map(|id| id == tree_ref)
                .unwrap_or(false)
            {
                return Ok(interface);
            }
        }
        Err(Error::not_found("navigation_tree", tree_ref))
    }
}
