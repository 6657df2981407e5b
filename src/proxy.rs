//! Server-side proxy to hosts.
//!
//! The server is a stateless router: it resolves which host owns a
//! device, forwards the request, and hands the execution id back to the
//! client. It duplicates no execution state; polling goes through the
//! same routing path, and a host lost mid-poll degrades to a failed
//! status with `host_unreachable` rather than an exception.

use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, ErrorKind, Result};
use crate::execution::record::{ExecutionId, ExecutionStatus, StatusResponse};
use crate::registry::{DeviceInfo, DeviceRegistry, HostInfo, HostStatus};

/// Proxy tunables.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub request_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 10,
        }
    }
}

/// Stateless request router over registered hosts.
pub struct ServerProxy {
    registry: Arc<DeviceRegistry>,
    http: Client,
}

impl ServerProxy {
    pub fn new(registry: Arc<DeviceRegistry>, config: ProxyConfig) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_default();
        Self { registry, http }
    }

    /// Resolve the owning host of a device; offline hosts are
    /// unreachable, not merely stale.
    pub fn resolve(&self, device_id: &str) -> Result<(HostInfo, DeviceInfo)> {
        let (host, device) = self.registry.resolve_device(device_id)?;
        if host.status != HostStatus::Online {
            return Err(Error::host_unreachable(&host.host_name, "host is offline"));
        }
        Ok((host, device))
    }

    fn endpoint(host: &HostInfo, path: &str) -> String {
        format!(
            "{}/{}",
            host.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Forward a POST to the owning host and return its JSON body.
    pub async fn forward(&self, device_id: &str, path: &str, payload: &Value) -> Result<Value> {
        let (host, _) = self.resolve(device_id)?;
        let url = Self::endpoint(&host, path);

        let response = self
            .http
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| Error::host_unreachable(&host.host_name, e.to_string()))?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let message = body
                .get("error_msg")
                .and_then(|v| v.as_str())
                .unwrap_or("host rejected the request");
            return Err(Error::Internal(format!(
                "host {} returned {}: {}",
                host.host_name, status, message
            )));
        }
        Ok(body)
    }

    /// Submit a long-running operation and return the execution id.
    pub async fn submit(&self, device_id: &str, path: &str, payload: &Value) -> Result<ExecutionId> {
        let body = self.forward(device_id, path, payload).await?;
        body.get("execution_id")
            .and_then(|v| v.as_str())
            .and_then(ExecutionId::parse)
            .ok_or_else(|| {
                Error::Internal("host response carried no execution_id".to_string())
            })
    }

    /// Poll a host for execution status. A host that became unreachable
    /// yields a failed status instead of an error, so pollers converge.
    pub async fn poll_status(
        &self,
        device_id: &str,
        execution_id: ExecutionId,
    ) -> Result<StatusResponse> {
        let (host, _) = match self.resolve(device_id) {
            Ok(resolved) => resolved,
            Err(e) if e.kind() == ErrorKind::HostUnreachable => {
                return Ok(unreachable_status(execution_id, e.to_string()));
            }
            Err(e) => return Err(e),
        };

        let url = Self::endpoint(&host, "execution/status");
        let response = self
            .http
            .get(&url)
            .query(&[("execution_id", execution_id.to_string())])
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => return Ok(unreachable_status(execution_id, e.to_string())),
        };
        if !response.status().is_success() {
            return Err(Error::not_found("execution", execution_id.to_string()));
        }
        response
            .json()
            .await
            .map_err(|e| Error::Internal(format!("malformed status payload: {}", e)))
    }
}

fn unreachable_status(execution_id: ExecutionId, message: String) -> StatusResponse {
    StatusResponse {
        execution_id,
        status: ExecutionStatus::Failed,
        progress: 0,
        result: None,
        logs: None,
        error_kind: Some(ErrorKind::HostUnreachable),
        error_msg: Some(message),
    }
}
