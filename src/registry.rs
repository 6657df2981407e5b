//! Host and device registry.
//!
//! The registry is the leaf of the core: it names the hosts a server knows
//! about and the devices each host drives, and derives capability catalogs
//! from device models. Everything above it (sessions, navigation, plans,
//! execution) resolves devices through this registry.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{Error, Result};

/// Liveness status of a registered host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Online,
    Offline,
}

/// A machine that drives one or more devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostInfo {
    /// Unique host name
    pub host_name: String,
    /// Base URL for forwarding requests to this host
    pub base_url: String,
    pub status: HostStatus,
    pub last_seen: DateTime<Utc>,
}

/// Capability sets derived from a device model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    /// Remote-key vocabulary (empty when the model has no remote)
    pub remote_keys: Vec<String>,
    /// ADB shell access
    pub adb: bool,
    /// Web/browser driving
    pub web: bool,
    /// Desktop driving
    pub desktop: bool,
    /// Verification methods the device supports
    pub verification_types: Vec<String>,
    /// Capture methods (screenshot, video)
    pub capture_types: Vec<String>,
}

/// A unit of test under a host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Unique within the owning host
    pub device_id: String,
    pub device_model: String,
    pub capabilities: DeviceCapabilities,
}

/// Fully-qualified device address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceKey {
    pub host_name: String,
    pub device_id: String,
}

impl DeviceKey {
    pub fn new(host_name: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
            device_id: device_id.into(),
        }
    }
}

impl std::fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.host_name, self.device_id)
    }
}

/// A single executable device action, as listed in capability catalogs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    /// Command name dispatched to the action executor
    pub command: String,
    /// Parameter names the command accepts
    pub params: Vec<String>,
    /// Which capability provides the command (remote, adb, web, desktop)
    pub provider: String,
}

impl ActionSpec {
    fn new(command: impl Into<String>, params: &[&str], provider: &str) -> Self {
        Self {
            command: command.into(),
            params: params.iter().map(|p| p.to_string()).collect(),
            provider: provider.to_string(),
        }
    }
}

/// A verification method, as listed in capability catalogs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationSpec {
    pub verification_type: String,
    pub params: Vec<String>,
}

impl VerificationSpec {
    fn new(verification_type: impl Into<String>, params: &[&str]) -> Self {
        Self {
            verification_type: verification_type.into(),
            params: params.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// Built-in model table. Unknown models fall back to a bare remote profile.
pub fn capabilities_for_model(device_model: &str) -> DeviceCapabilities {
    let standard_keys = |extra: &[&str]| {
        let mut keys: Vec<String> = ["UP", "DOWN", "LEFT", "RIGHT", "OK", "BACK", "HOME"]
            .iter()
            .map(|k| k.to_string())
            .collect();
        keys.extend(extra.iter().map(|k| k.to_string()));
        keys
    };

    match device_model {
        "android_tv" | "fire_tv" => DeviceCapabilities {
            remote_keys: standard_keys(&["MENU", "CHANNEL_UP", "CHANNEL_DOWN", "POWER"]),
            adb: true,
            web: false,
            desktop: false,
            verification_types: vec![
                "check_image".into(),
                "check_text".into(),
                "check_audio".into(),
                "check_video".into(),
                "check_adb_process".into(),
            ],
            capture_types: vec!["screenshot".into(), "video".into()],
        },
        "android_mobile" => DeviceCapabilities {
            remote_keys: standard_keys(&["VOLUME_UP", "VOLUME_DOWN", "POWER"]),
            adb: true,
            web: false,
            desktop: false,
            verification_types: vec![
                "check_image".into(),
                "check_text".into(),
                "check_adb_process".into(),
            ],
            capture_types: vec!["screenshot".into()],
        },
        "stb" | "settop" => DeviceCapabilities {
            remote_keys: standard_keys(&["MENU", "GUIDE", "CHANNEL_UP", "CHANNEL_DOWN", "POWER"]),
            adb: false,
            web: false,
            desktop: false,
            verification_types: vec![
                "check_image".into(),
                "check_text".into(),
                "check_audio".into(),
                "check_video".into(),
            ],
            capture_types: vec!["screenshot".into(), "video".into()],
        },
        "web_browser" => DeviceCapabilities {
            remote_keys: Vec::new(),
            adb: false,
            web: true,
            desktop: false,
            verification_types: vec!["check_element".into(), "check_text".into()],
            capture_types: vec!["screenshot".into()],
        },
        "desktop" => DeviceCapabilities {
            remote_keys: Vec::new(),
            adb: false,
            web: false,
            desktop: true,
            verification_types: vec!["check_image".into(), "check_text".into()],
            capture_types: vec!["screenshot".into()],
        },
        _ => DeviceCapabilities {
            remote_keys: standard_keys(&[]),
            adb: false,
            web: false,
            desktop: false,
            verification_types: vec!["check_image".into(), "check_text".into()],
            capture_types: vec!["screenshot".into()],
        },
    }
}

/// Derive the action catalog for a device from its capabilities.
pub fn actions_for_device(device: &DeviceInfo) -> Vec<ActionSpec> {
    let caps = &device.capabilities;
    let mut actions = Vec::new();

    for key in &caps.remote_keys {
        actions.push(ActionSpec::new(
            format!("press_key:{}", key),
            &["delay_ms"],
            "remote",
        ));
    }

    // Channel-capable devices get the composite zap action.
    if caps.remote_keys.iter().any(|k| k == "CHANNEL_UP") {
        actions.push(ActionSpec::new("zap", &["direction"], "remote"));
    }

    if caps.adb {
        actions.push(ActionSpec::new("launch_app", &["package"], "adb"));
        actions.push(ActionSpec::new("close_app", &["package"], "adb"));
        actions.push(ActionSpec::new("adb_shell", &["command"], "adb"));
        actions.push(ActionSpec::new("input_text", &["text"], "adb"));
        actions.push(ActionSpec::new("tap", &["x", "y"], "adb"));
    }

    if caps.web {
        actions.push(ActionSpec::new("open_url", &["url"], "web"));
        actions.push(ActionSpec::new("click_element", &["selector"], "web"));
        actions.push(ActionSpec::new("input_text", &["selector", "text"], "web"));
    }

    if caps.desktop {
        actions.push(ActionSpec::new("click", &["x", "y"], "desktop"));
        actions.push(ActionSpec::new("type_text", &["text"], "desktop"));
        actions.push(ActionSpec::new("key_combo", &["keys"], "desktop"));
    }

    actions
}

/// Derive the verification catalog for a device from its capabilities.
pub fn verifications_for_device(device: &DeviceInfo) -> Vec<VerificationSpec> {
    device
        .capabilities
        .verification_types
        .iter()
        .map(|v| match v.as_str() {
            "check_image" => VerificationSpec::new(v.clone(), &["reference", "threshold"]),
            "check_text" => VerificationSpec::new(v.clone(), &["text", "region"]),
            "check_element" => VerificationSpec::new(v.clone(), &["selector"]),
            "check_adb_process" => VerificationSpec::new(v.clone(), &["package"]),
            _ => VerificationSpec::new(v.clone(), &[]),
        })
        .collect()
}

struct HostEntry {
    info: HostInfo,
    devices: HashMap<String, DeviceInfo>,
}

/// Registry of hosts and their devices.
///
/// Read-mostly; writes happen on host registration and heartbeat. The
/// registry holds no locks across I/O.
pub struct DeviceRegistry {
    hosts: RwLock<HashMap<String, HostEntry>>,
    /// Hosts silent for longer than this are swept to Offline
    stale_after: Duration,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            hosts: RwLock::new(HashMap::new()),
            stale_after: Duration::seconds(60),
        }
    }

    /// Override the staleness window used by [`DeviceRegistry::sweep_stale`].
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Register (or re-register) a host. Re-registration preserves devices.
    pub fn register_host(&self, host_name: impl Into<String>, base_url: impl Into<String>) {
        let host_name = host_name.into();
        let mut hosts = self.hosts.write().expect("registry lock poisoned");
        let entry = hosts.entry(host_name.clone()).or_insert_with(|| HostEntry {
            info: HostInfo {
                host_name: host_name.clone(),
                base_url: String::new(),
                status: HostStatus::Online,
                last_seen: Utc::now(),
            },
            devices: HashMap::new(),
        });
        entry.info.base_url = base_url.into();
        entry.info.status = HostStatus::Online;
        entry.info.last_seen = Utc::now();
    }

    /// Attach a device to a host. The capability catalog is derived from
    /// the model unless the caller supplies one.
    pub fn register_device(
        &self,
        host_name: &str,
        device_id: impl Into<String>,
        device_model: impl Into<String>,
        capabilities: Option<DeviceCapabilities>,
    ) -> Result<()> {
        let device_id = device_id.into();
        let device_model = device_model.into();
        let mut hosts = self.hosts.write().expect("registry lock poisoned");
        let entry = hosts
            .get_mut(host_name)
            .ok_or_else(|| Error::not_found("host", host_name))?;
        let capabilities = capabilities.unwrap_or_else(|| capabilities_for_model(&device_model));
        entry.devices.insert(
            device_id.clone(),
            DeviceInfo {
                device_id,
                device_model,
                capabilities,
            },
        );
        Ok(())
    }

    /// Record a heartbeat from a host.
    pub fn mark_seen(&self, host_name: &str) {
        let mut hosts = self.hosts.write().expect("registry lock poisoned");
        if let Some(entry) = hosts.get_mut(host_name) {
            entry.info.last_seen = Utc::now();
            entry.info.status = HostStatus::Online;
        }
    }

    /// Get host info by name.
    pub fn host(&self, host_name: &str) -> Result<HostInfo> {
        let hosts = self.hosts.read().expect("registry lock poisoned");
        hosts
            .get(host_name)
            .map(|e| e.info.clone())
            .ok_or_else(|| Error::not_found("host", host_name))
    }

    /// Get a device by key.
    pub fn device(&self, key: &DeviceKey) -> Result<DeviceInfo> {
        let hosts = self.hosts.read().expect("registry lock poisoned");
        hosts
            .get(&key.host_name)
            .and_then(|e| e.devices.get(&key.device_id))
            .cloned()
            .ok_or_else(|| Error::not_found("device", key.to_string()))
    }

    /// Resolve the host that owns a device id, searching all hosts.
    pub fn resolve_device(&self, device_id: &str) -> Result<(HostInfo, DeviceInfo)> {
        let hosts = self.hosts.read().expect("registry lock poisoned");
        for entry in hosts.values() {
            if let Some(device) = entry.devices.get(device_id) {
                return Ok((entry.info.clone(), device.clone()));
            }
        }
        Err(Error::not_found("device", device_id))
    }

    /// List all registered hosts.
    pub fn hosts(&self) -> Vec<HostInfo> {
        let hosts = self.hosts.read().expect("registry lock poisoned");
        hosts.values().map(|e| e.info.clone()).collect()
    }

    /// List devices under a host.
    pub fn devices(&self, host_name: &str) -> Result<Vec<DeviceInfo>> {
        let hosts = self.hosts.read().expect("registry lock poisoned");
        hosts
            .get(host_name)
            .map(|e| e.devices.values().cloned().collect())
            .ok_or_else(|| Error::not_found("host", host_name))
    }

    /// Mark hosts silent for longer than the staleness window as Offline.
    /// Returns the names of hosts that transitioned.
    pub fn sweep_stale(&self) -> Vec<String> {
        let cutoff = Utc::now() - self.stale_after;
        let mut swept = Vec::new();
        let mut hosts = self.hosts.write().expect("registry lock poisoned");
        for entry in hosts.values_mut() {
            if entry.info.status == HostStatus::Online && entry.info.last_seen < cutoff {
                entry.info.status = HostStatus::Offline;
                swept.push(entry.info.host_name.clone());
            }
        }
        swept
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_device() -> DeviceRegistry {
        let registry = DeviceRegistry::new();
        registry.register_host("host1", "http://host1:6109");
        registry
            .register_device("host1", "device1", "android_tv", None)
            .unwrap();
        registry
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = registry_with_device();

        let (host, device) = registry.resolve_device("device1").unwrap();
        assert_eq!(host.host_name, "host1");
        assert_eq!(device.device_model, "android_tv");
        assert!(device.capabilities.adb);
    }

    #[test]
    fn test_unknown_device() {
        let registry = registry_with_device();
        let err = registry.resolve_device("missing").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn test_register_device_requires_host() {
        let registry = DeviceRegistry::new();
        assert!(registry
            .register_device("nope", "d1", "android_tv", None)
            .is_err());
    }

    #[test]
    fn test_action_catalog_derivation() {
        let registry = registry_with_device();
        let device = registry
            .device(&DeviceKey::new("host1", "device1"))
            .unwrap();

        let actions = actions_for_device(&device);
        assert!(actions.iter().any(|a| a.command == "press_key:UP"));
        assert!(actions.iter().any(|a| a.command == "launch_app"));

        let verifications = verifications_for_device(&device);
        assert!(verifications
            .iter()
            .any(|v| v.verification_type == "check_audio"));
    }

    #[test]
    fn test_web_model_has_no_remote_keys() {
        let caps = capabilities_for_model("web_browser");
        assert!(caps.remote_keys.is_empty());
        assert!(caps.web);
    }

    #[test]
    fn test_sweep_stale() {
        let registry = DeviceRegistry::new().with_stale_after(Duration::seconds(-1));
        registry.register_host("host1", "http://host1:6109");

        let swept = registry.sweep_stale();
        assert_eq!(swept, vec!["host1".to_string()]);
        assert_eq!(registry.host("host1").unwrap().status, HostStatus::Offline);
    }

    #[test]
    fn test_reregistration_preserves_devices() {
        let registry = registry_with_device();
        registry.register_host("host1", "http://host1:7000");

        assert_eq!(registry.host("host1").unwrap().base_url, "http://host1:7000");
        assert!(registry.device(&DeviceKey::new("host1", "device1")).is_ok());
    }
}
