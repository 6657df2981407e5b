//! Plan-cache fingerprints.
//!
//! A fingerprint identifies a (normalized prompt, context signature)
//! pair. Identical prompts against identical contexts must collide so
//! the cache can return byte-identical graphs; the hash must stay
//! stable across versions, so the canonical form is pinned here:
//! SHA-256 over `lowercase(trim(prompt))` followed by the canonical
//! JSON of `{device_model, interface, sorted(available_nodes)}`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The context half of a fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSignature {
    pub device_model: String,
    pub interface: String,
    /// Always sorted; the constructor enforces it
    pub available_nodes: Vec<String>,
}

impl ContextSignature {
    pub fn new(
        device_model: impl Into<String>,
        interface: impl Into<String>,
        mut available_nodes: Vec<String>,
    ) -> Self {
        available_nodes.sort();
        Self {
            device_model: device_model.into(),
            interface: interface.into(),
            available_nodes,
        }
    }
}

/// Normalize a prompt for fingerprinting and cache comparison.
pub fn normalize_prompt(prompt: &str) -> String {
    prompt.trim().to_lowercase()
}

/// Compute the stable fingerprint for (prompt, signature).
pub fn fingerprint(prompt: &str, signature: &ContextSignature) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_prompt(prompt).as_bytes());
    hasher.update(b"\x1f");
    // Struct field order is fixed, nodes are sorted: canonical by construction.
    let canonical = serde_json::to_string(signature).unwrap_or_default();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}
