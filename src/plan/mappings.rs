//! Learned phrase→node mappings.
//!
//! When a user resolves a disambiguation, the choice is persisted per
//! (team, interface, phrase) and applied automatically to future
//! prompts from the same team. Confirmations are idempotent:
//! re-confirming the same choice only bumps the usage counter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

use crate::control::Ctx;
use crate::error::Result;
use crate::persistence::{tables, Persistence};

/// One persisted substitution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedMapping {
    pub phrase: String,
    pub resolved_node: String,
    pub usage_count: u64,
    pub last_used_at: DateTime<Utc>,
}

/// Store-backed mapping table.
pub struct LearnedMappings {
    store: Arc<dyn Persistence>,
}

impl LearnedMappings {
    pub fn new(store: Arc<dyn Persistence>) -> Self {
        Self { store }
    }

    /// Batch lookup: returns phrase → resolved node for every phrase
    /// with a stored mapping, bumping usage on the hits.
    pub async fn lookup_batch(
        &self,
        ctx: &Ctx,
        interface: &str,
        phrases: &[String],
    ) -> Result<HashMap<String, String>> {
        let mut resolved = HashMap::new();
        for phrase in phrases {
            let key = [ctx.team_id.as_str(), interface, phrase.as_str()];
            let Some(record) = self
                .store
                .get_by_key(tables::LEARNED_MAPPING, &key)
                .await?
            else {
                continue;
            };
            let mut mapping: LearnedMapping = serde_json::from_value(record.payload)?;
            mapping.usage_count += 1;
            mapping.last_used_at = Utc::now();
            self.store
                .upsert(tables::LEARNED_MAPPING, &key, json!(mapping))
                .await?;
            resolved.insert(phrase.clone(), mapping.resolved_node);
        }
        Ok(resolved)
    }

    /// Persist a confirmed choice. Re-confirming the same node is a
    /// counter bump; a different node replaces the target but never
    /// decreases the counter.
    pub async fn confirm(
        &self,
        ctx: &Ctx,
        interface: &str,
        phrase: &str,
        resolved_node: &str,
    ) -> Result<()> {
        let key = [ctx.team_id.as_str(), interface, phrase];
        let existing = self
            .store
            .get_by_key(tables::LEARNED_MAPPING, &key)
            .await?
            .and_then(|r| serde_json::from_value::<LearnedMapping>(r.payload).ok());

        let mapping = match existing {
            Some(prior) if prior.resolved_node == resolved_node => LearnedMapping {
                usage_count: prior.usage_count + 1,
                last_used_at: Utc::now(),
                ..prior
            },
            Some(prior) => LearnedMapping {
                phrase: phrase.to_string(),
                resolved_node: resolved_node.to_string(),
                usage_count: prior.usage_count,
                last_used_at: Utc::now(),
            },
            None => LearnedMapping {
                phrase: phrase.to_string(),
                resolved_node: resolved_node.to_string(),
                usage_count: 1,
                last_used_at: Utc::now(),
            },
        };

        self.store
            .upsert(tables::LEARNED_MAPPING, &key, json!(mapping))
            .await
    }

    /// All mappings for (team, interface).
    pub async fn list(&self, ctx: &Ctx, interface: &str) -> Result<Vec<LearnedMapping>> {
        let records = self
            .store
            .list_by_filter(tables::LEARNED_MAPPING, &[&ctx.team_id, interface])
            .await?;
        let mut mappings = Vec::new();
        for record in records {
            mappings.push(serde_json::from_value(record.payload)?);
        }
        Ok(mappings)
    }
}
