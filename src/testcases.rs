//! Saved test cases.
//!
//! A test case is a named, persisted plan graph. Save validates the
//! graph structurally so nothing unloadable ever lands in the store;
//! save-then-load yields graph equality.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::control::Ctx;
use crate::error::{Error, Result};
use crate::persistence::{tables, Persistence};
use crate::plan::graph::PlanGraph;

/// A saved, executable plan graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Testcase {
    pub testcase_id: String,
    pub name: String,
    pub graph: PlanGraph,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Listing entry without the graph body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestcaseSummary {
    pub testcase_id: String,
    pub name: String,
    pub tags: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// Store-backed test case repository.
pub struct TestcaseStore {
    store: Arc<dyn Persistence>,
}

impl TestcaseStore {
    pub fn new(store: Arc<dyn Persistence>) -> Self {
        Self { store }
    }

    /// Save a new test case. The graph must validate.
    pub async fn save(
        &self,
        ctx: &Ctx,
        name: &str,
        graph: PlanGraph,
        tags: Vec<String>,
    ) -> Result<Testcase> {
        if name.trim().is_empty() {
            return Err(Error::invalid_input("testcase name must not be empty"));
        }
        graph.validate()?;

        let now = Utc::now();
        let testcase = Testcase {
            testcase_id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            graph,
            tags,
            created_at: now,
            updated_at: now,
        };
        self.store
            .upsert(
                tables::TESTCASES,
                &[&ctx.team_id, &testcase.testcase_id],
                json!(testcase),
            )
            .await?;
        Ok(testcase)
    }

    /// Overwrite an existing test case's graph and tags.
    pub async fn update(&self, ctx: &Ctx, testcase_id: &str, graph: PlanGraph) -> Result<Testcase> {
        graph.validate()?;
        let mut testcase = self.load(ctx, testcase_id).await?;
        testcase.graph = graph;
        testcase.updated_at = Utc::now();
        self.store
            .upsert(
                tables::TESTCASES,
                &[&ctx.team_id, testcase_id],
                json!(testcase),
            )
            .await?;
        Ok(testcase)
    }

    /// Load one test case.
    pub async fn load(&self, ctx: &Ctx, testcase_id: &str) -> Result<Testcase> {
        let record = self
            .store
            .get_by_key(tables::TESTCASES, &[&ctx.team_id, testcase_id])
            .await?
            .ok_or_else(|| Error::not_found("testcase", testcase_id))?;
        Ok(serde_json::from_value(record.payload)?)
    }

    /// List the team's test cases, optionally filtered by tag.
    pub async fn list(&self, ctx: &Ctx, tag: Option<&str>) -> Result<Vec<TestcaseSummary>> {
        let records = self
            .store
            .list_by_filter(tables::TESTCASES, &[&ctx.team_id])
            .await?;
        let mut summaries = Vec::new();
        for record in records {
            let testcase: Testcase = serde_json::from_value(record.payload)?;
            if let Some(tag) = tag {
                if !testcase.tags.iter().any(|t| t == tag) {
                    continue;
                }
            }
            summaries.push(TestcaseSummary {
                testcase_id: testcase.testcase_id,
                name: testcase.name,
                tags: testcase.tags,
                updated_at: testcase.updated_at,
            });
        }
        Ok(summaries)
    }
}
