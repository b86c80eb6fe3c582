//! Collaborator contracts consumed by the coordinator, plus their default backends.
//!
//! - `DataSnapshotProvider`: read-only view of the latest behavioral bundle.
//!   Default: `PgSnapshotProvider` over the `behavior_snapshots` table.
//! - `ExternalInsightGenerator`: the expensive, slow call we are protecting.
//!   Default: `LlmInsightGenerator`, which goes through `llm_client` like every
//!   other LLM call in the service.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use crate::insights::errors::InsightError;
use crate::insights::policy::CategoryPolicyRegistry;
use crate::insights::prompts::{render_prompt, INSIGHT_SYSTEM};
use crate::llm_client::LlmClient;

// ────────────────────────────────────────────────────────────────────────────
// Data models
// ────────────────────────────────────────────────────────────────────────────

/// The category-relevant subset of a user's behavioral signals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataBundle {
    pub data_point_count: u32,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl DataBundle {
    pub fn is_empty(&self) -> bool {
        self.data_point_count == 0 || self.fields.is_empty()
    }
}

/// Raw output of one generation call, before length and range validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedInsight {
    pub text: String,
    pub confidence: f64,
    #[serde(default)]
    pub evidence: Vec<String>,
}

// ────────────────────────────────────────────────────────────────────────────
// Trait definitions
// ────────────────────────────────────────────────────────────────────────────

/// Source of data bundles. Must be side-effect free and safe to call repeatedly.
#[async_trait]
pub trait DataSnapshotProvider: Send + Sync {
    async fn get_bundle(&self, user_id: Uuid, category: &str) -> Result<DataBundle, InsightError>;
}

/// The external text generator. May fail or hang; the coordinator enforces the timeout.
#[async_trait]
pub trait ExternalInsightGenerator: Send + Sync {
    async fn generate(
        &self,
        prompt_template_id: &str,
        bundle: &DataBundle,
    ) -> Result<GeneratedInsight, InsightError>;
}

// ────────────────────────────────────────────────────────────────────────────
// PgSnapshotProvider
// ────────────────────────────────────────────────────────────────────────────

/// Reads the latest bundle written by the feature extraction pipeline.
/// A missing row is an empty bundle, not an error.
pub struct PgSnapshotProvider {
    pool: PgPool,
}

impl PgSnapshotProvider {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DataSnapshotProvider for PgSnapshotProvider {
    async fn get_bundle(&self, user_id: Uuid, category: &str) -> Result<DataBundle, InsightError> {
        let row: Option<(i32, Value)> = sqlx::query_as(
            "SELECT data_point_count, data FROM behavior_snapshots WHERE user_id = $1 AND category = $2",
        )
        .bind(user_id)
        .bind(category)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| InsightError::Snapshot(format!("snapshot query failed: {e}")))?;

        Ok(row
            .map(|(count, data)| bundle_from_row(count, data))
            .unwrap_or_default())
    }
}

fn bundle_from_row(count: i32, data: Value) -> DataBundle {
    let fields = match data {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };

    DataBundle {
        data_point_count: u32::try_from(count).unwrap_or(0),
        fields,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// LlmInsightGenerator
// ────────────────────────────────────────────────────────────────────────────

/// Generates insight text with Claude through the shared `LlmClient`.
pub struct LlmInsightGenerator {
    llm: LlmClient,
    /// Text limit per prompt template, rendered into the prompt.
    /// The coordinator still truncates.
    max_lengths: HashMap<String, usize>,
}

impl LlmInsightGenerator {
    pub fn new(llm: LlmClient, registry: &CategoryPolicyRegistry) -> Self {
        let max_lengths = registry
            .policies()
            .map(|policy| (policy.prompt_template_id.clone(), policy.text_max_length))
            .collect();
        Self { llm, max_lengths }
    }

    fn build_prompt(&self, prompt_template_id: &str, bundle: &DataBundle) -> Result<String, InsightError> {
        let max_length = self.max_lengths.get(prompt_template_id).copied().ok_or_else(|| {
            InsightError::Generation(format!(
                "no category policy uses prompt template '{prompt_template_id}'"
            ))
        })?;

        let bundle_json = serde_json::to_string_pretty(bundle)
            .map_err(|e| InsightError::Generation(format!("failed to serialize bundle: {e}")))?;

        render_prompt(prompt_template_id, &bundle_json, max_length).ok_or_else(|| {
            InsightError::Generation(format!("unknown prompt template '{prompt_template_id}'"))
        })
    }
}

#[async_trait]
impl ExternalInsightGenerator for LlmInsightGenerator {
    async fn generate(
        &self,
        prompt_template_id: &str,
        bundle: &DataBundle,
    ) -> Result<GeneratedInsight, InsightError> {
        let prompt = self.build_prompt(prompt_template_id, bundle)?;

        debug!(
            "Calling LLM for template {} ({} data points)",
            prompt_template_id, bundle.data_point_count
        );

        self.llm
            .call_json::<GeneratedInsight>(&prompt, INSIGHT_SYSTEM)
            .await
            .map_err(|e| InsightError::Generation(format!("insight LLM call failed: {e}")))
    }
}
