//! Axum route handlers for the Insights API.
//!
//! Generation outcomes (cooldown, insufficient data, upstream failure) are normal
//! 200 responses with `success: false`; only request validation and read-path
//! store failures become `AppError`s.

use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use chrono::{DateTime, Utc};
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::errors::AppError;
use crate::insights::coordinator::{DigestEntry, GenerationOutcome, WeeklyDigest};
use crate::insights::cooldown::CooldownState;
use crate::models::insight::InsightRecord;
use crate::state::AppState;

// ────────────────────────────────────────────────────────────────────────────
// Request / Response types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct GenerateInsightRequest {
    pub user_id: Uuid,
    #[serde(default)]
    pub force_generate: bool,
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub user_id: Uuid,
    #[serde(default)]
    pub force_generate: bool,
}

#[derive(Debug, Deserialize)]
pub struct UserIdQuery {
    pub user_id: Uuid,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct DigestRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InsightView {
    pub id: Uuid,
    pub category: String,
    pub text: String,
    pub confidence: f64,
    pub evidence: Vec<String>,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
}

impl From<InsightRecord> for InsightView {
    fn from(record: InsightRecord) -> Self {
        Self {
            id: record.id,
            category: record.category,
            text: record.text,
            confidence: record.confidence,
            evidence: record.evidence,
            generated_at: record.generated_at,
            expires_at: record.expires_at,
            active: record.active,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CooldownView {
    pub cooldown_until: DateTime<Utc>,
    pub remaining_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InsufficientDataView {
    pub data_point_count: u32,
    pub needed: u32,
}

/// The single response shape for a generation request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InsightResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insight: Option<InsightView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown: Option<CooldownView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insufficient_data: Option<InsufficientDataView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_insight: Option<String>,
    pub cached: bool,
    pub category: String,
    pub timestamp: DateTime<Utc>,
}

impl InsightResponse {
    pub fn from_outcome(category: &str, outcome: GenerationOutcome, timestamp: DateTime<Utc>) -> Self {
        let mut response = InsightResponse {
            success: false,
            insight: None,
            error: None,
            error_code: None,
            cooldown: None,
            insufficient_data: None,
            fallback_insight: None,
            cached: false,
            category: category.to_string(),
            timestamp,
        };

        match outcome {
            GenerationOutcome::Generated { insight, cached } => {
                response.success = true;
                response.cached = cached;
                response.insight = Some(insight.into());
            }
            GenerationOutcome::CooldownActive {
                cooldown_until,
                remaining,
            } => {
                let remaining_seconds = remaining.num_seconds();
                response.error = Some(format!(
                    "Insight is on cooldown for another {}",
                    humanize_seconds(remaining_seconds)
                ));
                response.error_code = Some("COOLDOWN_ACTIVE");
                response.cooldown = Some(CooldownView {
                    cooldown_until,
                    remaining_seconds,
                });
            }
            GenerationOutcome::InsufficientData {
                data_point_count,
                needed,
            } => {
                response.error = Some(format!(
                    "Not enough data yet: {data_point_count} of {needed} data points"
                ));
                response.error_code = Some("INSUFFICIENT_DATA");
                response.insufficient_data = Some(InsufficientDataView {
                    data_point_count,
                    needed,
                });
            }
            GenerationOutcome::GenerationFailed {
                error,
                fallback_insight,
            } => {
                response.error = Some(error);
                response.error_code = Some("GENERATION_FAILED");
                response.fallback_insight = Some(fallback_insight);
            }
            GenerationOutcome::InvalidCategory { category } => {
                response.error = Some(format!("Unknown insight category: {category}"));
                response.error_code = Some("VALIDATION_ERROR");
            }
        }

        response
    }
}

#[derive(Debug, Serialize)]
pub struct InsightStatusResponse {
    pub user_id: Uuid,
    pub cooldown_status: std::collections::BTreeMap<String, CooldownState>,
    pub recent_insights: Vec<InsightView>,
}

#[derive(Debug, Serialize)]
pub struct DigestCategoryView {
    pub category: String,
    pub result: InsightResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_insight: Option<InsightView>,
}

#[derive(Debug, Serialize)]
pub struct DigestResponse {
    pub user_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub categories: Vec<DigestCategoryView>,
}

impl From<WeeklyDigest> for DigestResponse {
    fn from(digest: WeeklyDigest) -> Self {
        let generated_at = digest.generated_at;
        Self {
            user_id: digest.user_id,
            generated_at,
            categories: digest
                .entries
                .into_iter()
                .map(
                    |DigestEntry {
                         category,
                         outcome,
                         cached_insight,
                     }| DigestCategoryView {
                        result: InsightResponse::from_outcome(&category, outcome, generated_at),
                        cached_insight: cached_insight.map(InsightView::from),
                        category,
                    },
                )
                .collect(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Handlers
// ────────────────────────────────────────────────────────────────────────────

/// POST /api/v1/insights/:category/generate
///
/// Generates an insight unless the category is cooling down, data is thin, or
/// the cached insight still matches the data. Always answers with the
/// `InsightResponse` shape.
pub async fn handle_generate_insight(
    State(state): State<AppState>,
    Path(category): Path<String>,
    Json(request): Json<GenerateInsightRequest>,
) -> Result<Json<InsightResponse>, AppError> {
    let outcome = state
        .coordinator
        .generate_category_insight(request.user_id, &category, request.force_generate)
        .await;

    if let GenerationOutcome::InvalidCategory { category } = outcome {
        return Err(AppError::Validation(format!(
            "Unknown insight category: {category}"
        )));
    }

    Ok(Json(InsightResponse::from_outcome(
        &category,
        outcome,
        state.coordinator.now(),
    )))
}

/// GET /api/v1/insights/:category/stream
///
/// SSE variant: one `status` event, then exactly one `insight` or `error` event,
/// then `done`. Closing the stream early does not cancel the generation.
pub async fn handle_stream_insight(
    State(state): State<AppState>,
    Path(category): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    if state.coordinator.registry().get(&category).is_none() {
        return Err(AppError::Validation(format!(
            "Unknown insight category: {category}"
        )));
    }

    let coordinator = state.coordinator.clone();
    let stream = async_stream::stream! {
        yield Ok(json_event("status", &json!({
            "status": "processing",
            "category": category,
        })));

        let outcome = coordinator
            .generate_category_insight(query.user_id, &category, query.force_generate)
            .await;
        let response = InsightResponse::from_outcome(&category, outcome, coordinator.now());
        let event_name = if response.success { "insight" } else { "error" };
        yield Ok(json_event(event_name, &response));

        yield Ok(Event::default().event("done").data("[DONE]"));
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// GET /api/v1/insights/status
///
/// Cooldown state per category plus recent insights. Never triggers generation.
pub async fn handle_insight_status(
    State(state): State<AppState>,
    Query(params): Query<UserIdQuery>,
) -> Result<Json<InsightStatusResponse>, AppError> {
    let status = state.coordinator.status(params.user_id).await?;

    Ok(Json(InsightStatusResponse {
        user_id: params.user_id,
        cooldown_status: status.cooldown_status,
        recent_insights: status
            .recent_insights
            .into_iter()
            .map(InsightView::from)
            .collect(),
    }))
}

/// GET /api/v1/insights/recent
pub async fn handle_recent_insights(
    State(state): State<AppState>,
    Query(params): Query<UserIdQuery>,
) -> Result<Json<Vec<InsightView>>, AppError> {
    let insights = state
        .coordinator
        .recent_insights(params.user_id, params.limit)
        .await?;
    Ok(Json(insights.into_iter().map(InsightView::from).collect()))
}

/// POST /api/v1/insights/digest
///
/// Best-effort generation for every category, merged with cached insights for
/// categories that are cooling down or failed.
pub async fn handle_weekly_digest(
    State(state): State<AppState>,
    Json(request): Json<DigestRequest>,
) -> Result<Json<DigestResponse>, AppError> {
    let digest = state.coordinator.weekly_digest(request.user_id).await;
    Ok(Json(digest.into()))
}

/// DELETE /api/v1/insights/:category
///
/// Marks the active insight inactive. The cooldown is left as is.
pub async fn handle_invalidate_insight(
    State(state): State<AppState>,
    Path(category): Path<String>,
    Query(params): Query<UserIdQuery>,
) -> Result<StatusCode, AppError> {
    let invalidated = state
        .coordinator
        .invalidate(params.user_id, &category)
        .await?;

    if !invalidated {
        return Err(AppError::NotFound(format!(
            "No active {category} insight for user {}",
            params.user_id
        )));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ────────────────────────────────────────────────────────────────────────────
// Helpers
// ────────────────────────────────────────────────────────────────────────────

fn json_event<T: Serialize>(name: &str, payload: &T) -> Event {
    Event::default()
        .event(name)
        .json_data(payload)
        .unwrap_or_else(|e| {
            tracing::error!("Failed to serialize SSE payload: {e}");
            Event::default().event("error").data("serialization failed")
        })
}

fn humanize_seconds(seconds: i64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    match (hours, minutes) {
        (0, 0) => "less than a minute".to_string(),
        (0, m) => format!("{m}m"),
        (h, 0) => format!("{h}h"),
        (h, m) => format!("{h}h {m}m"),
    }
}
