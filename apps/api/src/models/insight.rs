use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One generated insight for a (user, category) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct InsightRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub category: String,
    pub text: String,
    pub confidence: f64,
    pub evidence: Vec<String>,
    pub data_fingerprint: String,
    pub data_point_count: i32,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
}

/// Gating state for one (user, category) pair. Absence of a row means
/// "never attempted".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct CooldownRecord {
    pub user_id: Uuid,
    pub category: String,
    pub last_generated_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_fingerprint: Option<String>,
    pub attempt_count: i64,
}
