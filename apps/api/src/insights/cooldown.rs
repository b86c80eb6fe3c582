//! Cooldown state: durable per-(user, category) gating bookkeeping.
//!
//! Rules:
//! - no row ⇒ never attempted ⇒ eligible
//! - `cooldown_until` moves only on a successful attempt
//! - `attempt_count` increments on every attempt, success or failure
//!
//! Only the generation coordinator writes through this store.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::insights::errors::InsightError;
use crate::models::insight::CooldownRecord;

/// Result of an eligibility check.
#[derive(Debug, Clone, PartialEq)]
pub struct Eligibility {
    pub eligible: bool,
    /// Time left on the cooldown. Zero when eligible by time.
    pub remaining: Duration,
    pub state: Option<CooldownRecord>,
}

/// One attempt to be recorded against a (user, category) pair.
#[derive(Debug, Clone)]
pub struct AttemptRecord<'a> {
    pub user_id: Uuid,
    pub category: &'a str,
    pub fingerprint: &'a str,
    pub success: bool,
    pub now: DateTime<Utc>,
    pub cooldown_period: Duration,
}

/// Externally visible gating state for one category.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CooldownState {
    NeverAttempted,
    Eligible {
        attempt_count: i64,
        last_generated_at: Option<DateTime<Utc>>,
    },
    OnCooldown {
        attempt_count: i64,
        last_generated_at: Option<DateTime<Utc>>,
        cooldown_until: DateTime<Utc>,
        remaining_seconds: i64,
    },
    Generating,
}

/// Pure eligibility rule shared by every backend.
pub fn evaluate_eligibility(
    state: Option<CooldownRecord>,
    force_generate: bool,
    now: DateTime<Utc>,
) -> Eligibility {
    let remaining = state
        .as_ref()
        .and_then(|s| s.cooldown_until)
        .map(|until| until - now)
        .filter(|left| *left > Duration::zero())
        .unwrap_or_else(Duration::zero);

    Eligibility {
        eligible: force_generate || remaining <= Duration::zero(),
        remaining,
        state,
    }
}

/// Maps a stored record to the state shown to callers.
pub fn describe_state(state: Option<&CooldownRecord>, now: DateTime<Utc>) -> CooldownState {
    let Some(record) = state else {
        return CooldownState::NeverAttempted;
    };

    match record.cooldown_until {
        Some(until) if until > now => CooldownState::OnCooldown {
            attempt_count: record.attempt_count,
            last_generated_at: record.last_generated_at,
            cooldown_until: until,
            remaining_seconds: (until - now).num_seconds(),
        },
        _ => CooldownState::Eligible {
            attempt_count: record.attempt_count,
            last_generated_at: record.last_generated_at,
        },
    }
}

#[async_trait]
pub trait CooldownStateStore: Send + Sync {
    async fn get_state(
        &self,
        user_id: Uuid,
        category: &str,
    ) -> Result<Option<CooldownRecord>, InsightError>;

    /// All cooldown rows for a user, any category.
    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<CooldownRecord>, InsightError>;

    async fn record_attempt(&self, attempt: AttemptRecord<'_>) -> Result<(), InsightError>;

    async fn is_eligible(
        &self,
        user_id: Uuid,
        category: &str,
        force_generate: bool,
        now: DateTime<Utc>,
    ) -> Result<Eligibility, InsightError> {
        let state = self.get_state(user_id, category).await?;
        Ok(evaluate_eligibility(state, force_generate, now))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Postgres backend
// ────────────────────────────────────────────────────────────────────────────

pub struct PgCooldownStore {
    pool: PgPool,
}

impl PgCooldownStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CooldownStateStore for PgCooldownStore {
    async fn get_state(
        &self,
        user_id: Uuid,
        category: &str,
    ) -> Result<Option<CooldownRecord>, InsightError> {
        Ok(sqlx::query_as::<_, CooldownRecord>(
            r#"
            SELECT user_id, category, last_generated_at, cooldown_until,
                   last_fingerprint, attempt_count
            FROM insight_cooldowns
            WHERE user_id = $1 AND category = $2
            "#,
        )
        .bind(user_id)
        .bind(category)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<CooldownRecord>, InsightError> {
        Ok(sqlx::query_as::<_, CooldownRecord>(
            r#"
            SELECT user_id, category, last_generated_at, cooldown_until,
                   last_fingerprint, attempt_count
            FROM insight_cooldowns
            WHERE user_id = $1
            ORDER BY category
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn record_attempt(&self, attempt: AttemptRecord<'_>) -> Result<(), InsightError> {
        if attempt.success {
            sqlx::query(
                r#"
                INSERT INTO insight_cooldowns
                    (user_id, category, last_generated_at, cooldown_until,
                     last_fingerprint, attempt_count, updated_at)
                VALUES ($1, $2, $3, $4, $5, 1, $3)
                ON CONFLICT (user_id, category) DO UPDATE SET
                    last_generated_at = EXCLUDED.last_generated_at,
                    cooldown_until    = EXCLUDED.cooldown_until,
                    last_fingerprint  = EXCLUDED.last_fingerprint,
                    attempt_count     = insight_cooldowns.attempt_count + 1,
                    updated_at        = EXCLUDED.updated_at
                "#,
            )
            .bind(attempt.user_id)
            .bind(attempt.category)
            .bind(attempt.now)
            .bind(attempt.now + attempt.cooldown_period)
            .bind(attempt.fingerprint)
            .execute(&self.pool)
            .await?;
        } else {
            // Failure leaves cooldown_until alone: a failed attempt imposes no wait.
            sqlx::query(
                r#"
                INSERT INTO insight_cooldowns (user_id, category, attempt_count, updated_at)
                VALUES ($1, $2, 1, $3)
                ON CONFLICT (user_id, category) DO UPDATE SET
                    attempt_count = insight_cooldowns.attempt_count + 1,
                    updated_at    = EXCLUDED.updated_at
                "#,
            )
            .bind(attempt.user_id)
            .bind(attempt.category)
            .bind(attempt.now)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }
}
