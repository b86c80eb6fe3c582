//! Insight store: durable, TTL-aware cache of generated insights.
//!
//! CRITICAL: every read filters `expires_at > now`. That filter, not physical
//! deletion, is what keeps expired insights from ever being served. `purge_expired`
//! is housekeeping only.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use crate::insights::errors::InsightError;
use crate::models::insight::InsightRecord;

#[async_trait]
pub trait InsightStore: Send + Sync {
    /// Persists `record` and marks any previously active record for the same
    /// (user, category) inactive, atomically.
    async fn save(&self, record: &InsightRecord) -> Result<(), InsightError>;

    async fn get_active(
        &self,
        user_id: Uuid,
        category: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<InsightRecord>, InsightError>;

    /// Unexpired records across all categories, newest first.
    async fn get_recent(
        &self,
        user_id: Uuid,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<InsightRecord>, InsightError>;

    /// Marks the active record inactive. Returns whether one was found.
    async fn invalidate(&self, user_id: Uuid, category: &str) -> Result<bool, InsightError>;

    /// Deletes expired rows. Returns the number removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, InsightError>;
}

pub struct PgInsightStore {
    pool: PgPool,
}

impl PgInsightStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InsightStore for PgInsightStore {
    async fn save(&self, record: &InsightRecord) -> Result<(), InsightError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE insights SET active = FALSE WHERE user_id = $1 AND category = $2 AND active",
        )
        .bind(record.user_id)
        .bind(&record.category)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO insights
                (id, user_id, category, text, confidence, evidence, data_fingerprint,
                 data_point_count, generated_at, expires_at, active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(record.id)
        .bind(record.user_id)
        .bind(&record.category)
        .bind(&record.text)
        .bind(record.confidence)
        .bind(&record.evidence)
        .bind(&record.data_fingerprint)
        .bind(record.data_point_count)
        .bind(record.generated_at)
        .bind(record.expires_at)
        .bind(record.active)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(
            "Saved insight {} for user {} ({})",
            record.id, record.user_id, record.category
        );
        Ok(())
    }

    async fn get_active(
        &self,
        user_id: Uuid,
        category: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<InsightRecord>, InsightError> {
        Ok(sqlx::query_as::<_, InsightRecord>(
            r#"
            SELECT id, user_id, category, text, confidence, evidence, data_fingerprint,
                   data_point_count, generated_at, expires_at, active
            FROM insights
            WHERE user_id = $1 AND category = $2 AND active AND expires_at > $3
            ORDER BY generated_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(category)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn get_recent(
        &self,
        user_id: Uuid,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<InsightRecord>, InsightError> {
        Ok(sqlx::query_as::<_, InsightRecord>(
            r#"
            SELECT id, user_id, category, text, confidence, evidence, data_fingerprint,
                   data_point_count, generated_at, expires_at, active
            FROM insights
            WHERE user_id = $1 AND expires_at > $2
            ORDER BY generated_at DESC
            LIMIT $3
            "#,
        )
        .bind(user_id)
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?)
    }

    async fn invalidate(&self, user_id: Uuid, category: &str) -> Result<bool, InsightError> {
        let result = sqlx::query(
            "UPDATE insights SET active = FALSE WHERE user_id = $1 AND category = $2 AND active",
        )
        .bind(user_id)
        .bind(category)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, InsightError> {
        let result = sqlx::query("DELETE FROM insights WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
