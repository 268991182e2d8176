//! Append-only record of inbound provider webhooks.
//!
//! `UNIQUE(provider, event_id)` on `webhook_events` is what makes a delivery
//! apply at most once: of any number of concurrent inserts for the same key,
//! exactly one affects a row.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::db::now;
use crate::errors::Result;
use crate::models::WebhookEventRecord;

#[derive(Debug, Clone, Copy)]
pub struct NewWebhookEvent<'a> {
    pub provider: &'a str,
    pub event_id: &'a str,
    pub event_type: &'a str,
    pub payload: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// First delivery; side effects may be applied.
    Recorded(i64),
    /// The key was already present; the row's retry count was bumped.
    Duplicate(i64),
}

#[async_trait]
pub trait EventLedger: Send + Sync {
    /// Insert the event before any side effect runs.
    async fn record(&self, event: NewWebhookEvent<'_>) -> Result<RecordOutcome>;

    /// Mark the event handled. `note` explains skipped or partially failed work.
    async fn mark_processed(&self, id: i64, note: Option<&str>) -> Result<()>;

    /// Leave the event unprocessed with an error for operator replay.
    async fn mark_failed(&self, id: i64, error: &str) -> Result<()>;

    /// Count an operator replay.
    async fn bump_retry(&self, id: i64) -> Result<()>;

    async fn get(&self, id: i64) -> Result<Option<WebhookEventRecord>>;

    async fn list(&self, unprocessed_only: bool, limit: i64) -> Result<Vec<WebhookEventRecord>>;
}

#[derive(Clone)]
pub struct SqliteEventLedger {
    pool: SqlitePool,
}

impl SqliteEventLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

const SELECT_EVENT: &str = r#"
    SELECT id, provider, event_id, event_type, payload, processed, processed_at,
           error_message, retry_count, received_at
    FROM   webhook_events
"#;

#[async_trait]
impl EventLedger for SqliteEventLedger {
    async fn record(&self, event: NewWebhookEvent<'_>) -> Result<RecordOutcome> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO webhook_events
                (provider, event_id, event_type, payload, processed, retry_count, received_at)
            VALUES (?1, ?2, ?3, ?4, 0, 0, ?5)
            "#,
        )
        .bind(event.provider)
        .bind(event.event_id)
        .bind(event.event_type)
        .bind(event.payload)
        .bind(now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(RecordOutcome::Recorded(result.last_insert_rowid()));
        }

        let (id,): (i64,) = sqlx::query_as(
            r#"
            UPDATE webhook_events SET retry_count = retry_count + 1
            WHERE  provider = ?1 AND event_id = ?2
            RETURNING id
            "#,
        )
        .bind(event.provider)
        .bind(event.event_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(RecordOutcome::Duplicate(id))
    }

    async fn mark_processed(&self, id: i64, note: Option<&str>) -> Result<()> {
        sqlx::query(
            "UPDATE webhook_events SET processed = 1, processed_at = ?1, error_message = ?2 WHERE id = ?3",
        )
        .bind(now())
        .bind(note)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query("UPDATE webhook_events SET processed = 0, error_message = ?1 WHERE id = ?2")
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn bump_retry(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE webhook_events SET retry_count = retry_count + 1 WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, id: i64) -> Result<Option<WebhookEventRecord>> {
        let row = sqlx::query_as::<_, WebhookEventRecord>(&format!("{SELECT_EVENT} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list(&self, unprocessed_only: bool, limit: i64) -> Result<Vec<WebhookEventRecord>> {
        let rows = sqlx::query_as::<_, WebhookEventRecord>(&format!(
            "{SELECT_EVENT} WHERE (?1 = 0 OR processed = 0) ORDER BY received_at DESC, id DESC LIMIT ?2"
        ))
        .bind(unprocessed_only)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
