//! Failure ledger
//!
//! One row per external id that failed to fetch, upserted on every failure
//! and removed once the id is fetched successfully. The ledger only answers
//! "is it time to retry yet"; deciding to give up is the caller's business.

use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::error::Result;
use crate::models::{now_millis, ExternalId};
use crate::store::CacheStore;

/// Retry delay used when the caller does not supply one
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5 * 60);

/// Per-entity delay: `base * 2^prior_attempts`, capped at `cap`
pub fn escalating_delay(base: Duration, cap: Duration, prior_attempts: u32) -> Duration {
    let factor = 1u32.checked_shl(prior_attempts.min(31)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(cap)
}

/// Maps to the failures table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct FailureRecord {
    pub external_id: String,
    pub attempts: i64,
    pub last_error: String,
    pub last_status: Option<i64>,
    pub last_attempt_at: i64,
    pub next_retry_at: Option<i64>,
    pub import_run_id: Option<i64>,
}

impl FailureRecord {
    pub fn external_id(&self) -> ExternalId {
        ExternalId::new(self.external_id.clone())
    }
}

#[derive(Debug, Clone)]
pub struct FailureLedger {
    store: CacheStore,
}

impl FailureLedger {
    pub fn new(store: &CacheStore) -> Self {
        Self {
            store: store.clone(),
        }
    }

    pub async fn record_failure(
        &self,
        external_id: &ExternalId,
        error: &str,
        status: Option<u16>,
        retry_delay: Option<Duration>,
        import_run_id: Option<i64>,
    ) -> Result<FailureRecord> {
        self.record_failure_at(now_millis(), external_id, error, status, retry_delay, import_run_id)
            .await
    }

    /// [`FailureLedger::record_failure`] with an explicit clock
    pub async fn record_failure_at(
        &self,
        now: i64,
        external_id: &ExternalId,
        error: &str,
        status: Option<u16>,
        retry_delay: Option<Duration>,
        import_run_id: Option<i64>,
    ) -> Result<FailureRecord> {
        let delay = retry_delay.unwrap_or(DEFAULT_RETRY_DELAY);
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        let next_retry_at = now.saturating_add(delay_ms);

        let record = sqlx::query_as::<_, FailureRecord>(
            r#"
            INSERT INTO failures (
                external_id, attempts, last_error, last_status,
                last_attempt_at, next_retry_at, import_run_id
            )
            VALUES (?1, 1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(external_id) DO UPDATE SET
                attempts = failures.attempts + 1,
                last_error = excluded.last_error,
                last_status = excluded.last_status,
                last_attempt_at = excluded.last_attempt_at,
                next_retry_at = excluded.next_retry_at,
                import_run_id = excluded.import_run_id
            RETURNING external_id, attempts, last_error, last_status,
                      last_attempt_at, next_retry_at, import_run_id
            "#,
        )
        .bind(external_id.as_str())
        .bind(error)
        .bind(status.map(i64::from))
        .bind(now)
        .bind(next_retry_at)
        .bind(import_run_id)
        .fetch_one(self.store.pool())
        .await?;

        debug!(
            external_id = %external_id,
            attempts = record.attempts,
            next_retry_at,
            "Recorded failure"
        );
        Ok(record)
    }

    /// Forget an id after a successful fetch; returns whether a record existed
    pub async fn clear_failure(&self, external_id: &ExternalId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM failures WHERE external_id = ?1")
            .bind(external_id.as_str())
            .execute(self.store.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Records whose retry time is unset or has passed, soonest first
    pub async fn list_eligible(&self, as_of: i64) -> Result<Vec<FailureRecord>> {
        let records = sqlx::query_as::<_, FailureRecord>(
            r#"
            SELECT external_id, attempts, last_error, last_status,
                   last_attempt_at, next_retry_at, import_run_id
            FROM failures
            WHERE next_retry_at IS NULL OR next_retry_at <= ?1
            ORDER BY COALESCE(next_retry_at, 0), external_id
            "#,
        )
        .bind(as_of)
        .fetch_all(self.store.pool())
        .await?;

        Ok(records)
    }

    pub async fn get(&self, external_id: &ExternalId) -> Result<Option<FailureRecord>> {
        let record = sqlx::query_as::<_, FailureRecord>(
            r#"
            SELECT external_id, attempts, last_error, last_status,
                   last_attempt_at, next_retry_at, import_run_id
            FROM failures WHERE external_id = ?1
            "#,
        )
        .bind(external_id.as_str())
        .fetch_optional(self.store.pool())
        .await?;

        Ok(record)
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM failures")
            .fetch_one(self.store.pool())
            .await?;
        Ok(count)
    }
}
