//! Import run provenance
//!
//! An import run is opened before a request leaves the process and is
//! finalized exactly once. A run whose fetch was cancelled is deleted
//! instead, so no half-written run remains.

use std::time::Duration;

use serde::Serialize;
use sqlx::SqliteExecutor;
use tracing::debug;

use super::CacheStore;
use crate::error::{IngestError, Result};
use crate::models::now_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportOutcome {
    Pending,
    Success,
    Failure,
}

impl ImportOutcome {
    pub fn as_str(&self) -> &str {
        match self {
            ImportOutcome::Pending => "pending",
            ImportOutcome::Success => "success",
            ImportOutcome::Failure => "failure",
        }
    }
}

impl From<String> for ImportOutcome {
    fn from(s: String) -> Self {
        match s.as_str() {
            "success" => ImportOutcome::Success,
            "failure" => ImportOutcome::Failure,
            _ => ImportOutcome::Pending,
        }
    }
}

/// One outbound fetch and how it ended (maps to import_runs table)
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ImportRun {
    pub id: i64,
    pub target: String,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub duration_ms: Option<i64>,
    pub http_status: Option<i64>,
    pub payload_bytes: Option<i64>,
    pub error: Option<String>,
    #[sqlx(try_from = "String")]
    pub outcome: ImportOutcome,
}

pub(crate) async fn fetch_import_run<'e, E>(executor: E, id: i64) -> Result<Option<ImportRun>>
where
    E: SqliteExecutor<'e>,
{
    let run = sqlx::query_as::<_, ImportRun>(
        r#"
        SELECT id, target, started_at, completed_at, duration_ms,
               http_status, payload_bytes, error, outcome
        FROM import_runs WHERE id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(executor)
    .await?;

    Ok(run)
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

impl CacheStore {
    /// Open a run for `target` (normally the request URL)
    pub async fn begin_import(&self, target: &str) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO import_runs (target, started_at, outcome)
            VALUES (?1, ?2, 'pending')
            "#,
        )
        .bind(target)
        .bind(now_millis())
        .execute(self.pool())
        .await?;

        let id = result.last_insert_rowid();
        debug!(import_run_id = id, target, "Began import run");
        Ok(id)
    }

    pub async fn complete_import_success(
        &self,
        id: i64,
        status: u16,
        payload_bytes: usize,
        duration: Duration,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE import_runs
            SET completed_at = ?2, duration_ms = ?3, http_status = ?4,
                payload_bytes = ?5, outcome = 'success'
            WHERE id = ?1 AND completed_at IS NULL
            "#,
        )
        .bind(id)
        .bind(now_millis())
        .bind(millis(duration))
        .bind(i64::from(status))
        .bind(i64::try_from(payload_bytes).unwrap_or(i64::MAX))
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.completion_conflict(id).await);
        }
        Ok(())
    }

    pub async fn complete_import_failure(
        &self,
        id: i64,
        error: &str,
        status: Option<u16>,
        duration: Duration,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE import_runs
            SET completed_at = ?2, duration_ms = ?3, http_status = ?4,
                error = ?5, outcome = 'failure'
            WHERE id = ?1 AND completed_at IS NULL
            "#,
        )
        .bind(id)
        .bind(now_millis())
        .bind(millis(duration))
        .bind(status.map(i64::from))
        .bind(error)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.completion_conflict(id).await);
        }
        Ok(())
    }

    /// Attach an error to a completed run whose payload was later rejected.
    ///
    /// The outcome is left as recorded: the transfer itself succeeded.
    pub async fn annotate_import_error(&self, id: i64, error: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE import_runs SET error = ?2
            WHERE id = ?1 AND completed_at IS NOT NULL
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return match fetch_import_run(self.pool(), id).await? {
                Some(_) => Err(IngestError::corrupt(format!(
                    "import run {} is still pending",
                    id
                ))),
                None => Err(IngestError::ImportRunNotFound(id)),
            };
        }
        Ok(())
    }

    /// Delete a run that never completed; returns whether a row was removed
    pub async fn abandon_import(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM import_runs WHERE id = ?1 AND completed_at IS NULL")
            .bind(id)
            .execute(self.pool())
            .await?;

        debug!(import_run_id = id, "Abandoned import run");
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_import_run(&self, id: i64) -> Result<Option<ImportRun>> {
        fetch_import_run(self.pool(), id).await
    }

    async fn completion_conflict(&self, id: i64) -> IngestError {
        match fetch_import_run(self.pool(), id).await {
            Ok(Some(_)) => IngestError::ImportRunCompleted(id),
            Ok(None) => IngestError::ImportRunNotFound(id),
            Err(e) => e,
        }
    }
}
