//! Read-only access to a provider cache
//!
//! Opened on its own connection pool with `query_only` set, so reporting and
//! cache-derived candidate scans never hold the writer's connections.

use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use super::entities::{fetch_entity, fetch_names, fetch_redirect_chain};
use super::{CachedEntity, ImportRun};
use crate::error::{IngestError, Result};
use crate::models::{ExternalId, RedirectHop};
use crate::names::{normalize_name, NameVariant};

const READER_CONNECTIONS: u32 = 2;

/// Aggregate counts for status reporting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct CacheStats {
    pub entities: i64,
    pub redirects: i64,
    pub names: i64,
    pub import_runs: i64,
    pub failed_import_runs: i64,
    pub last_downloaded_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct CacheReader {
    pool: SqlitePool,
}

impl CacheReader {
    /// Open an existing cache database for reading
    pub async fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(IngestError::config(format!(
                "Cache database {} does not exist",
                path.display()
            )));
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(false)
            .busy_timeout(Duration::from_secs(10))
            .pragma("query_only", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(READER_CONNECTIONS)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub async fn get_entity(&self, external_id: &ExternalId) -> Result<Option<CachedEntity>> {
        fetch_entity(&self.pool, external_id.as_str()).await
    }

    /// Hops for an entity row, in chain order
    pub async fn redirect_chain(&self, entity_id: i64) -> Result<Vec<RedirectHop>> {
        fetch_redirect_chain(&self.pool, entity_id).await
    }

    pub async fn names_for(&self, entity_id: i64) -> Result<Vec<NameVariant>> {
        fetch_names(&self.pool, entity_id).await
    }

    /// Entities with a lookup row matching `name` after normalization
    pub async fn find_by_name(&self, name: &str) -> Result<Vec<CachedEntity>> {
        let entities = sqlx::query_as::<_, CachedEntity>(
            r#"
            SELECT DISTINCT e.id, e.external_id, e.import_run_id, e.payload, e.content_hash,
                   e.downloaded_at, e.canonical_id, e.canonical_name, e.parent_id, e.rank,
                   e.is_redirect, e.updated_at
            FROM entities e
            JOIN entity_names n ON n.entity_id = e.id
            WHERE n.normalized = ?1
            ORDER BY e.id
            "#,
        )
        .bind(normalize_name(name))
        .fetch_all(&self.pool)
        .await?;

        Ok(entities)
    }

    pub async fn cache_stats(&self) -> Result<CacheStats> {
        let stats = sqlx::query_as::<_, CacheStats>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM entities) AS entities,
                (SELECT COUNT(*) FROM redirect_edges) AS redirects,
                (SELECT COUNT(*) FROM entity_names) AS names,
                (SELECT COUNT(*) FROM import_runs) AS import_runs,
                (SELECT COUNT(*) FROM import_runs WHERE outcome = 'failure') AS failed_import_runs,
                (SELECT MAX(downloaded_at) FROM entities) AS last_downloaded_at
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(stats)
    }

    /// Most recent import runs, newest first
    pub async fn import_run_summaries(&self, limit: u32) -> Result<Vec<ImportRun>> {
        let runs = sqlx::query_as::<_, ImportRun>(
            r#"
            SELECT id, target, started_at, completed_at, duration_ms,
                   http_status, payload_bytes, error, outcome
            FROM import_runs
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(runs)
    }

    /// Persisted position of a named cursor
    pub async fn cursor(&self, name: &str) -> Result<Option<i64>> {
        let position: Option<i64> =
            sqlx::query_scalar("SELECT position FROM cursor_state WHERE name = ?1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(position)
    }

    pub async fn failure_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM failures")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Ledger entries whose retry time is unset or has passed
    pub async fn eligible_failure_count(&self, as_of: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM failures WHERE next_retry_at IS NULL OR next_retry_at <= ?1",
        )
        .bind(as_of)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Entity rows with `id > after_row_id`, in row order
    pub async fn scan_rows(&self, after_row_id: i64, limit: usize) -> Result<Vec<CachedEntity>> {
        let rows = sqlx::query_as::<_, CachedEntity>(
            r#"
            SELECT id, external_id, import_run_id, payload, content_hash, downloaded_at,
                   canonical_id, canonical_name, parent_id, rank, is_redirect, updated_at
            FROM entities
            WHERE id > ?1
            ORDER BY id
            LIMIT ?2
            "#,
        )
        .bind(after_row_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
