//! Cached entities, redirect chains, and name lookup rows
//!
//! Writes that belong together (payload, chain, names) go through one
//! transaction so a reader never sees a payload without its chain.

use serde::Serialize;
use sqlx::{SqliteConnection, SqliteExecutor};
use taxa_common::checksum::ContentHash;
use tracing::debug;

use super::CacheStore;
use crate::error::{IngestError, Result};
use crate::models::{validate_redirect_chain, ExternalId, FetchedEntity, RedirectHop};
use crate::names::NameVariant;

/// Durable record for one external id (maps to entities table)
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CachedEntity {
    pub id: i64,
    pub external_id: String,
    pub import_run_id: i64,
    pub payload: String,
    pub content_hash: String,
    pub downloaded_at: i64,
    pub canonical_id: Option<String>,
    pub canonical_name: Option<String>,
    pub parent_id: Option<String>,
    pub rank: Option<String>,
    pub is_redirect: bool,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityChange {
    Inserted,
    Updated,
    /// Same content hash as the stored payload
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertResult {
    pub row_id: i64,
    pub change: EntityChange,
    pub content_hash: ContentHash,
}

pub(crate) async fn fetch_entity<'e, E>(executor: E, external_id: &str) -> Result<Option<CachedEntity>>
where
    E: SqliteExecutor<'e>,
{
    let entity = sqlx::query_as::<_, CachedEntity>(
        r#"
        SELECT id, external_id, import_run_id, payload, content_hash, downloaded_at,
               canonical_id, canonical_name, parent_id, rank, is_redirect, updated_at
        FROM entities WHERE external_id = ?1
        "#,
    )
    .bind(external_id)
    .fetch_optional(executor)
    .await?;

    Ok(entity)
}

pub(crate) async fn fetch_redirect_chain<'e, E>(executor: E, entity_id: i64) -> Result<Vec<RedirectHop>>
where
    E: SqliteExecutor<'e>,
{
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT from_id, to_id FROM redirect_edges WHERE entity_id = ?1 ORDER BY position",
    )
    .bind(entity_id)
    .fetch_all(executor)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(from, to)| RedirectHop { from, to })
        .collect())
}

pub(crate) async fn fetch_names<'e, E>(executor: E, entity_id: i64) -> Result<Vec<NameVariant>>
where
    E: SqliteExecutor<'e>,
{
    let rows: Vec<(String, String, String)> = sqlx::query_as(
        "SELECT original, normalized, kind FROM entity_names WHERE entity_id = ?1 ORDER BY id",
    )
    .bind(entity_id)
    .fetch_all(executor)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(original, normalized, kind)| NameVariant {
            original,
            normalized,
            kind,
        })
        .collect())
}

async fn upsert_in(
    conn: &mut SqliteConnection,
    external_id: &ExternalId,
    import_run_id: i64,
    entity: &FetchedEntity,
    downloaded_at: i64,
) -> Result<UpsertResult> {
    let hash = ContentHash::of(entity.payload.as_bytes());

    let existing: Option<(i64, String)> =
        sqlx::query_as("SELECT id, content_hash FROM entities WHERE external_id = ?1")
            .bind(external_id.as_str())
            .fetch_optional(&mut *conn)
            .await?;

    let change = match existing {
        None => EntityChange::Inserted,
        Some((row_id, stored)) => {
            let stored = ContentHash::from_hex(stored).map_err(|e| {
                IngestError::corrupt(format!("entity row {}: {}", row_id, e))
            })?;
            if stored == hash {
                EntityChange::Unchanged
            } else {
                EntityChange::Updated
            }
        },
    };

    // Provenance always moves forward; updated_at only when content changed
    let row_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO entities (
            external_id, import_run_id, payload, content_hash, downloaded_at,
            canonical_id, canonical_name, parent_id, rank, is_redirect, updated_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?5)
        ON CONFLICT(external_id) DO UPDATE SET
            import_run_id = excluded.import_run_id,
            downloaded_at = excluded.downloaded_at,
            payload = excluded.payload,
            canonical_id = excluded.canonical_id,
            canonical_name = excluded.canonical_name,
            parent_id = excluded.parent_id,
            rank = excluded.rank,
            is_redirect = excluded.is_redirect,
            updated_at = CASE
                WHEN entities.content_hash = excluded.content_hash THEN entities.updated_at
                ELSE excluded.updated_at
            END,
            content_hash = excluded.content_hash
        RETURNING id
        "#,
    )
    .bind(external_id.as_str())
    .bind(import_run_id)
    .bind(&entity.payload)
    .bind(hash.as_str())
    .bind(downloaded_at)
    .bind(&entity.fields.canonical_id)
    .bind(&entity.fields.canonical_name)
    .bind(&entity.fields.parent_id)
    .bind(&entity.fields.rank)
    .bind(entity.fields.is_redirect)
    .fetch_one(&mut *conn)
    .await?;

    Ok(UpsertResult {
        row_id,
        change,
        content_hash: hash,
    })
}

async fn replace_chain_in(
    conn: &mut SqliteConnection,
    entity_id: i64,
    hops: &[RedirectHop],
) -> Result<()> {
    let (is_redirect, canonical_id): (bool, Option<String>) =
        sqlx::query_as("SELECT is_redirect, canonical_id FROM entities WHERE id = ?1")
            .bind(entity_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| IngestError::InvalidRedirectChain {
                entity_id,
                reason: "entity does not exist".to_string(),
            })?;

    if !hops.is_empty() && is_redirect {
        return Err(IngestError::InvalidRedirectChain {
            entity_id,
            reason: "chain terminates at a redirect stub".to_string(),
        });
    }
    validate_redirect_chain(hops, canonical_id.as_deref())
        .map_err(|reason| IngestError::InvalidRedirectChain { entity_id, reason })?;

    sqlx::query("DELETE FROM redirect_edges WHERE entity_id = ?1")
        .bind(entity_id)
        .execute(&mut *conn)
        .await?;

    for (position, hop) in hops.iter().enumerate() {
        sqlx::query(
            "INSERT INTO redirect_edges (entity_id, position, from_id, to_id) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(entity_id)
        .bind(position as i64)
        .bind(&hop.from)
        .bind(&hop.to)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

async fn replace_names_in(
    conn: &mut SqliteConnection,
    entity_id: i64,
    names: &[NameVariant],
) -> Result<()> {
    sqlx::query("DELETE FROM entity_names WHERE entity_id = ?1")
        .bind(entity_id)
        .execute(&mut *conn)
        .await?;

    for name in names {
        sqlx::query(
            "INSERT INTO entity_names (entity_id, original, normalized, kind) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(entity_id)
        .bind(&name.original)
        .bind(&name.normalized)
        .bind(&name.kind)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

impl CacheStore {
    /// Insert or update the row for `external_id`.
    ///
    /// The content hash is recomputed from the payload; `change` reports
    /// whether it differs from what was stored.
    pub async fn upsert_entity(
        &self,
        external_id: &ExternalId,
        import_run_id: i64,
        entity: &FetchedEntity,
        downloaded_at: i64,
    ) -> Result<UpsertResult> {
        let mut conn = self.pool().acquire().await?;
        upsert_in(&mut conn, external_id, import_run_id, entity, downloaded_at).await
    }

    /// Atomically swap the stored chain for `entity_id` with `hops`
    pub async fn replace_redirect_chain(&self, entity_id: i64, hops: &[RedirectHop]) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        replace_chain_in(&mut tx, entity_id, hops).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Atomically swap the lookup rows for `entity_id` with `names`
    pub async fn replace_names(&self, entity_id: i64, names: &[NameVariant]) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        replace_names_in(&mut tx, entity_id, names).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Upsert, chain replacement, and name replacement in one transaction.
    ///
    /// Chain and names are only rewritten when the content changed.
    pub async fn commit_entity(
        &self,
        external_id: &ExternalId,
        import_run_id: i64,
        entity: &FetchedEntity,
        names: &[NameVariant],
        downloaded_at: i64,
    ) -> Result<UpsertResult> {
        let mut tx = self.pool().begin().await?;

        let result = upsert_in(&mut tx, external_id, import_run_id, entity, downloaded_at).await?;
        if result.change != EntityChange::Unchanged {
            replace_chain_in(&mut tx, result.row_id, &entity.redirects).await?;
            replace_names_in(&mut tx, result.row_id, names).await?;
        }

        tx.commit().await?;
        debug!(
            external_id = %external_id,
            row_id = result.row_id,
            change = ?result.change,
            "Committed entity"
        );
        Ok(result)
    }

    pub async fn get_downloaded_at(&self, external_id: &ExternalId) -> Result<Option<i64>> {
        let downloaded_at: Option<i64> =
            sqlx::query_scalar("SELECT downloaded_at FROM entities WHERE external_id = ?1")
                .bind(external_id.as_str())
                .fetch_optional(self.pool())
                .await?;
        Ok(downloaded_at)
    }

    pub async fn get_entity(&self, external_id: &ExternalId) -> Result<Option<CachedEntity>> {
        fetch_entity(self.pool(), external_id.as_str()).await
    }

    pub async fn redirect_chain(&self, entity_id: i64) -> Result<Vec<RedirectHop>> {
        fetch_redirect_chain(self.pool(), entity_id).await
    }

    pub async fn names_for(&self, entity_id: i64) -> Result<Vec<NameVariant>> {
        fetch_names(self.pool(), entity_id).await
    }

    /// Remove an entity; its chain and name rows cascade
    pub async fn delete_entity(&self, external_id: &ExternalId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM entities WHERE external_id = ?1")
            .bind(external_id.as_str())
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
