//! Content cache store
//!
//! One SQLite database per provider holds import provenance, cached entities,
//! redirect chains, name lookup rows, the failure ledger, and cursor state.
//! [`CacheStore`] is the single writer; [`CacheReader`] is a separate
//! query-only handle for reporting and for cache-derived candidate streams.

mod entities;
mod imports;
mod reader;

pub use entities::{CachedEntity, EntityChange, UpsertResult};
pub use imports::{ImportOutcome, ImportRun};
pub use reader::{CacheReader, CacheStats};

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use crate::error::{IngestError, Result};

const WRITER_CONNECTIONS: u32 = 4;
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Writer handle over one provider's cache database
#[derive(Debug, Clone)]
pub struct CacheStore {
    pool: SqlitePool,
    path: Option<PathBuf>,
}

impl CacheStore {
    /// Open (creating if needed) the database at `path` and apply migrations
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(taxa_common::CommonError::from)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(WRITER_CONNECTIONS)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            path: Some(path.to_path_buf()),
        };
        store.migrate().await?;
        info!(path = %path.display(), "Opened cache store");
        Ok(store)
    }

    /// Private in-memory database, mainly for tests
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        // Every connection to :memory: is a separate database, so pin one
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool, path: None };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        debug!("Cache schema is up to date");
        Ok(())
    }

    /// Pool shared with the ledger and cursor store living in the same file
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Database file backing this store; `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Open a read-only handle on the same database file
    pub async fn reader(&self) -> Result<CacheReader> {
        let path = self.path.as_deref().ok_or_else(|| {
            IngestError::config("In-memory cache store cannot be opened for reading")
        })?;
        CacheReader::open(path).await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
