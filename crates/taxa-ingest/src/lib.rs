//! Taxa Ingest Library
//!
//! Resilient, resumable harvesting of taxonomic records from Wikidata, the
//! IUCN Red List, and English Wikipedia into per-provider SQLite caches.
//!
//! # Components
//!
//! - [`client`]: rate-limited HTTP client with bounded retries
//! - [`store`]: content cache with redirect chains and import provenance
//! - [`ledger`]: failed fetches and when each becomes eligible for retry
//! - [`cursor`]: resumable candidate streams with adaptive batch sizing
//! - [`orchestrator`]: per-provider driver composing the above
//!
//! # Example
//!
//! ```no_run
//! use taxa_ingest::{IngestConfig, Ingestor, Provider, RunOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::from_env()?;
//!     let ingestor = Ingestor::open(Provider::Wikidata, &config).await?;
//!     let summary = ingestor
//!         .run(&RunOptions::full().with_limit(1_000), &CancellationToken::new())
//!         .await?;
//!     println!("added {} entities", summary.added);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod client;
pub mod config;
pub mod cursor;
pub mod error;
pub mod fetcher;
pub mod ledger;
pub mod models;
pub mod names;
pub mod orchestrator;
pub mod providers;
pub mod store;

pub use client::{FetchRequest, FetchedResponse, RetryClient};
pub use config::{IngestConfig, ProviderConfig};
pub use cursor::{CursorPhase, CursorStore};
pub use error::{ApiError, FetchError, IngestError, Result};
pub use ledger::{FailureLedger, FailureRecord};
pub use models::{EntityOutcome, ExternalId, Provider, RunMode, RunOptions, RunSummary};
pub use orchestrator::{provider_status, Ingestor, StatusReport};
pub use store::{CacheReader, CacheStats, CacheStore};
