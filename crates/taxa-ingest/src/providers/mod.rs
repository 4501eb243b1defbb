//! Provider adapters
//!
//! Each provider contributes two things:
//! - a [`ProviderAdapter`] that builds the entity request and decodes the
//!   response into an [`EntityFetch`]
//! - a [`PageSource`] that enumerates candidate ids for full runs
//!
//! Wikidata enumerates remotely over SPARQL. IUCN and Wikipedia derive their
//! candidates from the local wikidata cache through a read-only handle.

pub mod iucn;
pub mod wikidata;
pub mod wikipedia;

use std::collections::HashSet;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::{FetchRequest, FetchedResponse};
use crate::config::IngestConfig;
use crate::cursor::{Candidate, CandidatePage, PageSource};
use crate::error::{FetchError, PageError, Result};
use crate::fetcher::TrackedFetcher;
use crate::models::{EntityFetch, ExternalId, Provider};
use crate::store::CacheReader;

pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    fn entity_request(&self, id: &ExternalId) -> std::result::Result<FetchRequest, FetchError>;

    /// Interpret a 2xx response; payload problems are [`FetchError::Decode`]
    fn decode_entity(
        &self,
        id: &ExternalId,
        response: &FetchedResponse,
    ) -> std::result::Result<EntityFetch, FetchError>;
}

/// Name of the persisted cursor stream for a provider
pub fn stream_name(provider: Provider) -> &'static str {
    match provider {
        Provider::Wikidata => "wikidata.qid",
        Provider::Iucn => "iucn.wikidata_row",
        Provider::Wikipedia => "wikipedia.wikidata_row",
    }
}

pub fn adapter_for(provider: Provider, config: &IngestConfig) -> Result<Box<dyn ProviderAdapter>> {
    let provider_config = config.provider(provider);
    let adapter: Box<dyn ProviderAdapter> = match provider {
        Provider::Wikidata => Box::new(wikidata::WikidataAdapter::new(provider_config)),
        Provider::Iucn => Box::new(iucn::IucnAdapter::new(provider_config)?),
        Provider::Wikipedia => Box::new(wikipedia::WikipediaAdapter::new(provider_config)),
    };
    Ok(adapter)
}

pub async fn source_for(
    provider: Provider,
    config: &IngestConfig,
    fetcher: &TrackedFetcher,
) -> Result<Box<dyn PageSource>> {
    let source: Box<dyn PageSource> = match provider {
        Provider::Wikidata => Box::new(wikidata::WikidataTaxonSource::new(
            config.provider(provider),
            fetcher.clone(),
        )?),
        Provider::Iucn => {
            let reader = CacheReader::open(&config.database_path(Provider::Wikidata)).await?;
            Box::new(WikidataDerivedSource::new(reader, "iucn", wikidata::iucn_taxon_id))
        },
        Provider::Wikipedia => {
            let reader = CacheReader::open(&config.database_path(Provider::Wikidata)).await?;
            Box::new(WikidataDerivedSource::new(reader, "enwiki", wikidata::enwiki_title))
        },
    };
    Ok(source)
}

type Extractor = fn(&serde_json::Value) -> Option<String>;

/// Candidates read from cached wikidata entities, positioned by cache row id
pub struct WikidataDerivedSource {
    reader: CacheReader,
    label: &'static str,
    extract: Extractor,
}

impl WikidataDerivedSource {
    pub fn new(reader: CacheReader, label: &'static str, extract: Extractor) -> Self {
        Self {
            reader,
            label,
            extract,
        }
    }
}

#[async_trait]
impl PageSource for WikidataDerivedSource {
    async fn fetch_page(
        &self,
        after: i64,
        limit: usize,
        cancel: &CancellationToken,
    ) -> std::result::Result<CandidatePage, PageError> {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled.into());
        }

        let rows = self.reader.scan_rows(after, limit).await?;
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        for row in &rows {
            let payload: serde_json::Value = match serde_json::from_str(&row.payload) {
                Ok(value) => value,
                Err(e) => {
                    warn!(
                        row_id = row.id,
                        external_id = %row.external_id,
                        error = %e,
                        "Unreadable wikidata payload, skipping"
                    );
                    continue;
                },
            };
            if let Some(id) = (self.extract)(&payload) {
                if seen.insert(id.clone()) {
                    candidates.push(Candidate {
                        position: row.id,
                        external_id: ExternalId::new(id),
                    });
                }
            }
        }

        debug!(
            source = self.label,
            scanned = rows.len(),
            candidates = candidates.len(),
            "Scanned wikidata cache rows"
        );

        Ok(CandidatePage {
            candidates,
            scanned: rows.len(),
            last_position: rows.last().map(|row| row.id),
        })
    }
}

/// Required string at a JSON pointer
pub(crate) fn required_str<'a>(
    value: &'a serde_json::Value,
    pointer: &str,
    target: &ExternalId,
) -> std::result::Result<&'a str, FetchError> {
    value
        .pointer(pointer)
        .and_then(serde_json::Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| FetchError::decode(target.as_str(), format!("missing field {}", pointer)))
}
