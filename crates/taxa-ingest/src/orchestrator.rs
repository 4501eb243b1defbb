//! Ingestion orchestrator
//!
//! One [`Ingestor`] drives one provider. A full run walks the provider's
//! candidate stream through the [`CursorDriver`]; a failed-only run replays
//! ledger entries whose retry time has come. In both modes a batch is
//! fetched concurrently (bounded by the retry client's semaphore) and then
//! committed sequentially, one entity at a time, before the next batch starts.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::RetryClient;
use crate::config::{IngestConfig, ProviderConfig};
use crate::cursor::{
    BatchSizer, CandidatePage, CommitStatus, CursorDriver, CursorPhase, CursorStore, PageSink,
    PageSource,
};
use crate::error::{FetchError, IngestError, Result};
use crate::fetcher::TrackedFetcher;
use crate::ledger::{escalating_delay, FailureLedger};
use crate::models::{
    now_millis, EntityFetch, EntityOutcome, ExternalId, Provider, RunMode, RunOptions, RunSummary,
};
use crate::names::{CanonicalNameResolver, NameResolver};
use crate::providers::{adapter_for, source_for, stream_name, ProviderAdapter};
use crate::store::{CacheReader, CacheStats, CacheStore, EntityChange, ImportRun};

/// Result of the concurrent half of processing one candidate
#[derive(Debug)]
enum Attempt {
    /// Cached recently enough; no request was made
    Fresh,
    Fetched {
        import_run_id: Option<i64>,
        result: std::result::Result<EntityFetch, FetchError>,
    },
}

/// Snapshot backing the `status` command
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub provider: Provider,
    pub stream: &'static str,
    pub cursor: Option<i64>,
    pub failures: i64,
    pub eligible_failures: i64,
    pub stats: CacheStats,
    pub recent_runs: Vec<ImportRun>,
}

pub struct Ingestor {
    provider: Provider,
    config: IngestConfig,
    store: CacheStore,
    fetcher: TrackedFetcher,
    adapter: Box<dyn ProviderAdapter>,
    ledger: FailureLedger,
    cursors: CursorStore,
    resolver: Arc<dyn NameResolver>,
}

impl Ingestor {
    /// Open the provider's cache database under the configured data dir
    pub async fn open(provider: Provider, config: &IngestConfig) -> Result<Self> {
        let store = CacheStore::open(&config.database_path(provider)).await?;
        Self::with_store(provider, config, store)
    }

    /// Build on an already opened store
    pub fn with_store(provider: Provider, config: &IngestConfig, store: CacheStore) -> Result<Self> {
        let provider_config = config.provider(provider);
        provider_config.validate()?;

        let client = Arc::new(RetryClient::new(provider_config, &config.user_agent)?);
        let adapter = adapter_for(provider, config)?;

        Ok(Self {
            provider,
            config: config.clone(),
            fetcher: TrackedFetcher::new(client, store.clone()),
            ledger: FailureLedger::new(&store),
            cursors: CursorStore::new(&store),
            store,
            adapter,
            resolver: Arc::new(CanonicalNameResolver),
        })
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn NameResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn ledger(&self) -> &FailureLedger {
        &self.ledger
    }

    pub fn cursors(&self) -> &CursorStore {
        &self.cursors
    }

    fn provider_config(&self) -> &ProviderConfig {
        self.config.provider(self.provider)
    }

    /// Run one ingestion pass.
    ///
    /// Entity-level failures are counted and recorded in the ledger; only
    /// store, cursor, and enumeration failures surface as `Err`.
    pub async fn run(&self, options: &RunOptions, cancel: &CancellationToken) -> Result<RunSummary> {
        match options.mode {
            RunMode::Full => {
                let source = source_for(self.provider, &self.config, &self.fetcher).await?;
                self.run_with_source(options, source.as_ref(), cancel).await
            },
            RunMode::FailedOnly => self.run_failed_only(options, cancel).await,
        }
    }

    /// Full run over an explicit candidate source
    pub async fn run_with_source(
        &self,
        options: &RunOptions,
        source: &dyn PageSource,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        let stream = stream_name(self.provider);
        let start = self
            .cursors
            .resolve_start(stream, options.resume_from, options.reset_cursor)
            .await?;

        info!(
            provider = %self.provider,
            stream,
            start,
            limit = ?options.limit,
            force = options.force,
            "Starting full ingestion run"
        );

        let provider_config = self.provider_config();
        let mut driver = CursorDriver::new(
            stream,
            self.cursors.clone(),
            BatchSizer::from_config(provider_config),
            provider_config.batch_cooldown,
        );
        let mut sink = EntitySink {
            ingestor: self,
            check_staleness: !options.force,
            summary: RunSummary::default(),
        };

        let run = driver
            .run(start, options.limit, source, &mut sink, cancel)
            .await?;

        let mut summary = sink.summary;
        summary.cursor = Some(run.position);
        summary.finished = run.phase;

        self.log_summary(RunMode::Full, &summary);
        Ok(summary)
    }

    async fn run_failed_only(&self, options: &RunOptions, cancel: &CancellationToken) -> Result<RunSummary> {
        let mut records = self.ledger.list_eligible(now_millis()).await?;
        let eligible = records.len();

        if let Some(max) = self.config.max_failure_attempts {
            records.retain(|record| record.attempts < i64::from(max));
        }
        if let Some(limit) = options.limit {
            records.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        }

        info!(
            provider = %self.provider,
            eligible,
            selected = records.len(),
            max_attempts = ?self.config.max_failure_attempts,
            "Starting failed-only ingestion run"
        );

        let ids: Vec<ExternalId> = records.iter().map(|record| record.external_id()).collect();
        let batch_size = self.provider_config().batch_size.max(1);
        let mut summary = RunSummary {
            finished: CursorPhase::Exhausted,
            ..RunSummary::default()
        };

        for chunk in ids.chunks(batch_size) {
            if cancel.is_cancelled() {
                summary.finished = CursorPhase::Cancelled;
                break;
            }
            let status = self
                .process_batch(chunk.to_vec(), false, &mut summary, cancel)
                .await?;
            if status == CommitStatus::Interrupted {
                summary.finished = CursorPhase::Cancelled;
                break;
            }
        }

        self.log_summary(RunMode::FailedOnly, &summary);
        Ok(summary)
    }

    /// Fetch every id concurrently, then commit the outcomes in input order
    async fn process_batch(
        &self,
        ids: Vec<ExternalId>,
        check_staleness: bool,
        summary: &mut RunSummary,
        cancel: &CancellationToken,
    ) -> Result<CommitStatus> {
        let concurrency = self.provider_config().max_concurrency.max(1);

        // Collected before committing: the commit phase needs the store's
        // connections that in-flight fetches would otherwise be holding
        let attempts: Vec<(ExternalId, Result<Attempt>)> = stream::iter(ids)
            .map(|id| async move {
                let attempt = self.attempt(&id, check_staleness, cancel).await;
                (id, attempt)
            })
            .buffered(concurrency)
            .collect()
            .await;

        let mut status = CommitStatus::Committed;
        for (id, attempt) in attempts {
            match self.settle(&id, attempt?).await? {
                Some(outcome) => summary.record(&outcome),
                None => status = CommitStatus::Interrupted,
            }
        }
        Ok(status)
    }

    async fn attempt(
        &self,
        id: &ExternalId,
        check_staleness: bool,
        cancel: &CancellationToken,
    ) -> Result<Attempt> {
        if check_staleness && self.is_fresh(id).await? {
            return Ok(Attempt::Fresh);
        }

        let request = match self.adapter.entity_request(id) {
            Ok(request) => request,
            Err(e) => {
                return Ok(Attempt::Fetched {
                    import_run_id: None,
                    result: Err(e),
                })
            },
        };

        let tracked = self.fetcher.fetch(&request, cancel).await?;
        let result = match tracked.result {
            Ok(response) => self.adapter.decode_entity(id, &response),
            Err(FetchError::Api(e)) if e.is_not_found() => Ok(EntityFetch::Missing {
                reason: e.to_string(),
            }),
            Err(e) => Err(e),
        };

        Ok(Attempt::Fetched {
            import_run_id: tracked.import_run_id,
            result,
        })
    }

    async fn is_fresh(&self, id: &ExternalId) -> Result<bool> {
        let Some(downloaded_at) = self.store.get_downloaded_at(id).await? else {
            return Ok(false);
        };
        let refresh_ms = i64::try_from(self.config.refresh_after.as_millis()).unwrap_or(i64::MAX);
        Ok(now_millis().saturating_sub(downloaded_at) < refresh_ms)
    }

    /// Persist one attempt; `None` means the fetch was cancelled
    async fn settle(&self, id: &ExternalId, attempt: Attempt) -> Result<Option<EntityOutcome>> {
        let (import_run_id, result) = match attempt {
            Attempt::Fresh => {
                debug!(external_id = %id, "Cached copy is fresh, skipping");
                return Ok(Some(EntityOutcome::Skipped));
            },
            Attempt::Fetched {
                import_run_id,
                result,
            } => (import_run_id, result),
        };

        let outcome = match result {
            Ok(EntityFetch::Found(entity)) => {
                let Some(run_id) = import_run_id else {
                    return Err(IngestError::corrupt(format!(
                        "entity {} was fetched without an import run",
                        id
                    )));
                };
                let names = self.resolver.resolve(self.provider, &entity);
                let upsert = self
                    .store
                    .commit_entity(id, run_id, &entity, &names, now_millis())
                    .await?;
                self.ledger.clear_failure(id).await?;

                match upsert.change {
                    EntityChange::Inserted => EntityOutcome::Added,
                    EntityChange::Updated => EntityOutcome::Updated,
                    EntityChange::Unchanged => EntityOutcome::Unchanged,
                }
            },
            Ok(EntityFetch::Missing { reason }) => {
                debug!(external_id = %id, reason = %reason, "Entity does not exist upstream");
                self.ledger.clear_failure(id).await?;
                EntityOutcome::Missing
            },
            Err(FetchError::Cancelled) => return Ok(None),
            Err(error) => {
                if let (Some(run_id), FetchError::Decode { .. }) = (import_run_id, &error) {
                    self.store
                        .annotate_import_error(run_id, &error.to_string())
                        .await?;
                }
                let prior = self
                    .ledger
                    .get(id)
                    .await?
                    .map(|record| u32::try_from(record.attempts).unwrap_or(u32::MAX))
                    .unwrap_or(0);
                let delay = escalating_delay(
                    self.config.failure_retry_delay,
                    self.config.failure_max_retry_delay,
                    prior,
                );
                let record = self
                    .ledger
                    .record_failure(
                        id,
                        &error.to_string(),
                        error.http_status(),
                        Some(delay),
                        import_run_id,
                    )
                    .await?;

                warn!(
                    provider = %self.provider,
                    external_id = %id,
                    attempts = record.attempts,
                    retry_in_secs = delay.as_secs(),
                    error = %error,
                    "Entity fetch failed"
                );
                EntityOutcome::Failed { error }
            },
        };

        debug!(external_id = %id, outcome = outcome.label(), "Entity settled");
        Ok(Some(outcome))
    }

    fn log_summary(&self, mode: RunMode, summary: &RunSummary) {
        info!(
            provider = %self.provider,
            mode = mode.as_str(),
            processed = summary.processed,
            added = summary.added,
            updated = summary.updated,
            unchanged = summary.unchanged,
            missing = summary.missing,
            skipped = summary.skipped,
            errors = summary.errors,
            cursor = ?summary.cursor,
            finished = summary.finished.as_str(),
            "Ingestion run finished"
        );
    }

    /// Aggregate counts read through a separate read-only handle
    pub async fn get_cache_stats(&self) -> Result<CacheStats> {
        let reader = self.store.reader().await?;
        let stats = reader.cache_stats().await;
        reader.close().await;
        stats
    }

    /// Most recent import runs, newest first
    pub async fn get_import_run_summaries(&self, limit: u32) -> Result<Vec<ImportRun>> {
        let reader = self.store.reader().await?;
        let runs = reader.import_run_summaries(limit).await;
        reader.close().await;
        runs
    }
}

/// Status of a provider cache, read without opening the writer
pub async fn provider_status(
    provider: Provider,
    config: &IngestConfig,
    recent_runs: u32,
) -> Result<StatusReport> {
    let reader = CacheReader::open(&config.database_path(provider)).await?;

    let stream = stream_name(provider);
    let report = StatusReport {
        provider,
        stream,
        cursor: reader.cursor(stream).await?,
        failures: reader.failure_count().await?,
        eligible_failures: reader.eligible_failure_count(now_millis()).await?,
        stats: reader.cache_stats().await?,
        recent_runs: reader.import_run_summaries(recent_runs).await?,
    };
    reader.close().await;

    Ok(report)
}

/// Adapts [`Ingestor::process_batch`] to the cursor driver
struct EntitySink<'a> {
    ingestor: &'a Ingestor,
    check_staleness: bool,
    summary: RunSummary,
}

#[async_trait]
impl PageSink for EntitySink<'_> {
    async fn commit(&mut self, page: &CandidatePage, cancel: &CancellationToken) -> Result<CommitStatus> {
        let ids = page
            .candidates
            .iter()
            .map(|candidate| candidate.external_id.clone())
            .collect();
        self.ingestor
            .process_batch(ids, self.check_staleness, &mut self.summary, cancel)
            .await
    }
}
