//! Fetches with import-run provenance
//!
//! Wraps [`RetryClient::send`] so every request that reaches the network is
//! bracketed by an import run: opened before the request, completed with the
//! final status afterwards, or deleted if the fetch was cancelled.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::{FetchRequest, FetchedResponse, RetryClient};
use crate::error::{FetchError, Result};
use crate::store::CacheStore;

/// Entity-level result of a tracked fetch
#[derive(Debug)]
pub struct Tracked {
    /// None when no run was kept (bad request or cancelled)
    pub import_run_id: Option<i64>,
    pub result: std::result::Result<FetchedResponse, FetchError>,
}

#[derive(Clone)]
pub struct TrackedFetcher {
    client: Arc<RetryClient>,
    store: CacheStore,
}

impl TrackedFetcher {
    pub fn new(client: Arc<RetryClient>, store: CacheStore) -> Self {
        Self { client, store }
    }

    /// The outer error is a store failure and ends the run
    pub async fn fetch(&self, request: &FetchRequest, cancel: &CancellationToken) -> Result<Tracked> {
        let target = match request.resolved_url() {
            Ok(url) => url.to_string(),
            Err(e) => {
                return Ok(Tracked {
                    import_run_id: None,
                    result: Err(e),
                })
            },
        };

        let import_run_id = self.store.begin_import(&target).await?;
        let started = Instant::now();
        let result = self.client.send(request, cancel).await;
        let duration = started.elapsed();

        match &result {
            Ok(response) => {
                self.store
                    .complete_import_success(
                        import_run_id,
                        response.status,
                        response.payload_bytes(),
                        duration,
                    )
                    .await?;
            },
            Err(FetchError::Cancelled) => {
                self.store.abandon_import(import_run_id).await?;
                debug!(target = %target, "Fetch cancelled, import run discarded");
                return Ok(Tracked {
                    import_run_id: None,
                    result,
                });
            },
            Err(e) => {
                self.store
                    .complete_import_failure(import_run_id, &e.to_string(), e.http_status(), duration)
                    .await?;
            },
        }

        Ok(Tracked {
            import_run_id: Some(import_run_id),
            result,
        })
    }
}
