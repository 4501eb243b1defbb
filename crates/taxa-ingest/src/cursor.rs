//! Cursor & batch controller
//!
//! Drives resumable enumeration of one named candidate stream:
//!
//! ```text
//! Idle -> Fetching(batch) -> Committing -> Idle
//!                                       -> Exhausted (short page or limit reached)
//! ```
//!
//! The persisted position only moves after the sink reports the batch fully
//! committed, so a crash anywhere in between is resumed by re-requesting from
//! the last persisted position. Timeout-class page failures halve the batch
//! size (down to a floor) and retry the same position after a cool-down;
//! every committed page ramps the size back toward the configured value.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProviderConfig;
use crate::error::{FetchError, IngestError, PageError, Result};
use crate::models::{now_millis, ExternalId};
use crate::store::CacheStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorPhase {
    #[default]
    Idle,
    Fetching,
    Committing,
    /// The source ran dry or the run limit was reached
    Exhausted,
    /// Stopped by the cancellation token; nothing past the last commit persisted
    Cancelled,
}

impl CursorPhase {
    pub fn as_str(&self) -> &str {
        match self {
            CursorPhase::Idle => "idle",
            CursorPhase::Fetching => "fetching",
            CursorPhase::Committing => "committing",
            CursorPhase::Exhausted => "exhausted",
            CursorPhase::Cancelled => "cancelled",
        }
    }
}

/// Persisted positions of named streams (maps to cursor_state table)
#[derive(Debug, Clone)]
pub struct CursorStore {
    store: CacheStore,
}

impl CursorStore {
    pub fn new(store: &CacheStore) -> Self {
        Self {
            store: store.clone(),
        }
    }

    pub async fn get(&self, name: &str) -> Result<Option<i64>> {
        let position: Option<i64> =
            sqlx::query_scalar("SELECT position FROM cursor_state WHERE name = ?1")
                .bind(name)
                .fetch_optional(self.store.pool())
                .await?;
        Ok(position)
    }

    pub async fn set(&self, name: &str, position: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cursor_state (name, position, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(name) DO UPDATE SET
                position = excluded.position,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(name)
        .bind(position)
        .bind(now_millis())
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    pub async fn reset(&self, name: &str) -> Result<()> {
        self.set(name, 0).await
    }

    /// Starting position: override, then reset, then persisted, then zero.
    ///
    /// An override or reset is written through immediately.
    pub async fn resolve_start(
        &self,
        name: &str,
        resume_from: Option<i64>,
        reset: bool,
    ) -> Result<i64> {
        if let Some(position) = resume_from {
            self.set(name, position).await?;
            info!(stream = name, position, "Cursor overridden");
            return Ok(position);
        }
        if reset {
            self.reset(name).await?;
            info!(stream = name, "Cursor reset");
            return Ok(0);
        }
        Ok(self.get(name).await?.unwrap_or(0))
    }
}

/// Adaptive batch size bounded by `[min, configured]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSizer {
    configured: usize,
    min: usize,
    ramp_step: usize,
    current: usize,
}

impl BatchSizer {
    pub fn new(configured: usize, min: usize, ramp_step: usize) -> Self {
        let configured = configured.max(1);
        Self {
            configured,
            min: min.clamp(1, configured),
            ramp_step: ramp_step.max(1),
            current: configured,
        }
    }

    pub fn from_config(config: &ProviderConfig) -> Self {
        Self::new(config.batch_size, config.min_batch_size, config.batch_ramp_step)
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn configured(&self) -> usize {
        self.configured
    }

    /// Halve toward the floor; false when already at the floor
    pub fn shrink(&mut self) -> bool {
        if self.current <= self.min {
            return false;
        }
        self.current = (self.current / 2).max(self.min);
        true
    }

    pub fn ramp_up(&mut self) {
        self.current = self.current.saturating_add(self.ramp_step).min(self.configured);
    }
}

/// One enumerated id and its position in the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub position: i64,
    pub external_id: ExternalId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidatePage {
    pub candidates: Vec<Candidate>,
    /// Source rows examined; fewer than requested means the stream is dry
    pub scanned: usize,
    /// Position of the last examined row
    pub last_position: Option<i64>,
}

#[async_trait]
pub trait PageSource: Send + Sync {
    /// Up to `limit` rows strictly after `after`, in increasing position order
    async fn fetch_page(
        &self,
        after: i64,
        limit: usize,
        cancel: &CancellationToken,
    ) -> std::result::Result<CandidatePage, PageError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    Committed,
    /// Cancellation cut the batch short
    Interrupted,
}

#[async_trait]
pub trait PageSink: Send {
    async fn commit(&mut self, page: &CandidatePage, cancel: &CancellationToken) -> Result<CommitStatus>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorRun {
    pub phase: CursorPhase,
    pub position: i64,
    pub pages: u64,
    pub candidates: u64,
}

pub struct CursorDriver {
    name: String,
    cursors: CursorStore,
    sizer: BatchSizer,
    cooldown: Duration,
}

impl CursorDriver {
    pub fn new(name: impl Into<String>, cursors: CursorStore, sizer: BatchSizer, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            cursors,
            sizer,
            cooldown,
        }
    }

    pub fn sizer(&self) -> &BatchSizer {
        &self.sizer
    }

    /// Enumerate from `start` until exhaustion, `limit` candidates, or cancellation
    pub async fn run(
        &mut self,
        start: i64,
        limit: Option<u64>,
        source: &dyn PageSource,
        sink: &mut dyn PageSink,
        cancel: &CancellationToken,
    ) -> Result<CursorRun> {
        let mut run = CursorRun {
            phase: CursorPhase::Idle,
            position: start,
            pages: 0,
            candidates: 0,
        };
        let mut remaining = limit;

        loop {
            if remaining == Some(0) {
                run.phase = CursorPhase::Exhausted;
                break;
            }
            if cancel.is_cancelled() {
                run.phase = CursorPhase::Cancelled;
                break;
            }

            let requested = self.sizer.current();
            run.phase = CursorPhase::Fetching;
            debug!(stream = %self.name, after = run.position, batch_size = requested, "Fetching page");

            let mut page = match source.fetch_page(run.position, requested, cancel).await {
                Ok(page) => page,
                Err(PageError::Fetch(FetchError::Cancelled)) => {
                    run.phase = CursorPhase::Cancelled;
                    break;
                },
                Err(PageError::Fetch(e)) if e.is_timeout_class() => {
                    if !self.sizer.shrink() {
                        return Err(self.enumeration_error(e));
                    }
                    warn!(
                        stream = %self.name,
                        after = run.position,
                        failed_size = requested,
                        next_size = self.sizer.current(),
                        cooldown_ms = self.cooldown.as_millis() as u64,
                        error = %e,
                        "Timeout-class failure, shrinking batch"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            run.phase = CursorPhase::Cancelled;
                            break;
                        },
                        _ = tokio::time::sleep(self.cooldown) => {},
                    }
                    continue;
                },
                Err(PageError::Fetch(e)) => return Err(self.enumeration_error(e)),
                Err(PageError::Store(e)) => return Err(e),
            };

            let exhausted = page.scanned < requested;
            let limit_hit = truncate_to_limit(&mut page, remaining);

            if let Some(last) = page.last_position {
                if last <= run.position {
                    return Err(IngestError::corrupt(format!(
                        "stream '{}' returned position {} which does not advance past {}",
                        self.name, last, run.position
                    )));
                }
            }

            run.phase = CursorPhase::Committing;
            if sink.commit(&page, cancel).await? == CommitStatus::Interrupted {
                run.phase = CursorPhase::Cancelled;
                break;
            }

            if let Some(last) = page.last_position {
                self.cursors.set(&self.name, last).await?;
                run.position = last;
            }

            let committed = page.candidates.len() as u64;
            run.pages += 1;
            run.candidates += committed;
            if let Some(r) = remaining.as_mut() {
                *r = r.saturating_sub(committed);
            }
            self.sizer.ramp_up();

            debug!(
                stream = %self.name,
                position = run.position,
                candidates = committed,
                next_batch_size = self.sizer.current(),
                "Page committed"
            );

            if exhausted || limit_hit {
                run.phase = CursorPhase::Exhausted;
                break;
            }
            run.phase = CursorPhase::Idle;
        }

        info!(
            stream = %self.name,
            phase = run.phase.as_str(),
            position = run.position,
            pages = run.pages,
            candidates = run.candidates,
            "Cursor stream stopped"
        );
        Ok(run)
    }

    fn enumeration_error(&self, source: FetchError) -> IngestError {
        IngestError::Enumeration {
            stream: self.name.clone(),
            source,
        }
    }
}

/// Drop candidates past the run limit; the cursor then stops at the last kept one
fn truncate_to_limit(page: &mut CandidatePage, remaining: Option<u64>) -> bool {
    let Some(remaining) = remaining else {
        return false;
    };
    let keep = usize::try_from(remaining).unwrap_or(usize::MAX);
    if page.candidates.len() < keep {
        return false;
    }
    page.candidates.truncate(keep);
    if let Some(last) = page.candidates.last() {
        page.last_position = Some(last.position);
    }
    true
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_sizer_halves_to_floor_and_ramps() {
        let mut sizer = BatchSizer::new(500, 50, 50);
        assert!(sizer.shrink());
        assert_eq!(sizer.current(), 250);
        assert!(sizer.shrink());
        assert_eq!(sizer.current(), 125);
        assert!(sizer.shrink());
        assert_eq!(sizer.current(), 62);
        assert!(sizer.shrink());
        assert_eq!(sizer.current(), 50);
        assert!(!sizer.shrink());

        for _ in 0..20 {
            sizer.ramp_up();
        }
        assert_eq!(sizer.current(), 500);
    }

    #[test]
    fn test_truncate_to_limit_moves_last_position() {
        let mut page = CandidatePage {
            candidates: (1..=5)
                .map(|i| Candidate {
                    position: i * 10,
                    external_id: ExternalId::new(format!("Q{}", i)),
                })
                .collect(),
            scanned: 5,
            last_position: Some(55),
        };
        assert!(!truncate_to_limit(&mut page.clone(), None));
        assert!(!truncate_to_limit(&mut page.clone(), Some(6)));

        assert!(truncate_to_limit(&mut page, Some(2)));
        assert_eq!(page.candidates.len(), 2);
        assert_eq!(page.last_position, Some(20));
    }

    #[tokio::test]
    async fn test_resolve_start_precedence() {
        let store = CacheStore::in_memory().await.unwrap();
        let cursors = CursorStore::new(&store);

        assert_eq!(cursors.resolve_start("s", None, false).await.unwrap(), 0);
        cursors.set("s", 40).await.unwrap();
        assert_eq!(cursors.resolve_start("s", None, false).await.unwrap(), 40);
        assert_eq!(cursors.resolve_start("s", Some(7), true).await.unwrap(), 7);
        assert_eq!(cursors.get("s").await.unwrap(), Some(7));
        assert_eq!(cursors.resolve_start("s", None, true).await.unwrap(), 0);
        assert_eq!(cursors.get("s").await.unwrap(), Some(0));
    }

    proptest! {
        #[test]
        fn prop_sizer_stays_within_bounds(
            configured in 1usize..5_000,
            min in 1usize..500,
            step in 1usize..500,
            ops in proptest::collection::vec(any::<bool>(), 0..64),
        ) {
            let mut sizer = BatchSizer::new(configured, min, step);
            let floor = min.min(configured);
            for shrink in ops {
                if shrink {
                    sizer.shrink();
                } else {
                    sizer.ramp_up();
                }
                prop_assert!(sizer.current() >= floor);
                prop_assert!(sizer.current() <= configured);
            }
        }
    }
}
