//! Domain types shared by the ingestion pipeline

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::cursor::CursorPhase;
use crate::error::FetchError;

/// Current wall-clock time as unix epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// External data provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Wikidata,
    Iucn,
    Wikipedia,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Wikidata, Provider::Iucn, Provider::Wikipedia];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Wikidata => "wikidata",
            Provider::Iucn => "iucn",
            Provider::Wikipedia => "wikipedia",
        }
    }

    /// Upper-case key used in environment variable names
    pub fn env_key(&self) -> &'static str {
        match self {
            Provider::Wikidata => "WIKIDATA",
            Provider::Iucn => "IUCN",
            Provider::Wikipedia => "WIKIPEDIA",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "wikidata" => Ok(Provider::Wikidata),
            "iucn" => Ok(Provider::Iucn),
            "wikipedia" | "enwiki" => Ok(Provider::Wikipedia),
            other => Err(format!("Unknown provider: {}", other)),
        }
    }
}

/// Provider-scoped stable identifier (numeric id, QID, or page title)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalId(String);

impl ExternalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExternalId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ExternalId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// One hop of a redirect chain; position is the index within the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectHop {
    pub from: String,
    pub to: String,
}

impl RedirectHop {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Check that hops are contiguous, acyclic, and end at `terminal` when given
pub fn validate_redirect_chain(hops: &[RedirectHop], terminal: Option<&str>) -> Result<(), String> {
    let Some(first) = hops.first() else {
        return Ok(());
    };

    let mut seen = std::collections::HashSet::new();
    seen.insert(first.from.as_str());

    let mut previous_to: Option<&str> = None;
    for (position, hop) in hops.iter().enumerate() {
        if hop.from.is_empty() || hop.to.is_empty() {
            return Err(format!("hop {} has an empty endpoint", position));
        }
        if let Some(prev) = previous_to {
            if prev != hop.from {
                return Err(format!(
                    "hop {} starts at '{}' but the previous hop ended at '{}'",
                    position, hop.from, prev
                ));
            }
        }
        if !seen.insert(hop.to.as_str()) {
            return Err(format!("cycle through '{}'", hop.to));
        }
        previous_to = Some(hop.to.as_str());
    }

    match (terminal, previous_to) {
        (Some(expected), Some(last)) if expected != last => Err(format!(
            "chain ends at '{}' instead of canonical '{}'",
            last, expected
        )),
        _ => Ok(()),
    }
}

/// Provider-specific fields derived from a payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityFields {
    pub canonical_id: Option<String>,
    pub canonical_name: Option<String>,
    pub parent_id: Option<String>,
    pub rank: Option<String>,
    /// The fetched item is itself an alias stub
    pub is_redirect: bool,
}

/// A decoded entity ready to be cached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedEntity {
    /// Raw body exactly as the provider returned it
    pub payload: String,
    pub fields: EntityFields,
    pub redirects: Vec<RedirectHop>,
}

/// Result of asking a provider for one entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityFetch {
    Found(FetchedEntity),
    /// The provider answered definitively that the entity does not exist
    Missing { reason: String },
}

/// What happened to one candidate during a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityOutcome {
    Added,
    Updated,
    /// Re-fetched with an identical content hash
    Unchanged,
    Missing,
    /// Cached recently enough that no fetch was made
    Skipped,
    Failed { error: FetchError },
}

impl EntityOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            EntityOutcome::Added => "added",
            EntityOutcome::Updated => "updated",
            EntityOutcome::Unchanged => "unchanged",
            EntityOutcome::Missing => "missing",
            EntityOutcome::Skipped => "skipped",
            EntityOutcome::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Full,
    /// Only re-attempt ledger entries whose retry time has come
    FailedOnly,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Full => "full",
            RunMode::FailedOnly => "failed_only",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub mode: RunMode,
    /// Maximum number of candidates to process
    pub limit: Option<u64>,
    /// Bypass the staleness check
    pub force: bool,
    /// Explicit cursor start, takes precedence over everything else
    pub resume_from: Option<i64>,
    /// Start the cursor stream from zero
    pub reset_cursor: bool,
}

impl RunOptions {
    pub fn full() -> Self {
        Self::default()
    }

    pub fn failed_only() -> Self {
        Self {
            mode: RunMode::FailedOnly,
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_resume_from(mut self, position: i64) -> Self {
        self.resume_from = Some(position);
        self
    }

    pub fn with_reset_cursor(mut self, reset: bool) -> Self {
        self.reset_cursor = reset;
        self
    }
}

/// Informational counts for one ingestion run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub processed: u64,
    pub added: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub missing: u64,
    pub skipped: u64,
    pub errors: u64,
    /// Persisted cursor position at the end of the run (full mode only)
    pub cursor: Option<i64>,
    pub finished: CursorPhase,
}

impl RunSummary {
    pub fn record(&mut self, outcome: &EntityOutcome) {
        self.processed += 1;
        match outcome {
            EntityOutcome::Added => self.added += 1,
            EntityOutcome::Updated => self.updated += 1,
            EntityOutcome::Unchanged => self.unchanged += 1,
            EntityOutcome::Missing => self.missing += 1,
            EntityOutcome::Skipped => self.skipped += 1,
            EntityOutcome::Failed { .. } => self.errors += 1,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_round_trip() {
        for provider in Provider::ALL {
            assert_eq!(provider.as_str().parse::<Provider>().unwrap(), provider);
        }
        assert_eq!(" WikiPedia ".parse::<Provider>().unwrap(), Provider::Wikipedia);
        assert!("gbif".parse::<Provider>().is_err());
    }

    #[test]
    fn test_summary_counts_each_outcome_once() {
        let mut summary = RunSummary::default();
        summary.record(&EntityOutcome::Added);
        summary.record(&EntityOutcome::Unchanged);
        summary.record(&EntityOutcome::Skipped);
        summary.record(&EntityOutcome::Failed {
            error: FetchError::decode("Q1", "bad"),
        });

        assert_eq!(summary.processed, 4);
        assert_eq!(summary.added, 1);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.updated, 0);
    }

    #[test]
    fn test_redirect_chain_validation() {
        let chain = vec![
            RedirectHop::new("panthera leo", "Panthera leo"),
            RedirectHop::new("Panthera leo", "Lion"),
        ];
        assert!(validate_redirect_chain(&chain, Some("Lion")).is_ok());
        assert!(validate_redirect_chain(&chain, Some("Tiger")).is_err());
        assert!(validate_redirect_chain(&[], Some("Lion")).is_ok());

        let gap = vec![RedirectHop::new("a", "b"), RedirectHop::new("c", "d")];
        assert!(validate_redirect_chain(&gap, None).is_err());

        let cycle = vec![RedirectHop::new("a", "b"), RedirectHop::new("b", "a")];
        assert!(validate_redirect_chain(&cycle, None).unwrap_err().contains("cycle"));
    }

    #[test]
    fn test_external_id_serializes_transparently() {
        let id = ExternalId::new("Q140");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"Q140\"");
    }
}
