//! Error types for taxa ingestion
//!
//! Two layers:
//!
//! - [`FetchError`] is entity-level. It is produced by the retry client and the
//!   provider decoders, lands in the failure ledger, and never aborts a batch.
//! - [`IngestError`] is run-level. Store, cursor, and configuration faults end
//!   the run because continuing could silently skip unprocessed ids.

use thiserror::Error;

/// Result type alias for run-level operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// HTTP statuses the retry client backs off and retries on
pub const RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Statuses that indicate the backend gave up on an oversized request
const TIMEOUT_CLASS_STATUSES: [u16; 4] = [408, 502, 503, 504];

/// Query services that report a query timeout as HTTP 500 name it in the body
const QUERY_TIMEOUT_MARKER: &str = "TimeoutException";

/// Maximum number of response body bytes kept on an error
const MAX_ERROR_BODY: usize = 2048;

/// Terminal failure of one logical request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub url: String,
    /// None when no HTTP response was ever received
    pub status: Option<u16>,
    pub body: Option<String>,
    pub attempts: u32,
    /// The last transport failure was a timeout
    pub timed_out: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// Network or timeout failure, retried until the attempt ceiling
    Transport,
    /// 429/408/5xx, retried with backoff until the attempt ceiling
    Retryable,
    /// Any other non-2xx status, never retried
    Permanent,
}

impl ApiError {
    pub fn transport(url: impl Into<String>, attempts: u32, timed_out: bool) -> Self {
        Self {
            url: url.into(),
            status: None,
            body: None,
            attempts,
            timed_out,
        }
    }

    pub fn status(url: impl Into<String>, status: u16, body: Option<String>, attempts: u32) -> Self {
        Self {
            url: url.into(),
            status: Some(status),
            body: body.map(truncate_body),
            attempts,
            timed_out: false,
        }
    }

    pub fn kind(&self) -> ApiErrorKind {
        match self.status {
            None => ApiErrorKind::Transport,
            Some(status) if RETRYABLE_STATUSES.contains(&status) => ApiErrorKind::Retryable,
            Some(_) => ApiErrorKind::Permanent,
        }
    }

    /// Failures that shrinking the unit of work can plausibly cure
    pub fn is_timeout_class(&self) -> bool {
        match self.status {
            None => self.timed_out,
            Some(500) => self
                .body
                .as_deref()
                .is_some_and(|body| body.contains(QUERY_TIMEOUT_MARKER)),
            Some(status) => TIMEOUT_CLASS_STATUSES.contains(&status),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(
                f,
                "HTTP {} from {} after {} attempt(s)",
                status, self.url, self.attempts
            )?,
            None if self.timed_out => write!(
                f,
                "Request to {} timed out after {} attempt(s)",
                self.url, self.attempts
            )?,
            None => write!(
                f,
                "Transport failure for {} after {} attempt(s)",
                self.url, self.attempts
            )?,
        }
        if let Some(body) = self.body.as_deref().filter(|b| !b.is_empty()) {
            write!(f, ": {}", body)?;
        }
        Ok(())
    }
}

impl std::error::Error for ApiError {}

fn truncate_body(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

/// Entity-level failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The payload arrived but could not be interpreted; permanent for that entity
    #[error("Could not decode response for '{target}': {message}")]
    Decode { target: String, message: String },

    /// The request itself could not be built (bad URL or id)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Cooperative cancellation; never recorded as a failure
    #[error("Fetch cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn decode(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            FetchError::Api(api) => api.status,
            _ => None,
        }
    }

    pub fn is_timeout_class(&self) -> bool {
        matches!(self, FetchError::Api(api) if api.is_timeout_class())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Cancelled)
    }
}

/// Run-level failure
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Import run {0} does not exist")]
    ImportRunNotFound(i64),

    #[error("Import run {0} was already completed")]
    ImportRunCompleted(i64),

    #[error("Invalid redirect chain for entity row {entity_id}: {reason}")]
    InvalidRedirectChain { entity_id: i64, reason: String },

    #[error("Corrupt cache data: {0}")]
    Corrupt(String),

    /// A candidate page could not be fetched even after batch shrinking
    #[error("Candidate enumeration failed for stream '{stream}': {source}")]
    Enumeration {
        stream: String,
        #[source]
        source: FetchError,
    },

    #[error("HTTP client setup failed: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error(transparent)]
    Common(#[from] taxa_common::CommonError),
}

/// Failure to produce one page of candidates
#[derive(Error, Debug)]
pub enum PageError {
    /// Network-backed enumeration failed; timeout-class failures shrink the batch
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Store(#[from] IngestError),
}

impl IngestError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }
}
