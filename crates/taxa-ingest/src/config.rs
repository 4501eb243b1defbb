//! Ingestion configuration
//!
//! One [`IngestConfig`] is built at process start (usually from the
//! environment) and passed by reference to everything that needs it.
//!
//! Shared variables:
//! - `TAXA_DATA_DIR`, `TAXA_USER_AGENT`
//! - `TAXA_REFRESH_AFTER_DAYS`
//! - `TAXA_FAILURE_RETRY_DELAY_SECS`, `TAXA_FAILURE_MAX_RETRY_DELAY_SECS`
//! - `TAXA_MAX_FAILURE_ATTEMPTS`
//!
//! Per provider, with `{P}` one of `WIKIDATA`, `IUCN`, `WIKIPEDIA`:
//! - `TAXA_{P}_BASE_URL`, `TAXA_{P}_QUERY_URL`, `TAXA_{P}_AUTH_TOKEN`
//! - `TAXA_{P}_TIMEOUT_SECS`, `TAXA_{P}_MAX_CONCURRENCY`
//! - `TAXA_{P}_INITIAL_BACKOFF_SECS`, `TAXA_{P}_MAX_BACKOFF_SECS`
//! - `TAXA_{P}_BATCH_SIZE`, `TAXA_{P}_MIN_BATCH_SIZE`,
//!   `TAXA_{P}_BATCH_RAMP_STEP`, `TAXA_{P}_BATCH_COOLDOWN_SECS`

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{IngestError, Result};
use crate::models::Provider;

pub const DEFAULT_DATA_DIR: &str = "./data";
pub const DEFAULT_USER_AGENT: &str = concat!("taxa-ingest/", env!("CARGO_PKG_VERSION"));
pub const DEFAULT_REFRESH_AFTER_DAYS: u64 = 30;
pub const DEFAULT_FAILURE_RETRY_DELAY_SECS: u64 = 300;
pub const DEFAULT_FAILURE_MAX_RETRY_DELAY_SECS: u64 = 86_400;

pub const DEFAULT_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_MAX_CONCURRENCY: usize = 2;
pub const MAX_CONCURRENCY_LIMIT: usize = 4;
pub const DEFAULT_INITIAL_BACKOFF_SECS: u64 = 2;
pub const DEFAULT_MAX_BACKOFF_SECS: u64 = 60;
pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const DEFAULT_MIN_BATCH_SIZE: usize = 50;
pub const DEFAULT_BATCH_RAMP_STEP: usize = 50;
pub const DEFAULT_BATCH_COOLDOWN_SECS: u64 = 5;

const SECS_PER_DAY: u64 = 86_400;

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Settings for one provider's HTTP client and cursor stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider: Provider,
    /// Entity endpoint root
    pub base_url: String,
    /// Candidate query endpoint, if the provider enumerates remotely
    pub query_url: Option<String>,
    pub auth_token: Option<String>,
    /// Per-attempt request timeout
    pub timeout: Duration,
    pub max_concurrency: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub batch_size: usize,
    pub min_batch_size: usize,
    pub batch_ramp_step: usize,
    pub batch_cooldown: Duration,
}

impl ProviderConfig {
    /// Built-in defaults for a provider
    pub fn for_provider(provider: Provider) -> Self {
        let (base_url, query_url) = match provider {
            Provider::Wikidata => (
                "https://www.wikidata.org",
                Some("https://query.wikidata.org/sparql"),
            ),
            Provider::Iucn => ("https://api.iucnredlist.org/api/v4", None),
            Provider::Wikipedia => ("https://en.wikipedia.org/w/api.php", None),
        };

        Self {
            provider,
            base_url: base_url.to_string(),
            query_url: query_url.map(str::to_string),
            auth_token: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            initial_backoff: Duration::from_secs(DEFAULT_INITIAL_BACKOFF_SECS),
            max_backoff: Duration::from_secs(DEFAULT_MAX_BACKOFF_SECS),
            batch_size: DEFAULT_BATCH_SIZE,
            min_batch_size: DEFAULT_MIN_BATCH_SIZE,
            batch_ramp_step: DEFAULT_BATCH_RAMP_STEP,
            batch_cooldown: Duration::from_secs(DEFAULT_BATCH_COOLDOWN_SECS),
        }
    }

    /// Overlay `TAXA_{P}_*` variables on the defaults
    pub fn from_env(provider: Provider) -> Self {
        let key = |suffix: &str| format!("TAXA_{}_{}", provider.env_key(), suffix);
        let defaults = Self::for_provider(provider);
        let secs = |suffix: &str, default: Duration| {
            env_parse::<u64>(&key(suffix))
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        Self {
            provider,
            base_url: env_string(&key("BASE_URL")).unwrap_or(defaults.base_url),
            query_url: env_string(&key("QUERY_URL")).or(defaults.query_url),
            auth_token: env_string(&key("AUTH_TOKEN")),
            timeout: secs("TIMEOUT_SECS", defaults.timeout),
            max_concurrency: env_parse::<usize>(&key("MAX_CONCURRENCY"))
                .unwrap_or(defaults.max_concurrency)
                .clamp(1, MAX_CONCURRENCY_LIMIT),
            initial_backoff: secs("INITIAL_BACKOFF_SECS", defaults.initial_backoff),
            max_backoff: secs("MAX_BACKOFF_SECS", defaults.max_backoff),
            batch_size: env_parse(&key("BATCH_SIZE")).unwrap_or(defaults.batch_size),
            min_batch_size: env_parse(&key("MIN_BATCH_SIZE")).unwrap_or(defaults.min_batch_size),
            batch_ramp_step: env_parse(&key("BATCH_RAMP_STEP")).unwrap_or(defaults.batch_ramp_step),
            batch_cooldown: secs("BATCH_COOLDOWN_SECS", defaults.batch_cooldown),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_query_url(mut self, url: impl Into<String>) -> Self {
        self.query_url = Some(url.into());
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.clamp(1, MAX_CONCURRENCY_LIMIT);
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_batch_tuning(mut self, min: usize, ramp_step: usize, cooldown: Duration) -> Self {
        self.min_batch_size = min;
        self.batch_ramp_step = ramp_step;
        self.batch_cooldown = cooldown;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let name = self.provider.env_key();
        if self.base_url.trim().is_empty() {
            return Err(IngestError::config(format!("TAXA_{}_BASE_URL cannot be empty", name)));
        }
        url::Url::parse(&self.base_url).map_err(|e| {
            IngestError::config(format!("TAXA_{}_BASE_URL is not a valid URL: {}", name, e))
        })?;
        if let Some(query_url) = &self.query_url {
            url::Url::parse(query_url).map_err(|e| {
                IngestError::config(format!("TAXA_{}_QUERY_URL is not a valid URL: {}", name, e))
            })?;
        }
        if self.timeout.is_zero() {
            return Err(IngestError::config(format!(
                "TAXA_{}_TIMEOUT_SECS must be greater than 0",
                name
            )));
        }
        if !(1..=MAX_CONCURRENCY_LIMIT).contains(&self.max_concurrency) {
            return Err(IngestError::config(format!(
                "TAXA_{}_MAX_CONCURRENCY must be between 1 and {}",
                name, MAX_CONCURRENCY_LIMIT
            )));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(IngestError::config(format!(
                "TAXA_{}_INITIAL_BACKOFF_SECS cannot exceed TAXA_{}_MAX_BACKOFF_SECS",
                name, name
            )));
        }
        if self.min_batch_size == 0 || self.batch_size < self.min_batch_size {
            return Err(IngestError::config(format!(
                "TAXA_{}_BATCH_SIZE ({}) must be at least TAXA_{}_MIN_BATCH_SIZE ({}) and non-zero",
                name, self.batch_size, name, self.min_batch_size
            )));
        }
        if self.batch_ramp_step == 0 {
            return Err(IngestError::config(format!(
                "TAXA_{}_BATCH_RAMP_STEP must be greater than 0",
                name
            )));
        }
        Ok(())
    }
}

/// Process-wide ingestion configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestConfig {
    /// Directory holding one SQLite cache per provider
    pub data_dir: PathBuf,
    pub user_agent: String,
    /// Cached entities younger than this are skipped unless forced
    pub refresh_after: Duration,
    /// Base per-entity retry delay, doubled per recorded attempt
    pub failure_retry_delay: Duration,
    pub failure_max_retry_delay: Duration,
    /// Failed-only runs skip entries that reached this many attempts
    pub max_failure_attempts: Option<u32>,
    pub wikidata: ProviderConfig,
    pub iucn: ProviderConfig,
    pub wikipedia: ProviderConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            refresh_after: Duration::from_secs(DEFAULT_REFRESH_AFTER_DAYS * SECS_PER_DAY),
            failure_retry_delay: Duration::from_secs(DEFAULT_FAILURE_RETRY_DELAY_SECS),
            failure_max_retry_delay: Duration::from_secs(DEFAULT_FAILURE_MAX_RETRY_DELAY_SECS),
            max_failure_attempts: None,
            wikidata: ProviderConfig::for_provider(Provider::Wikidata),
            iucn: ProviderConfig::for_provider(Provider::Iucn),
            wikipedia: ProviderConfig::for_provider(Provider::Wikipedia),
        }
    }
}

impl IngestConfig {
    /// Load configuration from environment variables (after `.env`, if present)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            data_dir: env_string("TAXA_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            user_agent: env_string("TAXA_USER_AGENT")
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            refresh_after: Duration::from_secs(
                env_parse::<u64>("TAXA_REFRESH_AFTER_DAYS").unwrap_or(DEFAULT_REFRESH_AFTER_DAYS)
                    * SECS_PER_DAY,
            ),
            failure_retry_delay: Duration::from_secs(
                env_parse("TAXA_FAILURE_RETRY_DELAY_SECS")
                    .unwrap_or(DEFAULT_FAILURE_RETRY_DELAY_SECS),
            ),
            failure_max_retry_delay: Duration::from_secs(
                env_parse("TAXA_FAILURE_MAX_RETRY_DELAY_SECS")
                    .unwrap_or(DEFAULT_FAILURE_MAX_RETRY_DELAY_SECS),
            ),
            max_failure_attempts: env_parse::<u32>("TAXA_MAX_FAILURE_ATTEMPTS").filter(|n| *n > 0),
            wikidata: ProviderConfig::from_env(Provider::Wikidata),
            iucn: ProviderConfig::from_env(Provider::Iucn),
            wikipedia: ProviderConfig::from_env(Provider::Wikipedia),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(IngestError::config("TAXA_DATA_DIR cannot be empty"));
        }
        if self.user_agent.trim().is_empty() {
            return Err(IngestError::config("TAXA_USER_AGENT cannot be empty"));
        }
        if self.failure_retry_delay > self.failure_max_retry_delay {
            return Err(IngestError::config(
                "TAXA_FAILURE_RETRY_DELAY_SECS cannot exceed TAXA_FAILURE_MAX_RETRY_DELAY_SECS",
            ));
        }
        for provider in Provider::ALL {
            self.provider(provider).validate()?;
        }
        Ok(())
    }

    pub fn provider(&self, provider: Provider) -> &ProviderConfig {
        match provider {
            Provider::Wikidata => &self.wikidata,
            Provider::Iucn => &self.iucn,
            Provider::Wikipedia => &self.wikipedia,
        }
    }

    /// Replace one provider's settings
    pub fn with_provider(mut self, config: ProviderConfig) -> Self {
        match config.provider {
            Provider::Wikidata => self.wikidata = config,
            Provider::Iucn => self.iucn = config,
            Provider::Wikipedia => self.wikipedia = config,
        }
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// SQLite file backing a provider's cache
    pub fn database_path(&self, provider: Provider) -> PathBuf {
        self.data_dir.join(format!("{}.db", provider.as_str()))
    }
}
