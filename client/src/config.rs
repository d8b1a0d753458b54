//! Configuration management for the client.

use std::env;
use std::time::Duration;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// SQLite connection URL used by [`crate::Client::connect`]
    pub database_url: String,
    /// Maximum concurrent remote calls (outbox dispatch and queries)
    pub max_in_flight: usize,
    /// Deadline for a single remote call; expiry is a connectivity failure
    pub remote_timeout: Duration,
    /// First outbox retry delay, doubled per consecutive failure
    pub retry_base_delay: Duration,
    /// Upper bound on the outbox retry delay
    pub retry_max_delay: Duration,
    /// Tick of the background outbox loop
    pub sync_interval: Duration,
    /// Cached query results older than this are treated as misses
    pub max_cache_age: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            max_in_flight: 4,
            remote_timeout: Duration::from_secs(10),
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(60),
            sync_interval: Duration::from_secs(5),
            max_cache_age: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database_url =
            env::var("STASH_DATABASE_URL").unwrap_or_else(|_| defaults.database_url.clone());

        let max_in_flight = match env::var("STASH_MAX_IN_FLIGHT") {
            Ok(raw) => match raw.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => return Err(ConfigError::InvalidMaxInFlight),
            },
            Err(_) => defaults.max_in_flight,
        };

        Ok(Self {
            database_url,
            max_in_flight,
            remote_timeout: millis("STASH_REMOTE_TIMEOUT_MS")?.unwrap_or(defaults.remote_timeout),
            retry_base_delay: millis("STASH_RETRY_BASE_MS")?.unwrap_or(defaults.retry_base_delay),
            retry_max_delay: millis("STASH_RETRY_MAX_MS")?.unwrap_or(defaults.retry_max_delay),
            sync_interval: millis("STASH_SYNC_INTERVAL_MS")?.unwrap_or(defaults.sync_interval),
            max_cache_age: millis("STASH_MAX_CACHE_AGE_MS")?,
        })
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    pub fn with_retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_delay = base;
        self.retry_max_delay = max.max(base);
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_max_cache_age(mut self, age: Duration) -> Self {
        self.max_cache_age = Some(age);
        self
    }

    /// Retry delay after `attempts` consecutive failures.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempts.saturating_sub(1));
        self.retry_base_delay
            .saturating_mul(factor)
            .min(self.retry_max_delay)
    }
}

fn millis(var: &'static str) -> Result<Option<Duration>, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|_| ConfigError::InvalidDuration(var)),
        Err(_) => Ok(None),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("STASH_MAX_IN_FLIGHT must be a positive integer")]
    InvalidMaxInFlight,

    #[error("{0} must be a whole number of milliseconds")]
    InvalidDuration(&'static str),
}
