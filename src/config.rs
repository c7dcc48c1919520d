//! Governor configuration.
//!
//! Every section has working defaults, so an empty YAML document is a valid
//! configuration. Environment knobs override file values:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `GOVERNOR_RATE_CAPACITY` | `rate_limit.capacity` |
//! | `GOVERNOR_REFILL_INTERVAL_MS` | `rate_limit.refill_interval_ms` |
//! | `GOVERNOR_MAX_RETRIES` | `retry.max_retries` |
//! | `GOVERNOR_INITIAL_BACKOFF_MS` | `retry.initial_backoff_ms` |
//! | `GOVERNOR_ENDPOINT` | `transport.endpoint` |
//! | `GOVERNOR_HTTP_TIMEOUT_SECS` | `transport.timeout_secs` |
//! | `GOVERNOR_MAX_CONTEXT_UNITS` | `transport.max_context_units` |

use crate::resilience::rate_limiter::{AdmissionMode, RateLimiterConfig};
use crate::resilience::retry::RetryConfig;
use crate::scheduler::CancellationPolicy;
use crate::transport::ContextBudget;
use crate::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub capacity: u32,
    pub refill_interval_ms: u64,
    pub mode: AdmissionMode,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            capacity: 1,
            refill_interval_ms: 2000,
            mode: AdmissionMode::Wait,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 60_000,
            jitter: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Full URL of the generation endpoint.
    pub endpoint: String,
    /// Used for the keyring entry and the `<PROVIDER>_API_KEY` variable.
    pub provider: String,
    pub timeout_secs: u64,
    pub max_context_units: usize,
    pub chars_per_unit: f64,
    /// Explicit key; when absent the keyring and environment are consulted.
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080/v1/generate".to_string(),
            provider: "generation".to_string(),
            timeout_secs: 120,
            max_context_units: 100_000,
            chars_per_unit: 4.0,
            api_key: None,
        }
    }
}

impl TransportConfig {
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn context_budget(&self) -> ContextBudget {
        ContextBudget::new(self.max_context_units).with_chars_per_unit(self.chars_per_unit)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub enabled: bool,
    /// Mixed into every fingerprint, e.g. the downstream model id.
    pub salt: Option<String>,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            salt: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub rate_limit: RateLimitSection,
    pub retry: RetrySection,
    pub transport: TransportConfig,
    pub cache: CacheSection,
    pub cancellation: CancellationPolicy,
}

impl GovernorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        // An empty document deserializes to unit, not to an empty map.
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: Self = serde_yaml::from_str(content)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub async fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_yaml_str(&content)
    }

    /// Defaults overlaid with `GOVERNOR_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any variable source. Unparsable values are errors.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var(&lookup, "GOVERNOR_RATE_CAPACITY")? {
            self.rate_limit.capacity = v;
        }
        if let Some(v) = parse_var(&lookup, "GOVERNOR_REFILL_INTERVAL_MS")? {
            self.rate_limit.refill_interval_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "GOVERNOR_MAX_RETRIES")? {
            self.retry.max_retries = v;
        }
        if let Some(v) = parse_var(&lookup, "GOVERNOR_INITIAL_BACKOFF_MS")? {
            self.retry.initial_backoff_ms = v;
        }
        if let Some(v) = lookup("GOVERNOR_ENDPOINT") {
            self.transport.endpoint = v;
        }
        if let Some(v) = parse_var(&lookup, "GOVERNOR_HTTP_TIMEOUT_SECS")? {
            self.transport.timeout_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "GOVERNOR_MAX_CONTEXT_UNITS")? {
            self.transport.max_context_units = v;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        self.rate_limiter_config().validate()?;
        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            return Err(Error::configuration(
                "retry.max_backoff_ms must not be smaller than retry.initial_backoff_ms",
            ));
        }
        url::Url::parse(&self.transport.endpoint).map_err(|e| {
            Error::configuration(format!(
                "transport.endpoint '{}' is not a valid URL: {}",
                self.transport.endpoint, e
            ))
        })?;
        if !(self.transport.chars_per_unit.is_finite() && self.transport.chars_per_unit > 0.0) {
            return Err(Error::configuration(
                "transport.chars_per_unit must be a positive number",
            ));
        }
        Ok(())
    }

    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig::new()
            .with_capacity(self.rate_limit.capacity)
            .with_refill_interval(Duration::from_millis(self.rate_limit.refill_interval_ms))
            .with_mode(self.rate_limit.mode)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new()
            .with_max_retries(self.retry.max_retries)
            .with_initial_backoff(Duration::from_millis(self.retry.initial_backoff_ms))
            .with_max_backoff(Duration::from_millis(self.retry.max_backoff_ms))
            .with_jitter(self.retry.jitter)
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            Error::configuration(format!("{} has an invalid value: '{}'", name, raw))
        }),
    }
}
