//! Configuration for the query cache
//!
//! Three layers:
//! - [`CacheConfig`]: store-wide defaults (retention, freshness, metrics)
//! - [`QueryOptions`]: per-key options supplied by each consumer
//! - [`CacheHooks`]: store-wide callbacks fired when any query resolves

use crate::cache::entry::Query;
use crate::cache::removable::DEFAULT_GC_TIME;
use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Environment variable for [`CacheConfig::default_gc_time`], in milliseconds
pub const ENV_GC_TIME_MS: &str = "QUERY_CACHE_GC_TIME_MS";

/// Environment variable for [`CacheConfig::default_stale_time`], in milliseconds
pub const ENV_STALE_TIME_MS: &str = "QUERY_CACHE_STALE_TIME_MS";

/// Environment variable for [`CacheConfig::enable_metrics`]
pub const ENV_ENABLE_METRICS: &str = "QUERY_CACHE_ENABLE_METRICS";

/// Store-wide configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Retention window for unobserved queries when a consumer gives none
    pub default_gc_time: Duration,

    /// How long resolved data counts as fresh when a consumer gives no
    /// stale time. Zero means data is stale as soon as it arrives.
    pub default_stale_time: Duration,

    /// Track lookup and event counters in [`QueryCacheStats`](crate::cache::QueryCacheStats)
    pub enable_metrics: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            // 5 minutes
            default_gc_time: DEFAULT_GC_TIME,
            default_stale_time: Duration::ZERO,
            enable_metrics: true,
        }
    }
}

impl CacheConfig {
    /// Create a new builder for cache configuration
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.default_gc_time.is_zero() {
            return Err(CacheError::ConfigError(
                "default_gc_time must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Load configuration from the environment (and a `.env` file if present)
    ///
    /// Unset variables keep their defaults; malformed ones are errors.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = Self::default();
        if let Some(gc_time) = env_millis(ENV_GC_TIME_MS)? {
            config.default_gc_time = gc_time;
        }
        if let Some(stale_time) = env_millis(ENV_STALE_TIME_MS)? {
            config.default_stale_time = stale_time;
        }
        if let Ok(raw) = std::env::var(ENV_ENABLE_METRICS) {
            config.enable_metrics = raw.trim().parse().map_err(|_| {
                CacheError::ConfigError(format!("{ENV_ENABLE_METRICS} must be true or false, got {raw:?}"))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Fill in the gaps of per-key options from these defaults
    pub fn resolve(&self, options: &QueryOptions) -> ResolvedOptions {
        ResolvedOptions {
            gc_time: options.gc_time.unwrap_or(self.default_gc_time),
            stale_time: options.stale_time.unwrap_or(self.default_stale_time),
            enabled: options.enabled,
        }
    }
}

fn env_millis(name: &str) -> Result<Option<Duration>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|e| CacheError::ConfigError(format!("{name}: {e}"))),
        Err(_) => Ok(None),
    }
}

/// Builder for cache configuration
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    default_gc_time: Option<Duration>,
    default_stale_time: Option<Duration>,
    enable_metrics: Option<bool>,
}

impl CacheConfigBuilder {
    /// Set the default retention window
    pub fn default_gc_time(mut self, gc_time: Duration) -> Self {
        self.default_gc_time = Some(gc_time);
        self
    }

    /// Set the default freshness window
    pub fn default_stale_time(mut self, stale_time: Duration) -> Self {
        self.default_stale_time = Some(stale_time);
        self
    }

    /// Enable or disable metrics collection
    pub fn enable_metrics(mut self, enable: bool) -> Self {
        self.enable_metrics = Some(enable);
        self
    }

    /// Build the cache configuration
    pub fn build(self) -> CacheConfig {
        let defaults = CacheConfig::default();

        CacheConfig {
            default_gc_time: self.default_gc_time.unwrap_or(defaults.default_gc_time),
            default_stale_time: self
                .default_stale_time
                .unwrap_or(defaults.default_stale_time),
            enable_metrics: self.enable_metrics.unwrap_or(defaults.enable_metrics),
        }
    }
}

/// Preset configurations for common use cases
impl CacheConfig {
    /// Drop unobserved data quickly; suited to rapidly changing data
    pub fn short_lived() -> Self {
        Self {
            default_gc_time: Duration::from_secs(30),
            default_stale_time: Duration::ZERO,
            ..Default::default()
        }
    }

    /// Keep data around and fresh for a long time; suited to reference data
    pub fn long_lived() -> Self {
        Self {
            default_gc_time: Duration::from_secs(3600),
            default_stale_time: Duration::from_secs(600),
            ..Default::default()
        }
    }
}

/// Options a consumer supplies for one key
///
/// Deserialises from the JSON shape `{"gcTime": 1000, "staleTime": 0,
/// "enabled": true}` with durations in milliseconds. Unknown fields are
/// ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOptions {
    /// Retention window once unobserved; raises the query's gc time
    #[serde(default, with = "option_millis", skip_serializing_if = "Option::is_none")]
    pub gc_time: Option<Duration>,

    /// How long resolved data counts as fresh for this consumer
    #[serde(default, with = "option_millis", skip_serializing_if = "Option::is_none")]
    pub stale_time: Option<Duration>,

    /// Whether this consumer may trigger fetches
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            gc_time: None,
            stale_time: None,
            enabled: true,
        }
    }
}

impl QueryOptions {
    /// Set the retention window
    pub fn gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = Some(gc_time);
        self
    }

    /// Set the freshness window
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    /// Enable or disable fetching for this consumer
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Parse options from a JSON object, ignoring unknown fields
    pub fn from_json(value: &Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// [`QueryOptions`] with every default applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedOptions {
    pub gc_time: Duration,
    pub stale_time: Duration,
    pub enabled: bool,
}

mod option_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_u64(duration.as_millis() as u64),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

/// Callback run when any query resolves with data
pub type SuccessHook = dyn Fn(&Value, &Query) + Send + Sync;

/// Callback run when any query's fetch fails
pub type ErrorHook = dyn Fn(&CacheError, &Query) + Send + Sync;

/// Store-wide resolution callbacks
#[derive(Clone, Default)]
pub struct CacheHooks {
    pub on_success: Option<Arc<SuccessHook>>,
    pub on_error: Option<Arc<ErrorHook>>,
}

impl CacheHooks {
    /// Set the success callback
    pub fn on_success(mut self, hook: impl Fn(&Value, &Query) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(hook));
        self
    }

    /// Set the error callback
    pub fn on_error(mut self, hook: impl Fn(&CacheError, &Query) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for CacheHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheHooks")
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}
