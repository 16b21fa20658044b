//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default Redis hash namespace for flag state.
pub const DEFAULT_NAMESPACE: &str = "magick:features";

/// Pub/sub channel carrying flag-name invalidation messages.
pub const INVALIDATION_CHANNEL: &str = "magick:cache:invalidate";

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// TTL for entries in the process-local store.
    #[serde(with = "duration_secs", default = "default_memory_ttl")]
    pub memory_ttl: Duration,

    /// Dispatch Remote writes on a background task instead of awaiting
    /// them on the write path.
    #[serde(default)]
    pub async_updates: bool,

    /// Emit a warning when a deprecated flag is evaluated without the
    /// caller opting in.
    #[serde(default = "default_true")]
    pub warn_on_deprecated: bool,

    /// Circuit breaker wrapping Remote writes.
    #[serde(default)]
    pub circuit_breaker: BreakerConfig,

    /// Performance metrics pipeline.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Remote (shared key/value) store. `None` disables the tier.
    #[serde(default)]
    pub redis: Option<RedisConfig>,

    /// Durable (relational) store. `None` disables the tier.
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
}

fn default_memory_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory_ttl: default_memory_ttl(),
            async_updates: false,
            warn_on_deprecated: true,
            circuit_breaker: BreakerConfig::default(),
            metrics: MetricsConfig::default(),
            redis: None,
            database: None,
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// Load configuration from `MAGICK_*` environment variables.
    pub fn from_env() -> EngineConfigBuilder {
        let mut builder = EngineConfigBuilder::new();

        if let Ok(url) = std::env::var("MAGICK_REDIS_URL") {
            builder = builder.redis_url(url);
        }
        if let Ok(namespace) = std::env::var("MAGICK_REDIS_NAMESPACE") {
            builder = builder.redis_namespace(namespace);
        }
        if let Ok(db) = std::env::var("MAGICK_REDIS_DB") {
            if let Ok(db) = db.parse() {
                builder = builder.redis_db(db);
            }
        }
        if let Ok(url) = std::env::var("MAGICK_DATABASE_URL") {
            builder = builder.database_url(url);
        }
        if let Ok(ttl) = std::env::var("MAGICK_MEMORY_TTL") {
            if let Ok(secs) = ttl.parse() {
                builder = builder.memory_ttl(Duration::from_secs(secs));
            }
        }
        if std::env::var("MAGICK_ASYNC_UPDATES").is_ok() {
            builder = builder.async_updates(true);
        }

        builder
    }
}

/// Circuit breaker settings for Remote writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    #[serde(default = "default_breaker_threshold")]
    pub threshold: u32,

    /// How long the circuit stays open before a half-open probe.
    #[serde(with = "duration_secs", default = "default_breaker_timeout")]
    pub timeout: Duration,
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_timeout() -> Duration {
    Duration::from_secs(60)
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: default_breaker_threshold(),
            timeout: default_breaker_timeout(),
        }
    }
}

/// Metrics pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Pending records that trigger a flush.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum age of unflushed records.
    #[serde(with = "duration_secs", default = "default_flush_interval")]
    pub flush_interval: Duration,

    /// Push aggregates to the Remote store. `None` means auto: enabled
    /// whenever a Remote store is configured.
    #[serde(default)]
    pub redis_tracking: Option<bool>,
}

fn default_batch_size() -> usize {
    100
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: default_batch_size(),
            flush_interval: default_flush_interval(),
            redis_tracking: None,
        }
    }
}

/// Remote store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL (redis://host:port).
    pub url: String,

    /// Hash key namespace, prepended as `{namespace}:{flag_name}`.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Database index. Defaults to 1, distinct from the conventional
    /// application-cache database 0, so cache eviction pressure never
    /// drops flag state.
    #[serde(default = "default_redis_db")]
    pub db: u8,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_redis_db() -> u8 {
    1
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            namespace: default_namespace(),
            db: default_redis_db(),
        }
    }

    /// Full connection URL with the database index appended.
    pub fn connection_url(&self) -> String {
        let base = self.url.trim_end_matches('/');
        format!("{}/{}", base, self.db)
    }
}

/// Durable store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL (sqlite://, postgres://, or mysql://).
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: default_max_connections(),
        }
    }
}

/// Builder for [`EngineConfig`].
#[derive(Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn memory_ttl(mut self, ttl: Duration) -> Self {
        self.config.memory_ttl = ttl;
        self
    }

    pub fn async_updates(mut self, enabled: bool) -> Self {
        self.config.async_updates = enabled;
        self
    }

    pub fn warn_on_deprecated(mut self, enabled: bool) -> Self {
        self.config.warn_on_deprecated = enabled;
        self
    }

    pub fn breaker_threshold(mut self, threshold: u32) -> Self {
        self.config.circuit_breaker.threshold = threshold;
        self
    }

    pub fn breaker_timeout(mut self, timeout: Duration) -> Self {
        self.config.circuit_breaker.timeout = timeout;
        self
    }

    pub fn metrics_enabled(mut self, enabled: bool) -> Self {
        self.config.metrics.enabled = enabled;
        self
    }

    pub fn metrics_batch_size(mut self, batch_size: usize) -> Self {
        self.config.metrics.batch_size = batch_size;
        self
    }

    pub fn metrics_flush_interval(mut self, interval: Duration) -> Self {
        self.config.metrics.flush_interval = interval;
        self
    }

    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        match &mut self.config.redis {
            Some(redis) => redis.url = url.into(),
            None => self.config.redis = Some(RedisConfig::new(url)),
        }
        self
    }

    pub fn redis_namespace(mut self, namespace: impl Into<String>) -> Self {
        if let Some(redis) = &mut self.config.redis {
            redis.namespace = namespace.into();
        }
        self
    }

    pub fn redis_db(mut self, db: u8) -> Self {
        if let Some(redis) = &mut self.config.redis {
            redis.db = db;
        }
        self
    }

    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        match &mut self.config.database {
            Some(database) => database.url = url.into(),
            None => self.config.database = Some(DatabaseConfig::new(url)),
        }
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
