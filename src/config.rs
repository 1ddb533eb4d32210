//! Configuration management for deferwork.
//!
//! Settings are grouped by concern: where the store lives, queue and job
//! defaults, worker behaviour, and logging. Configuration can be built in
//! code, loaded from a TOML file, or read from `DEFERWORK_*` environment
//! variables.
//!
//! ```rust
//! use deferwork::config::DeferworkConfig;
//! use std::time::Duration;
//!
//! let config = DeferworkConfig::new()
//!     .with_store_url("redis://127.0.0.1:6379/2")
//!     .with_default_result_ttl(3600)
//!     .with_polling_interval(Duration::from_millis(250));
//!
//! assert_eq!(config.queue.default_queue, "default");
//! assert_eq!(config.queue.default_result_ttl, 3600);
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration as StdDuration;

/// Serializes `std::time::Duration` as strings like `"500ms"`, `"30s"`,
/// `"5m"` or `"1h"`.
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis();
        if millis % 1000 != 0 {
            return serializer.serialize_str(&format!("{}ms", millis));
        }
        let secs = duration.as_secs();
        if secs == 0 {
            serializer.serialize_str("0s")
        } else if secs % 3600 == 0 {
            serializer.serialize_str(&format!("{}h", secs / 3600))
        } else if secs % 60 == 0 {
            serializer.serialize_str(&format!("{}m", secs / 60))
        } else {
            serializer.serialize_str(&format!("{}s", secs))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(D::Error::custom)
    }

    /// Parse a duration string like "250ms", "30s", "5m", "1h" or "90".
    pub(super) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();

        // Bare numbers are seconds
        if let Ok(secs) = s.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }

        if let Some(num_str) = s.strip_suffix("ms") {
            let num: u64 = num_str
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
            return Ok(Duration::from_millis(num));
        }

        if s.len() < 2 {
            return Err(format!("Invalid duration format: {}", s));
        }

        let (num_str, suffix) = s.split_at(s.len() - 1);
        let num: u64 = num_str
            .parse()
            .map_err(|_| format!("Invalid number in duration: {}", num_str))?;

        match suffix {
            "s" => Ok(Duration::from_secs(num)),
            "m" => Ok(Duration::from_secs(num * 60)),
            "h" => Ok(Duration::from_secs(num * 3600)),
            "d" => Ok(Duration::from_secs(num * 86400)),
            _ => Err(format!(
                "Invalid duration suffix: {}. Use ms, s, m, h, or d",
                suffix
            )),
        }
    }
}

/// Main configuration for deferwork.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct DeferworkConfig {
    /// Store connection settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Queue and job defaults
    #[serde(default)]
    pub queue: QueueConfig,

    /// Worker settings
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl DeferworkConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store_url(mut self, url: &str) -> Self {
        self.store.url = url.to_string();
        self
    }

    pub fn with_default_queue(mut self, name: &str) -> Self {
        self.queue.default_queue = name.to_string();
        self
    }

    /// Seconds a finished job's record is kept when the job sets no result TTL
    pub fn with_default_result_ttl(mut self, seconds: i64) -> Self {
        self.queue.default_result_ttl = seconds;
        self
    }

    pub fn with_promotion_retries(mut self, retries: u32) -> Self {
        self.queue.promotion_retries = retries;
        self
    }

    pub fn with_max_argument_nodes(mut self, nodes: usize) -> Self {
        self.queue.max_argument_nodes = nodes;
        self
    }

    pub fn with_synchronous_queues(mut self, synchronous: bool) -> Self {
        self.queue.synchronous = synchronous;
        self
    }

    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker.pool_size = size;
        self
    }

    pub fn with_polling_interval(mut self, interval: StdDuration) -> Self {
        self.worker.polling_interval = interval;
        self
    }

    pub fn with_log_level(mut self, level: &str) -> Self {
        self.logging.level = level.to_string();
        self
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: &str) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("DEFERWORK_STORE_URL") {
            config.store.url = url;
        }

        if let Ok(name) = std::env::var("DEFERWORK_DEFAULT_QUEUE") {
            config.queue.default_queue = name;
        }
        if let Ok(ttl) = std::env::var("DEFERWORK_DEFAULT_RESULT_TTL") {
            config.queue.default_result_ttl = ttl.parse().map_err(|_| {
                crate::DeferworkError::Config(format!(
                    "DEFERWORK_DEFAULT_RESULT_TTL is not an integer: {}",
                    ttl
                ))
            })?;
        }
        if let Ok(retries) = std::env::var("DEFERWORK_PROMOTION_RETRIES") {
            config.queue.promotion_retries =
                retries.parse().unwrap_or(config.queue.promotion_retries);
        }

        if let Ok(pool_size) = std::env::var("DEFERWORK_WORKER_POOL_SIZE") {
            config.worker.pool_size = pool_size.parse().unwrap_or(config.worker.pool_size);
        }
        if let Ok(interval) = std::env::var("DEFERWORK_POLLING_INTERVAL") {
            config.worker.polling_interval =
                duration_str::parse_duration(&interval).map_err(crate::DeferworkError::Config)?;
        }
        if let Ok(queues) = std::env::var("DEFERWORK_WORKER_QUEUES") {
            config.worker.queues = queues
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Ok(level) = std::env::var("DEFERWORK_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(json) = std::env::var("DEFERWORK_LOG_JSON") {
            config.logging.json_format = json.parse().unwrap_or(config.logging.json_format);
        }

        Ok(config)
    }

    /// Create a configuration for local development
    pub fn development() -> Self {
        Self {
            store: StoreConfig {
                url: "redis://127.0.0.1:6379/1".to_string(),
                ..Default::default()
            },
            queue: QueueConfig {
                default_result_ttl: 60,
                ..Default::default()
            },
            worker: WorkerConfig {
                pool_size: 1,
                polling_interval: StdDuration::from_millis(100),
                ..Default::default()
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
                include_location: true,
                ..Default::default()
            },
        }
    }

    /// Create a configuration for production deployments
    pub fn production() -> Self {
        Self {
            store: StoreConfig {
                connection_timeout_secs: 60,
                ..Default::default()
            },
            worker: WorkerConfig {
                pool_size: 8,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                json_format: true,
                include_location: false,
            },
            ..Default::default()
        }
    }
}

/// Store connection configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// `redis://...` or `postgres://...`
    pub url: String,

    /// Connection timeout in seconds
    pub connection_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            connection_timeout_secs: 30,
        }
    }
}

/// Queue and job defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue used when a job has no origin
    pub default_queue: String,

    /// Seconds to keep a finished job when it sets no result TTL
    pub default_result_ttl: i64,

    /// Attempts at promoting a deferred job before giving up on conflicts
    pub promotion_retries: u32,

    /// Largest argument structure scanned for pending results
    pub max_argument_nodes: usize,

    /// Perform jobs at enqueue time instead of in a worker
    pub synchronous: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_queue: "default".to_string(),
            default_result_ttl: 500,
            promotion_retries: 16,
            max_argument_nodes: crate::call::DEFAULT_MAX_ARGUMENT_NODES,
            synchronous: false,
        }
    }
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of workers started by a pool built from this configuration
    pub pool_size: usize,

    /// How long an idle worker waits before polling again
    #[serde(with = "duration_str")]
    pub polling_interval: StdDuration,

    /// Queues to listen on, checked in the order listed
    pub queues: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 1,
            polling_interval: StdDuration::from_secs(1),
            queues: vec!["default".to_string()],
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error), or any `EnvFilter` directive
    pub level: String,

    /// Whether to enable structured JSON logging
    pub json_format: bool,

    /// Whether to include file and line information
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            include_location: false,
        }
    }
}
