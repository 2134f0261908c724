use crate::utils::error::{ConnPoolError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Settings applied to every address pool a manager creates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Connections dialed eagerly when a pool is first used
    #[serde(default = "default_min_capacity")]
    pub min_capacity: usize,
    /// Maximum idle connections kept per address
    #[serde(default = "default_max_capacity")]
    pub max_capacity: usize,
    /// Idle connections older than this are closed (milliseconds)
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Period of the background sweep (milliseconds)
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Dial timeout (milliseconds), 0 waits for the OS
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Tag carried by every connection
    #[serde(default)]
    pub protocol_version: Option<String>,
    /// Absolute deadline (unix seconds) after which connections are not reused
    #[serde(default)]
    pub expires_at_unix: Option<u64>,
    /// Also close expired connections during sweep, not only on acquire
    #[serde(default)]
    pub purge_expired_on_sweep: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String, // "json" or "pretty"
}

// Default values
fn default_min_capacity() -> usize {
    5
}

fn default_max_capacity() -> usize {
    80
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_capacity: default_min_capacity(),
            max_capacity: default_max_capacity(),
            idle_timeout_ms: default_idle_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            protocol_version: None,
            expires_at_unix: None,
            purge_expired_on_sweep: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        match self.connect_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn expires_at(&self) -> Option<SystemTime> {
        self.expires_at_unix
            .map(|secs| UNIX_EPOCH + Duration::from_secs(secs))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_capacity == 0 {
            return Err(ConnPoolError::Config(
                "pool.max_capacity must be at least 1".to_string(),
            ));
        }

        if self.min_capacity > self.max_capacity {
            return Err(ConnPoolError::Config(format!(
                "pool.min_capacity ({}) cannot exceed pool.max_capacity ({})",
                self.min_capacity, self.max_capacity
            )));
        }

        if self.idle_timeout_ms == 0 {
            return Err(ConnPoolError::Config(
                "pool.idle_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.sweep_interval_ms == 0 {
            return Err(ConnPoolError::Config(
                "pool.sweep_interval_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConnPoolError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConnPoolError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(ConnPoolError::Config(format!(
                "Invalid log format: {}. Must be 'pretty' or 'json'",
                self.logging.format
            )));
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example<P: AsRef<Path>>(path: P) -> Result<()> {
        let example = r#"[pool]
min_capacity = 5         # Connections dialed when an address is first used
max_capacity = 80        # Idle connections kept per address; surplus is closed
idle_timeout_ms = 30000  # Idle connections older than this are closed
sweep_interval_ms = 1000 # Background sweep period
connect_timeout_ms = 5000  # 0 = no dial timeout
# protocol_version = "v1"
# expires_at_unix = 1893456000
purge_expired_on_sweep = false

[logging]
level = "info"  # Options: "trace", "debug", "info", "warn", "error"
format = "pretty"  # Options: "pretty", "json"
"#;

        std::fs::write(path.as_ref(), example).map_err(|e| {
            ConnPoolError::Config(format!("Failed to write example config: {}", e))
        })?;

        Ok(())
    }
}
