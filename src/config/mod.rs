use crate::utils::error::{PoolError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable overriding `pool.run_mode`.
pub const RUN_MODE_ENV: &str = "MESHPOOL_RUN_MODE";
/// Environment variable overriding `pool.idc`.
pub const IDC_ENV: &str = "MESHPOOL_IDC";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub registry: RegistrySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// How long `lookup` waits for an unregistered service (milliseconds)
    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,
    /// How long `get` waits for a pool to gain its first connection (milliseconds)
    #[serde(default = "default_empty_pool_timeout_ms")]
    pub empty_pool_timeout_ms: u64,
    /// Backoff increment applied after each reconnect attempt (milliseconds)
    #[serde(default = "default_reload_step_ms")]
    pub reload_step_ms: u64,
    /// Upper bound for the reconnect backoff (milliseconds)
    #[serde(default = "default_reload_max_ms")]
    pub reload_max_ms: u64,
    #[serde(default)]
    pub run_mode: RunMode,
    /// Local datacenter identifier used for locality-preferring selection
    #[serde(default)]
    pub idc: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Reconnects only while the service store still lists the endpoint.
    #[default]
    Online,
    /// Reconnects whatever the service store says, as long as the pool still
    /// carries the endpoint's config. Endpoints removed from the pool are never
    /// redialled, not even in this mode.
    Test,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default = "ProtocolDefaults::nova")]
    pub nova: ProtocolDefaults,
    #[serde(default = "ProtocolDefaults::dubbo")]
    pub dubbo: ProtocolDefaults,
}

/// Per-protocol connection defaults merged into every endpoint of that protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtocolDefaults {
    #[serde(default = "default_strategy")]
    pub load_balancing_strategy: String,
    /// Request timeout (milliseconds)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_persistent")]
    pub persistent: bool,
    #[serde(default)]
    pub framing: FramingConfig,
}

/// Length-prefixed framing hints handed to the transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FramingConfig {
    #[serde(default = "default_open_length_check")]
    pub open_length_check: bool,
    /// Pack-style length type, "N" is a 32-bit big endian length
    #[serde(default = "default_package_length_type")]
    pub package_length_type: String,
    #[serde(default)]
    pub package_length_offset: usize,
    #[serde(default)]
    pub package_body_offset: usize,
    #[serde(default = "default_package_max_length")]
    pub package_max_length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String, // "json" or "pretty"
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegistrySettings {
    /// Static registry file describing apps and their servers
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub watch: bool,
}

// Default values
fn default_lookup_timeout_ms() -> u64 {
    2000
}

fn default_empty_pool_timeout_ms() -> u64 {
    1000
}

fn default_reload_step_ms() -> u64 {
    5000
}

fn default_reload_max_ms() -> u64 {
    30000
}

fn default_strategy() -> String {
    "roundRobin".to_string()
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_heartbeat_interval_ms() -> u64 {
    5000
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_persistent() -> bool {
    true
}

fn default_open_length_check() -> bool {
    true
}

fn default_package_length_type() -> String {
    "N".to_string()
}

fn default_package_max_length() -> usize {
    2 * 1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            lookup_timeout_ms: default_lookup_timeout_ms(),
            empty_pool_timeout_ms: default_empty_pool_timeout_ms(),
            reload_step_ms: default_reload_step_ms(),
            reload_max_ms: default_reload_max_ms(),
            run_mode: RunMode::default(),
            idc: None,
        }
    }
}

impl PoolSettings {
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    pub fn empty_pool_timeout(&self) -> Duration {
        Duration::from_millis(self.empty_pool_timeout_ms)
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            nova: ProtocolDefaults::nova(),
            dubbo: ProtocolDefaults::dubbo(),
        }
    }
}

impl ConnectionSettings {
    /// Defaults for a protocol; unknown protocols use the nova settings.
    pub fn defaults_for(&self, protocol: &str) -> &ProtocolDefaults {
        match protocol {
            "dubbo" => &self.dubbo,
            _ => &self.nova,
        }
    }
}

impl ProtocolDefaults {
    pub fn nova() -> Self {
        Self {
            load_balancing_strategy: default_strategy(),
            timeout_ms: default_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            persistent: default_persistent(),
            framing: FramingConfig::default(),
        }
    }

    pub fn dubbo() -> Self {
        Self {
            load_balancing_strategy: default_strategy(),
            timeout_ms: 5000,
            heartbeat_interval_ms: 30000,
            connect_timeout_ms: default_connect_timeout_ms(),
            persistent: true,
            framing: FramingConfig {
                open_length_check: true,
                package_length_type: "N".to_string(),
                // 0xdabb + flag(2 bytes) + status + id(8 bytes), then the body length
                package_length_offset: 12,
                package_body_offset: 16,
                package_max_length: default_package_max_length(),
            },
        }
    }
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            open_length_check: default_open_length_check(),
            package_length_type: default_package_length_type(),
            package_length_offset: 0,
            package_body_offset: 0,
            package_max_length: default_package_max_length(),
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

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| PoolError::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = toml::from_str(&content)
            .map_err(|e| PoolError::Config(format!("Failed to parse config: {}", e)))?;

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Apply `MESHPOOL_RUN_MODE` and `MESHPOOL_IDC` if set
    pub fn apply_env_overrides(&mut self) {
        if let Ok(mode) = std::env::var(RUN_MODE_ENV) {
            match mode.trim().to_ascii_lowercase().as_str() {
                "test" => self.pool.run_mode = RunMode::Test,
                "online" => self.pool.run_mode = RunMode::Online,
                _ => {}
            }
        }

        if let Ok(idc) = std::env::var(IDC_ENV) {
            let idc = idc.trim();
            if !idc.is_empty() {
                self.pool.idc = Some(idc.to_string());
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.pool.lookup_timeout_ms == 0 || self.pool.empty_pool_timeout_ms == 0 {
            return Err(PoolError::Config(
                "lookup_timeout_ms and empty_pool_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.pool.reload_max_ms < self.pool.reload_step_ms {
            return Err(PoolError::Config(format!(
                "reload_max_ms ({}) must not be smaller than reload_step_ms ({})",
                self.pool.reload_max_ms, self.pool.reload_step_ms
            )));
        }

        for (name, defaults) in [
            ("nova", &self.connection.nova),
            ("dubbo", &self.connection.dubbo),
        ] {
            if defaults.heartbeat_interval_ms == 0 {
                return Err(PoolError::Config(format!(
                    "connection.{}.heartbeat_interval_ms must be greater than 0",
                    name
                )));
            }
            if defaults.connect_timeout_ms == 0 {
                return Err(PoolError::Config(format!(
                    "connection.{}.connect_timeout_ms must be greater than 0",
                    name
                )));
            }
            if defaults.load_balancing_strategy.trim().is_empty() {
                return Err(PoolError::Config(format!(
                    "connection.{}.load_balancing_strategy cannot be empty",
                    name
                )));
            }
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(PoolError::Config(format!(
                "Invalid log format: {}. Must be 'pretty' or 'json'",
                self.logging.format
            )));
        }

        if self.registry.watch && self.registry.file.is_none() {
            return Err(PoolError::Config(
                "registry.watch requires registry.file".to_string(),
            ));
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example<P: AsRef<Path>>(path: P) -> Result<()> {
        let example = r#"[pool]
lookup_timeout_ms = 2000      # wait for an unregistered service before failing
empty_pool_timeout_ms = 1000  # wait for a first live connection before giving up
reload_step_ms = 5000         # reconnect backoff increment
reload_max_ms = 30000         # reconnect backoff cap
run_mode = "online"           # Options: "online", "test"
# idc = "dc1"                 # local datacenter, preferred during selection

[connection.nova]
load_balancing_strategy = "roundRobin"  # Options: "roundRobin", "polling", "random"
timeout_ms = 5000
heartbeat_interval_ms = 5000
connect_timeout_ms = 3000

[connection.dubbo]
load_balancing_strategy = "roundRobin"
timeout_ms = 5000
heartbeat_interval_ms = 30000
connect_timeout_ms = 3000

[connection.dubbo.framing]
open_length_check = true
package_length_type = "N"
package_length_offset = 12
package_body_offset = 16
package_max_length = 2097152

[logging]
level = "info"  # Options: "trace", "debug", "info", "warn", "error"
format = "pretty"  # Options: "pretty", "json"

[registry]
# file = "config/registry.toml"
watch = false
"#;

        std::fs::write(path.as_ref(), example).map_err(|e| {
            PoolError::Config(format!("Failed to write example config: {}", e))
        })?;

        Ok(())
    }
}
