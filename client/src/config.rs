//! Configuration management.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Connection transport settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Explicit endpoint candidates, tried before the discovered ones
    #[garde(skip)]
    pub urls: Vec<String>,
    /// Per-candidate connection timeout
    #[garde(range(min = 1))]
    pub connect_timeout_ms: u64,
    /// First reconnect delay
    #[garde(range(min = 1))]
    pub reconnect_base_delay_ms: u64,
    /// Growth factor between reconnect delays
    #[garde(range(min = 1.0))]
    pub reconnect_multiplier: f64,
    /// Upper bound of the reconnect delay
    #[garde(range(min = 1))]
    pub reconnect_max_delay_ms: u64,
    /// Reconnect attempts before giving up (0 = retry forever)
    #[garde(skip)]
    pub max_reconnect_attempts: u32,
    /// Interval between liveness probes
    #[garde(range(min = 1))]
    pub ping_interval_ms: u64,
    /// How long to wait for a pong before treating the socket as dead
    #[garde(range(min = 1))]
    pub pong_timeout_ms: u64,
    /// Maximum number of messages held while disconnected
    #[garde(range(min = 1))]
    pub queue_capacity: usize,
    /// How long start/stop commands wait for backend confirmation
    #[garde(range(min = 1))]
    pub command_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            connect_timeout_ms: 5_000,
            reconnect_base_delay_ms: 1_000,
            reconnect_multiplier: 2.0,
            reconnect_max_delay_ms: 30_000,
            max_reconnect_attempts: 10,
            ping_interval_ms: 30_000,
            pong_timeout_ms: 10_000,
            queue_capacity: 256,
            command_timeout_ms: 10_000,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Admission control limits.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ResourceLimits {
    /// Maximum aggregate CPU usage in percent
    #[garde(range(min = 1.0))]
    pub max_cpu: f64,
    /// Maximum aggregate memory in MB
    #[garde(range(min = 1.0))]
    pub max_memory_mb: f64,
    /// Maximum aggregate bandwidth in Mbps
    #[garde(range(min = 1.0))]
    pub max_bandwidth_mbps: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_cpu: 80.0,
            max_memory_mb: 4096.0,
            max_bandwidth_mbps: 100.0,
        }
    }
}

/// Health monitoring settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct HealthConfig {
    /// Interval between health checks
    #[garde(range(min = 1))]
    pub interval_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { interval_ms: 5_000 }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Stream lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct StreamsConfig {
    /// Pause between stop and start when restarting a stream
    #[garde(skip)]
    pub restart_grace_ms: u64,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            restart_grace_ms: 1_000,
        }
    }
}

impl StreamsConfig {
    pub fn restart_grace(&self) -> Duration {
        Duration::from_millis(self.restart_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, Validate)]
#[serde(default)]
pub struct LoggingConfig {
    /// Path to log file (if set, logs will be written to file in addition to stdout)
    #[garde(skip)]
    pub log_file: Option<PathBuf>,
    /// Log level (trace, debug, info, warn, error)
    /// If not set, uses RUST_LOG environment variable or defaults to "info"
    #[garde(skip)]
    pub log_level: Option<String>,
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, Validate)]
#[serde(default)]
pub struct Config {
    #[garde(dive)]
    pub connection: ConnectionConfig,
    #[garde(dive)]
    pub resources: ResourceLimits,
    #[garde(dive)]
    pub health: HealthConfig,
    #[garde(dive)]
    pub streams: StreamsConfig,
    #[garde(dive)]
    pub logging: LoggingConfig,
}

/// Values given on the command line, which win over every other source.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub urls: Vec<String>,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration with full priority chain: CLI args > env vars > config files > defaults.
    ///
    /// Config files are searched in this order:
    /// 1. `config.toml` in user config directory (~/.config/streamctl/ on Linux)
    /// 2. `.streamctl.toml` in current directory
    pub fn from_figment(overrides: ConfigOverrides) -> anyhow::Result<Self> {
        let local_config = std::env::current_dir()
            .ok()
            .map(|d| d.join(".streamctl.toml"));
        let user_config = directories::ProjectDirs::from("", "", "streamctl")
            .map(|dirs| dirs.config_dir().join("config.toml"));

        Self::load(
            [user_config, local_config].into_iter().flatten().collect(),
            overrides,
        )
    }

    /// Load configuration from the given files (later files win), the
    /// environment and the overrides.
    pub fn load(files: Vec<PathBuf>, overrides: ConfigOverrides) -> anyhow::Result<Self> {
        // Build figment with priority: defaults < config files < env vars < CLI args
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        for path in &files {
            if path.exists() {
                figment = figment.merge(Toml::file(path));
            }
        }

        // STREAMCTL_CONNECTION__PING_INTERVAL_MS -> connection.ping_interval_ms
        figment = figment.merge(Env::prefixed("STREAMCTL_").split("__"));

        if !overrides.urls.is_empty() {
            figment = figment.merge(Serialized::default("connection.urls", &overrides.urls));
        }
        if let Some(ref level) = overrides.log_level {
            figment = figment.merge(Serialized::default("logging.log_level", level));
        }
        if let Some(ref file) = overrides.log_file {
            figment = figment.merge(Serialized::default("logging.log_file", file));
        }

        let config: Config = figment.extract()?;
        config
            .validate()
            .map_err(|report| anyhow::anyhow!("Invalid configuration: {}", report))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.health.interval(), Duration::from_secs(5));
        assert_eq!(config.connection.max_reconnect_attempts, 10);
    }

    #[test]
    #[serial]
    fn test_file_then_env_then_overrides() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[connection]
urls = ["ws://from-file:9000/gstreamer"]
ping_interval_ms = 1500

[resources]
max_cpu = 10.0

[logging]
log_level = "debug"
"#,
        )
        .unwrap();

        std::env::set_var("STREAMCTL_CONNECTION__PONG_TIMEOUT_MS", "750");
        let config = Config::load(
            vec![path],
            ConfigOverrides {
                log_level: Some("trace".to_string()),
                ..Default::default()
            },
        );
        std::env::remove_var("STREAMCTL_CONNECTION__PONG_TIMEOUT_MS");
        let config = config.unwrap();

        assert_eq!(config.connection.urls, vec!["ws://from-file:9000/gstreamer"]);
        assert_eq!(config.connection.ping_interval_ms, 1500);
        assert_eq!(config.connection.pong_timeout_ms, 750);
        assert_eq!(config.resources.max_cpu, 10.0);
        // Untouched values keep their defaults
        assert_eq!(config.resources.max_memory_mb, 4096.0);
        assert_eq!(config.logging.log_level.as_deref(), Some("trace"));
    }

    #[test]
    #[serial]
    fn test_zero_health_interval_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[health]\ninterval_ms = 0\n").unwrap();

        let err = Config::load(vec![path], ConfigOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("interval_ms"), "{}", err);
    }

    #[test]
    #[serial]
    fn test_missing_files_are_skipped() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(
            vec![dir.path().join("does-not-exist.toml")],
            ConfigOverrides {
                urls: vec!["ws://cli:1".to_string()],
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(config.connection.urls, vec!["ws://cli:1"]);
    }
}
