use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Placeholder substituted with the stream key in [`IngestConfig::url_template`].
pub const STREAM_KEY_PLACEHOLDER: &str = "{stream_key}";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub ingest: IngestConfig,
    pub relay: RelayConfig,
    pub retry: RetryConfig,
    pub simulcast: SimulcastConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Where relay workers read the live source from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Ingest URL, `{stream_key}` is replaced with the broadcaster's stream key
    pub url_template: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            url_template: format!("rtmp://127.0.0.1:1935/live/{STREAM_KEY_PLACEHOLDER}"),
        }
    }
}

/// Relay process settings (one ffmpeg child per destination).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub ffmpeg_path: String,
    pub connect_timeout_seconds: u64,
    /// No progress for this long counts as a dead connection
    pub stall_timeout_seconds: u64,
    pub health_check_interval_seconds: u64,
    /// Number of stderr lines kept for error messages
    pub stderr_tail_lines: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            connect_timeout_seconds: 15,
            stall_timeout_seconds: 20,
            health_check_interval_seconds: 5,
            stderr_tail_lines: 20,
        }
    }
}

/// Reconnect policy for a destination before it is marked as failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulcastConfig {
    /// Time a relay gets to close its connection before it is killed
    pub stop_grace_period_seconds: u64,
    pub max_destinations_per_stream: usize,
    pub event_channel_capacity: usize,
}

impl Default for SimulcastConfig {
    fn default() -> Self {
        Self {
            stop_grace_period_seconds: 5,
            max_destinations_per_stream: 10,
            event_channel_capacity: 256,
        }
    }
}

impl Config {
    /// Load configuration with the following priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Default values (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // RELAYCAST_RETRY__MAX_ATTEMPTS=5, RELAYCAST_LOGGING__LEVEL=debug, ...
        builder = builder.add_source(
            Environment::with_prefix("RELAYCAST")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Collect every configuration problem instead of stopping at the first one.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !matches!(
            self.logging.level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "warning" | "error"
        ) {
            errors.push(format!("logging.level is invalid: {}", self.logging.level));
        }
        if self.logging.format != "json" && self.logging.format != "pretty" {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got {}",
                self.logging.format
            ));
        }

        if !self.ingest.url_template.contains(STREAM_KEY_PLACEHOLDER) {
            errors.push(format!(
                "ingest.url_template must contain {STREAM_KEY_PLACEHOLDER}"
            ));
        }

        if self.relay.ffmpeg_path.trim().is_empty() {
            errors.push("relay.ffmpeg_path must not be empty".to_string());
        }
        if self.relay.connect_timeout_seconds == 0 {
            errors.push("relay.connect_timeout_seconds must be greater than 0".to_string());
        }
        if self.relay.stall_timeout_seconds == 0 {
            errors.push("relay.stall_timeout_seconds must be greater than 0".to_string());
        }
        if self.relay.health_check_interval_seconds == 0 {
            errors.push("relay.health_check_interval_seconds must be greater than 0".to_string());
        }

        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            errors.push(format!(
                "retry.initial_backoff_ms ({}) exceeds retry.max_backoff_ms ({})",
                self.retry.initial_backoff_ms, self.retry.max_backoff_ms
            ));
        }

        if self.simulcast.max_destinations_per_stream == 0 {
            errors.push("simulcast.max_destinations_per_stream must be greater than 0".to_string());
        }
        if self.simulcast.event_channel_capacity == 0 {
            errors.push("simulcast.event_channel_capacity must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_backoff_ms, 1000);
        assert_eq!(config.simulcast.stop_grace_period_seconds, 5);
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        config.ingest.url_template = "rtmp://127.0.0.1/live".to_string();
        config.retry.initial_backoff_ms = 60_000;
        config.simulcast.max_destinations_per_stream = 0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("logging.format")));
        assert!(errors.iter().any(|e| e.contains("url_template")));
        assert!(errors.iter().any(|e| e.contains("initial_backoff_ms")));
        assert!(errors.iter().any(|e| e.contains("max_destinations_per_stream")));
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "retry:\n  max_attempts: 7\nrelay:\n  ffmpeg_path: /usr/local/bin/ffmpeg\n"
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.relay.ffmpeg_path, "/usr/local/bin/ffmpeg");
        // Untouched sections keep their defaults
        assert_eq!(config.retry.initial_backoff_ms, 1000);
        assert_eq!(config.simulcast.max_destinations_per_stream, 10);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = Config::from_file("/nonexistent/relaycast.yaml").unwrap();
        assert_eq!(config.logging.level, "info");
    }
}
