//! Library configuration.
//!
//! Values here size the statistics rings and drive the metric log pipeline.
//! A config is installed once per process via the crate init functions; if
//! nothing is installed, defaults apply. Install before the first entry:
//! resource nodes capture the ring parameters when they are created.

use std::path::Path;
use std::path::PathBuf;
use std::sync::OnceLock;

use serde::Deserialize;

/// Errors surfaced when loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration loaded from a TOML file or built in code.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Seconds between metric log flushes. 0 disables the aggregator.
    pub metric_log_flush_interval_sec: u32,

    /// Size cap for a single metric log file before it rolls
    /// (e.g. "50MB", "512KB", or a plain byte count).
    #[serde(deserialize_with = "deserialize_size")]
    pub metric_log_single_file_max_size: u64,

    /// How many rolled metric log files to retain.
    pub metric_log_max_file_amount: u32,

    /// Directory the metric log files are written to.
    pub metric_log_dir: PathBuf,

    /// Bucket count of the per-resource limiter ring.
    pub stat_sample_count: u32,

    /// Window covered by the limiter ring, in milliseconds. Must divide
    /// evenly by `stat_sample_count`.
    pub stat_interval_ms: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            metric_log_flush_interval_sec: 1,
            metric_log_single_file_max_size: 50 * 1024 * 1024,
            metric_log_max_file_amount: 8,
            metric_log_dir: PathBuf::from("logs"),
            stat_sample_count: 10,
            stat_interval_ms: 1000,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file and validate it.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stat_sample_count == 0 {
            return Err(ConfigError::Invalid(
                "stat_sample_count must be positive".into(),
            ));
        }
        if self.stat_interval_ms % self.stat_sample_count != 0 {
            return Err(ConfigError::Invalid(format!(
                "stat_interval_ms ({}) must divide evenly by stat_sample_count ({})",
                self.stat_interval_ms, self.stat_sample_count
            )));
        }
        if self.metric_log_flush_interval_sec > 0 {
            if self.metric_log_single_file_max_size == 0 {
                return Err(ConfigError::Invalid(
                    "metric_log_single_file_max_size must be positive".into(),
                ));
            }
            if self.metric_log_max_file_amount == 0 {
                return Err(ConfigError::Invalid(
                    "metric_log_max_file_amount must be positive".into(),
                ));
            }
        }
        Ok(())
    }
}

static GLOBAL: OnceLock<Config> = OnceLock::new();

/// Install the process-wide config. Returns false if one was already
/// installed (the existing config stays in effect).
pub(crate) fn install(config: Config) -> bool {
    GLOBAL.set(config).is_ok()
}

/// The process-wide config, defaulting if none was installed.
pub(crate) fn global() -> &'static Config {
    GLOBAL.get_or_init(Config::default)
}

/// Parse a size string like "64MB" or "4GB" into bytes.
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }

    let (num_str, suffix) = match s.find(|c: char| c.is_alphabetic()) {
        Some(idx) => (&s[..idx], s[idx..].to_uppercase()),
        None => (s, String::new()),
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid number: {}", num_str))?;

    let multiplier: u64 = match suffix.as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1024,
        "M" | "MB" | "MIB" => 1024 * 1024,
        "G" | "GB" | "GIB" => 1024 * 1024 * 1024,
        _ => return Err(format!("unknown size suffix: {}", suffix)),
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| "size overflow".to_string())
}

fn deserialize_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeValue {
        Number(u64),
        String(String),
    }

    match SizeValue::deserialize(deserializer)? {
        SizeValue::Number(n) => Ok(n),
        SizeValue::String(s) => parse_size(&s).map_err(D::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn parse_size_strings() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("1K").unwrap(), 1024);
        assert_eq!(parse_size("64MB").unwrap(), 64 * 1024 * 1024);
        assert_eq!(parse_size("4GB").unwrap(), 4 * 1024 * 1024 * 1024);
        assert!(parse_size("12parsecs").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn rejects_indivisible_window() {
        let config = Config {
            stat_sample_count: 3,
            stat_interval_ms: 1000,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_zero_log_sizes_when_flushing() {
        let config = Config {
            metric_log_single_file_max_size: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            metric_log_flush_interval_sec: 0,
            metric_log_single_file_max_size: 0,
            ..Config::default()
        };
        // With the aggregator disabled the log sizes are irrelevant.
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_round_trip() {
        let config: Config = toml::from_str(
            r#"
            metric_log_flush_interval_sec = 2
            metric_log_single_file_max_size = "8MB"
            metric_log_max_file_amount = 4
            metric_log_dir = "/tmp/flowgate-logs"
            stat_sample_count = 20
            stat_interval_ms = 2000
            "#,
        )
        .unwrap();
        assert_eq!(config.metric_log_flush_interval_sec, 2);
        assert_eq!(config.metric_log_single_file_max_size, 8 * 1024 * 1024);
        assert_eq!(config.stat_sample_count, 20);
        config.validate().unwrap();
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let parsed: Result<Config, _> = toml::from_str("definitely_not_a_field = 1");
        assert!(parsed.is_err());
    }
}
