use std::{
    env,
    net::{AddrParseError, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use tabmux::config::{AutoLock, CoordinatorConfig};
use thiserror::Error;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub bind_addr: SocketAddr,
    /// Directory for the file-backed tiers. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    pub log_format: LogFormat,
    pub coordinator: CoordinatorConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid TABMUX_BIND_ADDR: {0}")]
    BindAddrParse(#[from] AddrParseError),
    #[error("invalid TABMUX_CALL_TIMEOUT_MS: {0}")]
    InvalidCallTimeout(String),
    #[error("invalid TABMUX_CONVERSION_MAX_ATTEMPTS: {0}")]
    InvalidConversionMaxAttempts(String),
    #[error("invalid TABMUX_AUTO_LOCK_MINUTES: {0}")]
    InvalidAutoLock(String),
    #[error("invalid TABMUX_LOG_FORMAT: {0}")]
    InvalidLogFormat(String),
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = CoordinatorConfig::default();

        let bind_addr = var("TABMUX_BIND_ADDR")
            .unwrap_or_else(|| "127.0.0.1:4180".to_string())
            .parse()?;
        let data_dir = var("TABMUX_DATA_DIR").map(PathBuf::from);
        let call_timeout = match var("TABMUX_CALL_TIMEOUT_MS") {
            Some(raw) => Duration::from_millis(
                raw.parse::<u64>()
                    .map_err(|error| ConfigError::InvalidCallTimeout(error.to_string()))?,
            ),
            None => defaults.call_timeout,
        };
        let conversion_max_attempts = match var("TABMUX_CONVERSION_MAX_ATTEMPTS") {
            Some(raw) => match raw.parse::<u32>() {
                Ok(0) => {
                    return Err(ConfigError::InvalidConversionMaxAttempts(
                        "must be at least 1".to_string(),
                    ));
                }
                Ok(attempts) => attempts,
                Err(error) => {
                    return Err(ConfigError::InvalidConversionMaxAttempts(error.to_string()));
                }
            },
            None => defaults.conversion_max_attempts,
        };
        let mirrored_categories = match var("TABMUX_MIRRORED_CATEGORIES") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|category| !category.is_empty())
                .map(ToString::to_string)
                .collect(),
            None => defaults.mirrored_categories,
        };
        let auto_lock = parse_auto_lock(var("TABMUX_AUTO_LOCK_MINUTES").as_deref())?;
        let log_format = parse_log_format(var("TABMUX_LOG_FORMAT").as_deref())?;
        let stream_origin = Some(
            var("TABMUX_STREAM_ORIGIN").unwrap_or_else(|| format!("http://{bind_addr}/")),
        );

        Ok(Self {
            bind_addr,
            data_dir,
            log_format,
            coordinator: CoordinatorConfig {
                call_timeout,
                conversion_max_attempts,
                mirrored_categories,
                auto_lock,
                stream_origin,
                ..defaults
            },
        })
    }
}

impl WorkerConfig {
    /// Replaces the bind address, moving a derived stream origin along with it.
    pub fn set_bind_addr(&mut self, bind_addr: SocketAddr) {
        let derived = format!("http://{}/", self.bind_addr);
        if self.coordinator.stream_origin.as_deref() == Some(derived.as_str()) {
            self.coordinator.stream_origin = Some(format!("http://{bind_addr}/"));
        }
        self.bind_addr = bind_addr;
    }
}

fn parse_auto_lock(raw: Option<&str>) -> Result<AutoLock, ConfigError> {
    match raw {
        None | Some("disabled") => Ok(AutoLock::Disabled),
        Some(raw) => {
            let minutes = raw
                .parse::<u64>()
                .map_err(|error| ConfigError::InvalidAutoLock(error.to_string()))?;
            AutoLock::minutes(minutes).map_err(|error| ConfigError::InvalidAutoLock(error.to_string()))
        }
    }
}

fn parse_log_format(raw: Option<&str>) -> Result<LogFormat, ConfigError> {
    match raw {
        None | Some("text") => Ok(LogFormat::Text),
        Some("json") => Ok(LogFormat::Json),
        Some(other) => Err(ConfigError::InvalidLogFormat(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        WorkerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() -> anyhow::Result<()> {
        let config = config_from(&[])?;
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:4180");
        assert!(config.data_dir.is_none());
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.coordinator.call_timeout, Duration::from_secs(30));
        assert_eq!(config.coordinator.conversion_max_attempts, 3);
        assert_eq!(config.coordinator.auto_lock, AutoLock::Disabled);
        assert_eq!(
            config.coordinator.stream_origin.as_deref(),
            Some("http://127.0.0.1:4180/")
        );
        Ok(())
    }

    #[test]
    fn overrides_are_parsed() -> anyhow::Result<()> {
        let config = config_from(&[
            ("TABMUX_BIND_ADDR", "0.0.0.0:9000"),
            ("TABMUX_DATA_DIR", "/var/lib/tabmux"),
            ("TABMUX_CALL_TIMEOUT_MS", "1500"),
            ("TABMUX_MIRRORED_CATEGORIES", "peers, messages,,"),
            ("TABMUX_AUTO_LOCK_MINUTES", "15"),
            ("TABMUX_LOG_FORMAT", "json"),
        ])?;
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.data_dir, Some(PathBuf::from("/var/lib/tabmux")));
        assert_eq!(config.coordinator.call_timeout, Duration::from_millis(1500));
        assert_eq!(
            config.coordinator.mirrored_categories,
            vec!["peers".to_string(), "messages".to_string()]
        );
        assert_eq!(
            config.coordinator.auto_lock.timeout(),
            Some(Duration::from_secs(15 * 60))
        );
        assert_eq!(config.log_format, LogFormat::Json);
        Ok(())
    }

    #[test]
    fn bind_override_moves_derived_origin_only() -> anyhow::Result<()> {
        let mut derived = config_from(&[])?;
        derived.set_bind_addr("127.0.0.1:5000".parse()?);
        assert_eq!(
            derived.coordinator.stream_origin.as_deref(),
            Some("http://127.0.0.1:5000/")
        );

        let mut explicit = config_from(&[("TABMUX_STREAM_ORIGIN", "https://app.example.org/")])?;
        explicit.set_bind_addr("127.0.0.1:5000".parse()?);
        assert_eq!(
            explicit.coordinator.stream_origin.as_deref(),
            Some("https://app.example.org/")
        );
        Ok(())
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            config_from(&[("TABMUX_AUTO_LOCK_MINUTES", "7")]),
            Err(ConfigError::InvalidAutoLock(_))
        ));
        assert!(matches!(
            config_from(&[("TABMUX_CONVERSION_MAX_ATTEMPTS", "0")]),
            Err(ConfigError::InvalidConversionMaxAttempts(_))
        ));
        assert!(matches!(
            config_from(&[("TABMUX_LOG_FORMAT", "xml")]),
            Err(ConfigError::InvalidLogFormat(_))
        ));
        assert!(matches!(
            config_from(&[("TABMUX_BIND_ADDR", "nowhere")]),
            Err(ConfigError::BindAddrParse(_))
        ));
    }
}
