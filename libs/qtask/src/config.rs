//! Runtime configuration.
//!
//! Everything the facade needs up front: the store endpoint, the
//! fleet-wide partition count, and the logger settings. Configuration
//! can be built programmatically or loaded from the environment; values
//! that are present but invalid are errors, never silent defaults,
//! because a fleet member running with a wrong `TOTAL_PARTITIONS` would
//! corrupt the partition mapping for every key it touches.

use std::str::FromStr;

use strum::{Display, EnumString};

use crate::connection::ConnectionSettings;
use crate::error::{QTaskError, Result};

/// Log verbosity accepted by the facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Silent,
}

impl LogLevel {
    /// The tracing filter directive for this level.
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Silent => "off",
        }
    }
}

/// Cosmetic logger settings.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Service name stamped on the startup event.
    pub service_name: Option<String>,
    /// ANSI colors in log output. Off is the safe default for
    /// aggregated logs.
    pub use_colors: bool,
    /// chrono strftime format for event timestamps; the subscriber
    /// default when unset.
    pub timestamp_format: Option<String>,
}

/// Facade configuration.
#[derive(Debug, Clone)]
pub struct QTaskConfig {
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_username: Option<String>,
    pub redis_password: Option<String>,
    pub redis_database: Option<u8>,

    /// Fleet-wide partition count. Must agree across every producer and
    /// consumer of the deployment; never renumbered while any is live.
    pub total_partitions: u32,

    pub log: LogConfig,
}

impl QTaskConfig {
    pub fn new(host: impl Into<String>, port: u16, total_partitions: u32) -> Self {
        Self {
            redis_host: host.into(),
            redis_port: port,
            redis_username: None,
            redis_password: None,
            redis_database: None,
            total_partitions,
            log: LogConfig::default(),
        }
    }

    pub fn with_auth(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.redis_username = username;
        self.redis_password = password;
        self
    }

    pub fn with_database(mut self, database: u8) -> Self {
        self.redis_database = Some(database);
        self
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log.level = level;
        self
    }

    pub fn with_log_service_name(mut self, name: impl Into<String>) -> Self {
        self.log.service_name = Some(name.into());
        self
    }

    pub fn with_log_colors(mut self, use_colors: bool) -> Self {
        self.log.use_colors = use_colors;
        self
    }

    pub fn with_log_timestamp_format(mut self, format: impl Into<String>) -> Self {
        self.log.timestamp_format = Some(format.into());
        self
    }

    /// Load from the environment.
    ///
    /// `REDIS_HOST`, `REDIS_PORT` and `TOTAL_PARTITIONS` are required;
    /// `REDIS_USERNAME`, `REDIS_PASSWORD`, `REDIS_DATABASE`,
    /// `LOG_LEVEL` and `LOG_SERVICE_NAME` are optional.
    pub fn from_env() -> Result<Self> {
        let host = env_required("REDIS_HOST")?;
        let port: u16 = parse_env("REDIS_PORT", &env_required("REDIS_PORT")?)?;
        let total_partitions: u32 =
            parse_env("TOTAL_PARTITIONS", &env_required("TOTAL_PARTITIONS")?)?;

        let mut config = Self::new(host, port, total_partitions).with_auth(
            std::env::var("REDIS_USERNAME").ok(),
            std::env::var("REDIS_PASSWORD").ok(),
        );

        if let Ok(raw) = std::env::var("REDIS_DATABASE") {
            config.redis_database = Some(parse_env("REDIS_DATABASE", &raw)?);
        }
        if let Ok(raw) = std::env::var("LOG_LEVEL") {
            config.log.level = LogLevel::from_str(&raw.to_lowercase())
                .map_err(|_| QTaskError::Config(format!("invalid LOG_LEVEL: {}", raw)))?;
        }
        if let Ok(name) = std::env::var("LOG_SERVICE_NAME") {
            config.log.service_name = Some(name);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the invariants a fleet member must hold before connecting.
    pub fn validate(&self) -> Result<()> {
        if self.redis_host.is_empty() {
            return Err(QTaskError::Config("REDIS_HOST is required".to_string()));
        }
        if self.redis_port == 0 {
            return Err(QTaskError::Config("REDIS_PORT is required".to_string()));
        }
        if self.total_partitions == 0 {
            return Err(QTaskError::Config(
                "TOTAL_PARTITIONS must be a positive integer".to_string(),
            ));
        }
        Ok(())
    }

    /// The store endpoint these settings describe.
    pub fn connection_settings(&self) -> ConnectionSettings {
        let mut settings = ConnectionSettings::new(self.redis_host.clone(), self.redis_port)
            .with_auth(self.redis_username.clone(), self.redis_password.clone());
        if let Some(db) = self.redis_database {
            settings = settings.with_database(db);
        }
        settings
    }
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| QTaskError::Config(format!("{} is required", key)))
}

fn parse_env<T: FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| QTaskError::Config(format!("invalid {}: {}", key, e)))
}
