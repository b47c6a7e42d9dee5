use crate::error::Error;
use crate::queue::{Queue, QueueOptions, RecoveryPolicy};
use log::LevelFilter;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    /// Queue files are `<path>.stat` and `<path>.buf`.
    pub path: PathBuf,
    #[serde(default = "defaults::n_slots")]
    pub n_slots: u32,
    #[serde(default = "defaults::buffer_size")]
    pub buffer_size: u32,
    #[serde(default)]
    pub blocking_write: bool,
    #[serde(default)]
    pub compress: bool,
    #[serde(default)]
    pub single_writer: bool,
    #[serde(default)]
    pub sync_on_commit: bool,
    #[serde(default = "defaults::poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Unset waits for the reader as long as it takes.
    #[serde(default)]
    pub write_timeout_ms: Option<u64>,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    #[serde(default = "defaults::on_corrupt")]
    pub on_corrupt: RecoveryPolicy,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

mod defaults {
    use crate::constants::{DEFAULT_BUFFER_SIZE, DEFAULT_N_SLOTS, DEFAULT_POLL_INTERVAL_MS};
    use crate::queue::RecoveryPolicy;

    pub fn n_slots() -> u32 {
        return DEFAULT_N_SLOTS;
    }

    pub fn buffer_size() -> u32 {
        return DEFAULT_BUFFER_SIZE;
    }

    pub fn poll_interval_ms() -> u64 {
        return DEFAULT_POLL_INTERVAL_MS;
    }

    pub fn log_level() -> String {
        return "info".to_string();
    }

    pub fn on_corrupt() -> RecoveryPolicy {
        return RecoveryPolicy::Recover;
    }
}

impl QueueConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        return QueueConfig::parse(&text);
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: QueueConfig = toml::from_str(text)?;
        config.validate()?;
        return Ok(config);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("path is empty".to_string()));
        }
        self.level_filter()?;
        match self.options().validate() {
            Ok(()) => return Ok(()),
            Err(Error::InvalidConfig(reason)) => return Err(ConfigError::Invalid(reason)),
            Err(e) => return Err(ConfigError::Invalid(e.to_string())),
        }
    }

    pub fn level_filter(&self) -> Result<LevelFilter, ConfigError> {
        return LevelFilter::from_str(&self.log_level)
            .map_err(|_| ConfigError::Invalid(format!("unknown log level '{}'", self.log_level)));
    }

    pub fn options(&self) -> QueueOptions {
        return QueueOptions {
            n_slots: self.n_slots,
            buffer_size: self.buffer_size,
            blocking_write: self.blocking_write,
            single_writer: self.single_writer,
            sync_on_commit: self.sync_on_commit,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        };
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        return self.write_timeout_ms.map(Duration::from_millis);
    }

    /// Open the queue read-write, creating it if needed and repairing it
    /// according to `on_corrupt`.
    pub fn open_queue(&self) -> crate::Result<Queue> {
        return Queue::open_or_create(&self.path, self.options(), self.on_corrupt);
    }
}
