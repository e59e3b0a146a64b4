use serde::{Deserialize, Serialize};
use std::{
    fs::{read_to_string, write},
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    db::DOCGRAPH_DB,
    error::SyncError,
    notify::DEFAULT_NOTIFICATION_CHANNEL,
    processor::ProcessorOptions,
    snapshot::SnapshotOptions,
    tokenizer::DEFAULT_TOKENIZER_MODEL,
};

pub const DEFAULT_CONFIG_FILE: &str = "docgraph.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Seconds between queue polls when no notification arrives.
    pub poll_interval_secs: u64,
    /// Hard wall-clock limit for one pass. Also the pass lease lifetime.
    pub pass_timeout_secs: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        ProcessorConfig {
            poll_interval_secs: 30,
            pass_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub interval_secs: u64,
    pub lookback_secs: u64,
    pub timeout_secs: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        SnapshotConfig {
            interval_secs: 300,
            lookback_secs: 24 * 60 * 60,
            timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub database_path: PathBuf,
    pub tokenizer_model: String,
    /// Surface reconciliation errors to the caller of a pass.
    pub strict: bool,
    pub notification_channel: String,
    pub processor: ProcessorConfig,
    pub snapshot: SnapshotConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            database_path: PathBuf::from(DOCGRAPH_DB),
            tokenizer_model: DEFAULT_TOKENIZER_MODEL.to_string(),
            strict: false,
            notification_channel: DEFAULT_NOTIFICATION_CHANNEL.to_string(),
            processor: ProcessorConfig::default(),
            snapshot: SnapshotConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.processor.poll_interval_secs)
    }

    pub fn pass_timeout(&self) -> Duration {
        Duration::from_secs(self.processor.pass_timeout_secs)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot.interval_secs)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_secs(self.snapshot.timeout_secs)
    }

    pub fn processor_options(&self) -> ProcessorOptions {
        ProcessorOptions {
            strict: self.strict,
            lease_ttl: self.pass_timeout(),
        }
    }

    pub fn snapshot_options(&self) -> SnapshotOptions {
        SnapshotOptions {
            interval: self.snapshot_interval(),
            lookback: Duration::from_secs(self.snapshot.lookback_secs),
            lease_ttl: self.snapshot_timeout(),
        }
    }
}

pub trait ConfigProvider: Send + Sync {
    fn get_config(&self) -> Result<SyncConfig, SyncError>;
    fn set_config(&self, config: &SyncConfig) -> Result<(), SyncError>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TomlConfigProvider {
    path: PathBuf,
}

impl TomlConfigProvider {
    pub fn new(path: PathBuf) -> Self {
        TomlConfigProvider { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigProvider for TomlConfigProvider {
    fn get_config(&self) -> Result<SyncConfig, SyncError> {
        tracing::debug!("Attempting to read config from: {:?}", &self.path);
        if !self.path.exists() {
            tracing::debug!("Config file not found, using defaults.");
            return Ok(SyncConfig::default());
        }
        let content = read_to_string(&self.path)?;
        let config: SyncConfig = toml::from_str(&content)?;
        if config.processor.pass_timeout_secs == 0 || config.snapshot.timeout_secs == 0 {
            return Err(SyncError::Config(format!(
                "{:?}: pass timeouts must be at least one second",
                self.path
            )));
        }
        Ok(config)
    }

    fn set_config(&self, config: &SyncConfig) -> Result<(), SyncError> {
        tracing::debug!("Attempting to write config to: {:?}", &self.path);
        write(&self.path, toml::to_string(config)?)?;
        Ok(())
    }
}
