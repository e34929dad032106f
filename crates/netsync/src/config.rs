use std::fs;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub const MIN_ID_BATCH_SIZE: u32 = 100;
pub const MAX_ID_BATCH_SIZE: u32 = 1000;
pub const DEFAULT_ID_BATCH_SIZE: u32 = 200;

pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub adaptive_pool_scaling: bool,
    pub pool_baseline: usize,
    pub pool_ceiling: usize,
    pub id_batch_size: u32,
    pub compression: bool,
    pub connect_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            adaptive_pool_scaling: true,
            pool_baseline: 1000,
            pool_ceiling: 20000,
            id_batch_size: DEFAULT_ID_BATCH_SIZE,
            compression: true,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

impl SyncConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Batch size clamped into the supported range.
    pub fn batch_size(&self) -> u32 {
        let clamped = self.id_batch_size.clamp(MIN_ID_BATCH_SIZE, MAX_ID_BATCH_SIZE);
        if clamped != self.id_batch_size {
            log::warn!(
                "id_batch_size {} outside {}..={}, using {}",
                self.id_batch_size,
                MIN_ID_BATCH_SIZE,
                MAX_ID_BATCH_SIZE,
                clamped
            );
        }
        clamped
    }
}

/// Anything that can hand out the current configuration. Consumers call
/// `current()` each time they need values and validate what they get.
pub trait ConfigSource: Send + Sync {
    fn current(&self) -> SyncConfig;
}

impl ConfigSource for SyncConfig {
    fn current(&self) -> SyncConfig {
        self.clone()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SharedConfig {
    inner: Arc<RwLock<SyncConfig>>,
}

impl SharedConfig {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut SyncConfig)) {
        f(&mut self.inner.write());
    }

    pub fn replace(&self, config: SyncConfig) {
        *self.inner.write() = config;
    }
}

impl ConfigSource for SharedConfig {
    fn current(&self) -> SyncConfig {
        self.inner.read().clone()
    }
}
