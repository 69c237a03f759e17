//! Configuration for userbd.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use nbd::{DeviceScan, NBD_BLOCK_SIZE};
use serde::{Deserialize, Serialize};

use crate::device::{Device, FileDevice, MemoryDevice};
use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub nbd: NbdConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Exported disk size. Must be a non-zero multiple of 4096.
    pub size_bytes: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            size_bytes: 1 << 30,
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.size_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "device.size_bytes",
                reason: "must be > 0",
            });
        }
        if self.size_bytes % NBD_BLOCK_SIZE != 0 {
            return Err(ConfigError::InvalidValue {
                field: "device.size_bytes",
                reason: "must be a multiple of 4096",
            });
        }
        Ok(())
    }
}

/// Where device contents live. Without a path the device is held in memory
/// and lost on exit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl StorageConfig {
    pub fn build_device(&self, size_bytes: u64) -> Result<Arc<dyn Device>, ConfigError> {
        let Some(ref path) = self.path else {
            let size = usize::try_from(size_bytes).map_err(|_| ConfigError::InvalidValue {
                field: "device.size_bytes",
                reason: "too large for an in-memory device",
            })?;
            return Ok(Arc::new(MemoryDevice::new(size)));
        };

        let device = FileDevice::open(path, size_bytes).map_err(|source| ConfigError::Backend {
            path: path.clone(),
            source,
        })?;
        Ok(Arc::new(device))
    }
}

/// Where to look for device nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NbdConfig {
    pub dev_dir: PathBuf,
    pub sys_block_dir: PathBuf,
}

impl Default for NbdConfig {
    fn default() -> Self {
        Self {
            dev_dir: PathBuf::from("/dev"),
            sys_block_dir: PathBuf::from("/sys/block"),
        }
    }
}

impl NbdConfig {
    pub fn device_scan(&self) -> DeviceScan {
        DeviceScan::new(&self.dev_dir, &self.sys_block_dir)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.device.validate()?;
        Ok(config)
    }
}
