use crate::device::OpenFlags;
use crate::error::{BlockError, Result};
use crate::geometry::{MAX_SECTOR_SIZE, MIN_SECTOR_SIZE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How to open one backing device or image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default = "default_exclusive")]
    pub exclusive: bool,
    /// Overrides the sector size the backend reports (images carry no geometry)
    #[serde(default)]
    pub sector_size: Option<u32>,
}

fn default_exclusive() -> bool {
    true
}

impl DeviceConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            read_only: false,
            exclusive: true,
            sector_size: None,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: DeviceConfig = serde_json::from_str(json)
            .map_err(|e| BlockError::Configuration(format!("invalid device config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| BlockError::Configuration(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(BlockError::Configuration("device path is empty".to_string()));
        }
        if let Some(size) = self.sector_size {
            if !size.is_power_of_two() || !(MIN_SECTOR_SIZE..=MAX_SECTOR_SIZE).contains(&size) {
                return Err(BlockError::Configuration(format!(
                    "sector_size {} is not a power of two in {}..={}",
                    size, MIN_SECTOR_SIZE, MAX_SECTOR_SIZE
                )));
            }
        }
        Ok(())
    }

    pub fn open_flags(&self) -> OpenFlags {
        OpenFlags {
            read_only: self.read_only,
            exclusive: self.exclusive,
        }
    }
}
