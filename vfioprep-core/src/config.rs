//! Configuration management.

use crate::error::{PrepError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where device enumeration data comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnumerationSourceKind {
    /// `lspci` machine-readable output (includes device names).
    #[default]
    Lspci,
    /// Raw `/sys/bus/pci/devices` attributes.
    Sysfs,
}

impl EnumerationSourceKind {
    /// Parse from string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "lspci" => Some(Self::Lspci),
            "sysfs" => Some(Self::Sysfs),
            _ => None,
        }
    }
}

/// Persistent configuration for vfioprep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Vendor id of the GPU to hand to the guest (e.g. "1002" for AMD).
    pub preferred_vendor: String,
    /// Driver that claims passthrough devices.
    pub passthrough_driver: String,
    /// Pass through the whole isolation group instead of the physical slot.
    pub whole_group: bool,
    pub enumeration_source: EnumerationSourceKind,
    /// Overrides [`paths::data_dir`] for journal, backups and reversal script.
    pub output_dir: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            preferred_vendor: "1002".to_string(),
            passthrough_driver: "vfio-pci".to_string(),
            whole_group: false,
            enumeration_source: EnumerationSourceKind::default(),
            output_dir: None,
        }
    }
}

impl Config {
    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        paths::config_dir().join("config.json")
    }

    /// Load configuration from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, falling back to defaults when absent.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| PrepError::InvalidConfig {
            reason: format!("Failed to read config {}: {}", path.display(), e),
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| PrepError::InvalidConfig {
            reason: format!("Failed to parse config {}: {}", path.display(), e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PrepError::IoError { path: parent.to_path_buf(), source: e })?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| PrepError::InvalidConfig {
            reason: format!("Failed to serialize config: {}", e),
        })?;
        std::fs::write(path, content)
            .map_err(|e| PrepError::IoError { path: path.to_path_buf(), source: e })
    }

    /// Directory receiving the journal, backups and reversal script.
    pub fn output_dir(&self) -> PathBuf {
        self.output_dir.as_ref().map(PathBuf::from).unwrap_or_else(paths::data_dir)
    }

    fn validate(&self) -> Result<()> {
        let vendor = self.preferred_vendor.as_str();
        if vendor.len() != 4 || !vendor.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(PrepError::InvalidConfig {
                reason: format!(
                    "preferred_vendor must be a 4-digit hex PCI vendor id, got '{}'",
                    vendor
                ),
            });
        }
        if self.passthrough_driver.trim().is_empty() {
            return Err(PrepError::InvalidConfig {
                reason: "passthrough_driver must not be empty".to_string(),
            });
        }
        Ok(())
    }
}
