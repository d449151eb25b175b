// SPDX-License-Identifier: GPL-3.0-only

use std::fs;
use std::path::Path;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use storage_udevwatch::{DEFAULT_MANAGED_SIGNATURE, NetlinkGroup};

use crate::error::{Result, ServiceError};

/// Read when present and no `--config` was given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/cosmic-ext-storage-udevwatch.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum GroupSetting {
    Kernel,
    #[default]
    Udev,
}

impl From<GroupSetting> for NetlinkGroup {
    fn from(setting: GroupSetting) -> Self {
        match setting {
            GroupSetting::Kernel => NetlinkGroup::Kernel,
            GroupSetting::Udev => NetlinkGroup::Udev,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Keep udev monitoring after the first external event.
    pub use_udev: bool,
    pub netlink_group: GroupSetting,
    pub subsystem: String,
    pub managed_signature: String,
    pub lvm_binary: String,
    pub retry_delay_ms: u64,
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            use_udev: false,
            netlink_group: GroupSetting::default(),
            subsystem: "block".to_string(),
            managed_signature: DEFAULT_MANAGED_SIGNATURE.to_string(),
            lvm_binary: "lvm".to_string(),
            retry_delay_ms: 1000,
            log_level: "info".to_string(),
        }
    }
}

/// Command line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub use_udev: bool,
    pub netlink_group: Option<GroupSetting>,
    pub lvm_binary: Option<String>,
    pub debug: bool,
}

impl ServiceConfig {
    /// Load `path`, or [`DEFAULT_CONFIG_PATH`] when it exists, or defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                if !path.exists() {
                    return Err(ServiceError::ConfigNotFound {
                        path: path.to_path_buf(),
                    });
                }
                Self::from_file(path)?
            }
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    Self::default()
                }
            }
        };
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let invalid = |reason: String| ServiceError::ConfigInvalid {
            path: path.to_path_buf(),
            reason,
        };

        let raw = fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
        let config = Self::parse(&raw).map_err(|e| invalid(e.to_string()))?;
        config.validate().map_err(invalid)?;
        Ok(config)
    }

    pub fn parse(raw: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.subsystem.trim().is_empty() {
            return Err("subsystem must not be empty".to_string());
        }
        if self.managed_signature.is_empty() {
            return Err("managed_signature must not be empty".to_string());
        }
        if self.lvm_binary.trim().is_empty() {
            return Err("lvm_binary must not be empty".to_string());
        }
        Ok(())
    }

    pub fn apply(&mut self, overrides: &Overrides) {
        if overrides.use_udev {
            self.use_udev = true;
        }
        if let Some(group) = overrides.netlink_group {
            self.netlink_group = group;
        }
        if let Some(binary) = &overrides.lvm_binary {
            self.lvm_binary = binary.clone();
        }
        if overrides.debug {
            self.log_level = "debug".to_string();
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}
