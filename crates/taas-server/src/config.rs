//! Configuration file support for the TaaS control node
//!
//! Only the `[taas]` table is read; other tables in the file are ignored.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use taas_common::vlan_range::MAX_VLAN;
use taas_common::{TaasError, TaasResult};

/// taas_id pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// First taas_id handed out
    #[serde(default = "default_vlan_range_start")]
    pub vlan_range_start: u16,

    /// One past the last taas_id handed out
    #[serde(default = "default_vlan_range_end")]
    pub vlan_range_end: u16,

    /// Allocation attempts before a store conflict is reported
    #[serde(default = "default_max_allocation_attempts")]
    pub max_allocation_attempts: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub taas: PoolConfig,
}

fn default_vlan_range_start() -> u16 {
    3900
}

fn default_vlan_range_end() -> u16 {
    4000
}

fn default_max_allocation_attempts() -> u32 {
    3
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            vlan_range_start: default_vlan_range_start(),
            vlan_range_end: default_vlan_range_end(),
            max_allocation_attempts: default_max_allocation_attempts(),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> TaasResult<()> {
        if self.vlan_range_start >= self.vlan_range_end {
            return Err(TaasError::invalid_config(
                "taas.vlan_range_end",
                format!(
                    "must be greater than vlan_range_start ({})",
                    self.vlan_range_start
                ),
            ));
        }
        if self.vlan_range_end > MAX_VLAN + 1 {
            return Err(TaasError::invalid_config(
                "taas.vlan_range_end",
                format!("must not exceed {}", MAX_VLAN + 1),
            ));
        }
        if self.max_allocation_attempts == 0 {
            return Err(TaasError::invalid_config(
                "taas.max_allocation_attempts",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

impl ServerConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> TaasResult<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                TaasError::invalid_config(
                    path.display().to_string(),
                    format!("Failed to parse config file: {}", e),
                )
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(TaasError::invalid_config(
                path.display().to_string(),
                e.to_string(),
            )),
        }
    }

    pub fn validate(&self) -> TaasResult<()> {
        self.taas.validate()
    }
}
