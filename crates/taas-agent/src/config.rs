//! Configuration file support for the TaaS agent
//!
//! Loads and validates agent configuration from TOML files.
//! Default location: /etc/neutron/taas-agent.toml

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use taas_common::switch::TunnelType;
use taas_common::{TaasError, TaasResult};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/neutron/taas-agent.toml";

/// Linux interface names are limited to 15 characters.
const MAX_IFNAME_LEN: usize = 15;

/// Host identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// This host's name as it appears in intents
    #[serde(default = "default_host")]
    pub host: String,

    /// Local tunnel endpoint address
    #[serde(default)]
    pub tunnel_ip: Option<IpAddr>,
}

/// Open vSwitch layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OvsConfig {
    /// Bridge carrying VM traffic
    #[serde(default = "default_access_bridge")]
    pub access_bridge: String,

    /// Bridge carrying mirrored traffic only
    #[serde(default = "default_collection_bridge")]
    pub collection_bridge: String,

    /// Patch port on the access bridge
    #[serde(default = "default_access_patch_port")]
    pub access_patch_port: String,

    /// Patch port on the collection bridge
    #[serde(default = "default_collection_patch_port")]
    pub collection_patch_port: String,

    /// Encapsulation for cross-host mirror tunnels
    #[serde(default)]
    pub tunnel_type: TunnelType,

    /// Forward mirrored sources with the access bridge's catch-all action
    /// instead of `normal` when one is installed
    #[serde(default)]
    pub catch_all_compensation: bool,
}

/// SR-IOV backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SriovConfig {
    #[serde(default = "default_sriov_enabled")]
    pub enabled: bool,

    /// Root of the sysfs mount
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,
}

/// Complete agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub agent: HostConfig,

    #[serde(default)]
    pub ovs: OvsConfig,

    #[serde(default)]
    pub sriov: SriovConfig,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_access_bridge() -> String {
    "br-int".to_string()
}

fn default_collection_bridge() -> String {
    "br-tap".to_string()
}

fn default_access_patch_port() -> String {
    "patch-int-tap".to_string()
}

fn default_collection_patch_port() -> String {
    "patch-tap-int".to_string()
}

fn default_sriov_enabled() -> bool {
    true
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/sys")
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            tunnel_ip: None,
        }
    }
}

impl Default for OvsConfig {
    fn default() -> Self {
        Self {
            access_bridge: default_access_bridge(),
            collection_bridge: default_collection_bridge(),
            access_patch_port: default_access_patch_port(),
            collection_patch_port: default_collection_patch_port(),
            tunnel_type: TunnelType::default(),
            catch_all_compensation: false,
        }
    }
}

impl Default for SriovConfig {
    fn default() -> Self {
        Self {
            enabled: default_sriov_enabled(),
            sysfs_root: default_sysfs_root(),
        }
    }
}

impl AgentConfig {
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

    /// Validate configuration
    pub fn validate(&self) -> TaasResult<()> {
        if self.agent.host.trim().is_empty() {
            return Err(TaasError::invalid_config("agent.host", "must not be empty"));
        }

        let ovs = &self.ovs;
        if ovs.access_bridge.is_empty() || ovs.collection_bridge.is_empty() {
            return Err(TaasError::invalid_config(
                "ovs",
                "bridge names must not be empty",
            ));
        }
        if ovs.access_bridge == ovs.collection_bridge {
            return Err(TaasError::invalid_config(
                "ovs.collection_bridge",
                "must differ from access_bridge",
            ));
        }
        if ovs.access_patch_port == ovs.collection_patch_port {
            return Err(TaasError::invalid_config(
                "ovs.collection_patch_port",
                "must differ from access_patch_port",
            ));
        }
        for (field, name) in [
            ("ovs.access_bridge", &ovs.access_bridge),
            ("ovs.collection_bridge", &ovs.collection_bridge),
            ("ovs.access_patch_port", &ovs.access_patch_port),
            ("ovs.collection_patch_port", &ovs.collection_patch_port),
        ] {
            if name.is_empty() || name.len() > MAX_IFNAME_LEN {
                return Err(TaasError::invalid_config(
                    field,
                    format!("'{}' is not a valid interface name", name),
                ));
            }
        }

        Ok(())
    }
}
