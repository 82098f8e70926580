//! Switch-control collaborator interface.
//!
//! The flow controller drives a virtual switch exclusively through
//! [`SwitchControl`]. Every primitive is independently atomic; callers
//! serialize sequences that must appear atomic together.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TaasResult;
use crate::flow::{FlowMatch, FlowRule};

/// A virtual interface attached to a bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VifPort {
    /// Port/interface name (e.g. `tap1234`).
    pub port_name: String,
    /// OpenFlow port number.
    pub ofport: u32,
    /// Logical port identifier (`external_ids:iface-id`).
    pub iface_id: String,
    /// MAC address (`external_ids:attached-mac`).
    pub mac: String,
    /// Bridge the port is attached to.
    pub bridge: String,
}

/// Description of a port to attach to a bridge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortSpec {
    pub name: String,
    /// Interface `external_ids` to set (iface-id, attached-mac, ...).
    pub external_ids: BTreeMap<String, String>,
    /// Port `other_config` metadata to set.
    pub metadata: BTreeMap<String, String>,
}

impl PortSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Carries over the identity of an existing VIF.
    pub fn from_vif(vif: &VifPort) -> Self {
        let mut spec = Self::new(vif.port_name.clone());
        spec.external_ids
            .insert("iface-id".to_string(), vif.iface_id.clone());
        spec.external_ids
            .insert("attached-mac".to_string(), vif.mac.clone());
        spec
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Tunnel encapsulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelType {
    #[default]
    Vxlan,
    Gre,
    Geneve,
}

impl TunnelType {
    /// OVSDB interface type.
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelType::Vxlan => "vxlan",
            TunnelType::Gre => "gre",
            TunnelType::Geneve => "geneve",
        }
    }

    /// Two-letter tag used in tunnel port names.
    pub fn short_name(&self) -> &'static str {
        match self {
            TunnelType::Vxlan => "vx",
            TunnelType::Gre => "gr",
            TunnelType::Geneve => "gn",
        }
    }
}

impl fmt::Display for TunnelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tunnel port towards one remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    pub name: String,
    pub tunnel_type: TunnelType,
    pub local_ip: Option<IpAddr>,
    pub remote_ip: IpAddr,
}

/// Primitives of a virtual switch.
#[async_trait]
pub trait SwitchControl: Send + Sync {
    /// Creates `bridge` if it does not exist.
    async fn ensure_bridge(&self, bridge: &str) -> TaasResult<()>;

    /// Adds a patch port on `bridge` peered with `peer`. Idempotent.
    async fn add_patch_port(&self, bridge: &str, name: &str, peer: &str) -> TaasResult<()>;

    /// Attaches a port to `bridge`, moving it if already attached elsewhere.
    async fn add_port(&self, bridge: &str, port: &PortSpec) -> TaasResult<()>;

    /// Detaches a port. Absent ports are ignored.
    async fn delete_port(&self, bridge: &str, name: &str) -> TaasResult<()>;

    /// Adds a tunnel port. Idempotent.
    async fn add_tunnel_port(&self, bridge: &str, tunnel: &TunnelSpec) -> TaasResult<()>;

    /// Returns the OpenFlow port number of `name`, if attached.
    async fn get_port_ofport(&self, name: &str) -> TaasResult<Option<u32>>;

    /// Finds the VIF whose iface-id is `port_id` on `bridge`.
    async fn get_vif_port(&self, bridge: &str, port_id: &str) -> TaasResult<Option<VifPort>>;

    async fn get_port_tag(&self, name: &str) -> TaasResult<Option<u16>>;

    /// Sets or clears the access VLAN tag.
    async fn set_port_tag(&self, name: &str, tag: Option<u16>) -> TaasResult<()>;

    /// Reads one `other_config` key of a port.
    async fn get_port_metadata(&self, name: &str, key: &str) -> TaasResult<Option<String>>;

    /// Installs or replaces the rule with the same table, priority and match.
    async fn add_flow(&self, bridge: &str, rule: &FlowRule) -> TaasResult<()>;

    /// Deletes rules in `table`.
    ///
    /// With a priority the delete is strict: only the rule with exactly that
    /// priority and match goes. Without one, every rule whose match
    /// includes `matches` goes.
    async fn delete_flows(
        &self,
        bridge: &str,
        table: u8,
        priority: Option<u16>,
        matches: &FlowMatch,
    ) -> TaasResult<()>;

    /// Lists the rules of `bridge`, optionally restricted to one table.
    async fn dump_flows(&self, bridge: &str, table: Option<u8>) -> TaasResult<Vec<FlowRule>>;
}
