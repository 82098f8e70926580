//! Tap service / tap flow records and the port details carried with them.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Which traffic of a source port is mirrored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    /// Traffic delivered to the port.
    In,
    /// Traffic sent by the port.
    Out,
    /// Both directions.
    Both,
}

impl Direction {
    /// Returns true if traffic leaving the source port is mirrored.
    pub fn mirrors_egress(&self) -> bool {
        matches!(self, Direction::Out | Direction::Both)
    }

    /// Returns true if traffic arriving at the source port is mirrored.
    pub fn mirrors_ingress(&self) -> bool {
        matches!(self, Direction::In | Direction::Both)
    }

    /// Wire name ("IN", "OUT", "BOTH").
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "IN",
            Direction::Out => "OUT",
            Direction::Both => "BOTH",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a tap service or tap flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Active,
    Down,
    Error,
    #[default]
    PendingCreate,
    PendingDelete,
}

/// A mirroring destination: a collection port and its VLAN tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapService {
    pub id: String,
    pub collection_port_id: String,
    #[serde(default)]
    pub status: Status,
    /// VLAN tag classifying this service's mirrored traffic.
    pub taas_id: u16,
}

/// A mirroring source bound to a tap service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapFlow {
    pub id: String,
    pub tap_service_id: String,
    pub source_port_id: String,
    pub direction: Direction,
    #[serde(default)]
    pub status: Status,
    /// VLAN range string restricting mirrored VLANs (SR-IOV only).
    #[serde(default)]
    pub vlan_filter: Option<String>,
}

impl TapFlow {
    /// VLAN filter narrowing what is mirrored onto `collection`: the flow's
    /// own, else the collection port's `vlan_mirror`. `None` means the flow
    /// mirrors VF to VF without a VLAN filter.
    pub fn mirror_filter<'a>(&'a self, collection: &'a PortInfo) -> Option<&'a str> {
        self.vlan_filter
            .as_deref()
            .or(collection.binding.vlan_mirror.as_deref())
            .filter(|f| !f.trim().is_empty())
    }
}

/// How a port is attached to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VnicType {
    /// Virtual switch port.
    #[default]
    Normal,
    /// SR-IOV virtual function passed through to the guest.
    Direct,
}

/// Binding details of a port as resolved by the control node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PortBinding {
    /// PCI address of the VF backing the port.
    #[serde(default)]
    pub pci_slot: Option<String>,
    /// VLANs a collection VF accepts for mirroring.
    #[serde(default)]
    pub vlan_mirror: Option<String>,
    /// Guest VLANs of a trunk VF.
    #[serde(default)]
    pub guest_vlans: Option<String>,
    /// VLAN of the port's network; `"0"` means the guest tags its own.
    #[serde(default)]
    pub vlan: Option<String>,
}

/// A port as carried inside an intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub id: String,
    pub mac_address: String,
    #[serde(default)]
    pub vnic_type: VnicType,
    #[serde(default)]
    pub binding: PortBinding,
}

impl PortInfo {
    /// Creates a virtual-switch port.
    pub fn new(id: impl Into<String>, mac_address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            mac_address: mac_address.into(),
            vnic_type: VnicType::Normal,
            binding: PortBinding::default(),
        }
    }

    /// Returns true if the port is an SR-IOV virtual function.
    pub fn is_sriov(&self) -> bool {
        self.vnic_type == VnicType::Direct
    }

    /// VLANs carried by this port as a source. `None` means every VLAN.
    pub fn source_vlans(&self) -> Option<&str> {
        match self.binding.vlan.as_deref() {
            Some("0") => self.binding.guest_vlans.as_deref(),
            other => other,
        }
    }
}

/// A host and the address its tunnels terminate on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostEndpoint {
    pub host: String,
    pub tunnel_ip: IpAddr,
}

impl HostEndpoint {
    pub fn new(host: impl Into<String>, tunnel_ip: IpAddr) -> Self {
        Self {
            host: host.into(),
            tunnel_ip,
        }
    }
}
