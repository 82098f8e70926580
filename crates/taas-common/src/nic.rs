//! NIC-control and PCI-lookup collaborator interfaces for SR-IOV mirroring.

use std::fmt;

use async_trait::async_trait;

use crate::error::TaasResult;

/// Whether a mirror setting is added or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MirrorOp {
    Add,
    Remove,
}

impl MirrorOp {
    /// Verb accepted by the driver's sysfs interface.
    pub fn as_str(&self) -> &'static str {
        match self {
            MirrorOp::Add => "add",
            MirrorOp::Remove => "rem",
        }
    }
}

/// Traffic direction of a VF-to-VF mirror, relative to the source VF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VfDirection {
    Ingress,
    Egress,
}

impl VfDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            VfDirection::Ingress => "ingress",
            VfDirection::Egress => "egress",
        }
    }
}

/// What a mirror command configures.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MirrorTarget {
    /// Mirror the listed VLANs of the PF onto `collection_vf`.
    Vlans { collection_vf: u16, vlans: String },
    /// Mirror all of `source_vf`'s traffic in `direction` onto
    /// `collection_vf`.
    Vf {
        source_vf: u16,
        collection_vf: u16,
        direction: VfDirection,
    },
}

/// One mirror configuration change on a physical function.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MirrorCommand {
    /// Net device of the PF (e.g. `p1p1`).
    pub pf_device: String,
    pub op: MirrorOp,
    pub target: MirrorTarget,
}

impl MirrorCommand {
    pub fn vlans(
        pf_device: impl Into<String>,
        op: MirrorOp,
        collection_vf: u16,
        vlans: impl Into<String>,
    ) -> Self {
        Self {
            pf_device: pf_device.into(),
            op,
            target: MirrorTarget::Vlans {
                collection_vf,
                vlans: vlans.into(),
            },
        }
    }

    pub fn vf(
        pf_device: impl Into<String>,
        op: MirrorOp,
        source_vf: u16,
        collection_vf: u16,
        direction: VfDirection,
    ) -> Self {
        Self {
            pf_device: pf_device.into(),
            op,
            target: MirrorTarget::Vf {
                source_vf,
                collection_vf,
                direction,
            },
        }
    }
}

impl fmt::Display for MirrorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            MirrorTarget::Vlans {
                collection_vf,
                vlans,
            } => write!(
                f,
                "{} vlan_mirror {} on {} vf {}",
                self.op.as_str(),
                vlans,
                self.pf_device,
                collection_vf
            ),
            MirrorTarget::Vf {
                source_vf,
                collection_vf,
                direction,
            } => write!(
                f,
                "{} {}_mirror {} on {} vf {}",
                self.op.as_str(),
                direction.as_str(),
                collection_vf,
                self.pf_device,
                source_vf
            ),
        }
    }
}

/// Applies mirror configuration on SR-IOV NICs.
#[async_trait]
pub trait NicControl: Send + Sync {
    async fn set_mirror(&self, command: &MirrorCommand) -> TaasResult<()>;
}

/// Resolves PCI addresses of virtual functions.
#[async_trait]
pub trait PciLookup: Send + Sync {
    /// Index of the VF at `pci_addr` under its physical function.
    async fn vf_index(&self, pci_addr: &str) -> TaasResult<u16>;

    /// Net device name of the PF owning the VF at `pci_addr`.
    async fn pf_device(&self, pci_addr: &str) -> TaasResult<String>;
}
