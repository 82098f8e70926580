//! Intent messages delivered from the control node to host agents.
//!
//! Each intent carries the fully resolved records; agents never look
//! anything up in the object store.

use serde::{Deserialize, Serialize};

use crate::model::{HostEndpoint, PortInfo, TapFlow, TapService};

/// A tap-service create/delete request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceIntent {
    pub tap_service: TapService,
    /// Collection port. May be absent on delete if the port is gone.
    #[serde(default)]
    pub port: Option<PortInfo>,
    /// Host owning the collection port.
    pub host: String,
}

impl ServiceIntent {
    pub fn taas_id(&self) -> u16 {
        self.tap_service.taas_id
    }
}

/// A tap-flow create/delete request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowIntent {
    pub tap_flow: TapFlow,
    pub taas_id: u16,
    pub source_port: PortInfo,
    pub collection_port: PortInfo,
    pub source_host: HostEndpoint,
    pub service_host: HostEndpoint,
    /// Mirrored VLANs of each other flow still mirroring to the same
    /// collection port, already narrowed by that flow's filter. Only
    /// meaningful on SR-IOV deletes.
    #[serde(default)]
    pub remaining_mirror_vlans: Vec<String>,
}

impl FlowIntent {
    /// Returns true if source and collection ports live on different hosts.
    pub fn is_cross_host(&self) -> bool {
        self.source_host.host != self.service_host.host
    }

    /// The tunnel peer of `host`, if the flow crosses hosts.
    pub fn remote_of(&self, host: &str) -> Option<&HostEndpoint> {
        if !self.is_cross_host() {
            None
        } else if self.source_host.host == host {
            Some(&self.service_host)
        } else if self.service_host.host == host {
            Some(&self.source_host)
        } else {
            None
        }
    }
}

/// A control-plane request for one host agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Intent {
    CreateTapService(ServiceIntent),
    DeleteTapService(ServiceIntent),
    CreateTapFlow(FlowIntent),
    DeleteTapFlow(FlowIntent),
}

impl Intent {
    /// Operation name for logging.
    pub fn op(&self) -> &'static str {
        match self {
            Intent::CreateTapService(_) => "create_tap_service",
            Intent::DeleteTapService(_) => "delete_tap_service",
            Intent::CreateTapFlow(_) => "create_tap_flow",
            Intent::DeleteTapFlow(_) => "delete_tap_flow",
        }
    }

    /// Identifier of the tap service or tap flow the intent targets.
    pub fn object_id(&self) -> &str {
        match self {
            Intent::CreateTapService(s) | Intent::DeleteTapService(s) => &s.tap_service.id,
            Intent::CreateTapFlow(f) | Intent::DeleteTapFlow(f) => &f.tap_flow.id,
        }
    }

    /// Returns true if `host` has work to do for this intent.
    pub fn concerns_host(&self, host: &str) -> bool {
        match self {
            Intent::CreateTapService(s) | Intent::DeleteTapService(s) => s.host == host,
            Intent::CreateTapFlow(f) | Intent::DeleteTapFlow(f) => {
                f.source_host.host == host || f.service_host.host == host
            }
        }
    }
}
