//! Test fixtures for tap services, tap flows and their intents.

use std::net::{IpAddr, Ipv4Addr};

use taas_common::intent::{FlowIntent, Intent, ServiceIntent};
use taas_common::model::{
    Direction, HostEndpoint, PortBinding, PortInfo, Status, TapFlow, TapService, VnicType,
};

pub const COMPUTE_1: &str = "compute-1";
pub const COMPUTE_2: &str = "compute-2";
pub const COMPUTE_3: &str = "compute-3";

/// Host endpoint with tunnel address `10.0.0.<octet>`.
pub fn host(name: &str, octet: u8) -> HostEndpoint {
    HostEndpoint::new(name, IpAddr::V4(Ipv4Addr::new(10, 0, 0, octet)))
}

pub fn compute_1() -> HostEndpoint {
    host(COMPUTE_1, 1)
}

pub fn compute_2() -> HostEndpoint {
    host(COMPUTE_2, 2)
}

pub fn compute_3() -> HostEndpoint {
    host(COMPUTE_3, 3)
}

/// Virtual-switch port.
pub fn port(id: &str, mac: &str) -> PortInfo {
    PortInfo::new(id, mac)
}

/// SR-IOV VF port backed by `pci_slot`.
pub fn sriov_port(id: &str, mac: &str, pci_slot: &str) -> PortInfo {
    PortInfo {
        id: id.to_string(),
        mac_address: mac.to_string(),
        vnic_type: VnicType::Direct,
        binding: PortBinding {
            pci_slot: Some(pci_slot.to_string()),
            ..Default::default()
        },
    }
}

/// Sets binding VLAN details on an SR-IOV port.
pub fn with_binding(
    mut port: PortInfo,
    vlan: Option<&str>,
    guest_vlans: Option<&str>,
    vlan_mirror: Option<&str>,
) -> PortInfo {
    port.binding.vlan = vlan.map(str::to_string);
    port.binding.guest_vlans = guest_vlans.map(str::to_string);
    port.binding.vlan_mirror = vlan_mirror.map(str::to_string);
    port
}

pub fn tap_service(id: &str, collection_port_id: &str, taas_id: u16) -> TapService {
    TapService {
        id: id.to_string(),
        collection_port_id: collection_port_id.to_string(),
        status: Status::Active,
        taas_id,
    }
}

/// Service intent for `port` on `host`.
pub fn service_intent(service_id: &str, port: &PortInfo, taas_id: u16, host: &str) -> ServiceIntent {
    ServiceIntent {
        tap_service: tap_service(service_id, &port.id, taas_id),
        port: Some(port.clone()),
        host: host.to_string(),
    }
}

pub fn create_service(service_id: &str, port: &PortInfo, taas_id: u16, host: &str) -> Intent {
    Intent::CreateTapService(service_intent(service_id, port, taas_id, host))
}

pub fn delete_service(service_id: &str, port: &PortInfo, taas_id: u16, host: &str) -> Intent {
    Intent::DeleteTapService(service_intent(service_id, port, taas_id, host))
}

/// Builder for [`FlowIntent`].
///
/// Defaults: direction `BOTH`, source and collection ports both on
/// compute-1, no VLAN filter.
#[derive(Debug, Clone)]
pub struct FlowIntentBuilder {
    intent: FlowIntent,
}

impl FlowIntentBuilder {
    pub fn new(flow_id: &str, tap_service_id: &str, taas_id: u16) -> Self {
        let source_port = port("port-src", "fa:16:3e:00:00:01");
        Self {
            intent: FlowIntent {
                tap_flow: TapFlow {
                    id: flow_id.to_string(),
                    tap_service_id: tap_service_id.to_string(),
                    source_port_id: source_port.id.clone(),
                    direction: Direction::Both,
                    status: Status::Active,
                    vlan_filter: None,
                },
                taas_id,
                source_port,
                collection_port: port("port-col", "fa:16:3e:00:00:02"),
                source_host: compute_1(),
                service_host: compute_1(),
                remaining_mirror_vlans: Vec::new(),
            },
        }
    }

    pub fn source(mut self, port: PortInfo, host: HostEndpoint) -> Self {
        self.intent.tap_flow.source_port_id = port.id.clone();
        self.intent.source_port = port;
        self.intent.source_host = host;
        self
    }

    pub fn collection(mut self, port: PortInfo, host: HostEndpoint) -> Self {
        self.intent.collection_port = port;
        self.intent.service_host = host;
        self
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.intent.tap_flow.direction = direction;
        self
    }

    pub fn vlan_filter(mut self, filter: &str) -> Self {
        self.intent.tap_flow.vlan_filter = Some(filter.to_string());
        self
    }

    pub fn remaining_mirror_vlans<I, S>(mut self, vlans: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.intent.remaining_mirror_vlans = vlans.into_iter().map(Into::into).collect();
        self
    }

    pub fn build(self) -> FlowIntent {
        self.intent
    }

    pub fn create(self) -> Intent {
        Intent::CreateTapFlow(self.intent)
    }

    pub fn delete(self) -> Intent {
        Intent::DeleteTapFlow(self.intent)
    }
}
