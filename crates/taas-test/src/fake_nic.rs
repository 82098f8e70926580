//! In-memory SR-IOV NIC and PCI lookup.
//!
//! [`FakeNic`] records every mirror command and keeps the resulting mirror
//! state per physical function, so tests can assert both what was issued
//! and what the NIC ends up mirroring.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use taas_common::nic::{MirrorCommand, MirrorOp, MirrorTarget, NicControl, PciLookup, VfDirection};
use taas_common::vlan_range::{self, VlanSet};
use taas_common::{TaasError, TaasResult};

#[derive(Debug, Default)]
struct NicState {
    commands: Vec<MirrorCommand>,
    /// (pf, collection vf) -> mirrored VLANs.
    vlan_mirrors: BTreeMap<(String, u16), VlanSet>,
    /// (pf, source vf) -> (direction, collection vf).
    vf_mirrors: HashMap<(String, u16), Vec<(VfDirection, u16)>>,
    fail_remaining: usize,
}

#[derive(Debug, Default)]
pub struct FakeNic {
    state: Mutex<NicState>,
}

impl FakeNic {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NicState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes the next `count` commands fail.
    pub fn fail_next(&self, count: usize) {
        self.lock().fail_remaining = count;
    }

    /// Every command issued, in order.
    pub fn commands(&self) -> Vec<MirrorCommand> {
        self.lock().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.lock().commands.clear();
    }

    /// VLANs currently mirrored onto `collection_vf`.
    pub fn vlan_mirror(&self, pf: &str, collection_vf: u16) -> VlanSet {
        self.lock()
            .vlan_mirrors
            .get(&(pf.to_string(), collection_vf))
            .cloned()
            .unwrap_or_default()
    }

    /// VF-to-VF mirrors configured on `source_vf`.
    pub fn vf_mirrors(&self, pf: &str, source_vf: u16) -> Vec<(VfDirection, u16)> {
        self.lock()
            .vf_mirrors
            .get(&(pf.to_string(), source_vf))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl NicControl for FakeNic {
    async fn set_mirror(&self, command: &MirrorCommand) -> TaasResult<()> {
        let mut state = self.lock();
        state.commands.push(command.clone());
        if state.fail_remaining > 0 {
            state.fail_remaining -= 1;
            return Err(TaasError::nic_control(command.to_string(), "injected failure"));
        }

        match &command.target {
            MirrorTarget::Vlans {
                collection_vf,
                vlans,
            } => {
                let vlans = vlan_range::parse(vlans)?;
                let entry = state
                    .vlan_mirrors
                    .entry((command.pf_device.clone(), *collection_vf))
                    .or_default();
                match command.op {
                    MirrorOp::Add => entry.extend(vlans),
                    MirrorOp::Remove => entry.retain(|v| !vlans.contains(v)),
                }
            }
            MirrorTarget::Vf {
                source_vf,
                collection_vf,
                direction,
            } => {
                let entry = state
                    .vf_mirrors
                    .entry((command.pf_device.clone(), *source_vf))
                    .or_default();
                let mirror = (*direction, *collection_vf);
                match command.op {
                    MirrorOp::Add => {
                        if !entry.contains(&mirror) {
                            entry.push(mirror);
                        }
                    }
                    MirrorOp::Remove => entry.retain(|m| *m != mirror),
                }
            }
        }
        Ok(())
    }
}

/// PCI address table: address -> (VF index, PF net device).
#[derive(Debug, Default)]
pub struct FakePci {
    devices: BTreeMap<String, (u16, String)>,
}

impl FakePci {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vf(mut self, pci_addr: &str, vf_index: u16, pf_device: &str) -> Self {
        self.devices
            .insert(pci_addr.to_string(), (vf_index, pf_device.to_string()));
        self
    }

    /// Addresses known to the table.
    pub fn addresses(&self) -> BTreeSet<String> {
        self.devices.keys().cloned().collect()
    }
}

#[async_trait]
impl PciLookup for FakePci {
    async fn vf_index(&self, pci_addr: &str) -> TaasResult<u16> {
        self.devices
            .get(pci_addr)
            .map(|(vf, _)| *vf)
            .ok_or_else(|| TaasError::pci_device_not_found(pci_addr))
    }

    async fn pf_device(&self, pci_addr: &str) -> TaasResult<String> {
        self.devices
            .get(pci_addr)
            .map(|(_, pf)| pf.clone())
            .ok_or_else(|| TaasError::pci_device_not_found(pci_addr))
    }
}
