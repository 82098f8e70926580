//! SR-IOV Mirror Programmer.
//!
//! Mirrors between virtual functions of one physical NIC by writing mirror
//! settings through the NIC driver. Two modes exist per flow:
//!
//! - VLAN mode, when the collection side declares a VLAN filter: the VLANs
//!   common to the source port and the filter are mirrored onto the
//!   collection VF with the `vlan_mirror` command.
//! - VF-to-VF mode, when no filter is declared: every packet of the source
//!   VF in the flow's direction(s) is mirrored with the per-direction
//!   `ingress_mirror` / `egress_mirror` commands.
//!
//! The VLAN command sets state per collection VF rather than per flow, so a
//! delete clears the VF and re-applies what the remaining flows need.

use std::sync::Arc;

use taas_common::intent::{FlowIntent, ServiceIntent};
use taas_common::model::{Direction, PortInfo};
use taas_common::nic::{MirrorCommand, MirrorOp, NicControl, PciLookup, VfDirection};
use taas_common::vlan_range::{self, VlanSet};
use taas_common::{TaasError, TaasResult};
use tracing::{debug, info, warn};

/// A port's virtual function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfEndpoint {
    pub pci_slot: String,
    pub vf_index: u16,
    pub pf_device: String,
}

/// Both ends of a flow, checked to share one physical function.
struct VfPair {
    source: VfEndpoint,
    collection: VfEndpoint,
}

impl VfPair {
    fn pf_device(&self) -> &str {
        &self.collection.pf_device
    }
}

fn vf_directions(direction: Direction) -> Vec<VfDirection> {
    let mut dirs = Vec::with_capacity(2);
    if direction.mirrors_ingress() {
        dirs.push(VfDirection::Ingress);
    }
    if direction.mirrors_egress() {
        dirs.push(VfDirection::Egress);
    }
    dirs
}

/// Collection-side VLAN filter of a flow, `None` selecting VF-to-VF mode.
fn collection_filter(intent: &FlowIntent) -> Option<&str> {
    intent.tap_flow.mirror_filter(&intent.collection_port)
}

/// A VF that cannot be resolved any more has nothing left to clean up.
fn gone_on_delete(port: &PortInfo, err: TaasError) -> TaasError {
    match err {
        TaasError::PciSlotNotFound { .. } | TaasError::PciDeviceNotFound { .. } => {
            TaasError::port_not_found(&port.id)
        }
        other => other,
    }
}

pub struct SriovProgrammer {
    nic: Arc<dyn NicControl>,
    pci: Arc<dyn PciLookup>,
}

impl SriovProgrammer {
    pub fn new(nic: Arc<dyn NicControl>, pci: Arc<dyn PciLookup>) -> Self {
        Self { nic, pci }
    }

    /// Resolves the VF behind a port's PCI slot.
    pub async fn resolve_vf(&self, port: &PortInfo) -> TaasResult<VfEndpoint> {
        let pci_slot = port
            .binding
            .pci_slot
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| TaasError::pci_slot_not_found(&port.id, &port.mac_address))?;

        let vf_index = self.pci.vf_index(pci_slot).await?;
        let pf_device = self.pci.pf_device(pci_slot).await?;
        Ok(VfEndpoint {
            pci_slot: pci_slot.to_string(),
            vf_index,
            pf_device,
        })
    }

    async fn resolve_end(&self, port: &PortInfo, deleting: bool) -> TaasResult<VfEndpoint> {
        match self.resolve_vf(port).await {
            Err(e) if deleting => Err(gone_on_delete(port, e)),
            result => result,
        }
    }

    /// Resolves both VFs. When `deleting`, a VF that no longer resolves is
    /// reported as its port being gone.
    async fn resolve_pair(&self, intent: &FlowIntent, deleting: bool) -> TaasResult<VfPair> {
        let source = self.resolve_end(&intent.source_port, deleting).await?;
        let collection = self.resolve_end(&intent.collection_port, deleting).await?;
        if source.pf_device != collection.pf_device {
            return Err(TaasError::MismatchedPhysicalFunction {
                source_pf: source.pf_device,
                collection_pf: collection.pf_device,
            });
        }
        Ok(VfPair { source, collection })
    }

    /// Validates the collection VF. The NIC holds no per-service state.
    pub async fn create_tap_service(&self, intent: &ServiceIntent) -> TaasResult<()> {
        self.log_service("create", intent).await
    }

    pub async fn delete_tap_service(&self, intent: &ServiceIntent) -> TaasResult<()> {
        self.log_service("delete", intent).await
    }

    async fn log_service(&self, action: &str, intent: &ServiceIntent) -> TaasResult<()> {
        let port = intent.port.as_ref().ok_or_else(|| {
            TaasError::invalid_intent(format!(
                "tap service {} carries no collection port",
                intent.tap_service.id
            ))
        })?;
        let vf = self.resolve_vf(port).await?;
        info!(
            tap_service = %intent.tap_service.id,
            action,
            pf_device = %vf.pf_device,
            vf = vf.vf_index,
            pci_slot = %vf.pci_slot,
            vlan_mirror = ?port.binding.vlan_mirror,
            "SR-IOV tap service"
        );
        Ok(())
    }

    /// Programs the NIC to mirror the source VF onto the collection VF.
    ///
    /// Fails with `MismatchedPhysicalFunction` when the VFs sit on different
    /// NICs; callers treat that as a rejection.
    pub async fn create_tap_flow(&self, intent: &FlowIntent) -> TaasResult<()> {
        let pair = self.resolve_pair(intent, false).await?;
        let flow_id = &intent.tap_flow.id;
        let direction = intent.tap_flow.direction;

        let Some(filter) = collection_filter(intent) else {
            debug!(flow_id = %flow_id, direction = %direction, "VF to VF mirroring for all VLANs");
            for dir in vf_directions(direction) {
                self.nic
                    .set_mirror(&MirrorCommand::vf(
                        pair.pf_device(),
                        MirrorOp::Add,
                        pair.source.vf_index,
                        pair.collection.vf_index,
                        dir,
                    ))
                    .await?;
            }
            info!(
                flow_id = %flow_id,
                pf_device = %pair.pf_device(),
                vf = pair.source.vf_index,
                "SR-IOV VF mirror created"
            );
            return Ok(());
        };

        if direction != Direction::Both {
            warn!(
                flow_id = %flow_id,
                direction = %direction,
                "VLAN mirroring always covers both directions"
            );
        }

        let common = vlan_range::common(intent.source_port.source_vlans(), Some(filter))?;
        if common.is_empty() {
            warn!(
                flow_id = %flow_id,
                source_vlans = ?intent.source_port.source_vlans(),
                vlan_filter = filter,
                "No VLANs in common, nothing to mirror"
            );
            return Ok(());
        }

        let vlans = vlan_range::format(common);
        self.nic
            .set_mirror(&MirrorCommand::vlans(
                pair.pf_device(),
                MirrorOp::Add,
                pair.collection.vf_index,
                vlans.clone(),
            ))
            .await?;
        info!(
            flow_id = %flow_id,
            pf_device = %pair.pf_device(),
            vf = pair.collection.vf_index,
            vlans = %vlans,
            "SR-IOV VLAN mirror created"
        );
        Ok(())
    }

    /// Removes a flow's mirror.
    ///
    /// In VLAN mode the collection VF is cleared and the VLANs still
    /// mirrored by the remaining flows on it are applied again; only the
    /// collection VF is resolved. A VF that no longer resolves is reported
    /// as a port already gone.
    pub async fn delete_tap_flow(&self, intent: &FlowIntent) -> TaasResult<()> {
        let flow_id = &intent.tap_flow.id;

        if collection_filter(intent).is_none() {
            let pair = self.resolve_pair(intent, true).await?;
            for dir in vf_directions(intent.tap_flow.direction) {
                self.nic
                    .set_mirror(&MirrorCommand::vf(
                        pair.pf_device(),
                        MirrorOp::Remove,
                        pair.source.vf_index,
                        pair.collection.vf_index,
                        dir,
                    ))
                    .await?;
            }
            info!(flow_id = %flow_id, vf = pair.source.vf_index, "SR-IOV VF mirror deleted");
            return Ok(());
        }

        let collection = self.resolve_end(&intent.collection_port, true).await?;
        self.nic
            .set_mirror(&MirrorCommand::vlans(
                &collection.pf_device,
                MirrorOp::Remove,
                collection.vf_index,
                vlan_range::ALL_VLANS,
            ))
            .await?;

        let reapply = remaining_vlans(&intent.remaining_mirror_vlans)?;
        if !reapply.is_empty() {
            self.nic
                .set_mirror(&MirrorCommand::vlans(
                    &collection.pf_device,
                    MirrorOp::Add,
                    collection.vf_index,
                    vlan_range::format(reapply.iter().copied()),
                ))
                .await?;
        }

        info!(
            flow_id = %flow_id,
            vf = collection.vf_index,
            remaining = %vlan_range::format(reapply),
            "SR-IOV VLAN mirror deleted"
        );
        Ok(())
    }
}

/// Union of the VLANs mirrored by the flows left on a collection VF.
fn remaining_vlans(ranges: &[String]) -> TaasResult<VlanSet> {
    let mut vlans = VlanSet::new();
    for range in ranges.iter().filter(|r| !r.trim().is_empty()) {
        vlans.extend(vlan_range::parse(range)?);
    }
    Ok(vlans)
}
