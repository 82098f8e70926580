//! Flow Controller: the virtual-switch mirroring backend.
//!
//! Each host runs two cooperating bridges joined by a patch-port pair:
//!
//! - The **access** bridge carries VM traffic. Mirror rules in table 0
//!   forward a source's packets as usual and also send a copy, tagged with
//!   the tap service's taas_id, out of the patch port.
//! - The **collection** bridge carries mirrored traffic only. Table 0
//!   classifies where a copy came from (local patch or a tunnel from another
//!   host), table 1 delivers it by taas_id: to the collection port when the
//!   tap service lives here, or into the tunnel towards the host that owns
//!   it. Everything else is dropped.
//!
//! Shared rules are derived from [`Affiliations`] rather than installed per
//! flow: a mirror rule's action list always lists every taas_id currently
//! affiliated with its key, and the rule disappears when the last
//! affiliation does. The same holds for tunnels: a tunnel port lives while
//! any flow names its remote host.
//!
//! All bookkeeping and the switch calls derived from it happen under one
//! mutex per controller.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use itertools::Itertools;
use taas_common::affiliation::Affiliations;
use taas_common::flow::{FlowMatch, FlowRule};
use taas_common::intent::{FlowIntent, ServiceIntent};
use taas_common::model::{Direction, HostEndpoint};
use taas_common::switch::{PortSpec, SwitchControl, TunnelSpec, TunnelType};
use taas_common::{TaasError, TaasResult};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::forward::{ForwardAction, NormalForward};
use crate::tables::{
    priority, ACCESS_TABLE, COLLECTION_CLASSIFY_TABLE, COLLECTION_DELIVER_TABLE,
    ORIGINAL_TAG_KEY, TUNNEL_PORT_PREFIX,
};

/// Bridge names, patch ports and tunnel settings of one host.
#[derive(Debug, Clone)]
pub struct BridgeLayout {
    pub host: String,
    pub local_ip: Option<IpAddr>,
    pub access_bridge: String,
    pub collection_bridge: String,
    pub access_patch_port: String,
    pub collection_patch_port: String,
    pub tunnel_type: TunnelType,
}

impl BridgeLayout {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            host: config.agent.host.clone(),
            local_ip: config.agent.tunnel_ip,
            access_bridge: config.ovs.access_bridge.clone(),
            collection_bridge: config.ovs.collection_bridge.clone(),
            access_patch_port: config.ovs.access_patch_port.clone(),
            collection_patch_port: config.ovs.collection_patch_port.clone(),
            tunnel_type: config.ovs.tunnel_type,
        }
    }

    /// Default layout for `host`.
    pub fn for_host(host: &str) -> Self {
        let mut config = AgentConfig::default();
        config.agent.host = host.to_string();
        Self::from_config(&config)
    }
}

/// Name of the tunnel port towards `remote_ip`, e.g. `tvx-0a000002`.
///
/// IPv6 addresses are folded to 32 bits to stay within the 15-character
/// interface name limit.
pub fn tunnel_port_name(tunnel_type: TunnelType, remote_ip: IpAddr) -> String {
    let id = match remote_ip {
        IpAddr::V4(v4) => u32::from(v4),
        IpAddr::V6(v6) => v6
            .octets()
            .chunks(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .fold(0, |acc, word| acc ^ word),
    };
    format!("{}{}-{:08x}", TUNNEL_PORT_PREFIX, tunnel_type.short_name(), id)
}

/// Which end of a mirror tunnel this host is for a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TunnelRole {
    /// Holds the source port; copies leave through the tunnel.
    Sender,
    /// Holds the collection port; copies arrive through the tunnel.
    Receiver,
}

/// Source port details captured when a flow was applied.
#[derive(Debug, Clone)]
struct SourceBinding {
    ofport: u32,
    mac: String,
    vlan: Option<u16>,
}

/// What this host did for one tap flow.
#[derive(Debug, Clone)]
struct AppliedFlow {
    taas_id: u16,
    direction: Direction,
    source: Option<SourceBinding>,
    tunnel: Option<(TunnelRole, HostEndpoint)>,
}

#[derive(Default)]
struct ControllerState {
    /// Source ofport → taas_ids mirroring its egress traffic.
    egress: Affiliations<u32, u16>,
    /// Source MAC → taas_ids mirroring its unicast ingress traffic.
    ingress: Affiliations<String, u16>,
    /// Source VLAN → taas_ids mirroring broadcast/multicast on that VLAN.
    bcmc: Affiliations<u16, u16>,
    /// taas_id → (flow id, remote host) of flows crossing a tunnel.
    tunnels: Affiliations<u16, (String, String)>,
    /// Flows applied on this host, by flow id.
    applied: HashMap<String, AppliedFlow>,
    /// Tap services hosted here: service id → taas_id.
    services: HashMap<String, u16>,
}

/// Resolved pieces of an access-bridge mirror action list.
struct MirrorContext {
    forward: String,
    patch_ofport: u32,
}

impl MirrorContext {
    fn actions(&self, taas_ids: &BTreeSet<u16>) -> String {
        let clauses = taas_ids
            .iter()
            .map(|id| format!("mod_vlan_vid:{},output:{}", id, self.patch_ofport))
            .join(",");
        format!("{},{}", self.forward, clauses)
    }
}

/// Programs mirror state on the access and collection bridges of one host.
pub struct FlowController {
    switch: Arc<dyn SwitchControl>,
    forward: Arc<dyn ForwardAction>,
    layout: BridgeLayout,
    state: Mutex<ControllerState>,
}

impl FlowController {
    pub fn new(switch: Arc<dyn SwitchControl>, layout: BridgeLayout) -> Self {
        Self {
            switch,
            forward: Arc::new(NormalForward),
            layout,
            state: Mutex::new(ControllerState::default()),
        }
    }

    /// Replaces the strategy resolving the forward clause of mirror rules.
    pub fn with_forward_action(mut self, forward: Arc<dyn ForwardAction>) -> Self {
        self.forward = forward;
        self
    }

    pub fn layout(&self) -> &BridgeLayout {
        &self.layout
    }

    /// Number of flows currently applied on this host.
    pub async fn applied_flow_count(&self) -> usize {
        self.state.lock().await.applied.len()
    }

    /// Sets up the collection bridge and its fixed rules.
    ///
    /// Existing collection-bridge rules are purged; the agent expects the
    /// control node to re-push active services and flows afterwards.
    pub async fn initialize(&self) -> TaasResult<()> {
        let _state = self.state.lock().await;
        let l = &self.layout;

        self.switch.ensure_bridge(&l.collection_bridge).await?;
        self.switch
            .add_patch_port(&l.access_bridge, &l.access_patch_port, &l.collection_patch_port)
            .await?;
        self.switch
            .add_patch_port(&l.collection_bridge, &l.collection_patch_port, &l.access_patch_port)
            .await?;

        for table in [COLLECTION_CLASSIFY_TABLE, COLLECTION_DELIVER_TABLE] {
            self.switch
                .delete_flows(&l.collection_bridge, table, None, &FlowMatch::new())
                .await?;
        }

        let patch = self.required_ofport(&l.collection_patch_port).await?;
        self.switch
            .add_flow(
                &l.collection_bridge,
                &FlowRule::new(
                    COLLECTION_CLASSIFY_TABLE,
                    priority::FROM_PATCH,
                    FlowMatch::new().in_port(patch),
                    format!("resubmit(,{})", COLLECTION_DELIVER_TABLE),
                ),
            )
            .await?;
        self.ensure_default_drops().await?;

        info!(
            access_bridge = %l.access_bridge,
            collection_bridge = %l.collection_bridge,
            "Mirror bridges initialized"
        );
        Ok(())
    }

    async fn ensure_default_drops(&self) -> TaasResult<()> {
        for table in [COLLECTION_CLASSIFY_TABLE, COLLECTION_DELIVER_TABLE] {
            self.switch
                .add_flow(
                    &self.layout.collection_bridge,
                    &FlowRule::new(table, priority::DROP, FlowMatch::new(), "drop"),
                )
                .await?;
        }
        Ok(())
    }

    async fn required_ofport(&self, name: &str) -> TaasResult<u32> {
        self.switch.get_port_ofport(name).await?.ok_or_else(|| {
            TaasError::switch_control("get-ofport", format!("port {} is not attached", name))
        })
    }

    // ---- tap services ----

    /// Moves the collection port onto the collection bridge and delivers
    /// traffic tagged with the service's taas_id to it.
    pub async fn create_tap_service(&self, intent: &ServiceIntent) -> TaasResult<()> {
        let mut state = self.state.lock().await;
        let l = &self.layout;
        let taas_id = intent.taas_id();
        let port = intent.port.as_ref().ok_or_else(|| {
            TaasError::invalid_intent(format!(
                "tap service {} carries no collection port",
                intent.tap_service.id
            ))
        })?;

        let vif = match self.switch.get_vif_port(&l.access_bridge, &port.id).await? {
            Some(vif) => {
                let original_tag = self.switch.get_port_tag(&vif.port_name).await?;
                let mut spec = PortSpec::from_vif(&vif);
                if let Some(tag) = original_tag {
                    spec = spec.with_metadata(ORIGINAL_TAG_KEY, tag.to_string());
                }
                self.switch.add_port(&l.collection_bridge, &spec).await?;
                debug!(
                    port = %vif.port_name,
                    original_tag = ?original_tag,
                    "Collection port moved to collection bridge"
                );
                vif
            }
            None => self
                .switch
                .get_vif_port(&l.collection_bridge, &port.id)
                .await?
                .ok_or_else(|| TaasError::port_not_found(&port.id))?,
        };

        let ofport = self.required_ofport(&vif.port_name).await?;
        self.switch
            .add_flow(
                &l.collection_bridge,
                &FlowRule::new(
                    COLLECTION_DELIVER_TABLE,
                    priority::SERVICE,
                    FlowMatch::new().dl_vlan(taas_id),
                    format!("strip_vlan,output:{}", ofport),
                ),
            )
            .await?;
        self.ensure_default_drops().await?;

        state
            .services
            .insert(intent.tap_service.id.clone(), taas_id);
        info!(
            tap_service = %intent.tap_service.id,
            taas_id,
            port = %vif.port_name,
            "Tap service created"
        );
        Ok(())
    }

    /// Stops delivery for the service and returns the collection port to the
    /// access bridge with its original tag. A port that no longer exists is
    /// not an error.
    pub async fn delete_tap_service(&self, intent: &ServiceIntent) -> TaasResult<()> {
        let mut state = self.state.lock().await;
        let l = &self.layout;
        let taas_id = intent.taas_id();

        self.switch
            .delete_flows(
                &l.collection_bridge,
                COLLECTION_DELIVER_TABLE,
                Some(priority::SERVICE),
                &FlowMatch::new().dl_vlan(taas_id),
            )
            .await?;
        state.services.remove(&intent.tap_service.id);

        let port_id = intent
            .port
            .as_ref()
            .map(|p| p.id.as_str())
            .unwrap_or(intent.tap_service.collection_port_id.as_str());

        match self.return_port(port_id).await {
            Ok(()) => {}
            Err(e) if e.is_benign_on_delete() => {
                warn!(
                    tap_service = %intent.tap_service.id,
                    port = port_id,
                    "Collection port already gone"
                );
            }
            Err(e) => return Err(e),
        }

        info!(tap_service = %intent.tap_service.id, taas_id, "Tap service deleted");
        Ok(())
    }

    async fn return_port(&self, port_id: &str) -> TaasResult<()> {
        let l = &self.layout;
        let vif = self
            .switch
            .get_vif_port(&l.collection_bridge, port_id)
            .await?
            .ok_or_else(|| TaasError::port_not_found(port_id))?;

        let original_tag = self
            .switch
            .get_port_metadata(&vif.port_name, ORIGINAL_TAG_KEY)
            .await?
            .and_then(|tag| tag.parse::<u16>().ok());
        self.switch
            .add_port(&l.access_bridge, &PortSpec::from_vif(&vif))
            .await?;
        self.switch
            .set_port_tag(&vif.port_name, original_tag)
            .await?;
        debug!(port = %vif.port_name, tag = ?original_tag, "Collection port returned to access bridge");
        Ok(())
    }

    // ---- tap flows ----

    /// Installs the mirror rules for a flow on this host.
    ///
    /// Replaying an already applied flow re-derives its rules without
    /// touching affiliations.
    pub async fn create_tap_flow(&self, intent: &FlowIntent) -> TaasResult<()> {
        let mut state = self.state.lock().await;
        let flow_id = intent.tap_flow.id.clone();

        if let Some(applied) = state.applied.get(&flow_id).cloned() {
            debug!(flow_id = %flow_id, "Flow already applied, re-deriving rules");
            if let Some((_, remote)) = &applied.tunnel {
                self.ensure_tunnel_port(remote).await?;
            }
            return self.sync_flow_rules(&state, &applied).await;
        }

        let Some(applied) = self.resolve_flow(intent, true).await? else {
            debug!(flow_id = %flow_id, host = %self.layout.host, "Flow does not concern this host");
            return Ok(());
        };

        // Ports before the rules that reference them
        if let Some((_, remote)) = &applied.tunnel {
            self.ensure_tunnel_port(remote).await?;
        }

        Self::affiliate(&mut state, &flow_id, &applied);
        state.applied.insert(flow_id.clone(), applied.clone());
        self.sync_flow_rules(&state, &applied).await?;

        info!(
            flow_id = %flow_id,
            taas_id = applied.taas_id,
            direction = %applied.direction,
            tunnel = applied.tunnel.is_some(),
            "Tap flow created"
        );
        Ok(())
    }

    /// Removes a flow's contribution to the mirror rules on this host,
    /// tearing down shared rules and tunnels no other flow needs.
    pub async fn delete_tap_flow(&self, intent: &FlowIntent) -> TaasResult<()> {
        let mut state = self.state.lock().await;
        let flow_id = intent.tap_flow.id.clone();

        let applied = match state.applied.remove(&flow_id) {
            Some(applied) => {
                Self::unaffiliate(&mut state, &flow_id, &applied);
                applied
            }
            None => match self.resolve_flow(intent, false).await? {
                // Not applied here: converge the affected rules on what the
                // remaining affiliations say.
                Some(applied) => applied,
                None => return Ok(()),
            },
        };

        // Rules before the ports they reference
        self.sync_flow_rules(&state, &applied).await?;
        if let Some((_, remote)) = &applied.tunnel {
            if !state.tunnels.any_value(|(_, host)| *host == remote.host) {
                let name = tunnel_port_name(self.layout.tunnel_type, remote.tunnel_ip);
                self.switch
                    .delete_port(&self.layout.collection_bridge, &name)
                    .await?;
                debug!(port = %name, remote = %remote.host, "Tunnel port removed");
            }
        }

        info!(flow_id = %flow_id, taas_id = applied.taas_id, "Tap flow deleted");
        Ok(())
    }

    /// Works out what this host does for a flow. `None` if nothing.
    ///
    /// On create a missing source port is fatal; on delete it only means
    /// there are no source rules left to recompute.
    async fn resolve_flow(
        &self,
        intent: &FlowIntent,
        creating: bool,
    ) -> TaasResult<Option<AppliedFlow>> {
        let host = self.layout.host.as_str();
        let is_source = intent.source_host.host == host;
        let is_service = intent.service_host.host == host;
        if !is_source && !is_service {
            return Ok(None);
        }

        let source = if is_source {
            self.resolve_source(&intent.source_port.id, &intent.source_port.mac_address, creating)
                .await?
        } else {
            None
        };

        let tunnel = intent.remote_of(host).map(|remote| {
            let role = if is_source {
                TunnelRole::Sender
            } else {
                TunnelRole::Receiver
            };
            (role, remote.clone())
        });

        Ok(Some(AppliedFlow {
            taas_id: intent.taas_id,
            direction: intent.tap_flow.direction,
            source,
            tunnel,
        }))
    }

    async fn resolve_source(
        &self,
        port_id: &str,
        mac: &str,
        creating: bool,
    ) -> TaasResult<Option<SourceBinding>> {
        let vif = match self
            .switch
            .get_vif_port(&self.layout.access_bridge, port_id)
            .await?
        {
            Some(vif) => vif,
            None if creating => return Err(TaasError::port_not_found(port_id)),
            None => {
                warn!(port = port_id, "Source port already gone");
                return Ok(None);
            }
        };
        let vlan = self.switch.get_port_tag(&vif.port_name).await?;
        let mac = if mac.is_empty() { vif.mac } else { mac.to_string() };
        Ok(Some(SourceBinding {
            ofport: vif.ofport,
            mac,
            vlan,
        }))
    }

    fn affiliate(state: &mut ControllerState, flow_id: &str, applied: &AppliedFlow) {
        let taas_id = applied.taas_id;
        if let Some(source) = &applied.source {
            if applied.direction.mirrors_egress() {
                state.egress.affiliate(source.ofport, taas_id);
            }
            if applied.direction.mirrors_ingress() {
                state.ingress.affiliate(source.mac.clone(), taas_id);
                if let Some(vlan) = source.vlan {
                    state.bcmc.affiliate(vlan, taas_id);
                }
            }
        }
        if let Some((_, remote)) = &applied.tunnel {
            state
                .tunnels
                .affiliate(taas_id, (flow_id.to_string(), remote.host.clone()));
        }
    }

    fn unaffiliate(state: &mut ControllerState, flow_id: &str, applied: &AppliedFlow) {
        let taas_id = applied.taas_id;
        if let Some(source) = &applied.source {
            if applied.direction.mirrors_egress() {
                state.egress.unaffiliate(&source.ofport, &taas_id);
            }
            if applied.direction.mirrors_ingress() {
                state.ingress.unaffiliate(&source.mac, &taas_id);
                if let Some(vlan) = source.vlan {
                    state.bcmc.unaffiliate(&vlan, &taas_id);
                }
            }
        }
        if let Some((_, remote)) = &applied.tunnel {
            state
                .tunnels
                .unaffiliate(&taas_id, &(flow_id.to_string(), remote.host.clone()));
        }
    }

    /// Re-derives every rule a flow contributes to from current
    /// affiliations.
    async fn sync_flow_rules(
        &self,
        state: &ControllerState,
        applied: &AppliedFlow,
    ) -> TaasResult<()> {
        if let Some(source) = &applied.source {
            self.sync_source_rules(state, source, applied.direction)
                .await?;
        }
        if let Some((role, remote)) = &applied.tunnel {
            self.sync_tunnel_rule(state, applied.taas_id, *role, remote)
                .await?;
        }
        Ok(())
    }

    async fn sync_source_rules(
        &self,
        state: &ControllerState,
        source: &SourceBinding,
        direction: Direction,
    ) -> TaasResult<()> {
        let mut rules: Vec<(FlowMatch, BTreeSet<u16>)> = Vec::new();
        if direction.mirrors_egress() {
            rules.push((
                FlowMatch::new().in_port(source.ofport),
                state.egress.list(&source.ofport).into_iter().collect(),
            ));
        }
        if direction.mirrors_ingress() {
            rules.push((
                FlowMatch::new().dl_dst(source.mac.clone()),
                state.ingress.list(&source.mac).into_iter().collect(),
            ));
            if let Some(vlan) = source.vlan {
                rules.push((
                    FlowMatch::bcmc(vlan),
                    state.bcmc.list(&vlan).into_iter().collect(),
                ));
            }
        }

        let context = if rules.iter().any(|(_, ids)| !ids.is_empty()) {
            Some(MirrorContext {
                forward: self
                    .forward
                    .resolve(self.switch.as_ref(), &self.layout.access_bridge)
                    .await?,
                patch_ofport: self.required_ofport(&self.layout.access_patch_port).await?,
            })
        } else {
            None
        };

        for (matches, taas_ids) in rules {
            match &context {
                Some(context) if !taas_ids.is_empty() => {
                    let rule = FlowRule::new(
                        ACCESS_TABLE,
                        priority::MIRROR,
                        matches,
                        context.actions(&taas_ids),
                    );
                    self.switch
                        .add_flow(&self.layout.access_bridge, &rule)
                        .await?;
                }
                _ => {
                    self.switch
                        .delete_flows(
                            &self.layout.access_bridge,
                            ACCESS_TABLE,
                            Some(priority::MIRROR),
                            &matches,
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn sync_tunnel_rule(
        &self,
        state: &ControllerState,
        taas_id: u16,
        role: TunnelRole,
        remote: &HostEndpoint,
    ) -> TaasResult<()> {
        let bridge = &self.layout.collection_bridge;
        let name = tunnel_port_name(self.layout.tunnel_type, remote.tunnel_ip);
        let in_use = state
            .tunnels
            .list(&taas_id)
            .iter()
            .any(|(_, host)| *host == remote.host);

        match role {
            TunnelRole::Sender => {
                let matches = FlowMatch::new().dl_vlan(taas_id);
                if in_use {
                    let ofport = self.required_ofport(&name).await?;
                    let rule = FlowRule::new(
                        COLLECTION_DELIVER_TABLE,
                        priority::MIRROR,
                        matches,
                        format!("set_field:{}->tun_id,output:{}", taas_id, ofport),
                    );
                    self.switch.add_flow(bridge, &rule).await
                } else {
                    self.switch
                        .delete_flows(
                            bridge,
                            COLLECTION_DELIVER_TABLE,
                            Some(priority::MIRROR),
                            &matches,
                        )
                        .await
                }
            }
            TunnelRole::Receiver => {
                let Some(ofport) = self.switch.get_port_ofport(&name).await? else {
                    if in_use {
                        return Err(TaasError::switch_control(
                            "get-ofport",
                            format!("tunnel port {} is not attached", name),
                        ));
                    }
                    return Ok(());
                };
                let matches = FlowMatch::new().in_port(ofport).tun_id(taas_id);
                if in_use {
                    let rule = FlowRule::new(
                        COLLECTION_CLASSIFY_TABLE,
                        priority::TUNNEL_RECEIVE,
                        matches,
                        format!(
                            "mod_vlan_vid:{},resubmit(,{})",
                            taas_id, COLLECTION_DELIVER_TABLE
                        ),
                    );
                    self.switch.add_flow(bridge, &rule).await
                } else {
                    self.switch
                        .delete_flows(
                            bridge,
                            COLLECTION_CLASSIFY_TABLE,
                            Some(priority::TUNNEL_RECEIVE),
                            &matches,
                        )
                        .await
                }
            }
        }
    }

    async fn ensure_tunnel_port(&self, remote: &HostEndpoint) -> TaasResult<()> {
        let tunnel = TunnelSpec {
            name: tunnel_port_name(self.layout.tunnel_type, remote.tunnel_ip),
            tunnel_type: self.layout.tunnel_type,
            local_ip: self.layout.local_ip,
            remote_ip: remote.tunnel_ip,
        };
        self.switch
            .add_tunnel_port(&self.layout.collection_bridge, &tunnel)
            .await
    }
}
