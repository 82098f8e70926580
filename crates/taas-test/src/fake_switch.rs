//! In-memory virtual switch with Open vSwitch flow-table semantics.
//!
//! Models bridges, ports (VIF, patch, tunnel), OpenFlow port numbers, VLAN
//! tags, port metadata and flow tables. Rules follow `ovs-ofctl` semantics:
//! `add_flow` replaces a rule with the same table, priority and match;
//! strict deletes remove exactly one rule; loose deletes remove every rule
//! whose match includes the given fields.
//!
//! The switch also records ordering violations: a rule installed before the
//! port it references exists, or a port deleted while rules still
//! reference it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use taas_common::flow::{FlowMatch, FlowRule};
use taas_common::switch::{PortSpec, SwitchControl, TunnelSpec, VifPort};
use taas_common::{TaasError, TaasResult};

/// Rules of every bridge, keyed by bridge name.
pub type FlowSnapshot = BTreeMap<String, BTreeSet<FlowRule>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakePortKind {
    Vif,
    Patch { peer: String },
    Tunnel(TunnelSpec),
}

#[derive(Debug, Clone)]
pub struct FakePort {
    pub name: String,
    pub bridge: String,
    pub ofport: u32,
    pub tag: Option<u16>,
    pub external_ids: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, String>,
    pub kind: FakePortKind,
}

type RuleKey = (u8, u16, FlowMatch);

#[derive(Debug, Default)]
struct State {
    bridges: BTreeMap<String, BTreeMap<RuleKey, String>>,
    ports: BTreeMap<String, FakePort>,
    next_ofport: u32,
    calls: Vec<String>,
    violations: Vec<String>,
    fail_ops: HashMap<String, usize>,
}

impl State {
    fn record(&mut self, call: String) {
        self.calls.push(call);
    }

    fn check_fail(&mut self, op: &str) -> TaasResult<()> {
        if let Some(remaining) = self.fail_ops.get_mut(op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TaasError::switch_control(op, "injected failure"));
            }
        }
        Ok(())
    }

    fn bridge_mut(&mut self, bridge: &str, op: &str) -> TaasResult<&mut BTreeMap<RuleKey, String>> {
        self.bridges
            .get_mut(bridge)
            .ok_or_else(|| TaasError::switch_control(op, format!("no bridge named {}", bridge)))
    }

    fn alloc_ofport(&mut self) -> u32 {
        self.next_ofport += 1;
        self.next_ofport
    }

    fn ofports_on(&self, bridge: &str) -> BTreeSet<u32> {
        self.ports
            .values()
            .filter(|p| p.bridge == bridge)
            .map(|p| p.ofport)
            .collect()
    }

    fn attach(&mut self, bridge: &str, mut port: FakePort) {
        port.bridge = bridge.to_string();
        port.ofport = self.alloc_ofport();
        self.ports.insert(port.name.clone(), port);
    }
}

/// Ofports a rule refers to through `in_port=` or `output:`.
fn referenced_ofports(matches: &FlowMatch, actions: &str) -> Vec<u32> {
    let mut refs: Vec<u32> = matches
        .get("in_port")
        .and_then(|v| v.parse().ok())
        .into_iter()
        .collect();
    refs.extend(
        actions
            .split(',')
            .filter_map(|a| a.trim().strip_prefix("output:"))
            .filter_map(|v| v.parse::<u32>().ok()),
    );
    refs
}

/// Fake switch shared between the code under test and assertions.
#[derive(Debug, Default)]
pub struct FakeSwitch {
    state: Mutex<State>,
}

impl FakeSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Creates a bridge (test setup).
    pub fn with_bridge(self, bridge: &str) -> Self {
        self.lock()
            .bridges
            .entry(bridge.to_string())
            .or_default();
        self
    }

    /// Attaches a VIF (test setup). Returns its ofport.
    pub fn add_vif(
        &self,
        bridge: &str,
        name: &str,
        iface_id: &str,
        mac: &str,
        tag: Option<u16>,
    ) -> u32 {
        let mut state = self.lock();
        state.bridges.entry(bridge.to_string()).or_default();
        let port = FakePort {
            name: name.to_string(),
            bridge: String::new(),
            ofport: 0,
            tag,
            external_ids: BTreeMap::from([
                ("iface-id".to_string(), iface_id.to_string()),
                ("attached-mac".to_string(), mac.to_string()),
            ]),
            metadata: BTreeMap::new(),
            kind: FakePortKind::Vif,
        };
        state.attach(bridge, port);
        state.ports[name].ofport
    }

    /// Installs a rule without recording a call (test setup).
    pub fn seed_flow(&self, bridge: &str, rule: FlowRule) {
        let mut state = self.lock();
        state
            .bridges
            .entry(bridge.to_string())
            .or_default()
            .insert((rule.table, rule.priority, rule.matches), rule.actions);
    }

    /// Removes a port behind the controller's back (simulates a VM delete).
    pub fn remove_port_externally(&self, name: &str) {
        self.lock().ports.remove(name);
    }

    /// Makes the next `count` calls of `op` (e.g. `"add_flow"`) fail.
    pub fn fail_next(&self, op: &str, count: usize) {
        self.lock().fail_ops.insert(op.to_string(), count);
    }

    /// Rules of one bridge, sorted.
    pub fn flows(&self, bridge: &str) -> BTreeSet<FlowRule> {
        self.lock()
            .bridges
            .get(bridge)
            .map(|rules| {
                rules
                    .iter()
                    .map(|((table, priority, matches), actions)| {
                        FlowRule::new(*table, *priority, matches.clone(), actions.clone())
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Rules of every bridge.
    pub fn snapshot(&self) -> FlowSnapshot {
        let bridges: Vec<String> = self.lock().bridges.keys().cloned().collect();
        bridges
            .into_iter()
            .map(|b| {
                let flows = self.flows(&b);
                (b, flows)
            })
            .collect()
    }

    /// Finds a rule by table, priority and exact match.
    pub fn find_flow(
        &self,
        bridge: &str,
        table: u8,
        priority: u16,
        matches: &FlowMatch,
    ) -> Option<FlowRule> {
        self.lock()
            .bridges
            .get(bridge)?
            .get(&(table, priority, matches.clone()))
            .map(|actions| FlowRule::new(table, priority, matches.clone(), actions.clone()))
    }

    pub fn port(&self, name: &str) -> Option<FakePort> {
        self.lock().ports.get(name).cloned()
    }

    /// Names of tunnel ports on `bridge`.
    pub fn tunnel_ports(&self, bridge: &str) -> Vec<String> {
        self.lock()
            .ports
            .values()
            .filter(|p| p.bridge == bridge && matches!(p.kind, FakePortKind::Tunnel(_)))
            .map(|p| p.name.clone())
            .collect()
    }

    pub fn has_bridge(&self, bridge: &str) -> bool {
        self.lock().bridges.contains_key(bridge)
    }

    /// Every primitive invoked, in order, as `"<op> <args>"`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Ordering violations observed so far.
    pub fn violations(&self) -> Vec<String> {
        self.lock().violations.clone()
    }
}

#[async_trait]
impl SwitchControl for FakeSwitch {
    async fn ensure_bridge(&self, bridge: &str) -> TaasResult<()> {
        let mut state = self.lock();
        state.record(format!("ensure_bridge {}", bridge));
        state.check_fail("ensure_bridge")?;
        state.bridges.entry(bridge.to_string()).or_default();
        Ok(())
    }

    async fn add_patch_port(&self, bridge: &str, name: &str, peer: &str) -> TaasResult<()> {
        let mut state = self.lock();
        state.record(format!("add_patch_port {} {} {}", bridge, name, peer));
        state.check_fail("add_patch_port")?;
        state.bridge_mut(bridge, "add_patch_port")?;
        if state.ports.get(name).is_some_and(|p| p.bridge == bridge) {
            return Ok(());
        }
        let port = FakePort {
            name: name.to_string(),
            bridge: String::new(),
            ofport: 0,
            tag: None,
            external_ids: BTreeMap::new(),
            metadata: BTreeMap::new(),
            kind: FakePortKind::Patch {
                peer: peer.to_string(),
            },
        };
        state.attach(bridge, port);
        Ok(())
    }

    async fn add_port(&self, bridge: &str, spec: &PortSpec) -> TaasResult<()> {
        let mut state = self.lock();
        state.record(format!("add_port {} {}", bridge, spec.name));
        state.check_fail("add_port")?;
        state.bridge_mut(bridge, "add_port")?;

        if let Some(old) = state.ports.remove(&spec.name) {
            let dangling = state
                .bridges
                .get(&old.bridge)
                .map(|rules| {
                    rules
                        .iter()
                        .any(|((_, _, m), a)| referenced_ofports(m, a).contains(&old.ofport))
                })
                .unwrap_or(false);
            if dangling {
                state.violations.push(format!(
                    "port {} moved off {} while rules reference ofport {}",
                    old.name, old.bridge, old.ofport
                ));
            }
        }

        let port = FakePort {
            name: spec.name.clone(),
            bridge: String::new(),
            ofport: 0,
            tag: None,
            external_ids: spec.external_ids.clone(),
            metadata: spec.metadata.clone(),
            kind: FakePortKind::Vif,
        };
        state.attach(bridge, port);
        Ok(())
    }

    async fn delete_port(&self, bridge: &str, name: &str) -> TaasResult<()> {
        let mut state = self.lock();
        state.record(format!("delete_port {} {}", bridge, name));
        state.check_fail("delete_port")?;

        let Some(ofport) = state
            .ports
            .get(name)
            .filter(|p| p.bridge == bridge)
            .map(|p| p.ofport)
        else {
            return Ok(());
        };

        let dangling = state
            .bridges
            .get(bridge)
            .map(|rules| {
                rules
                    .iter()
                    .any(|((_, _, m), a)| referenced_ofports(m, a).contains(&ofport))
            })
            .unwrap_or(false);
        if dangling {
            state.violations.push(format!(
                "port {} deleted from {} while rules reference ofport {}",
                name, bridge, ofport
            ));
        }
        state.ports.remove(name);
        Ok(())
    }

    async fn add_tunnel_port(&self, bridge: &str, tunnel: &TunnelSpec) -> TaasResult<()> {
        let mut state = self.lock();
        state.record(format!(
            "add_tunnel_port {} {} {}",
            bridge, tunnel.name, tunnel.remote_ip
        ));
        state.check_fail("add_tunnel_port")?;
        state.bridge_mut(bridge, "add_tunnel_port")?;
        if state.ports.get(&tunnel.name).is_some_and(|p| p.bridge == bridge) {
            return Ok(());
        }
        let port = FakePort {
            name: tunnel.name.clone(),
            bridge: String::new(),
            ofport: 0,
            tag: None,
            external_ids: BTreeMap::new(),
            metadata: BTreeMap::new(),
            kind: FakePortKind::Tunnel(tunnel.clone()),
        };
        state.attach(bridge, port);
        Ok(())
    }

    async fn get_port_ofport(&self, name: &str) -> TaasResult<Option<u32>> {
        let mut state = self.lock();
        state.check_fail("get_port_ofport")?;
        Ok(state.ports.get(name).map(|p| p.ofport))
    }

    async fn get_vif_port(&self, bridge: &str, port_id: &str) -> TaasResult<Option<VifPort>> {
        let mut state = self.lock();
        state.check_fail("get_vif_port")?;
        Ok(state
            .ports
            .values()
            .find(|p| {
                p.bridge == bridge
                    && p.external_ids.get("iface-id").map(String::as_str) == Some(port_id)
            })
            .map(|p| VifPort {
                port_name: p.name.clone(),
                ofport: p.ofport,
                iface_id: port_id.to_string(),
                mac: p.external_ids.get("attached-mac").cloned().unwrap_or_default(),
                bridge: p.bridge.clone(),
            }))
    }

    async fn get_port_tag(&self, name: &str) -> TaasResult<Option<u16>> {
        let mut state = self.lock();
        state.check_fail("get_port_tag")?;
        Ok(state.ports.get(name).and_then(|p| p.tag))
    }

    async fn set_port_tag(&self, name: &str, tag: Option<u16>) -> TaasResult<()> {
        let mut state = self.lock();
        state.record(format!("set_port_tag {} {:?}", name, tag));
        state.check_fail("set_port_tag")?;
        match state.ports.get_mut(name) {
            Some(port) => {
                port.tag = tag;
                Ok(())
            }
            None => Err(TaasError::switch_control(
                "set_port_tag",
                format!("no row \"{}\" in table Port", name),
            )),
        }
    }

    async fn get_port_metadata(&self, name: &str, key: &str) -> TaasResult<Option<String>> {
        let mut state = self.lock();
        state.check_fail("get_port_metadata")?;
        Ok(state
            .ports
            .get(name)
            .and_then(|p| p.metadata.get(key).cloned()))
    }

    async fn add_flow(&self, bridge: &str, rule: &FlowRule) -> TaasResult<()> {
        let mut state = self.lock();
        state.record(format!("add_flow {} {}", bridge, rule.spec()));
        state.check_fail("add_flow")?;

        let attached = state.ofports_on(bridge);
        let missing: Vec<u32> = referenced_ofports(&rule.matches, &rule.actions)
            .into_iter()
            .filter(|ofport| !attached.contains(ofport))
            .collect();
        if !missing.is_empty() {
            state.violations.push(format!(
                "rule {} on {} references unattached ofports {:?}",
                rule.spec(),
                bridge,
                missing
            ));
        }

        state
            .bridge_mut(bridge, "add_flow")?
            .insert(
                (rule.table, rule.priority, rule.matches.clone()),
                rule.actions.clone(),
            );
        Ok(())
    }

    async fn delete_flows(
        &self,
        bridge: &str,
        table: u8,
        priority: Option<u16>,
        matches: &FlowMatch,
    ) -> TaasResult<()> {
        let mut state = self.lock();
        state.record(format!(
            "delete_flows {} {}",
            bridge,
            taas_common::flow::match_spec(table, priority, matches)
        ));
        state.check_fail("delete_flows")?;

        let rules = state.bridge_mut(bridge, "delete_flows")?;
        match priority {
            Some(priority) => {
                rules.remove(&(table, priority, matches.clone()));
            }
            None => {
                rules.retain(|(t, _, m), _| !(*t == table && matches.is_subset_of(m)));
            }
        }
        Ok(())
    }

    async fn dump_flows(&self, bridge: &str, table: Option<u8>) -> TaasResult<Vec<FlowRule>> {
        {
            let mut state = self.lock();
            state.check_fail("dump_flows")?;
            state.bridge_mut(bridge, "dump_flows")?;
        }
        Ok(self
            .flows(bridge)
            .into_iter()
            .filter(|r| table.map_or(true, |t| r.table == t))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use taas_common::switch::TunnelType;

    #[tokio::test]
    async fn test_add_flow_replaces_same_key() {
        let switch = FakeSwitch::new().with_bridge("br-int");
        let m = FlowMatch::new().dl_vlan(10);
        switch
            .add_flow("br-int", &FlowRule::new(0, 20, m.clone(), "normal"))
            .await
            .unwrap();
        switch
            .add_flow("br-int", &FlowRule::new(0, 20, m.clone(), "drop"))
            .await
            .unwrap();

        let flows = switch.flows("br-int");
        assert_eq!(flows.len(), 1);
        assert_eq!(flows.iter().next().unwrap().actions, "drop");
    }

    #[tokio::test]
    async fn test_strict_and_loose_delete() {
        let switch = FakeSwitch::new().with_bridge("br-tap");
        switch.seed_flow("br-tap", FlowRule::new(1, 25, FlowMatch::new().dl_vlan(3901), "drop"));
        switch.seed_flow("br-tap", FlowRule::new(1, 20, FlowMatch::new().dl_vlan(3901), "drop"));
        switch.seed_flow("br-tap", FlowRule::new(1, 0, FlowMatch::new(), "drop"));

        switch
            .delete_flows("br-tap", 1, Some(25), &FlowMatch::new().dl_vlan(3901))
            .await
            .unwrap();
        assert_eq!(switch.flows("br-tap").len(), 2);

        switch
            .delete_flows("br-tap", 1, None, &FlowMatch::new().dl_vlan(3901))
            .await
            .unwrap();
        let remaining = switch.flows("br-tap");
        assert_eq!(remaining.len(), 1);
        assert!(remaining.iter().next().unwrap().matches.is_empty());
    }

    #[tokio::test]
    async fn test_moving_port_assigns_new_ofport() {
        let switch = FakeSwitch::new().with_bridge("br-int").with_bridge("br-tap");
        let before = switch.add_vif("br-int", "tap1", "port-1", "fa:16:3e:00:00:01", Some(5));

        let vif = switch.get_vif_port("br-int", "port-1").await.unwrap().unwrap();
        switch.add_port("br-tap", &PortSpec::from_vif(&vif)).await.unwrap();

        assert!(switch.get_vif_port("br-int", "port-1").await.unwrap().is_none());
        let moved = switch.get_vif_port("br-tap", "port-1").await.unwrap().unwrap();
        assert_ne!(moved.ofport, before);
        assert_eq!(switch.get_port_tag("tap1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dangling_reference_recorded() {
        let switch = FakeSwitch::new().with_bridge("br-tap");
        let tunnel = TunnelSpec {
            name: "tvx-0a000002".to_string(),
            tunnel_type: TunnelType::Vxlan,
            local_ip: None,
            remote_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
        };
        switch.add_tunnel_port("br-tap", &tunnel).await.unwrap();
        let ofport = switch.get_port_ofport(&tunnel.name).await.unwrap().unwrap();
        switch
            .add_flow(
                "br-tap",
                &FlowRule::new(1, 20, FlowMatch::new().dl_vlan(3901), format!("output:{}", ofport)),
            )
            .await
            .unwrap();
        assert!(switch.violations().is_empty());

        switch.delete_port("br-tap", &tunnel.name).await.unwrap();
        assert_eq!(switch.violations().len(), 1);

        switch
            .add_flow("br-tap", &FlowRule::new(0, 1, FlowMatch::new().in_port(99), "drop"))
            .await
            .unwrap();
        assert_eq!(switch.violations().len(), 2);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let switch = FakeSwitch::new().with_bridge("br-int");
        switch.fail_next("add_flow", 1);
        let rule = FlowRule::new(0, 0, FlowMatch::new(), "normal");
        assert!(matches!(
            switch.add_flow("br-int", &rule).await,
            Err(TaasError::SwitchControlFailure { .. })
        ));
        assert!(switch.add_flow("br-int", &rule).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_bridge_fails() {
        let switch = FakeSwitch::new();
        let rule = FlowRule::new(0, 0, FlowMatch::new(), "normal");
        assert!(switch.add_flow("br-none", &rule).await.is_err());
    }
}
