//! Shell command builders for Open vSwitch and SR-IOV sysfs operations

use std::path::Path;

use itertools::Itertools;
use taas_common::flow::{self, FlowMatch, FlowRule};
use taas_common::nic::{MirrorCommand, MirrorTarget};
use taas_common::shell::{self, shellquote};
use taas_common::switch::{PortSpec, TunnelSpec};

/// Build bridge creation command (no-op if the bridge exists)
pub fn build_add_bridge_cmd(bridge: &str) -> String {
    format!(
        "{} --may-exist add-br {}",
        shell::OVS_VSCTL_CMD,
        shellquote(bridge)
    )
}

/// Build patch port creation command
pub fn build_add_patch_port_cmd(bridge: &str, name: &str, peer: &str) -> String {
    format!(
        "{} --may-exist add-port {} {} -- set Interface {} type=patch options:peer={}",
        shell::OVS_VSCTL_CMD,
        shellquote(bridge),
        shellquote(name),
        shellquote(name),
        shellquote(peer)
    )
}

/// Build port attach command
///
/// Deletes the port first within the same transaction, so an interface
/// attached to another bridge is moved rather than rejected.
pub fn build_add_port_cmd(bridge: &str, port: &PortSpec) -> String {
    let name = shellquote(&port.name);
    let mut cmd = format!(
        "{} -- --if-exists del-port {} -- add-port {} {}",
        shell::OVS_VSCTL_CMD,
        name,
        shellquote(bridge),
        name
    );

    if !port.metadata.is_empty() {
        let values = port
            .metadata
            .iter()
            .map(|(k, v)| format!("other_config:{}={}", k, shellquote(v)))
            .join(" ");
        cmd.push_str(&format!(" -- set Port {} {}", name, values));
    }
    if !port.external_ids.is_empty() {
        let values = port
            .external_ids
            .iter()
            .map(|(k, v)| format!("external_ids:{}={}", k, shellquote(v)))
            .join(" ");
        cmd.push_str(&format!(" -- set Interface {} {}", name, values));
    }
    cmd
}

/// Build port deletion command (no-op if the port is absent)
pub fn build_del_port_cmd(bridge: &str, name: &str) -> String {
    format!(
        "{} --if-exists del-port {} {}",
        shell::OVS_VSCTL_CMD,
        shellquote(bridge),
        shellquote(name)
    )
}

/// Build tunnel port creation command
///
/// The tunnel key is taken from the flow (`set_field:..->tun_id`).
pub fn build_add_tunnel_port_cmd(bridge: &str, tunnel: &TunnelSpec) -> String {
    let name = shellquote(&tunnel.name);
    let mut options = format!(
        "type={} options:remote_ip={} options:key=flow",
        tunnel.tunnel_type.as_str(),
        shellquote(&tunnel.remote_ip.to_string())
    );
    if let Some(local_ip) = tunnel.local_ip {
        options.push_str(&format!(
            " options:local_ip={}",
            shellquote(&local_ip.to_string())
        ));
    }
    format!(
        "{} --may-exist add-port {} {} -- set Interface {} {}",
        shell::OVS_VSCTL_CMD,
        shellquote(bridge),
        name,
        name,
        options
    )
}

/// Build OpenFlow port number query
pub fn build_get_ofport_cmd(name: &str) -> String {
    format!(
        "{} --if-exists get Interface {} ofport",
        shell::OVS_VSCTL_CMD,
        shellquote(name)
    )
}

/// Build VIF lookup by logical port id (JSON output)
pub fn build_find_vif_cmd(port_id: &str) -> String {
    format!(
        "{} --format=json --columns=name,ofport,external_ids find Interface external_ids:iface-id={}",
        shell::OVS_VSCTL_CMD,
        shellquote(port_id)
    )
}

/// Build port-to-bridge query
pub fn build_port_to_br_cmd(name: &str) -> String {
    format!("{} port-to-br {}", shell::OVS_VSCTL_CMD, shellquote(name))
}

/// Build access VLAN tag query
pub fn build_get_port_tag_cmd(name: &str) -> String {
    format!(
        "{} --if-exists get Port {} tag",
        shell::OVS_VSCTL_CMD,
        shellquote(name)
    )
}

/// Build access VLAN tag update; `None` clears the tag
pub fn build_set_port_tag_cmd(name: &str, tag: Option<u16>) -> String {
    match tag {
        Some(tag) => format!(
            "{} set Port {} tag={}",
            shell::OVS_VSCTL_CMD,
            shellquote(name),
            tag
        ),
        None => format!(
            "{} clear Port {} tag",
            shell::OVS_VSCTL_CMD,
            shellquote(name)
        ),
    }
}

/// Build port `other_config` key query
pub fn build_get_port_metadata_cmd(name: &str, key: &str) -> String {
    format!(
        "{} --if-exists get Port {} other_config:{}",
        shell::OVS_VSCTL_CMD,
        shellquote(name),
        key
    )
}

/// Build flow installation command
pub fn build_add_flow_cmd(bridge: &str, rule: &FlowRule) -> String {
    format!(
        "{} add-flow {} {}",
        shell::OVS_OFCTL_CMD,
        shellquote(bridge),
        shellquote(&rule.spec())
    )
}

/// Build flow deletion command
///
/// Strict when a priority is given.
pub fn build_del_flows_cmd(
    bridge: &str,
    table: u8,
    priority: Option<u16>,
    matches: &FlowMatch,
) -> String {
    let strict = if priority.is_some() { " --strict" } else { "" };
    format!(
        "{}{} del-flows {} {}",
        shell::OVS_OFCTL_CMD,
        strict,
        shellquote(bridge),
        shellquote(&flow::match_spec(table, priority, matches))
    )
}

/// Build flow dump command
pub fn build_dump_flows_cmd(bridge: &str, table: Option<u8>) -> String {
    match table {
        Some(table) => format!(
            "{} dump-flows {} table={}",
            shell::OVS_OFCTL_CMD,
            shellquote(bridge),
            table
        ),
        None => format!("{} dump-flows {}", shell::OVS_OFCTL_CMD, shellquote(bridge)),
    }
}

/// Build SR-IOV mirror command
///
/// VLAN mirrors are written to the collection VF's `vlan_mirror`;
/// VF-to-VF mirrors to the source VF's `<direction>_mirror` with the
/// collection VF index as argument.
pub fn build_sysfs_mirror_cmd(sysfs_root: &Path, command: &MirrorCommand) -> String {
    let (vf, attribute, argument) = match &command.target {
        MirrorTarget::Vlans {
            collection_vf,
            vlans,
        } => (*collection_vf, "vlan_mirror".to_string(), vlans.clone()),
        MirrorTarget::Vf {
            source_vf,
            collection_vf,
            direction,
        } => (
            *source_vf,
            format!("{}_mirror", direction.as_str()),
            collection_vf.to_string(),
        ),
    };
    let path = sysfs_root
        .join("class/net")
        .join(&command.pf_device)
        .join("device/sriov")
        .join(vf.to_string())
        .join(attribute);
    format!(
        "{} {} > {}",
        shell::ECHO_CMD,
        shellquote(&format!("{} {}", command.op.as_str(), argument)),
        shellquote(&path.display().to_string())
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use taas_common::switch::TunnelType;

    #[test]
    fn test_build_add_bridge_cmd() {
        let cmd = build_add_bridge_cmd("br-tap");
        assert!(cmd.contains("--may-exist add-br"));
        assert!(cmd.contains("\"br-tap\""));
    }

    #[test]
    fn test_build_add_patch_port_cmd() {
        let cmd = build_add_patch_port_cmd("br-int", "patch-int-tap", "patch-tap-int");
        assert!(cmd.contains("add-port \"br-int\" \"patch-int-tap\""));
        assert!(cmd.contains("type=patch"));
        assert!(cmd.contains("options:peer=\"patch-tap-int\""));
    }

    #[test]
    fn test_build_add_port_cmd_moves_and_sets() {
        let port = PortSpec::new("tap1").with_metadata("taas-original-tag", "7");
        let cmd = build_add_port_cmd("br-tap", &port);
        assert!(cmd.contains("-- --if-exists del-port \"tap1\" -- add-port \"br-tap\" \"tap1\""));
        assert!(cmd.contains("other_config:taas-original-tag=\"7\""));
        assert!(!cmd.contains("external_ids"));
    }

    #[test]
    fn test_build_add_port_cmd_external_ids() {
        let mut port = PortSpec::new("tap1");
        port.external_ids
            .insert("iface-id".to_string(), "port-1".to_string());
        let cmd = build_add_port_cmd("br-int", &port);
        assert!(cmd.contains("set Interface \"tap1\" external_ids:iface-id=\"port-1\""));
        assert!(!cmd.contains("tag="));
    }

    #[test]
    fn test_build_del_port_cmd() {
        let cmd = build_del_port_cmd("br-tap", "tvx-0a000002");
        assert!(cmd.contains("--if-exists del-port \"br-tap\" \"tvx-0a000002\""));
    }

    #[test]
    fn test_build_add_tunnel_port_cmd() {
        let tunnel = TunnelSpec {
            name: "tvx-0a000002".to_string(),
            tunnel_type: TunnelType::Vxlan,
            local_ip: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))),
            remote_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
        };
        let cmd = build_add_tunnel_port_cmd("br-tap", &tunnel);
        assert!(cmd.contains("type=vxlan"));
        assert!(cmd.contains("options:remote_ip=\"10.0.0.2\""));
        assert!(cmd.contains("options:local_ip=\"10.0.0.1\""));
        assert!(cmd.contains("options:key=flow"));
    }

    #[test]
    fn test_build_set_port_tag_cmd() {
        assert!(build_set_port_tag_cmd("tap1", Some(3)).ends_with("set Port \"tap1\" tag=3"));
        assert!(build_set_port_tag_cmd("tap1", None).ends_with("clear Port \"tap1\" tag"));
    }

    #[test]
    fn test_build_find_vif_cmd() {
        let cmd = build_find_vif_cmd("port-1");
        assert!(cmd.contains("--format=json"));
        assert!(cmd.contains("find Interface external_ids:iface-id=\"port-1\""));
    }

    #[test]
    fn test_build_flow_cmds() {
        let rule = FlowRule::new(1, 25, FlowMatch::new().dl_vlan(3901), "strip_vlan,output:4");
        assert_eq!(
            build_add_flow_cmd("br-tap", &rule),
            "/usr/bin/ovs-ofctl add-flow \"br-tap\" \"table=1,priority=25,dl_vlan=3901,actions=strip_vlan,output:4\""
        );

        let strict = build_del_flows_cmd("br-tap", 1, Some(25), &FlowMatch::new().dl_vlan(3901));
        assert!(strict.contains("--strict del-flows"));
        assert!(strict.contains("\"table=1,priority=25,dl_vlan=3901\""));

        let loose = build_del_flows_cmd("br-tap", 1, None, &FlowMatch::new());
        assert!(!loose.contains("--strict"));
        assert!(loose.ends_with("\"table=1\""));
    }

    #[test]
    fn test_build_sysfs_vlan_mirror_cmd() {
        use taas_common::nic::MirrorOp;

        let cmd = MirrorCommand::vlans("p1p1", MirrorOp::Add, 3, "4-5,9,18,20");
        assert_eq!(
            build_sysfs_mirror_cmd(Path::new("/sys"), &cmd),
            "/bin/echo \"add 4-5,9,18,20\" > \"/sys/class/net/p1p1/device/sriov/3/vlan_mirror\""
        );
    }

    #[test]
    fn test_build_sysfs_vf_mirror_cmd() {
        use taas_common::nic::{MirrorOp, VfDirection};

        let cmd = MirrorCommand::vf("p1p1", MirrorOp::Remove, 1, 3, VfDirection::Ingress);
        let built = build_sysfs_mirror_cmd(Path::new("/sys"), &cmd);
        assert!(built.contains("\"rem 3\""));
        assert!(built.ends_with("/sriov/1/ingress_mirror\""));
    }

    #[test]
    fn test_build_dump_flows_cmd() {
        assert!(build_dump_flows_cmd("br-int", Some(0)).ends_with("\"br-int\" table=0"));
        assert!(build_dump_flows_cmd("br-int", None).ends_with("\"br-int\""));
    }
}
