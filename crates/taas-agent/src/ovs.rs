//! Open vSwitch implementation of [`SwitchControl`].
//!
//! Each primitive runs one `ovs-vsctl` / `ovs-ofctl` invocation built in
//! [`crate::commands`].

use async_trait::async_trait;
use serde_json::Value;
use taas_common::flow::{FlowMatch, FlowRule};
use taas_common::shell;
use taas_common::switch::{PortSpec, SwitchControl, TunnelSpec, VifPort};
use taas_common::{TaasError, TaasResult};
use tracing::debug;

use crate::commands::*;

/// Switch control through the OVS command-line tools.
pub struct OvsSwitch {
    #[cfg(test)]
    mock_mode: bool,

    #[cfg(test)]
    captured_commands: std::sync::Mutex<Vec<String>>,

    #[cfg(test)]
    mock_responses: std::sync::Mutex<Vec<(String, String)>>,
}

impl OvsSwitch {
    pub fn new() -> Self {
        Self {
            #[cfg(test)]
            mock_mode: false,
            #[cfg(test)]
            captured_commands: std::sync::Mutex::new(Vec::new()),
            #[cfg(test)]
            mock_responses: std::sync::Mutex::new(Vec::new()),
        }
    }

    #[cfg(test)]
    pub fn new_mock() -> Self {
        let mut switch = Self::new();
        switch.mock_mode = true;
        switch
    }

    /// Returns `output` for the next commands containing `needle`.
    #[cfg(test)]
    pub fn respond(&self, needle: &str, output: &str) {
        self.mock_responses
            .lock()
            .unwrap()
            .push((needle.to_string(), output.to_string()));
    }

    #[cfg(test)]
    pub fn get_captured_commands(&self) -> Vec<String> {
        self.captured_commands.lock().unwrap().clone()
    }

    /// Execute a command (or capture it in mock mode), reporting failures
    /// as switch-control failures of `operation`.
    async fn exec(&self, operation: &str, cmd: &str) -> TaasResult<String> {
        #[cfg(test)]
        if self.mock_mode {
            self.captured_commands.lock().unwrap().push(cmd.to_string());
            let responses = self.mock_responses.lock().unwrap();
            return Ok(responses
                .iter()
                .find(|(needle, _)| cmd.contains(needle.as_str()))
                .map(|(_, output)| output.clone())
                .unwrap_or_default());
        }

        shell::exec_or_throw(cmd).await.map_err(|e| switch_failure(operation, e))
    }
}

/// Every failure below the switch seam, including a command that could
/// not be spawned, surfaces as a failure of the switch operation.
fn switch_failure(operation: &str, err: TaasError) -> TaasError {
    match err {
        e @ TaasError::SwitchControlFailure { .. } => e,
        other => TaasError::switch_control(operation, other),
    }
}

impl Default for OvsSwitch {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses an `ofport` column value. Unassigned ports report `[]` or `-1`.
pub fn parse_ofport(output: &str) -> Option<u32> {
    output.trim().parse::<i64>().ok().and_then(|v| u32::try_from(v).ok()).filter(|v| *v > 0)
}

/// Parses a `tag` column value; `[]` means untagged.
pub fn parse_tag(output: &str) -> Option<u16> {
    output.trim().parse().ok()
}

/// Parses an OVSDB string value, which `get` prints double-quoted when it
/// contains special characters.
pub fn parse_string_value(output: &str) -> Option<String> {
    let value = output.trim();
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Extracts `(name, ofport, attached-mac)` of the first interface in the
/// JSON output of `ovs-vsctl --format=json --columns=name,ofport,external_ids
/// find Interface ...`.
pub fn parse_find_interface(json: &str) -> TaasResult<Option<(String, u32, String)>> {
    if json.trim().is_empty() {
        return Ok(None);
    }
    let doc: Value = serde_json::from_str(json)
        .map_err(|e| TaasError::switch_control("find-interface", e))?;

    let Some(row) = doc
        .get("data")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .and_then(Value::as_array)
    else {
        return Ok(None);
    };

    let name = row.first().and_then(Value::as_str);
    let ofport = row
        .get(1)
        .and_then(Value::as_i64)
        .and_then(|v| u32::try_from(v).ok())
        .filter(|v| *v > 0);
    let (Some(name), Some(ofport)) = (name, ofport) else {
        return Ok(None);
    };

    // external_ids is ["map", [[k, v], ...]]
    let mac = row
        .get(2)
        .and_then(|m| m.get(1))
        .and_then(Value::as_array)
        .and_then(|pairs| {
            pairs.iter().find_map(|pair| {
                let pair = pair.as_array()?;
                match (pair.first()?.as_str()?, pair.get(1)?.as_str()?) {
                    ("attached-mac", mac) => Some(mac.to_string()),
                    _ => None,
                }
            })
        })
        .unwrap_or_default();

    Ok(Some((name.to_string(), ofport, mac)))
}

#[async_trait]
impl SwitchControl for OvsSwitch {
    async fn ensure_bridge(&self, bridge: &str) -> TaasResult<()> {
        debug!(bridge, "Ensuring bridge");
        self.exec("add-br", &build_add_bridge_cmd(bridge)).await?;
        Ok(())
    }

    async fn add_patch_port(&self, bridge: &str, name: &str, peer: &str) -> TaasResult<()> {
        debug!(bridge, port = name, peer, "Adding patch port");
        self.exec("add-patch-port", &build_add_patch_port_cmd(bridge, name, peer))
            .await?;
        Ok(())
    }

    async fn add_port(&self, bridge: &str, port: &PortSpec) -> TaasResult<()> {
        debug!(bridge, port = %port.name, "Attaching port");
        self.exec("add-port", &build_add_port_cmd(bridge, port)).await?;
        Ok(())
    }

    async fn delete_port(&self, bridge: &str, name: &str) -> TaasResult<()> {
        debug!(bridge, port = name, "Deleting port");
        self.exec("del-port", &build_del_port_cmd(bridge, name)).await?;
        Ok(())
    }

    async fn add_tunnel_port(&self, bridge: &str, tunnel: &TunnelSpec) -> TaasResult<()> {
        debug!(
            bridge,
            port = %tunnel.name,
            remote_ip = %tunnel.remote_ip,
            "Adding tunnel port"
        );
        self.exec("add-tunnel-port", &build_add_tunnel_port_cmd(bridge, tunnel))
            .await?;
        Ok(())
    }

    async fn get_port_ofport(&self, name: &str) -> TaasResult<Option<u32>> {
        let output = self.exec("get-ofport", &build_get_ofport_cmd(name)).await?;
        Ok(parse_ofport(&output))
    }

    async fn get_vif_port(&self, bridge: &str, port_id: &str) -> TaasResult<Option<VifPort>> {
        let output = self.exec("find-interface", &build_find_vif_cmd(port_id)).await?;
        let Some((port_name, ofport, mac)) = parse_find_interface(&output)? else {
            return Ok(None);
        };

        let owner = self
            .exec("port-to-br", &build_port_to_br_cmd(&port_name))
            .await?;
        if owner.trim() != bridge {
            return Ok(None);
        }

        Ok(Some(VifPort {
            port_name,
            ofport,
            iface_id: port_id.to_string(),
            mac,
            bridge: bridge.to_string(),
        }))
    }

    async fn get_port_tag(&self, name: &str) -> TaasResult<Option<u16>> {
        let output = self.exec("get-tag", &build_get_port_tag_cmd(name)).await?;
        Ok(parse_tag(&output))
    }

    async fn set_port_tag(&self, name: &str, tag: Option<u16>) -> TaasResult<()> {
        debug!(port = name, tag = ?tag, "Setting port tag");
        self.exec("set-tag", &build_set_port_tag_cmd(name, tag)).await?;
        Ok(())
    }

    async fn get_port_metadata(&self, name: &str, key: &str) -> TaasResult<Option<String>> {
        let cmd = build_get_port_metadata_cmd(name, key);
        // A missing map key is reported as a failure by ovs-vsctl
        match self.exec("get-metadata", &cmd).await {
            Ok(output) => Ok(parse_string_value(&output)),
            Err(TaasError::SwitchControlFailure { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn add_flow(&self, bridge: &str, rule: &FlowRule) -> TaasResult<()> {
        debug!(bridge, flow = %rule, "Adding flow");
        self.exec("add-flow", &build_add_flow_cmd(bridge, rule)).await?;
        Ok(())
    }

    async fn delete_flows(
        &self,
        bridge: &str,
        table: u8,
        priority: Option<u16>,
        matches: &FlowMatch,
    ) -> TaasResult<()> {
        debug!(bridge, table, priority = ?priority, matches = %matches, "Deleting flows");
        self.exec(
            "del-flows",
            &build_del_flows_cmd(bridge, table, priority, matches),
        )
        .await?;
        Ok(())
    }

    async fn dump_flows(&self, bridge: &str, table: Option<u8>) -> TaasResult<Vec<FlowRule>> {
        let output = self
            .exec("dump-flows", &build_dump_flows_cmd(bridge, table))
            .await?;
        Ok(output.lines().filter_map(FlowRule::parse_dump_line).collect())
    }
}
