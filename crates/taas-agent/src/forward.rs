//! How mirror rules forward the source's own traffic.
//!
//! A mirror rule on the access bridge shadows whatever rule would have
//! handled the packet, so its action list starts with a clause that
//! forwards the packet as usual before the mirror clauses. On a plain
//! learning bridge that clause is `normal`. When the access bridge sends
//! unmatched traffic through its own pipeline via a catch-all rule,
//! `normal` would bypass that pipeline, and [`CatchAllRedirect`] reuses the
//! catch-all's actions instead.

use async_trait::async_trait;
use taas_common::switch::SwitchControl;
use taas_common::TaasResult;
use tracing::{debug, info};

use crate::tables::ACCESS_TABLE;

/// Action clause for ordinary forwarding on a learning bridge.
pub const NORMAL_ACTION: &str = "normal";

/// Strategy resolving the forward clause of access-bridge mirror rules.
#[async_trait]
pub trait ForwardAction: Send + Sync {
    /// Returns the action clause that forwards a packet as if no mirror
    /// rule had matched.
    async fn resolve(&self, switch: &dyn SwitchControl, bridge: &str) -> TaasResult<String>;
}

/// Always forwards with `normal`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NormalForward;

#[async_trait]
impl ForwardAction for NormalForward {
    async fn resolve(&self, _switch: &dyn SwitchControl, _bridge: &str) -> TaasResult<String> {
        Ok(NORMAL_ACTION.to_string())
    }
}

/// Forwards with the actions of the access table's match-all rule when that
/// rule does something other than `normal` or `drop`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CatchAllRedirect;

#[async_trait]
impl ForwardAction for CatchAllRedirect {
    async fn resolve(&self, switch: &dyn SwitchControl, bridge: &str) -> TaasResult<String> {
        let flows = switch.dump_flows(bridge, Some(ACCESS_TABLE)).await?;
        let catch_all = flows
            .iter()
            .filter(|rule| rule.matches.is_empty())
            .min_by_key(|rule| rule.priority);

        match catch_all {
            Some(rule)
                if !rule.actions.eq_ignore_ascii_case(NORMAL_ACTION)
                    && !rule.actions.eq_ignore_ascii_case("drop")
                    && !rule.actions.is_empty() =>
            {
                info!(
                    bridge,
                    actions = %rule.actions,
                    "Catch-all rule found, mirror rules will forward through it"
                );
                Ok(rule.actions.clone())
            }
            _ => {
                debug!(bridge, "No conflicting catch-all rule");
                Ok(NORMAL_ACTION.to_string())
            }
        }
    }
}
