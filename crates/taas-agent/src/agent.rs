//! Intent dispatcher.
//!
//! Receives tap-service and tap-flow intents, drops the ones that do not
//! concern this host and hands the rest to the backend serving the port:
//! the Flow Controller for virtual-switch ports, the SR-IOV Mirror
//! Programmer for `direct` ports.

use std::sync::Arc;

use taas_common::intent::Intent;
use taas_common::nic::{NicControl, PciLookup};
use taas_common::switch::SwitchControl;
use taas_common::{TaasError, TaasResult};
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::flow_controller::{BridgeLayout, FlowController};
use crate::forward::CatchAllRedirect;
use crate::ovs::OvsSwitch;
use crate::sriov::SriovProgrammer;
use crate::sysfs::{SysfsNic, SysfsPci};

/// Backend chosen for an intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Switch,
    Sriov,
}

/// What the agent did with an intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied(Backend),
    /// The intent names other hosts only.
    Skipped,
    /// Refused as a configuration mismatch; logged, nothing applied.
    Rejected,
}

pub struct TaasAgent {
    host: String,
    flows: FlowController,
    sriov: Option<SriovProgrammer>,
}

impl TaasAgent {
    /// Builds an agent on the given collaborators.
    ///
    /// `nic` and `pci` are only used when SR-IOV is enabled.
    pub fn new(
        config: &AgentConfig,
        switch: Arc<dyn SwitchControl>,
        nic: Arc<dyn NicControl>,
        pci: Arc<dyn PciLookup>,
    ) -> Self {
        let mut flows = FlowController::new(switch, BridgeLayout::from_config(config));
        if config.ovs.catch_all_compensation {
            flows = flows.with_forward_action(Arc::new(CatchAllRedirect));
        }
        let sriov = config
            .sriov
            .enabled
            .then(|| SriovProgrammer::new(nic, pci));

        Self {
            host: config.agent.host.clone(),
            flows,
            sriov,
        }
    }

    /// Builds an agent driving Open vSwitch and sysfs on this host.
    pub fn from_config(config: &AgentConfig) -> Self {
        let sysfs_root = config.sriov.sysfs_root.clone();
        Self::new(
            config,
            Arc::new(OvsSwitch::new()),
            Arc::new(SysfsNic::new(sysfs_root.clone())),
            Arc::new(SysfsPci::new(sysfs_root)),
        )
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn flow_controller(&self) -> &FlowController {
        &self.flows
    }

    /// Sets up the mirror bridges.
    pub async fn start(&self) -> TaasResult<()> {
        self.flows.initialize().await
    }

    fn backend_for(&self, intent: &Intent) -> TaasResult<Backend> {
        let sriov = match intent {
            Intent::CreateTapService(s) | Intent::DeleteTapService(s) => {
                s.port.as_ref().is_some_and(|p| p.is_sriov())
            }
            Intent::CreateTapFlow(f) | Intent::DeleteTapFlow(f) => f.source_port.is_sriov(),
        };
        match (sriov, self.sriov.is_some()) {
            (false, _) => Ok(Backend::Switch),
            (true, true) => Ok(Backend::Sriov),
            (true, false) => Err(TaasError::invalid_intent(format!(
                "{} {} targets an SR-IOV port but SR-IOV is disabled",
                intent.op(),
                intent.object_id()
            ))),
        }
    }

    /// Applies one intent.
    ///
    /// Rejections and ports already gone on delete are logged and reported
    /// through [`Outcome`]; every other failure is returned.
    pub async fn handle(&self, intent: &Intent) -> TaasResult<Outcome> {
        let op = intent.op();
        let object_id = intent.object_id();

        if !intent.concerns_host(&self.host) {
            debug!(op, object_id, host = %self.host, "Intent for other hosts, skipping");
            return Ok(Outcome::Skipped);
        }

        let backend = self.backend_for(intent)?;
        debug!(op, object_id, backend = ?backend, "Dispatching intent");

        match self.dispatch(backend, intent).await {
            Ok(()) => {
                info!(op, object_id, "Intent applied");
                Ok(Outcome::Applied(backend))
            }
            Err(e) if e.is_rejection() => {
                error!(op, object_id, error = %e, "Intent rejected");
                Ok(Outcome::Rejected)
            }
            Err(e) if e.is_benign_on_delete() && is_delete(intent) => {
                warn!(op, object_id, error = %e, "Nothing left to delete");
                Ok(Outcome::Applied(backend))
            }
            Err(e) => {
                error!(op, object_id, error = %e, retryable = e.is_retryable(), "Intent failed");
                Err(e)
            }
        }
    }

    async fn dispatch(&self, backend: Backend, intent: &Intent) -> TaasResult<()> {
        match (backend, intent) {
            (Backend::Switch, Intent::CreateTapService(s)) => self.flows.create_tap_service(s).await,
            (Backend::Switch, Intent::DeleteTapService(s)) => self.flows.delete_tap_service(s).await,
            (Backend::Switch, Intent::CreateTapFlow(f)) => self.flows.create_tap_flow(f).await,
            (Backend::Switch, Intent::DeleteTapFlow(f)) => self.flows.delete_tap_flow(f).await,
            (Backend::Sriov, intent) => {
                let sriov = self
                    .sriov
                    .as_ref()
                    .ok_or_else(|| TaasError::internal("SR-IOV backend not configured"))?;
                match intent {
                    Intent::CreateTapService(s) => sriov.create_tap_service(s).await,
                    Intent::DeleteTapService(s) => sriov.delete_tap_service(s).await,
                    Intent::CreateTapFlow(f) => sriov.create_tap_flow(f).await,
                    Intent::DeleteTapFlow(f) => sriov.delete_tap_flow(f).await,
                }
            }
        }
    }
}

fn is_delete(intent: &Intent) -> bool {
    matches!(
        intent,
        Intent::DeleteTapService(_) | Intent::DeleteTapFlow(_)
    )
}
