//! Tap-service and tap-flow lifecycle on the control node.
//!
//! The orchestrator keeps the registry of tap services and flows, allocates
//! taas_ids and turns API requests into intents for the host agents:
//!
//! - a tap service gets its taas_id before its `CreateTapService` is sent;
//! - flows are sent to every host they touch (source and service hosts);
//! - deleting a tap service deletes its flows first, then the service, and
//!   only then releases its taas_id.
//!
//! The registry lock is never held while intents are delivered.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use taas_common::intent::{FlowIntent, Intent, ServiceIntent};
use taas_common::model::{Direction, HostEndpoint, PortInfo, Status, TapFlow, TapService};
use taas_common::pool::PoolStore;
use taas_common::vlan_range;
use taas_common::{TaasError, TaasResult};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::allocator::VlanTagAllocator;
use crate::config::ServerConfig;
use crate::pool::InMemoryPoolStore;

/// Transport delivering intents to host agents.
#[async_trait]
pub trait IntentSink: Send + Sync {
    async fn deliver(&self, host: &str, intent: &Intent) -> TaasResult<()>;
}

/// Tap-flow creation request.
#[derive(Debug, Clone)]
pub struct TapFlowRequest {
    pub id: String,
    pub tap_service_id: String,
    pub source_port: PortInfo,
    pub source_host: HostEndpoint,
    pub direction: Direction,
    pub vlan_filter: Option<String>,
}

#[derive(Debug, Clone)]
struct ServiceRecord {
    service: TapService,
    port: PortInfo,
    host: HostEndpoint,
}

#[derive(Debug, Clone)]
struct FlowRecord {
    flow: TapFlow,
    source_port: PortInfo,
    source_host: HostEndpoint,
}

#[derive(Debug, Default)]
struct Registry {
    services: BTreeMap<String, ServiceRecord>,
    flows: BTreeMap<String, FlowRecord>,
}

impl Registry {
    fn flow_intent(&self, record: &FlowRecord) -> TaasResult<FlowIntent> {
        let service = self
            .services
            .get(&record.flow.tap_service_id)
            .ok_or_else(|| {
                TaasError::internal(format!(
                    "tap flow {} outlived tap service {}",
                    record.flow.id, record.flow.tap_service_id
                ))
            })?;
        Ok(FlowIntent {
            tap_flow: record.flow.clone(),
            taas_id: service.service.taas_id,
            source_port: record.source_port.clone(),
            collection_port: service.port.clone(),
            source_host: record.source_host.clone(),
            service_host: service.host.clone(),
            remaining_mirror_vlans: Vec::new(),
        })
    }

    /// VLANs each flow other than `except` still mirrors onto the
    /// collection port `collection_port_id`. Flows without a VLAN filter
    /// mirror VF to VF and contribute nothing.
    fn remaining_mirror_vlans(&self, collection_port_id: &str, except: &str) -> Vec<String> {
        let mut remaining = Vec::new();
        for record in self.flows.values().filter(|r| r.flow.id != except) {
            let Some(service) = self.services.get(&record.flow.tap_service_id) else {
                continue;
            };
            if service.port.id != collection_port_id {
                continue;
            }
            let Some(filter) = record.flow.mirror_filter(&service.port) else {
                continue;
            };
            match vlan_range::common(record.source_port.source_vlans(), Some(filter)) {
                Ok(vlans) if vlans.is_empty() => {}
                Ok(vlans) => remaining.push(vlan_range::format(vlans)),
                Err(e) => warn!(
                    flow_id = %record.flow.id,
                    error = %e,
                    "Skipping flow with unusable VLANs"
                ),
            }
        }
        remaining
    }
}

fn flow_hosts(intent: &FlowIntent) -> BTreeSet<String> {
    BTreeSet::from([
        intent.source_host.host.clone(),
        intent.service_host.host.clone(),
    ])
}

pub struct TaasOrchestrator<S: PoolStore> {
    allocator: VlanTagAllocator<S>,
    sink: Arc<dyn IntentSink>,
    registry: Mutex<Registry>,
}

impl TaasOrchestrator<InMemoryPoolStore> {
    /// Builds an orchestrator over an in-memory pool sized by `config`.
    pub fn from_config(config: &ServerConfig, sink: Arc<dyn IntentSink>) -> TaasResult<Self> {
        config.validate()?;
        let allocator =
            VlanTagAllocator::new(Arc::new(InMemoryPoolStore::new()), &config.taas);
        Ok(Self::new(allocator, sink))
    }
}

impl<S: PoolStore> TaasOrchestrator<S> {
    pub fn new(allocator: VlanTagAllocator<S>, sink: Arc<dyn IntentSink>) -> Self {
        Self {
            allocator,
            sink,
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn allocator(&self) -> &VlanTagAllocator<S> {
        &self.allocator
    }

    pub async fn tap_service(&self, id: &str) -> Option<TapService> {
        self.registry
            .lock()
            .await
            .services
            .get(id)
            .map(|r| r.service.clone())
    }

    pub async fn tap_flow(&self, id: &str) -> Option<TapFlow> {
        self.registry
            .lock()
            .await
            .flows
            .get(id)
            .map(|r| r.flow.clone())
    }

    async fn send(&self, host: &str, intent: &Intent) -> TaasResult<()> {
        debug!(host, op = intent.op(), object_id = intent.object_id(), "Delivering intent");
        self.sink.deliver(host, intent).await.map_err(|e| {
            error!(host, op = intent.op(), object_id = intent.object_id(), error = %e, "Intent delivery failed");
            e
        })
    }

    async fn set_service_status(&self, id: &str, status: Status) {
        if let Some(record) = self.registry.lock().await.services.get_mut(id) {
            record.service.status = status;
        }
    }

    async fn set_flow_status(&self, id: &str, status: Status) {
        if let Some(record) = self.registry.lock().await.flows.get_mut(id) {
            record.flow.status = status;
        }
    }

    /// Allocates a taas_id for a new tap service and sends it to the host
    /// of its collection port.
    pub async fn create_tap_service(
        &self,
        id: &str,
        port: PortInfo,
        host: HostEndpoint,
    ) -> TaasResult<TapService> {
        if self.registry.lock().await.services.contains_key(id) {
            return Err(TaasError::invalid_intent(format!(
                "tap service {} already exists",
                id
            )));
        }

        let taas_id = self.allocator.allocate(id).await.map_err(|e| {
            error!(
                tap_service = id,
                error = %e,
                retryable = e.is_retryable(),
                "taas_id allocation failed"
            );
            e
        })?;
        let service = TapService {
            id: id.to_string(),
            collection_port_id: port.id.clone(),
            status: Status::PendingCreate,
            taas_id,
        };
        let intent = Intent::CreateTapService(ServiceIntent {
            tap_service: service.clone(),
            port: Some(port.clone()),
            host: host.host.clone(),
        });
        self.registry.lock().await.services.insert(
            id.to_string(),
            ServiceRecord {
                service: service.clone(),
                port,
                host: host.clone(),
            },
        );

        if let Err(e) = self.send(&host.host, &intent).await {
            self.set_service_status(id, Status::Error).await;
            return Err(e);
        }
        self.set_service_status(id, Status::Active).await;
        info!(tap_service = id, taas_id, host = %host.host, "Tap service created");
        Ok(TapService {
            status: Status::Active,
            ..service
        })
    }

    /// Registers a tap flow and sends it to the source and service hosts.
    pub async fn create_tap_flow(&self, request: TapFlowRequest) -> TaasResult<TapFlow> {
        let (flow, intent) = {
            let mut registry = self.registry.lock().await;
            if registry.flows.contains_key(&request.id) {
                return Err(TaasError::invalid_intent(format!(
                    "tap flow {} already exists",
                    request.id
                )));
            }
            if !registry.services.contains_key(&request.tap_service_id) {
                return Err(TaasError::invalid_intent(format!(
                    "tap service {} does not exist",
                    request.tap_service_id
                )));
            }
            if let Some(filter) = request.vlan_filter.as_deref() {
                vlan_range::parse(filter)?;
            }

            let record = FlowRecord {
                flow: TapFlow {
                    id: request.id.clone(),
                    tap_service_id: request.tap_service_id.clone(),
                    source_port_id: request.source_port.id.clone(),
                    direction: request.direction,
                    status: Status::PendingCreate,
                    vlan_filter: request.vlan_filter,
                },
                source_port: request.source_port,
                source_host: request.source_host,
            };
            let intent = registry.flow_intent(&record)?;
            let flow = record.flow.clone();
            registry.flows.insert(request.id.clone(), record);
            (flow, intent)
        };

        let hosts = flow_hosts(&intent);
        let intent = Intent::CreateTapFlow(intent);
        for host in &hosts {
            if let Err(e) = self.send(host, &intent).await {
                self.set_flow_status(&flow.id, Status::Error).await;
                return Err(e);
            }
        }
        self.set_flow_status(&flow.id, Status::Active).await;
        info!(flow_id = %flow.id, tap_service = %flow.tap_service_id, "Tap flow created");
        Ok(TapFlow {
            status: Status::Active,
            ..flow
        })
    }

    /// Removes a tap flow and sends its deletion to the hosts it touches.
    ///
    /// Unknown flows are a no-op.
    pub async fn delete_tap_flow(&self, id: &str) -> TaasResult<()> {
        let intent = {
            let mut registry = self.registry.lock().await;
            let Some(record) = registry.flows.get(id).cloned() else {
                debug!(flow_id = id, "Tap flow not found, nothing to delete");
                return Ok(());
            };
            let mut intent = registry.flow_intent(&record)?;
            intent.remaining_mirror_vlans =
                registry.remaining_mirror_vlans(&intent.collection_port.id, id);
            registry.flows.remove(id);
            intent
        };

        let hosts = flow_hosts(&intent);
        let intent = Intent::DeleteTapFlow(intent);
        for host in &hosts {
            self.send(host, &intent).await?;
        }
        info!(flow_id = id, "Tap flow deleted");
        Ok(())
    }

    /// Deletes a tap service: its flows first, then the service, then the
    /// taas_id goes back to the pool.
    pub async fn delete_tap_service(&self, id: &str) -> TaasResult<()> {
        let flow_ids: Vec<String> = {
            let mut registry = self.registry.lock().await;
            let Some(record) = registry.services.get_mut(id) else {
                debug!(tap_service = id, "Tap service not found, nothing to delete");
                return Ok(());
            };
            record.service.status = Status::PendingDelete;
            registry
                .flows
                .values()
                .filter(|r| r.flow.tap_service_id == id)
                .map(|r| r.flow.id.clone())
                .collect()
        };

        for flow_id in &flow_ids {
            self.delete_tap_flow(flow_id).await?;
        }

        let record = self.registry.lock().await.services.get(id).cloned();
        let Some(record) = record else {
            return Ok(());
        };
        let intent = Intent::DeleteTapService(ServiceIntent {
            tap_service: record.service.clone(),
            port: Some(record.port.clone()),
            host: record.host.host.clone(),
        });
        self.send(&record.host.host, &intent).await?;

        self.registry.lock().await.services.remove(id);
        self.allocator.release(id).await?;
        info!(
            tap_service = id,
            taas_id = record.service.taas_id,
            flows = flow_ids.len(),
            "Tap service deleted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use pretty_assertions::assert_eq;
    use taas_test::{compute_1, compute_2, port, sriov_port, with_binding};

    /// Records delivered intents as `(host, op, object id)`.
    #[derive(Default)]
    struct RecordingSink {
        delivered: std::sync::Mutex<Vec<(String, Intent)>>,
        fail_host: Option<String>,
    }

    impl RecordingSink {
        fn log(&self) -> Vec<(String, String, String)> {
            self.delivered
                .lock()
                .unwrap()
                .iter()
                .map(|(h, i)| (h.clone(), i.op().to_string(), i.object_id().to_string()))
                .collect()
        }

        fn intents(&self) -> Vec<Intent> {
            self.delivered
                .lock()
                .unwrap()
                .iter()
                .map(|(_, i)| i.clone())
                .collect()
        }
    }

    #[async_trait]
    impl IntentSink for RecordingSink {
        async fn deliver(&self, host: &str, intent: &Intent) -> TaasResult<()> {
            if self.fail_host.as_deref() == Some(host) {
                return Err(TaasError::internal(format!("{} unreachable", host)));
            }
            self.delivered
                .lock()
                .unwrap()
                .push((host.to_string(), intent.clone()));
            Ok(())
        }
    }

    fn orchestrator(sink: Arc<RecordingSink>) -> TaasOrchestrator<InMemoryPoolStore> {
        let allocator = VlanTagAllocator::new(
            Arc::new(InMemoryPoolStore::new()),
            &PoolConfig {
                vlan_range_start: 3900,
                vlan_range_end: 3902,
                max_allocation_attempts: 3,
            },
        );
        TaasOrchestrator::new(allocator, sink)
    }

    fn flow_request(id: &str, svc: &str, source: PortInfo) -> TapFlowRequest {
        TapFlowRequest {
            id: id.to_string(),
            tap_service_id: svc.to_string(),
            source_port: source,
            source_host: compute_1(),
            direction: Direction::Both,
            vlan_filter: None,
        }
    }

    fn entry(host: &str, op: &str, id: &str) -> (String, String, String) {
        (host.to_string(), op.to_string(), id.to_string())
    }

    #[tokio::test]
    async fn test_service_gets_taas_id_before_intent() {
        let sink = Arc::new(RecordingSink::default());
        let orch = orchestrator(sink.clone());
        let service = orch
            .create_tap_service("svc-1", port("port-col", "fa:16:3e:00:00:02"), compute_2())
            .await
            .unwrap();

        assert_eq!(service.status, Status::Active);
        assert!((3900..3902).contains(&service.taas_id));
        match &sink.intents()[0] {
            Intent::CreateTapService(s) => assert_eq!(s.taas_id(), service.taas_id),
            other => panic!("unexpected intent {:?}", other),
        }
        assert_eq!(sink.log(), vec![entry("compute-2", "create_tap_service", "svc-1")]);
    }

    #[tokio::test]
    async fn test_flow_sent_to_both_hosts() {
        let sink = Arc::new(RecordingSink::default());
        let orch = orchestrator(sink.clone());
        orch.create_tap_service("svc-1", port("port-col", "fa:16:3e:00:00:02"), compute_2())
            .await
            .unwrap();
        orch.create_tap_flow(flow_request("flow-1", "svc-1", port("port-src", "fa:16:3e:00:00:01")))
            .await
            .unwrap();

        let log = sink.log();
        assert_eq!(
            log[1..].to_vec(),
            vec![
                entry("compute-1", "create_tap_flow", "flow-1"),
                entry("compute-2", "create_tap_flow", "flow-1"),
            ]
        );
    }

    #[tokio::test]
    async fn test_flow_for_unknown_service_rejected() {
        let orch = orchestrator(Arc::new(RecordingSink::default()));
        let result = orch
            .create_tap_flow(flow_request("flow-1", "svc-x", port("p", "fa:16:3e:00:00:01")))
            .await;
        assert!(matches!(result, Err(TaasError::InvalidIntent { .. })));
    }

    #[tokio::test]
    async fn test_malformed_vlan_filter_rejected() {
        let orch = orchestrator(Arc::new(RecordingSink::default()));
        orch.create_tap_service("svc-1", port("port-col", "fa:16:3e:00:00:02"), compute_1())
            .await
            .unwrap();
        for filter in ["4,x", "4000-5000"] {
            let mut request = flow_request("flow-1", "svc-1", port("p", "fa:16:3e:00:00:01"));
            request.vlan_filter = Some(filter.to_string());
            assert!(matches!(
                orch.create_tap_flow(request).await,
                Err(TaasError::MalformedRange { .. })
            ));
        }
        assert!(orch.tap_flow("flow-1").await.is_none());
    }

    #[tokio::test]
    async fn test_delete_service_cascades_then_releases() {
        let sink = Arc::new(RecordingSink::default());
        let orch = orchestrator(sink.clone());
        let service = orch
            .create_tap_service("svc-1", port("port-col", "fa:16:3e:00:00:02"), compute_1())
            .await
            .unwrap();
        for n in 1..=2 {
            orch.create_tap_flow(flow_request(
                &format!("flow-{}", n),
                "svc-1",
                port(&format!("port-{}", n), "fa:16:3e:00:00:01"),
            ))
            .await
            .unwrap();
        }

        orch.delete_tap_service("svc-1").await.unwrap();
        let log = sink.log();
        assert_eq!(
            log[3..].to_vec(),
            vec![
                entry("compute-1", "delete_tap_flow", "flow-1"),
                entry("compute-1", "delete_tap_flow", "flow-2"),
                entry("compute-1", "delete_tap_service", "svc-1"),
            ]
        );
        assert!(orch.tap_service("svc-1").await.is_none());
        assert!(orch.tap_flow("flow-1").await.is_none());
        assert_eq!(orch.allocator().store().lookup("svc-1").await.unwrap(), None);

        // The taas_id is free again
        let again = orch
            .create_tap_service("svc-2", port("port-col", "fa:16:3e:00:00:02"), compute_1())
            .await
            .unwrap();
        let other = orch
            .create_tap_service("svc-3", port("port-col2", "fa:16:3e:00:00:03"), compute_1())
            .await
            .unwrap();
        assert!([again.taas_id, other.taas_id].contains(&service.taas_id));
    }

    #[tokio::test]
    async fn test_delete_flow_carries_remaining_vlans() {
        let sink = Arc::new(RecordingSink::default());
        let orch = orchestrator(sink.clone());
        let vf = |id: &str, pci: &str, vlan: Option<&str>, mirror: Option<&str>| {
            with_binding(sriov_port(id, "fa:16:3e:00:00:01", pci), vlan, None, mirror)
        };
        orch.create_tap_service("svc-1", vf("vf-col", "0000:03:10.3", None, Some("10-20")), compute_1())
            .await
            .unwrap();
        orch.create_tap_service("svc-2", vf("vf-col2", "0000:03:10.4", None, Some("1-4095")), compute_1())
            .await
            .unwrap();

        let flows = [
            ("flow-a", "svc-1", Some("10-12"), None),
            ("flow-b", "svc-1", Some("12-14"), Some("13-30")),
            ("flow-c", "svc-1", None, None),
            ("flow-d", "svc-1", Some("30-40"), None),
            ("flow-e", "svc-2", Some("15"), None),
        ];
        for (id, svc, vlan, filter) in flows {
            let mut request = flow_request(id, svc, vf(&format!("vf-{}", id), "0000:03:10.1", vlan, None));
            request.vlan_filter = filter.map(str::to_string);
            orch.create_tap_flow(request).await.unwrap();
        }

        orch.delete_tap_flow("flow-a").await.unwrap();
        match sink.intents().last() {
            // flow-d has nothing in common with the port filter, flow-e
            // mirrors to another port
            Some(Intent::DeleteTapFlow(f)) => assert_eq!(
                f.remaining_mirror_vlans,
                vec!["13-14".to_string(), "10-20".to_string()]
            ),
            other => panic!("unexpected intent {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_from_config() {
        let sink = Arc::new(RecordingSink::default());
        let mut config = ServerConfig::default();
        config.taas.vlan_range_start = 100;
        config.taas.vlan_range_end = 101;

        let orch = TaasOrchestrator::from_config(&config, sink.clone()).unwrap();
        assert_eq!(orch.allocator().capacity(), 1);
        let service = orch
            .create_tap_service("svc-1", port("port-col", "fa:16:3e:00:00:02"), compute_1())
            .await
            .unwrap();
        assert_eq!(service.taas_id, 100);

        config.taas.vlan_range_end = 100;
        assert!(matches!(
            TaasOrchestrator::from_config(&config, sink),
            Err(TaasError::InvalidConfig { .. })
        ));
    }

    #[tokio::test]
    async fn test_delivery_failure_marks_error() {
        let sink = Arc::new(RecordingSink {
            fail_host: Some("compute-2".to_string()),
            ..Default::default()
        });
        let orch = orchestrator(sink);
        assert!(orch
            .create_tap_service("svc-1", port("port-col", "fa:16:3e:00:00:02"), compute_2())
            .await
            .is_err());
        assert_eq!(orch.tap_service("svc-1").await.unwrap().status, Status::Error);
    }

    #[tokio::test]
    async fn test_pool_exhaustion_surfaces() {
        let orch = orchestrator(Arc::new(RecordingSink::default()));
        for n in 0..2 {
            orch.create_tap_service(&format!("svc-{}", n), port("p", "fa:16:3e:00:00:02"), compute_1())
                .await
                .unwrap();
        }
        assert!(matches!(
            orch.create_tap_service("svc-x", port("p", "fa:16:3e:00:00:02"), compute_1())
                .await,
            Err(TaasError::PoolExhausted { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_unknown_is_noop() {
        let sink = Arc::new(RecordingSink::default());
        let orch = orchestrator(sink.clone());
        orch.delete_tap_flow("flow-x").await.unwrap();
        orch.delete_tap_service("svc-x").await.unwrap();
        assert!(sink.log().is_empty());
    }
}
