//! End-to-end mirroring scenarios through the agent dispatcher.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use taas_agent::{AgentConfig, Backend, Outcome, TaasAgent};
use taas_common::flow::FlowMatch;
use taas_common::model::Direction;
use taas_common::vlan_range::{self, VlanSet};
use taas_test::{
    compute_1, compute_2, create_service, delete_service, port, sriov_port, with_binding,
    FakeNic, FakePci, FakeSwitch, FlowIntentBuilder, RuleSetVerifier, COMPUTE_1, COMPUTE_2,
};

const SRC_A_MAC: &str = "fa:16:3e:00:00:0a";
const SRC_B_MAC: &str = "fa:16:3e:00:00:0b";
const COL_MAC: &str = "fa:16:3e:00:00:02";

struct Host {
    switch: Arc<FakeSwitch>,
    nic: Arc<FakeNic>,
    agent: TaasAgent,
}

async fn host(name: &str) -> Host {
    let mut config = AgentConfig::default();
    config.agent.host = name.to_string();

    let switch = Arc::new(FakeSwitch::new().with_bridge("br-int"));
    let nic = Arc::new(FakeNic::new());
    let pci = FakePci::new()
        .with_vf("0000:03:10.1", 1, "p1p1")
        .with_vf("0000:03:10.2", 2, "p1p1")
        .with_vf("0000:03:10.3", 3, "p1p1");
    let agent = TaasAgent::new(&config, switch.clone(), nic.clone(), Arc::new(pci));
    agent.start().await.unwrap();
    Host { switch, nic, agent }
}

fn applied(outcome: Outcome) {
    assert!(matches!(outcome, Outcome::Applied(_)), "{:?}", outcome);
}

#[tokio::test]
async fn create_then_delete_restores_rule_sets() {
    let h = host(COMPUTE_1).await;
    h.switch.add_vif("br-int", "tap-a", "port-a", SRC_A_MAC, Some(7));
    h.switch.add_vif("br-int", "tap-col", "port-col", COL_MAC, Some(9));
    let col = port("port-col", COL_MAC);

    let baseline = h.switch.snapshot();
    applied(h.agent.handle(&create_service("svc-1", &col, 3901, COMPUTE_1)).await.unwrap());
    let with_service = h.switch.snapshot();

    let flow = FlowIntentBuilder::new("flow-1", "svc-1", 3901).source(port("port-a", SRC_A_MAC), compute_1());
    applied(h.agent.handle(&flow.clone().create()).await.unwrap());
    assert_eq!(h.switch.flows("br-int").len(), 3);

    applied(h.agent.handle(&flow.delete()).await.unwrap());
    let verifier = RuleSetVerifier::new(&h.switch);
    verifier.assert_unchanged_since(&with_service).unwrap();

    applied(h.agent.handle(&delete_service("svc-1", &col, 3901, COMPUTE_1)).await.unwrap());
    verifier.assert_unchanged_since(&baseline).unwrap();
    verifier.assert_no_violations().unwrap();
    assert_eq!(h.switch.port("tap-col").unwrap().tag, Some(9));
}

#[tokio::test]
async fn shared_broadcast_rule_survives_until_last_flow() {
    let h = host(COMPUTE_1).await;
    h.switch.add_vif("br-int", "tap-a", "port-a", SRC_A_MAC, Some(7));
    h.switch.add_vif("br-int", "tap-b", "port-b", SRC_B_MAC, Some(7));
    let patch = h.switch.port("patch-int-tap").unwrap().ofport;
    let bcmc = FlowMatch::bcmc(7);

    let flow_a = FlowIntentBuilder::new("flow-a", "svc-1", 3901)
        .source(port("port-a", SRC_A_MAC), compute_1())
        .direction(Direction::In);
    let flow_b = FlowIntentBuilder::new("flow-b", "svc-1", 3901)
        .source(port("port-b", SRC_B_MAC), compute_1())
        .direction(Direction::In);
    applied(h.agent.handle(&flow_a.clone().create()).await.unwrap());
    applied(h.agent.handle(&flow_b.clone().create()).await.unwrap());

    let verifier = RuleSetVerifier::new(&h.switch);
    let expected = format!("normal,mod_vlan_vid:3901,output:{}", patch);
    verifier.assert_actions("br-int", 0, 20, &bcmc, &expected).unwrap();

    applied(h.agent.handle(&flow_a.delete()).await.unwrap());
    verifier.assert_actions("br-int", 0, 20, &bcmc, &expected).unwrap();
    verifier
        .assert_no_rule("br-int", 0, 20, &FlowMatch::new().dl_dst(SRC_A_MAC))
        .unwrap();

    applied(h.agent.handle(&flow_b.delete()).await.unwrap());
    verifier.assert_no_rule("br-int", 0, 20, &bcmc).unwrap();
    assert!(h.switch.flows("br-int").is_empty());
}

#[tokio::test]
async fn broadcast_rule_lists_every_service_on_the_vlan() {
    let h = host(COMPUTE_1).await;
    h.switch.add_vif("br-int", "tap-a", "port-a", SRC_A_MAC, Some(7));
    h.switch.add_vif("br-int", "tap-b", "port-b", SRC_B_MAC, Some(7));
    let patch = h.switch.port("patch-int-tap").unwrap().ofport;

    let flow_a = FlowIntentBuilder::new("flow-a", "svc-1", 3901)
        .source(port("port-a", SRC_A_MAC), compute_1());
    let flow_b = FlowIntentBuilder::new("flow-b", "svc-2", 3902)
        .source(port("port-b", SRC_B_MAC), compute_1());
    applied(h.agent.handle(&flow_a.clone().create()).await.unwrap());
    applied(h.agent.handle(&flow_b.create()).await.unwrap());

    let verifier = RuleSetVerifier::new(&h.switch);
    verifier
        .assert_actions(
            "br-int",
            0,
            20,
            &FlowMatch::bcmc(7),
            &format!(
                "normal,mod_vlan_vid:3901,output:{p},mod_vlan_vid:3902,output:{p}",
                p = patch
            ),
        )
        .unwrap();

    applied(h.agent.handle(&flow_a.delete()).await.unwrap());
    verifier
        .assert_actions(
            "br-int",
            0,
            20,
            &FlowMatch::bcmc(7),
            &format!("normal,mod_vlan_vid:3902,output:{}", patch),
        )
        .unwrap();
}

#[tokio::test]
async fn tunnel_shared_between_flows_of_one_host_pair() {
    let h = host(COMPUTE_1).await;
    h.switch.add_vif("br-int", "tap-a", "port-a", SRC_A_MAC, Some(7));
    h.switch.add_vif("br-int", "tap-b", "port-b", SRC_B_MAC, Some(8));
    let remote_col = port("port-col", COL_MAC);

    let flow_a = FlowIntentBuilder::new("flow-a", "svc-1", 3901)
        .source(port("port-a", SRC_A_MAC), compute_1())
        .collection(remote_col.clone(), compute_2());
    let flow_b = FlowIntentBuilder::new("flow-b", "svc-1", 3901)
        .source(port("port-b", SRC_B_MAC), compute_1())
        .collection(remote_col, compute_2());

    applied(h.agent.handle(&flow_a.clone().create()).await.unwrap());
    applied(h.agent.handle(&flow_b.clone().create()).await.unwrap());
    assert_eq!(h.switch.tunnel_ports("br-tap"), vec!["tvx-0a000002".to_string()]);

    let verifier = RuleSetVerifier::new(&h.switch);
    let tunnel_rule = FlowMatch::new().dl_vlan(3901);
    verifier.assert_rule("br-tap", 1, 20, &tunnel_rule).unwrap();

    applied(h.agent.handle(&flow_a.delete()).await.unwrap());
    assert_eq!(h.switch.tunnel_ports("br-tap"), vec!["tvx-0a000002".to_string()]);
    verifier.assert_rule("br-tap", 1, 20, &tunnel_rule).unwrap();

    applied(h.agent.handle(&flow_b.delete()).await.unwrap());
    assert!(h.switch.tunnel_ports("br-tap").is_empty());
    verifier.assert_no_rule("br-tap", 1, 20, &tunnel_rule).unwrap();
    verifier.assert_no_violations().unwrap();
}

#[tokio::test]
async fn cross_host_flow_programs_both_ends() {
    let source = host(COMPUTE_1).await;
    let collector = host(COMPUTE_2).await;
    source.switch.add_vif("br-int", "tap-a", "port-a", SRC_A_MAC, Some(7));
    collector.switch.add_vif("br-int", "tap-col", "port-col", COL_MAC, Some(9));
    let col = port("port-col", COL_MAC);

    let service = create_service("svc-1", &col, 3901, COMPUTE_2);
    assert_eq!(source.agent.handle(&service).await.unwrap(), Outcome::Skipped);
    applied(collector.agent.handle(&service).await.unwrap());

    let flow = FlowIntentBuilder::new("flow-1", "svc-1", 3901)
        .source(port("port-a", SRC_A_MAC), compute_1())
        .collection(col.clone(), compute_2());
    for h in [&source, &collector] {
        assert_eq!(
            h.agent.handle(&flow.clone().create()).await.unwrap(),
            Outcome::Applied(Backend::Switch)
        );
    }

    // Sender: mirror rules plus taas_id into the tunnel
    let tun = source.switch.port("tvx-0a000002").unwrap().ofport;
    RuleSetVerifier::new(&source.switch)
        .assert_actions(
            "br-tap",
            1,
            20,
            &FlowMatch::new().dl_vlan(3901),
            &format!("set_field:3901->tun_id,output:{}", tun),
        )
        .unwrap();

    // Receiver: tunnel traffic re-tagged and delivered
    let tun = collector.switch.port("tvx-0a000001").unwrap().ofport;
    RuleSetVerifier::new(&collector.switch)
        .assert_actions(
            "br-tap",
            0,
            10,
            &FlowMatch::new().in_port(tun).tun_id(3901),
            "mod_vlan_vid:3901,resubmit(,1)",
        )
        .unwrap();

    for h in [&source, &collector] {
        applied(h.agent.handle(&flow.clone().delete()).await.unwrap());
        assert!(h.switch.tunnel_ports("br-tap").is_empty());
        RuleSetVerifier::new(&h.switch).assert_no_violations().unwrap();
    }
}

#[tokio::test]
async fn replayed_intents_are_idempotent() {
    let h = host(COMPUTE_1).await;
    h.switch.add_vif("br-int", "tap-a", "port-a", SRC_A_MAC, Some(7));
    h.switch.add_vif("br-int", "tap-col", "port-col", COL_MAC, Some(9));
    let col = port("port-col", COL_MAC);
    let baseline = h.switch.snapshot();

    let service = create_service("svc-1", &col, 3901, COMPUTE_1);
    let flow = FlowIntentBuilder::new("flow-1", "svc-1", 3901)
        .source(port("port-a", SRC_A_MAC), compute_1());

    for _ in 0..3 {
        applied(h.agent.handle(&service).await.unwrap());
        applied(h.agent.handle(&flow.clone().create()).await.unwrap());
    }
    assert_eq!(h.agent.flow_controller().applied_flow_count().await, 1);

    applied(h.agent.handle(&flow.clone().delete()).await.unwrap());
    applied(h.agent.handle(&delete_service("svc-1", &col, 3901, COMPUTE_1)).await.unwrap());
    RuleSetVerifier::new(&h.switch).assert_unchanged_since(&baseline).unwrap();

    // Deleting again changes nothing
    applied(h.agent.handle(&flow.delete()).await.unwrap());
    applied(h.agent.handle(&delete_service("svc-1", &col, 3901, COMPUTE_1)).await.unwrap());
    RuleSetVerifier::new(&h.switch).assert_unchanged_since(&baseline).unwrap();
}

#[tokio::test]
async fn delete_tolerates_vanished_ports() {
    let h = host(COMPUTE_1).await;
    h.switch.add_vif("br-int", "tap-a", "port-a", SRC_A_MAC, Some(7));
    h.switch.add_vif("br-int", "tap-col", "port-col", COL_MAC, Some(9));
    let col = port("port-col", COL_MAC);

    applied(h.agent.handle(&create_service("svc-1", &col, 3901, COMPUTE_1)).await.unwrap());
    let flow = FlowIntentBuilder::new("flow-1", "svc-1", 3901)
        .source(port("port-a", SRC_A_MAC), compute_1());
    applied(h.agent.handle(&flow.clone().create()).await.unwrap());

    h.switch.remove_port_externally("tap-col");
    applied(h.agent.handle(&flow.delete()).await.unwrap());
    applied(h.agent.handle(&delete_service("svc-1", &col, 3901, COMPUTE_1)).await.unwrap());
    assert!(h.switch.flows("br-int").is_empty());
}

#[tokio::test]
async fn create_with_missing_source_port_fails() {
    let h = host(COMPUTE_1).await;
    let flow = FlowIntentBuilder::new("flow-1", "svc-1", 3901)
        .source(port("port-ghost", SRC_A_MAC), compute_1())
        .create();
    assert!(h.agent.handle(&flow).await.is_err());
}

fn vlans(s: &str) -> VlanSet {
    vlan_range::parse(s).unwrap()
}

#[tokio::test]
async fn sriov_mirrors_common_vlans() {
    let h = host(COMPUTE_1).await;
    let source = with_binding(
        sriov_port("vf-src", SRC_A_MAC, "0000:03:10.1"),
        Some("4-6,8-10,15-18,20"),
        None,
        None,
    );
    let collection = with_binding(
        sriov_port("vf-col", COL_MAC, "0000:03:10.3"),
        None,
        None,
        Some("1-5,9,18,20,27-30,4000-4095"),
    );

    let flow = FlowIntentBuilder::new("flow-1", "svc-1", 3901)
        .source(source, compute_1())
        .collection(collection, compute_1());
    assert_eq!(
        h.agent.handle(&flow.clone().create()).await.unwrap(),
        Outcome::Applied(Backend::Sriov)
    );
    assert_eq!(h.nic.vlan_mirror("p1p1", 3), vlans("4-5,9,18,20"));
    assert!(h.switch.flows("br-int").is_empty());
}

#[tokio::test]
async fn sriov_delete_keeps_remaining_flows_vlans() {
    let h = host(COMPUTE_1).await;
    let collection = with_binding(
        sriov_port("vf-col", COL_MAC, "0000:03:10.3"),
        None,
        None,
        Some("1-100"),
    );
    let flow_a = FlowIntentBuilder::new("flow-a", "svc-1", 3901)
        .source(
            with_binding(sriov_port("vf-a", SRC_A_MAC, "0000:03:10.1"), Some("10-12"), None, None),
            compute_1(),
        )
        .collection(collection.clone(), compute_1());
    let flow_b = FlowIntentBuilder::new("flow-b", "svc-1", 3901)
        .source(
            with_binding(sriov_port("vf-b", SRC_B_MAC, "0000:03:10.2"), Some("12-14"), None, None),
            compute_1(),
        )
        .collection(collection, compute_1());

    applied(h.agent.handle(&flow_a.clone().create()).await.unwrap());
    applied(h.agent.handle(&flow_b.create()).await.unwrap());
    assert_eq!(h.nic.vlan_mirror("p1p1", 3), vlans("10-14"));

    applied(
        h.agent
            .handle(&flow_a.remaining_mirror_vlans(["12-14"]).delete())
            .await
            .unwrap(),
    );
    assert_eq!(h.nic.vlan_mirror("p1p1", 3), vlans("12-14"));
}

#[tokio::test]
async fn sriov_flow_on_other_host_skipped() {
    let h = host(COMPUTE_2).await;
    let flow = FlowIntentBuilder::new("flow-1", "svc-1", 3901)
        .source(sriov_port("vf-src", SRC_A_MAC, "0000:03:10.1"), compute_1())
        .create();
    assert_eq!(h.agent.handle(&flow).await.unwrap(), Outcome::Skipped);
    assert!(h.nic.commands().is_empty());
}

#[tokio::test]
async fn sriov_delete_keeps_vlans_of_differently_filtered_flow() {
    let h = host(COMPUTE_1).await;
    let collection = sriov_port("vf-col", COL_MAC, "0000:03:10.3");
    let flow_a = FlowIntentBuilder::new("flow-a", "svc-1", 3901)
        .source(sriov_port("vf-a", SRC_A_MAC, "0000:03:10.1"), compute_1())
        .collection(collection.clone(), compute_1())
        .vlan_filter("10");
    let flow_b = FlowIntentBuilder::new("flow-b", "svc-1", 3901)
        .source(sriov_port("vf-b", SRC_B_MAC, "0000:03:10.2"), compute_1())
        .collection(collection, compute_1())
        .vlan_filter("20");

    applied(h.agent.handle(&flow_a.clone().create()).await.unwrap());
    applied(h.agent.handle(&flow_b.create()).await.unwrap());
    assert_eq!(h.nic.vlan_mirror("p1p1", 3), vlans("10,20"));

    applied(
        h.agent
            .handle(&flow_a.remaining_mirror_vlans(["20"]).delete())
            .await
            .unwrap(),
    );
    assert_eq!(h.nic.vlan_mirror("p1p1", 3), vlans("20"));
}

#[tokio::test]
async fn sriov_delete_after_source_vf_released() {
    let h = host(COMPUTE_1).await;
    let collection = with_binding(
        sriov_port("vf-col", COL_MAC, "0000:03:10.3"),
        None,
        None,
        Some("5-6"),
    );
    let flow = FlowIntentBuilder::new("flow-1", "svc-1", 3901)
        .source(sriov_port("vf-a", SRC_A_MAC, "0000:03:10.1"), compute_1())
        .collection(collection, compute_1());
    applied(h.agent.handle(&flow.clone().create()).await.unwrap());
    assert_eq!(h.nic.vlan_mirror("p1p1", 3), vlans("5-6"));

    // The source VF was handed back and its PCI slot is gone
    let released = FlowIntentBuilder::new("flow-1", "svc-1", 3901)
        .source(sriov_port("vf-a", SRC_A_MAC, "0000:03:11.7"), compute_1())
        .collection(
            with_binding(sriov_port("vf-col", COL_MAC, "0000:03:10.3"), None, None, Some("5-6")),
            compute_1(),
        );
    applied(h.agent.handle(&released.delete()).await.unwrap());
    assert!(h.nic.vlan_mirror("p1p1", 3).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_flows_share_broadcast_rule_and_tunnel() {
    let h = Arc::new(host(COMPUTE_1).await);
    let remote_col = port("port-col", COL_MAC);
    let mut flows = Vec::new();
    for i in 0..6u16 {
        let name = format!("tap-{}", i);
        let id = format!("port-{}", i);
        let mac = format!("fa:16:3e:00:01:{:02x}", i);
        h.switch.add_vif("br-int", &name, &id, &mac, Some(7));
        let taas_id = 3901 + i % 3;
        flows.push(
            FlowIntentBuilder::new(&format!("flow-{}", i), &format!("svc-{}", i % 3), taas_id)
                .source(port(&id, &mac), compute_1())
                .collection(remote_col.clone(), compute_2())
                .direction(Direction::In),
        );
    }

    let mut tasks = Vec::new();
    for flow in flows.clone() {
        let h = h.clone();
        tasks.push(tokio::spawn(async move { h.agent.handle(&flow.create()).await }));
    }
    for task in tasks {
        applied(task.await.unwrap().unwrap());
    }

    let patch = h.switch.port("patch-int-tap").unwrap().ofport;
    let verifier = RuleSetVerifier::new(&h.switch);
    verifier
        .assert_actions(
            "br-int",
            0,
            20,
            &FlowMatch::bcmc(7),
            &format!(
                "normal,mod_vlan_vid:3901,output:{p},mod_vlan_vid:3902,output:{p},mod_vlan_vid:3903,output:{p}",
                p = patch
            ),
        )
        .unwrap();
    assert_eq!(h.switch.tunnel_ports("br-tap"), vec!["tvx-0a000002".to_string()]);
    h.switch.clear_calls();

    let mut tasks = Vec::new();
    for flow in flows {
        let h = h.clone();
        tasks.push(tokio::spawn(async move { h.agent.handle(&flow.delete()).await }));
    }
    for task in tasks {
        applied(task.await.unwrap().unwrap());
    }

    verifier.assert_no_rule("br-int", 0, 20, &FlowMatch::bcmc(7)).unwrap();
    assert!(h.switch.tunnel_ports("br-tap").is_empty());
    let teardowns = h
        .switch
        .calls()
        .iter()
        .filter(|call| call.as_str() == "delete_port br-tap tvx-0a000002")
        .count();
    assert_eq!(teardowns, 1);
    assert!(h.switch.flows("br-int").is_empty());
    verifier.assert_no_violations().unwrap();
}
