//! Two-replica rounds over the in-memory transport.
//!
//! Exercises the full driver: mailbox routing, the stateless responder,
//! simultaneous initiation, phase observability and the liveness seam.

use std::sync::Arc;
use std::time::Duration;

use flotilla_catalog::liveness::LivenessPolicy;
use flotilla_catalog::ServiceCatalog;
use flotilla_config::{ConfigFile, NodeConfig, RpcConfig, SyncConfig};
use flotilla_node::mock::MemoryHub;
use flotilla_node::RegistryNode;
use flotilla_primitives::service::ServiceInstance;
use flotilla_sync::engine::RoundPhase;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const DATA_SERVICE: &str = "com.corp.DataService.v1";
const AUTH_SERVICE: &str = "com.corp.AuthService.v1";
const LOG_SERVICE: &str = "com.corp.LoggingService.v1";

const ID_DATA_N1: &str = "11e7ae71-f171-4f4e-8b8f-2c1ad4f9a8e1";
const ID_DATA_N2: &str = "29f1c6d2-0a3b-4d5e-9f60-7a8b9c0d1e2f";
const ID_AUTH_N2: &str = "3b2d9e4f-5c6a-47b8-a901-234567890abc";
const ID_LOG_N1: &str = "4c3e0f5a-6d7b-48c9-b012-3456789abcde";

// ============================================================
// Harness
// ============================================================

fn config(node_id: &str, region: &str) -> ConfigFile {
    ConfigFile::new(
        NodeConfig {
            node_id: node_id.to_owned(),
            latitude: 30.2741,
            longitude: 120.1551,
            region: region.to_owned(),
        },
        SyncConfig::default(),
        RpcConfig::default(),
        Vec::new(),
    )
}

fn replica(
    hub: &MemoryHub,
    node_id: &str,
    region: &str,
) -> (Arc<RegistryNode>, UnboundedReceiver<(String, Vec<u8>)>) {
    let (transport, inbox) = hub.endpoint(node_id);
    let node = Arc::new(RegistryNode::new(
        &config(node_id, region),
        Arc::new(transport),
    ));

    (node, inbox)
}

/// Drains an inbox into the node's receive path, like a host would.
fn pump(
    node: Arc<RegistryNode>,
    mut inbox: UnboundedReceiver<(String, Vec<u8>)>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some((sender, bytes)) = inbox.recv().await {
            node.handle_sync_message(&sender, &bytes)
                .await
                .expect("sync frame rejected");
        }
    })
}

fn instance(name: &str, id: &str, node_id: &str) -> ServiceInstance {
    ServiceInstance {
        service_name: name.to_owned(),
        instance_id: id.to_owned(),
        node_id: node_id.to_owned(),
        is_alive: true,
    }
}

async fn register(node: &RegistryNode, name: &str, id: &str) {
    let engine = node.engine();
    let mut engine = engine.lock().await;

    engine
        .register(instance(name, id, node.node_id()))
        .expect("registration rejected");
}

/// Waits out the asynchronous half of a round: the responder merges in
/// its own receive task, after the initiator's round already returned.
async fn converged(a: &RegistryNode, b: &RegistryNode) {
    for _ in 0..100 {
        let root_a = a.engine().lock().await.root();
        let root_b = b.engine().lock().await.root();

        if root_a == root_b {
            return;
        }

        sleep(Duration::from_millis(5)).await;
    }

    panic!("replicas never converged");
}

// ============================================================
// Rounds
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_one_round_converges_two_replicas() {
    let hub = MemoryHub::new();
    let (node1, inbox1) = replica(&hub, "node1", "Hangzhou");
    let (node2, inbox2) = replica(&hub, "node2", "Shanghai");

    register(&node1, DATA_SERVICE, ID_DATA_N1).await;
    register(&node1, LOG_SERVICE, ID_LOG_N1).await;
    register(&node2, DATA_SERVICE, ID_DATA_N2).await;
    register(&node2, AUTH_SERVICE, ID_AUTH_N2).await;

    let _pump1 = pump(Arc::clone(&node1), inbox1);
    let _pump2 = pump(Arc::clone(&node2), inbox2);

    let report = node1.sync_once("node2").await.expect("round failed");

    assert_eq!(report.peer_id, "node2");
    assert_eq!(
        report.divergent,
        vec![DATA_SERVICE.to_owned(), LOG_SERVICE.to_owned()],
    );
    assert_eq!(report.pushed, 2);
    assert_eq!(report.merged, 2);

    converged(&node1, &node2).await;

    {
        let engine = node1.engine();
        let engine = engine.lock().await;
        assert_eq!(engine.catalog().group_count(), 3);
        assert_eq!(engine.snapshot().len(), 4);
    }

    let snapshot1 = node1.engine().lock().await.snapshot();
    let snapshot2 = node2.engine().lock().await.snapshot();
    assert_eq!(snapshot1, snapshot2);

    // The reverse direction over equal trees moves no records at all.
    let report = node2.sync_once("node1").await.expect("second round failed");

    assert!(report.divergent.is_empty());
    assert_eq!(report.pushed, 0);
    assert_eq!(report.merged, 0);
}

#[tokio::test(start_paused = true)]
async fn test_simultaneous_initiation_converges_both_rounds() {
    let hub = MemoryHub::new();
    let (node1, inbox1) = replica(&hub, "node1", "Hangzhou");
    let (node2, inbox2) = replica(&hub, "node2", "Shanghai");

    register(&node1, DATA_SERVICE, ID_DATA_N1).await;
    register(&node2, AUTH_SERVICE, ID_AUTH_N2).await;

    let _pump1 = pump(Arc::clone(&node1), inbox1);
    let _pump2 = pump(Arc::clone(&node2), inbox2);

    let (report1, report2) = tokio::join!(node1.sync_once("node2"), node2.sync_once("node1"));

    let report1 = report1.expect("node1 round failed");
    let report2 = report2.expect("node2 round failed");

    assert_eq!(report1.divergent, vec![DATA_SERVICE.to_owned()]);
    assert_eq!(report2.divergent, vec![AUTH_SERVICE.to_owned()]);
    assert_eq!(report1.pushed, 1);
    assert_eq!(report2.pushed, 1);
    assert_eq!(report1.merged, 1);
    assert_eq!(report2.merged, 1);

    converged(&node1, &node2).await;
}

#[tokio::test(start_paused = true)]
async fn test_sync_loop_converges_on_its_own_cadence() {
    let hub = MemoryHub::new();
    let (node1, inbox1) = replica(&hub, "node1", "Hangzhou");
    let (node2, inbox2) = replica(&hub, "node2", "Shanghai");

    register(&node1, DATA_SERVICE, ID_DATA_N1).await;
    register(&node2, AUTH_SERVICE, ID_AUTH_N2).await;

    let _pump1 = pump(Arc::clone(&node1), inbox1);
    let _pump2 = pump(Arc::clone(&node2), inbox2);

    let driver = Arc::clone(&node1).spawn_sync_loop(vec!["node2".to_owned()]);

    converged(&node1, &node2).await;

    driver.abort();
}

// ============================================================
// Phases and round exclusivity
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_phase_follows_an_unanswered_round() {
    let hub = MemoryHub::new();
    let (node1, _inbox1) = replica(&hub, "node1", "Hangzhou");
    // node2 is reachable but never drains its inbox, so the round stalls
    // once the announce is out.
    let (_transport2, _inbox2) = hub.endpoint("node2");

    assert_eq!(node1.phase("node2"), RoundPhase::Idle);

    let driver = Arc::clone(&node1);
    let round = tokio::spawn(async move {
        timeout(Duration::from_millis(250), driver.sync_once("node2")).await
    });

    while node1.phase("node2") == RoundPhase::Idle {
        tokio::task::yield_now().await;
    }
    assert_eq!(node1.phase("node2"), RoundPhase::TreeExchanged);

    let outcome = round.await.expect("round task panicked");
    assert!(outcome.is_err(), "unanswered round should hit the timeout");
    assert_eq!(node1.phase("node2"), RoundPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_second_round_to_the_same_peer_is_rejected() {
    let hub = MemoryHub::new();
    let (node1, _inbox1) = replica(&hub, "node1", "Hangzhou");
    let (_transport2, _inbox2) = hub.endpoint("node2");

    let driver = Arc::clone(&node1);
    let round = tokio::spawn(async move {
        timeout(Duration::from_millis(250), driver.sync_once("node2")).await
    });

    while node1.phase("node2") == RoundPhase::Idle {
        tokio::task::yield_now().await;
    }

    let error = node1
        .sync_once("node2")
        .await
        .expect_err("concurrent round should be refused");
    assert!(error.to_string().contains("already in flight"));

    let _outcome = round.await.expect("round task panicked");
    assert_eq!(node1.phase("node2"), RoundPhase::Idle);
}

// ============================================================
// Liveness seam
// ============================================================

struct DownEverything;

impl LivenessPolicy for DownEverything {
    fn sweep(&mut self, catalog: &mut ServiceCatalog) -> usize {
        catalog.mark_dead_where(|_instance| true)
    }
}

#[tokio::test]
async fn test_sweep_liveness_runs_the_installed_policy() {
    let hub = MemoryHub::new();
    let (transport, _inbox) = hub.endpoint("node1");
    let node = RegistryNode::new(&config("node1", "Hangzhou"), Arc::new(transport))
        .with_liveness_policy(Box::new(DownEverything));

    register(&node, DATA_SERVICE, ID_DATA_N1).await;

    let root_before = node.engine().lock().await.root();

    assert_eq!(node.sweep_liveness().await, 1);
    assert_eq!(node.sweep_liveness().await, 0);

    let engine = node.engine();
    let engine = engine.lock().await;
    assert!(engine.snapshot().iter().all(|record| !record.is_alive));
    assert_ne!(engine.root(), root_before);
}

#[tokio::test]
async fn test_default_policy_downs_nothing() {
    let hub = MemoryHub::new();
    let (transport, _inbox) = hub.endpoint("node1");
    let node = RegistryNode::new(&config("node1", "Hangzhou"), Arc::new(transport));

    register(&node, DATA_SERVICE, ID_DATA_N1).await;

    assert_eq!(node.sweep_liveness().await, 0);
    assert!(node.engine().lock().await.snapshot()[0].is_alive);
}
