use searchop::searchop::config::RolloutSettings;
use searchop::searchop::controller::coordinator::{
    ClusterRolloutCoordinator, NodeGroupSpec, SECRET_FINGERPRINT_ENV,
};
use searchop::searchop::controller::orchestrator::{NodeIdentity, RolloutError};
use searchop::searchop::controller::status::{
    CONDITION_BLOCKED, CONDITION_FAILED, CONDITION_FINGERPRINT_UNKNOWN, CONDITION_PROGRESSING,
};
use searchop::searchop::k8s::pod::{ObjectMeta, PodTemplateSpec};
use searchop::searchop::k8s::secret::Secret;
use searchop::searchop::k8s::workload::{DataBagKey, TopologyKind, WorkloadKey};
use searchop::searchop::test_support::{search_template, SimulatedCluster};
use std::sync::Arc;

const NAMESPACE: &str = "logging";

fn group(
    name: &str,
    topology: TopologyKind,
    replicas: u32,
    domain: &str,
    desired: PodTemplateSpec,
) -> NodeGroupSpec {
    NodeGroupSpec {
        identity: NodeIdentity::new(NAMESPACE, name, topology, replicas),
        desired,
        failure_domain: domain.to_string(),
    }
}

fn coordinator(sim: &Arc<SimulatedCluster>) -> ClusterRolloutCoordinator {
    ClusterRolloutCoordinator::new(sim.dependencies(), RolloutSettings::default())
}

fn live_image(sim: &SimulatedCluster, name: &str) -> Option<String> {
    sim.store()
        .workload(&WorkloadKey::new(NAMESPACE, name))
        .and_then(|live| live.template().spec.containers[0].image.clone())
}

fn live_env(sim: &SimulatedCluster, name: &str, var: &str) -> Option<String> {
    sim.store()
        .workload(&WorkloadKey::new(NAMESPACE, name))
        .and_then(|live| {
            live.template().spec.containers[0]
                .env_value(var)
                .map(str::to_string)
        })
}

#[tokio::test(start_paused = true)]
async fn creates_missing_groups_then_rolls_template_changes() {
    let sim = Arc::new(SimulatedCluster::new(6, 1, 1));
    let mut coordinator = coordinator(&sim);
    let v1 = search_template("search:v1");
    coordinator
        .upsert_node(group("es-master", TopologyKind::Ordinal, 3, "zone-a", v1.clone()))
        .expect("master");
    coordinator
        .upsert_node(group("es-data", TopologyKind::Ordinal, 2, "zone-a", v1.clone()))
        .expect("data");
    coordinator
        .upsert_node(group("es-ingest", TopologyKind::Independent, 1, "zone-b", v1))
        .expect("ingest");
    assert_eq!(coordinator.expected_cluster_size(), 6);

    let first = coordinator.reconcile().await;
    assert!(first.is_converged(), "{first:?}");
    assert!(first.nodes.iter().all(|node| node.created));
    assert_eq!(first.health.as_ref().map(|h| h.number_of_nodes), Some(6));

    let v2 = search_template("search:v2");
    coordinator
        .upsert_node(group("es-master", TopologyKind::Ordinal, 3, "zone-a", v2.clone()))
        .expect("master");
    coordinator
        .upsert_node(group("es-ingest", TopologyKind::Independent, 1, "zone-b", v2))
        .expect("ingest");

    let second = coordinator.reconcile().await;
    assert!(second.is_converged(), "{second:?}");
    let master = second.node("es-master").expect("master status");
    assert_eq!(master.outcome.as_deref(), Some("Completed"));
    assert_eq!(
        master
            .condition(CONDITION_PROGRESSING)
            .and_then(|condition| condition.reason.as_deref()),
        Some("RolloutComplete")
    );
    assert_eq!(
        second.node("es-data").and_then(|node| node.outcome.as_deref()),
        Some("Unchanged")
    );
    assert_eq!(live_image(&sim, "es-master").as_deref(), Some("search:v2"));
    assert_eq!(live_image(&sim, "es-ingest").as_deref(), Some("search:v2"));
    assert_eq!(live_image(&sim, "es-data").as_deref(), Some("search:v1"));
}

#[tokio::test(start_paused = true)]
async fn failing_group_blocks_the_rest_of_its_failure_domain() {
    let sim = Arc::new(SimulatedCluster::new(6, 1, 1));
    let mut coordinator = coordinator(&sim);
    let mut broken = search_template("search:v1");
    broken.spec.containers.clear();
    coordinator
        .upsert_node(group("es-master", TopologyKind::Ordinal, 3, "zone-a", broken))
        .expect("master");
    coordinator
        .upsert_node(group(
            "es-data",
            TopologyKind::Ordinal,
            2,
            "zone-a",
            search_template("search:v1"),
        ))
        .expect("data");
    coordinator
        .upsert_node(group(
            "es-ingest",
            TopologyKind::Independent,
            1,
            "zone-b",
            search_template("search:v1"),
        ))
        .expect("ingest");

    let status = coordinator.reconcile().await;

    assert!(!status.is_converged());
    let master = status.node("es-master").expect("master");
    assert!(master.has_condition(CONDITION_FAILED));
    assert_eq!(master.phase, "Failed");
    assert!(status
        .node("es-data")
        .expect("data")
        .has_condition(CONDITION_BLOCKED));
    assert!(sim
        .store()
        .workload(&WorkloadKey::new(NAMESPACE, "es-data"))
        .is_none());
    let ingest = status.node("es-ingest").expect("ingest");
    assert!(!ingest.has_condition(CONDITION_FAILED));
    assert!(ingest.created);
}

#[tokio::test(start_paused = true)]
async fn secret_change_restarts_the_group_with_the_new_fingerprint() {
    let sim = Arc::new(SimulatedCluster::new(3, 1, 1));
    sim.store().put_secret(
        Secret::new(ObjectMeta::named(NAMESPACE, "es-certs")).with_entry("tls.crt", b"cert-a"),
    );
    let mut coordinator = coordinator(&sim);
    let mut spec = group(
        "es-data",
        TopologyKind::Ordinal,
        3,
        "zone-a",
        search_template("search:v1"),
    );
    spec.identity = spec
        .identity
        .with_secret(DataBagKey::secret(NAMESPACE, "es-certs"));
    coordinator.upsert_node(spec).expect("register");

    let first = coordinator.reconcile().await;
    let baseline = first.node("es-data").expect("status").secret_fingerprint.clone();
    assert!(!baseline.is_empty());
    assert_eq!(
        live_env(&sim, "es-data", SECRET_FINGERPRINT_ENV),
        Some(baseline.clone())
    );
    assert!(first.is_converged(), "{first:?}");

    sim.store().put_secret(
        Secret::new(ObjectMeta::named(NAMESPACE, "es-certs")).with_entry("tls.crt", b"cert-b"),
    );
    let second = coordinator.reconcile().await;
    let node = second.node("es-data").expect("status");
    assert_eq!(node.outcome.as_deref(), Some("Completed"));
    assert_ne!(node.secret_fingerprint, baseline);
    assert_eq!(
        live_env(&sim, "es-data", SECRET_FINGERPRINT_ENV),
        Some(node.secret_fingerprint.clone())
    );
    assert_eq!(sim.partitions_seen(), vec![3, 2, 1, 0]);

    let third = coordinator.reconcile().await;
    assert_eq!(
        third.node("es-data").and_then(|node| node.outcome.as_deref()),
        Some("Unchanged")
    );
}

#[tokio::test(start_paused = true)]
async fn unknown_fingerprint_without_baseline_skips_the_group() {
    let sim = Arc::new(SimulatedCluster::new(3, 1, 1));
    let mut coordinator = coordinator(&sim);
    let mut spec = group(
        "es-data",
        TopologyKind::Ordinal,
        3,
        "zone-a",
        search_template("search:v1"),
    );
    spec.identity = spec
        .identity
        .with_secret(DataBagKey::secret(NAMESPACE, "es-certs"));
    coordinator.upsert_node(spec).expect("register");

    let skipped = coordinator.reconcile().await;
    assert!(skipped
        .node("es-data")
        .expect("status")
        .has_condition(CONDITION_FINGERPRINT_UNKNOWN));
    assert!(!skipped.is_converged());
    assert!(sim
        .store()
        .workload(&WorkloadKey::new(NAMESPACE, "es-data"))
        .is_none());

    sim.store().put_secret(
        Secret::new(ObjectMeta::named(NAMESPACE, "es-certs")).with_entry("tls.crt", b"cert-a"),
    );
    let created = coordinator.reconcile().await;
    assert!(created.node("es-data").expect("status").created);
    assert!(created.is_converged(), "{created:?}");
}

#[tokio::test(start_paused = true)]
async fn unreadable_fingerprint_with_baseline_is_never_reported_converged() {
    let sim = Arc::new(SimulatedCluster::new(3, 1, 1));
    sim.store().put_secret(
        Secret::new(ObjectMeta::named(NAMESPACE, "es-certs")).with_entry("tls.crt", b"cert-a"),
    );
    let mut coordinator = coordinator(&sim);
    let mut spec = group(
        "es-data",
        TopologyKind::Ordinal,
        3,
        "zone-a",
        search_template("search:v1"),
    );
    spec.identity = spec
        .identity
        .with_secret(DataBagKey::secret(NAMESPACE, "es-certs"));
    coordinator.upsert_node(spec).expect("register");

    let first = coordinator.reconcile().await;
    assert!(first.is_converged(), "{first:?}");
    let baseline = first.node("es-data").expect("status").secret_fingerprint.clone();

    sim.store().fail_next_data_bags(1);
    let second = coordinator.reconcile().await;
    let node = second.node("es-data").expect("status");
    assert!(node.has_condition(CONDITION_FINGERPRINT_UNKNOWN), "{node:?}");
    assert!(!second.is_converged());
    assert_eq!(node.secret_fingerprint, baseline);
    assert_eq!(
        live_env(&sim, "es-data", SECRET_FINGERPRINT_ENV),
        Some(baseline.clone())
    );

    let third = coordinator.reconcile().await;
    assert!(third.is_converged(), "{third:?}");
    assert!(!third
        .node("es-data")
        .expect("status")
        .has_condition(CONDITION_FINGERPRINT_UNKNOWN));
}

#[tokio::test(start_paused = true)]
async fn upsert_keeps_fingerprints_and_rejects_topology_changes() {
    let sim = Arc::new(SimulatedCluster::new(3, 1, 1));
    sim.store().put_secret(
        Secret::new(ObjectMeta::named(NAMESPACE, "es-certs")).with_entry("tls.crt", b"cert-a"),
    );
    let mut coordinator = coordinator(&sim);
    let mut spec = group(
        "es-data",
        TopologyKind::Ordinal,
        3,
        "zone-a",
        search_template("search:v1"),
    );
    spec.identity = spec
        .identity
        .with_secret(DataBagKey::secret(NAMESPACE, "es-certs"));
    coordinator.upsert_node(spec.clone()).expect("register");
    coordinator.reconcile().await;
    let recorded = coordinator
        .orchestrator("es-data")
        .expect("orchestrator")
        .state()
        .secret_fingerprint
        .clone();
    assert!(!recorded.is_empty());

    spec.desired = search_template("search:v2");
    coordinator.upsert_node(spec.clone()).expect("update");
    assert_eq!(
        coordinator
            .orchestrator("es-data")
            .expect("orchestrator")
            .state()
            .secret_fingerprint,
        recorded
    );

    spec.identity.topology = TopologyKind::Independent;
    let err = coordinator.upsert_node(spec).expect_err("topology is fixed");
    assert!(matches!(err, RolloutError::FatalConfiguration(_)));
}

#[tokio::test(start_paused = true)]
async fn removing_a_group_deletes_its_workload() {
    let sim = Arc::new(SimulatedCluster::new(4, 1, 1));
    let mut coordinator = coordinator(&sim);
    coordinator
        .upsert_node(group(
            "es-master",
            TopologyKind::Ordinal,
            3,
            "zone-a",
            search_template("search:v1"),
        ))
        .expect("master");
    coordinator
        .upsert_node(group(
            "es-ingest",
            TopologyKind::Independent,
            1,
            "zone-b",
            search_template("search:v1"),
        ))
        .expect("ingest");
    coordinator.reconcile().await;

    assert!(coordinator.remove_node("es-ingest").await.expect("remove"));
    assert!(!coordinator.remove_node("es-ingest").await.expect("second remove"));

    assert_eq!(coordinator.node_names(), vec!["es-master"]);
    assert_eq!(coordinator.expected_cluster_size(), 3);
    assert_eq!(
        coordinator
            .orchestrator("es-master")
            .expect("master")
            .expected_cluster_size(),
        3
    );
    assert!(sim
        .store()
        .workload(&WorkloadKey::new(NAMESPACE, "es-ingest"))
        .is_none());
}
