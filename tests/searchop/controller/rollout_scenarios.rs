use searchop::searchop::cluster::types::ClusterHealth;
use searchop::searchop::cluster::{AdminFuture, ClusterAdminApi};
use searchop::searchop::config::RolloutSettings;
use searchop::searchop::controller::fingerprint::compute_fingerprint;
use searchop::searchop::controller::orchestrator::{
    NodeIdentity, NodeRolloutOrchestrator, RolloutDependencies, RolloutError, RolloutOutcome,
    RolloutPhase,
};
use searchop::searchop::controller::topology::{
    IndependentStrategy, OrdinalStrategy, StepContext, TopologyStrategy,
};
use searchop::searchop::k8s::pod::{ObjectMeta, PodTemplateSpec};
use searchop::searchop::k8s::secret::Secret;
use searchop::searchop::k8s::store::InMemoryStore;
use searchop::searchop::k8s::workload::{
    DataBagKey, DataBagSource, TopologyKind, Workload, WorkloadKey,
};
use searchop::searchop::test_support::{
    green_health, search_template, ScriptedAdminApi, SimulatedCluster,
};
use searchop::searchop::util::new_error;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

const NAMESPACE: &str = "logging";

fn image(workload: &Workload) -> &str {
    workload.template().spec.containers[0]
        .image
        .as_deref()
        .unwrap_or_default()
}

/// Number of writes that changed the container image.
fn template_writes(history: &[Workload], initial: &str) -> usize {
    let mut previous = initial.to_string();
    let mut writes = 0;
    for workload in history {
        if image(workload) != previous {
            writes += 1;
            previous = image(workload).to_string();
        }
    }
    writes
}

fn dedup<T: PartialEq + Copy>(values: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut out: Vec<T> = Vec::new();
    for value in values {
        if out.last() != Some(&value) {
            out.push(value);
        }
    }
    out
}

fn ordinal_orchestrator(
    sim: &Arc<SimulatedCluster>,
    name: &str,
    replicas: u32,
    desired: PodTemplateSpec,
) -> NodeRolloutOrchestrator {
    NodeRolloutOrchestrator::new(
        NodeIdentity::new(NAMESPACE, name, TopologyKind::Ordinal, replicas),
        desired,
        sim.dependencies(),
        RolloutSettings::default(),
    )
}

#[tokio::test(start_paused = true)]
async fn ordinal_rollout_releases_one_ordinal_at_a_time() {
    let sim = Arc::new(SimulatedCluster::new(3, 2, 1));
    let key = WorkloadKey::new(NAMESPACE, "es-data");
    sim.seed(&key, TopologyKind::Ordinal, 3, &search_template("search:v1"));
    sim.store().put_secret(
        Secret::new(ObjectMeta::named(NAMESPACE, "es-certs")).with_entry("tls.crt", b"cert-a"),
    );

    let identity = NodeIdentity::new(NAMESPACE, "es-data", TopologyKind::Ordinal, 3)
        .with_secret(DataBagKey::secret(NAMESPACE, "es-certs"));
    let mut orchestrator = NodeRolloutOrchestrator::new(
        identity,
        search_template("search:v2"),
        sim.dependencies(),
        RolloutSettings::default(),
    );

    assert!(orchestrator.is_changed().await);
    let outcome = orchestrator
        .progress_node_changes()
        .await
        .expect("rollout succeeds");

    assert_eq!(outcome, RolloutOutcome::Completed { steps: 3 });
    assert_eq!(sim.partitions_seen(), vec![3, 2, 1, 0]);
    let live = sim.store().workload(&key).expect("workload");
    assert_eq!(image(&live), "search:v2");
    assert_eq!(live.partition(), Some(0));
    assert_eq!(orchestrator.phase(), RolloutPhase::Stable);
    assert!(!orchestrator.is_changed().await);

    let bag = sim
        .data_bag(&DataBagKey::secret(NAMESPACE, "es-certs"))
        .await
        .expect("secret");
    assert_eq!(
        orchestrator.state().secret_fingerprint,
        compute_fingerprint(&bag, &HashSet::new())
    );
}

#[tokio::test(start_paused = true)]
async fn second_pass_after_completion_writes_nothing() {
    let sim = Arc::new(SimulatedCluster::new(3, 1, 1));
    let key = WorkloadKey::new(NAMESPACE, "es-master");
    sim.seed(&key, TopologyKind::Ordinal, 3, &search_template("search:v1"));
    let mut orchestrator = ordinal_orchestrator(&sim, "es-master", 3, search_template("search:v2"));

    orchestrator.progress_node_changes().await.expect("first pass");
    let writes = sim.store().write_count();

    let second = orchestrator.progress_node_changes().await.expect("second pass");

    assert_eq!(second, RolloutOutcome::Unchanged);
    assert_eq!(sim.store().write_count(), writes);
    assert_eq!(template_writes(&sim.store().history(), "search:v1"), 1);
}

#[tokio::test(start_paused = true)]
async fn ordinal_rollout_never_completes_without_a_rejoin() {
    let store = Arc::new(InMemoryStore::new());
    let admin = Arc::new(ScriptedAdminApi::new());
    let key = WorkloadKey::new(NAMESPACE, "es-data");
    store.insert_workload(Workload::for_node(
        &key,
        TopologyKind::Ordinal,
        3,
        &search_template("search:v1"),
    ));
    // Full cluster, then the released ordinal leaves and never returns.
    admin.script_counts([3, 2]);

    let mut orchestrator = NodeRolloutOrchestrator::new(
        NodeIdentity::new(NAMESPACE, "es-data", TopologyKind::Ordinal, 3),
        search_template("search:v2"),
        RolloutDependencies {
            workloads: store.clone(),
            admin: admin.clone(),
            data: store.clone(),
        },
        RolloutSettings::default(),
    );

    let err = orchestrator
        .progress_node_changes()
        .await
        .expect_err("must not complete");

    assert!(matches!(err, RolloutError::Timeout(_)), "unexpected {err}");
    assert!(err.is_retryable());
    assert_eq!(
        store.workload(&key).and_then(|live| live.partition()),
        Some(2)
    );
    assert_eq!(orchestrator.phase(), RolloutPhase::Failed);
}

#[tokio::test(start_paused = true)]
async fn independent_rollout_unpauses_once_and_waits_for_pods() {
    let sim = Arc::new(SimulatedCluster::new(4, 3, 2));
    let key = WorkloadKey::new(NAMESPACE, "es-ingest");
    sim.seed(&key, TopologyKind::Independent, 1, &search_template("search:v1"));
    let mut orchestrator = NodeRolloutOrchestrator::new(
        NodeIdentity::new(NAMESPACE, "es-ingest", TopologyKind::Independent, 1),
        search_template("search:v2"),
        sim.dependencies(),
        RolloutSettings::default(),
    );

    let outcome = orchestrator
        .progress_node_changes()
        .await
        .expect("rollout succeeds");

    assert_eq!(outcome, RolloutOutcome::Completed { steps: 1 });
    let history = sim.store().history();
    let paused = dedup(history.iter().filter_map(Workload::paused));
    assert_eq!(paused, vec![true, false, true]);
    assert_eq!(template_writes(&history, "search:v1"), 1);
    assert_eq!(sim.pod_polls(&key), 2);
    let live = sim.store().workload(&key).expect("workload");
    assert_eq!(live.paused(), Some(true));
    assert_eq!(image(&live), "search:v2");
}

#[tokio::test(start_paused = true)]
async fn independent_pass_cut_short_refreezes_on_the_next_pass() {
    let sim = Arc::new(SimulatedCluster::new(1, 1, 32));
    let key = WorkloadKey::new(NAMESPACE, "es-ingest");
    sim.seed(&key, TopologyKind::Independent, 1, &search_template("search:v1"));
    let mut orchestrator = NodeRolloutOrchestrator::new(
        NodeIdentity::new(NAMESPACE, "es-ingest", TopologyKind::Independent, 1),
        search_template("search:v2"),
        sim.dependencies(),
        RolloutSettings::default(),
    );

    let err = orchestrator
        .progress_node_changes()
        .await
        .expect_err("pods lag past the rollout window");
    assert!(matches!(err, RolloutError::Timeout(_)), "unexpected {err}");
    let live = sim.store().workload(&key).expect("workload");
    assert_eq!(live.paused(), Some(false));

    let outcome = orchestrator
        .progress_node_changes()
        .await
        .expect("second pass resumes");
    assert_eq!(outcome, RolloutOutcome::Completed { steps: 1 });
    let live = sim.store().workload(&key).expect("workload");
    assert_eq!(live.paused(), Some(true));
    assert_eq!(image(&live), "search:v2");
    assert_eq!(orchestrator.phase(), RolloutPhase::Stable);
}

#[tokio::test(start_paused = true)]
async fn membership_checks_differ_by_topology() {
    let store = InMemoryStore::new();
    let admin = ScriptedAdminApi::new();
    admin.script_presence([false, false, true]);
    admin.script_counts([1, 2, 2, 3]);
    let key = WorkloadKey::new(NAMESPACE, "es-ingest");
    let template = search_template("search:v1");
    let settings = RolloutSettings::default();
    let ctx = StepContext {
        node: "es-ingest",
        key: &key,
        desired: &template,
        replicas: 1,
        expected_members: 3,
        workloads: &store,
        admin: &admin,
        settings: &settings,
    };

    IndependentStrategy
        .wait_rejoin(&ctx)
        .await
        .expect("name appears");
    assert_eq!(admin.presence_calls(), 3);
    assert_eq!(admin.count_calls(), 0);

    OrdinalStrategy
        .wait_rejoin(&ctx)
        .await
        .expect("count reaches target");
    assert_eq!(admin.count_calls(), 4);
    assert_eq!(admin.presence_calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn count_based_rejoin_accepts_any_node_reaching_the_target() {
    let store = InMemoryStore::new();
    let admin = ScriptedAdminApi::new();
    // Another node joined while ours is still away; the count cannot tell.
    admin.script_counts([3]);
    admin.script_presence([false]);
    let key = WorkloadKey::new(NAMESPACE, "es-data");
    let template = search_template("search:v1");
    let settings = RolloutSettings::default();
    let ctx = StepContext {
        node: "es-data",
        key: &key,
        desired: &template,
        replicas: 3,
        expected_members: 3,
        workloads: &store,
        admin: &admin,
        settings: &settings,
    };

    OrdinalStrategy.wait_rejoin(&ctx).await.expect("satisfied");
    assert_eq!(admin.count_calls(), 1);
    assert!(IndependentStrategy.wait_rejoin(&ctx).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn malformed_desired_template_is_fatal_and_writes_nothing() {
    let sim = Arc::new(SimulatedCluster::new(3, 1, 1));
    let key = WorkloadKey::new(NAMESPACE, "es-data");
    sim.seed(&key, TopologyKind::Ordinal, 3, &search_template("search:v1"));
    let mut desired = search_template("search:v2");
    if let Some(resources) = desired.spec.containers[0].resources.as_mut() {
        resources
            .requests
            .insert("memory".to_string(), "lots".to_string());
    }
    let mut orchestrator = ordinal_orchestrator(&sim, "es-data", 3, desired);

    let err = orchestrator
        .progress_node_changes()
        .await
        .expect_err("fatal");

    assert!(matches!(err, RolloutError::FatalConfiguration(_)));
    assert!(!err.is_retryable());
    assert_eq!(sim.store().write_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn malformed_live_quantity_is_rolled_over_as_drift() {
    let sim = Arc::new(SimulatedCluster::new(3, 1, 1));
    let key = WorkloadKey::new(NAMESPACE, "es-data");
    let mut edited = search_template("search:v1");
    if let Some(resources) = edited.spec.containers[0].resources.as_mut() {
        resources
            .limits
            .insert("memory".to_string(), "lots".to_string());
    }
    sim.seed(&key, TopologyKind::Ordinal, 3, &edited);
    let desired = search_template("search:v1");
    let mut orchestrator = ordinal_orchestrator(&sim, "es-data", 3, desired.clone());

    assert!(orchestrator.is_changed().await);
    let outcome = orchestrator
        .progress_node_changes()
        .await
        .expect("live object is repaired");

    assert_eq!(outcome, RolloutOutcome::Completed { steps: 3 });
    let live = sim.store().workload(&key).expect("workload");
    assert_eq!(
        live.template().spec.containers[0].resources,
        desired.spec.containers[0].resources
    );
}

#[tokio::test(start_paused = true)]
async fn unreadable_workload_is_reported_unchanged_and_untouched() {
    let sim = Arc::new(SimulatedCluster::new(3, 1, 1));
    let key = WorkloadKey::new(NAMESPACE, "es-data");
    sim.seed(&key, TopologyKind::Ordinal, 3, &search_template("search:v1"));
    let mut orchestrator = ordinal_orchestrator(&sim, "es-data", 3, search_template("search:v2"));

    sim.store().fail_next_gets(1);
    assert!(!orchestrator.is_changed().await);

    sim.store().fail_next_gets(1);
    let outcome = orchestrator.progress_node_changes().await.expect("pass");
    assert_eq!(outcome, RolloutOutcome::Unverified);
    assert_eq!(sim.store().write_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn conflicting_writers_are_retried() {
    let sim = Arc::new(SimulatedCluster::new(3, 1, 1));
    let key = WorkloadKey::new(NAMESPACE, "es-data");
    sim.seed(&key, TopologyKind::Ordinal, 3, &search_template("search:v1"));
    sim.store().inject_conflicts(3);
    let mut orchestrator = ordinal_orchestrator(&sim, "es-data", 3, search_template("search:v2"));

    let outcome = orchestrator.progress_node_changes().await.expect("rollout");

    assert_eq!(outcome, RolloutOutcome::Completed { steps: 3 });
    assert_eq!(sim.partitions_seen(), vec![3, 2, 1, 0]);
}

#[tokio::test(start_paused = true)]
async fn interrupted_rollout_resumes_from_the_live_partition() {
    let sim = Arc::new(SimulatedCluster::new(3, 1, 1));
    let key = WorkloadKey::new(NAMESPACE, "es-data");
    // A previous pass applied v2 and released ordinal 2 before it stopped.
    let mut workload = Workload::for_node(
        &key,
        TopologyKind::Ordinal,
        3,
        &search_template("search:v2"),
    );
    workload.set_partition(2);
    sim.seed_workload(workload);
    let mut orchestrator = ordinal_orchestrator(&sim, "es-data", 3, search_template("search:v2"));

    assert!(!orchestrator.is_changed().await);
    let outcome = orchestrator.progress_node_changes().await.expect("resume");

    assert_eq!(outcome, RolloutOutcome::Completed { steps: 2 });
    assert_eq!(sim.partitions_seen(), vec![1, 0]);
    assert_eq!(template_writes(&sim.store().history(), "search:v2"), 0);
}

/// Admin API that lets another actor rewrite the template right before the
/// final rejoin check.
struct InterferingAdmin {
    store: Arc<InMemoryStore>,
    key: WorkloadKey,
    calls: AtomicU32,
}

impl ClusterAdminApi for InterferingAdmin {
    fn is_node_in_cluster<'a>(&'a self, _name: &'a str) -> AdminFuture<'a, bool> {
        Box::pin(async move { Ok(true) })
    }

    fn cluster_node_count(&self) -> AdminFuture<'_, u32> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            match call {
                1 => Ok(1),
                2 => Ok(0),
                _ => {
                    if let Some(mut live) = self.store.workload(&self.key) {
                        live.template_mut().spec.containers[0].image =
                            Some("search:rogue".to_string());
                        self.store.insert_workload(live);
                    }
                    Ok(1)
                }
            }
        })
    }

    fn cluster_health(&self) -> AdminFuture<'_, ClusterHealth> {
        Box::pin(async move { Err(new_error("not needed")) })
    }
}

#[tokio::test(start_paused = true)]
async fn template_changed_during_rollout_is_not_reported_complete() {
    let store = Arc::new(InMemoryStore::new());
    let key = WorkloadKey::new(NAMESPACE, "es-master");
    store.insert_workload(Workload::for_node(
        &key,
        TopologyKind::Ordinal,
        1,
        &search_template("search:v1"),
    ));
    let admin = Arc::new(InterferingAdmin {
        store: store.clone(),
        key: key.clone(),
        calls: AtomicU32::new(0),
    });
    let mut orchestrator = NodeRolloutOrchestrator::new(
        NodeIdentity::new(NAMESPACE, "es-master", TopologyKind::Ordinal, 1),
        search_template("search:v2"),
        RolloutDependencies {
            workloads: store.clone(),
            admin,
            data: store.clone(),
        },
        RolloutSettings::default(),
    );

    let err = orchestrator
        .progress_node_changes()
        .await
        .expect_err("diverged");

    assert!(matches!(err, RolloutError::Diverged(_)), "unexpected {err}");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn scripted_health_is_served() {
    let admin = ScriptedAdminApi::new();
    assert!(admin.cluster_health().await.is_err());
    admin.set_health(green_health(5));
    assert_eq!(
        admin.cluster_health().await.expect("health").number_of_nodes,
        5
    );
}
