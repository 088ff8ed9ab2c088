/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

#![allow(dead_code)]

//! Fakes for exercising rollouts without a cluster: a scripted admin API and
//! a simulated cluster that restarts nodes when their workload releases them.

use crate::searchop::cluster::types::{ClusterHealth, HealthStatus};
use crate::searchop::cluster::{AdminFuture, ClusterAdminApi};
use crate::searchop::controller::orchestrator::RolloutDependencies;
use crate::searchop::k8s::pod::{
    ContainerSpec, EnvVar, Pod, PodSpec, PodTemplateSpec, ResourceRequirements,
};
use crate::searchop::k8s::store::InMemoryStore;
use crate::searchop::k8s::workload::{
    DataBagKey, DataBagSource, EqualFn, MutateFn, TopologyKind, UpdateOutcome, Workload,
    WorkloadError, WorkloadFuture, WorkloadKey, WorkloadResource,
};
use crate::searchop::util::new_error;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Pod template with a single `search` container running `image`.
pub fn search_template(image: &str) -> PodTemplateSpec {
    let container = ContainerSpec {
        name: "search".to_string(),
        image: Some(image.to_string()),
        args: vec!["--cluster.name=logs".to_string()],
        env: vec![EnvVar::literal("ES_JAVA_OPTS", "-Xms1g -Xmx1g")],
        resources: Some(ResourceRequirements {
            requests: BTreeMap::from([
                ("cpu".to_string(), "500m".to_string()),
                ("memory".to_string(), "2Gi".to_string()),
            ]),
            limits: BTreeMap::from([("memory".to_string(), "2Gi".to_string())]),
        }),
        ..Default::default()
    };
    PodTemplateSpec {
        spec: PodSpec {
            containers: vec![container],
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Replays scripted answers; the last scripted answer repeats forever.
struct Script<T> {
    answers: VecDeque<T>,
    fallback: T,
    calls: u32,
}

impl<T: Clone> Script<T> {
    fn new(fallback: T) -> Self {
        Self {
            answers: VecDeque::new(),
            fallback,
            calls: 0,
        }
    }

    fn replace(&mut self, answers: impl IntoIterator<Item = T>) {
        self.answers = answers.into_iter().collect();
        if let Some(last) = self.answers.back() {
            self.fallback = last.clone();
        }
    }

    fn next(&mut self) -> T {
        self.calls += 1;
        self.answers
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// Admin API answering from scripts; `Err` entries simulate unreachable
/// endpoints.
pub struct ScriptedAdminApi {
    counts: Mutex<Script<Result<u32, String>>>,
    presence: Mutex<Script<Result<bool, String>>>,
    health: Mutex<Option<ClusterHealth>>,
}

impl Default for ScriptedAdminApi {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedAdminApi {
    pub fn new() -> Self {
        Self {
            counts: Mutex::new(Script::new(Ok(0))),
            presence: Mutex::new(Script::new(Ok(false))),
            health: Mutex::new(None),
        }
    }

    pub fn script_counts(&self, counts: impl IntoIterator<Item = u32>) {
        lock(&self.counts).replace(counts.into_iter().map(Ok));
    }

    pub fn script_count_results(&self, results: impl IntoIterator<Item = Result<u32, String>>) {
        lock(&self.counts).replace(results);
    }

    pub fn script_presence(&self, presence: impl IntoIterator<Item = bool>) {
        lock(&self.presence).replace(presence.into_iter().map(Ok));
    }

    pub fn set_health(&self, health: ClusterHealth) {
        *lock(&self.health) = Some(health);
    }

    pub fn count_calls(&self) -> u32 {
        lock(&self.counts).calls
    }

    pub fn presence_calls(&self) -> u32 {
        lock(&self.presence).calls
    }
}

impl ClusterAdminApi for ScriptedAdminApi {
    fn is_node_in_cluster<'a>(&'a self, _name: &'a str) -> AdminFuture<'a, bool> {
        Box::pin(async move { lock(&self.presence).next().map_err(|message| new_error(message)) })
    }

    fn cluster_node_count(&self) -> AdminFuture<'_, u32> {
        Box::pin(async move { lock(&self.counts).next().map_err(|message| new_error(message)) })
    }

    fn cluster_health(&self) -> AdminFuture<'_, ClusterHealth> {
        Box::pin(async move {
            lock(&self.health)
                .clone()
                .ok_or_else(|| new_error("cluster health unavailable"))
        })
    }
}

pub fn green_health(nodes: u32) -> ClusterHealth {
    ClusterHealth {
        cluster_name: "logs".to_string(),
        status: HealthStatus::Green,
        number_of_nodes: nodes,
        number_of_data_nodes: nodes,
        active_primary_shards: 5,
        active_shards: 10,
        relocating_shards: 0,
        initializing_shards: 0,
        unassigned_shards: 0,
    }
}

#[derive(Default)]
struct Simulation {
    members: u32,
    /// Count polls left during which a restarted ordinal is still away.
    count_away: u32,
    /// Name polls left per independent node group still restarting.
    name_away: BTreeMap<String, u32>,
    /// Pod polls observed per independent group while it was unpaused.
    unpaused_pod_polls: BTreeMap<WorkloadKey, u32>,
    partitions: BTreeMap<WorkloadKey, u32>,
    partitions_seen: Vec<u32>,
    rejoin_disabled: bool,
}

/// A cluster whose membership reacts to workload writes.
///
/// Lowering a StatefulSet partition restarts one ordinal: the cluster is one
/// member short for `restart_polls` count polls. Unpausing a Deployment rolls
/// its pods onto the live template after `catch_up_polls` pod listings, and
/// the node then stays out of the member list for `restart_polls` name polls.
pub struct SimulatedCluster {
    store: InMemoryStore,
    state: Mutex<Simulation>,
    restart_polls: u32,
    catch_up_polls: u32,
}

impl SimulatedCluster {
    pub fn new(members: u32, restart_polls: u32, catch_up_polls: u32) -> Self {
        Self {
            store: InMemoryStore::new(),
            state: Mutex::new(Simulation {
                members,
                ..Default::default()
            }),
            restart_polls,
            catch_up_polls,
        }
    }

    pub fn store(&self) -> &InMemoryStore {
        &self.store
    }

    pub fn dependencies(self: &Arc<Self>) -> RolloutDependencies {
        RolloutDependencies {
            workloads: self.clone(),
            admin: self.clone(),
            data: self.clone(),
        }
    }

    /// Seeds a running node group whose pods run `template`.
    pub fn seed(
        &self,
        key: &WorkloadKey,
        topology: TopologyKind,
        replicas: u32,
        template: &PodTemplateSpec,
    ) -> Workload {
        self.seed_workload(Workload::for_node(key, topology, replicas, template))
    }

    /// Seeds an arbitrary workload, for example one left mid-rollout.
    pub fn seed_workload(&self, workload: Workload) -> Workload {
        let workload = self.store.insert_workload(workload);
        let key = workload.key();
        self.store.set_pods(&key, running_pods(&workload));
        if let Some(partition) = workload.partition() {
            lock(&self.state).partitions.insert(key, partition);
        }
        workload
    }

    /// Restarted nodes never come back.
    pub fn disable_rejoin(&self) {
        lock(&self.state).rejoin_disabled = true;
    }

    /// Every partition written, in order.
    pub fn partitions_seen(&self) -> Vec<u32> {
        lock(&self.state).partitions_seen.clone()
    }

    pub fn pod_polls(&self, key: &WorkloadKey) -> u32 {
        lock(&self.state)
            .unpaused_pod_polls
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    fn after_write(&self, key: &WorkloadKey) {
        let Some(workload) = self.store.workload(key) else {
            return;
        };
        let Some(partition) = workload.partition() else {
            return;
        };
        let mut state = lock(&self.state);
        let previous = state.partitions.insert(key.clone(), partition);
        if previous != Some(partition) {
            state.partitions_seen.push(partition);
        }
        if matches!(previous, Some(previous) if partition < previous) {
            state.count_away = self.restart_polls.max(1);
        }
    }

    fn poll_pods(&self, key: &WorkloadKey) -> Result<Vec<Pod>, String> {
        let workload = self.store.workload(key).ok_or("workload missing")?;
        if workload.paused() != Some(false) {
            return Ok(self.stored_pods(key));
        }
        let mut state = lock(&self.state);
        let polls = state.unpaused_pod_polls.entry(key.clone()).or_insert(0);
        *polls += 1;
        let caught_up = *polls >= self.catch_up_polls;
        let current = self.stored_pods(key);
        let pods = running_pods(&workload);
        if caught_up && current != pods {
            state.name_away.insert(key.name.clone(), self.restart_polls);
            drop(state);
            self.store.set_pods(key, pods.clone());
            return Ok(pods);
        }
        Ok(current)
    }

    fn stored_pods(&self, key: &WorkloadKey) -> Vec<Pod> {
        self.store.pods_of(key)
    }
}

fn running_pods(workload: &Workload) -> Vec<Pod> {
    let key = workload.key();
    (0..workload.replicas())
        .map(|ordinal| {
            Pod::from_template(
                &key.namespace,
                &format!("{}-{ordinal}", key.name),
                workload.template(),
            )
        })
        .collect()
}

impl WorkloadResource for SimulatedCluster {
    fn get<'a>(&'a self, key: &'a WorkloadKey) -> WorkloadFuture<'a, Workload> {
        self.store.get(key)
    }

    fn create(&self, workload: Workload) -> WorkloadFuture<'_, Workload> {
        Box::pin(async move {
            let created = self.store.create(workload).await?;
            let key = created.key();
            self.store.set_pods(&key, running_pods(&created));
            if let Some(partition) = created.partition() {
                lock(&self.state).partitions.insert(key, partition);
            }
            Ok(created)
        })
    }

    fn update<'a>(
        &'a self,
        key: &'a WorkloadKey,
        desired: &'a Workload,
        equal: &'a EqualFn<'a>,
        mutate: &'a MutateFn<'a>,
    ) -> WorkloadFuture<'a, UpdateOutcome> {
        Box::pin(async move {
            let outcome = self.store.update(key, desired, equal, mutate).await?;
            self.after_write(key);
            Ok(outcome)
        })
    }

    fn delete<'a>(&'a self, key: &'a WorkloadKey) -> WorkloadFuture<'a, ()> {
        self.store.delete(key)
    }

    fn pods<'a>(&'a self, key: &'a WorkloadKey) -> WorkloadFuture<'a, Vec<Pod>> {
        Box::pin(async move {
            self.poll_pods(key)
                .map_err(|message| WorkloadError::NotFound(format!("{key}: {message}")))
        })
    }
}

impl ClusterAdminApi for SimulatedCluster {
    fn is_node_in_cluster<'a>(&'a self, name: &'a str) -> AdminFuture<'a, bool> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            let rejoin_disabled = state.rejoin_disabled;
            match state.name_away.get_mut(name) {
                Some(remaining) if *remaining > 0 => {
                    if !rejoin_disabled {
                        *remaining -= 1;
                    }
                    Ok(false)
                }
                _ => Ok(true),
            }
        })
    }

    fn cluster_node_count(&self) -> AdminFuture<'_, u32> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            if state.count_away > 0 {
                if !state.rejoin_disabled {
                    state.count_away -= 1;
                }
                return Ok(state.members.saturating_sub(1));
            }
            Ok(state.members)
        })
    }

    fn cluster_health(&self) -> AdminFuture<'_, ClusterHealth> {
        Box::pin(async move { Ok(green_health(lock(&self.state).members)) })
    }
}

impl DataBagSource for SimulatedCluster {
    fn data_bag<'a>(
        &'a self,
        key: &'a DataBagKey,
    ) -> WorkloadFuture<'a, BTreeMap<String, Vec<u8>>> {
        self.store.data_bag(key)
    }
}
