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

//! Runs node group rollouts across a cluster: failure domains in parallel,
//! node groups inside a domain one at a time.

use super::fingerprint::{FingerprintObservation, UNKNOWN_FINGERPRINT};
use super::orchestrator::{
    NodeIdentity, NodeRolloutOrchestrator, RolloutDependencies, RolloutError, RolloutOutcome,
    RolloutPhase,
};
use super::status::{ClusterRolloutStatus, NodeCondition, NodeRolloutStatus, CONDITION_FAILED};
use crate::searchop::config::RolloutSettings;
use crate::searchop::k8s::pod::PodTemplateSpec;
use crate::searchop::k8s::workload::DataBagKey;
use crate::searchop::logger::{log_info, log_warn};
use crate::searchop::observability::tracing;
use futures_util::future::join_all;
use std::collections::BTreeMap;

/// Env var carrying the config fingerprint the pods were started with.
pub const CONFIG_FINGERPRINT_ENV: &str = "SEARCHOP_CONFIG_FINGERPRINT";
/// Env var carrying the secret fingerprint the pods were started with.
pub const SECRET_FINGERPRINT_ENV: &str = "SEARCHOP_SECRET_FINGERPRINT";

/// Registration of one node group with the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeGroupSpec {
    pub identity: NodeIdentity,
    pub desired: PodTemplateSpec,
    pub failure_domain: String,
}

struct ManagedNode {
    orchestrator: NodeRolloutOrchestrator,
    /// Desired template before fingerprints are stamped into it.
    template: PodTemplateSpec,
    failure_domain: String,
}

pub struct ClusterRolloutCoordinator {
    deps: RolloutDependencies,
    settings: RolloutSettings,
    nodes: Vec<ManagedNode>,
}

impl ClusterRolloutCoordinator {
    pub fn new(deps: RolloutDependencies, settings: RolloutSettings) -> Self {
        Self {
            deps,
            settings,
            nodes: Vec::new(),
        }
    }

    /// Registers a node group or updates an existing one in place. Node
    /// groups in the same failure domain roll in registration order.
    pub fn upsert_node(&mut self, spec: NodeGroupSpec) -> Result<(), RolloutError> {
        let position = self
            .nodes
            .iter()
            .position(|node| node.orchestrator.identity().name == spec.identity.name);
        match position {
            Some(index) => {
                let node = &mut self.nodes[index];
                node.orchestrator.set_identity(spec.identity)?;
                node.template = spec.desired;
                node.failure_domain = spec.failure_domain;
            }
            None => {
                log_info(
                    "coordinator",
                    "registered node group",
                    &[
                        ("node", spec.identity.name.as_str()),
                        ("failure_domain", spec.failure_domain.as_str()),
                        ("topology", spec.identity.topology.as_str()),
                    ],
                );
                let orchestrator = NodeRolloutOrchestrator::new(
                    spec.identity,
                    spec.desired.clone(),
                    self.deps.clone(),
                    self.settings,
                );
                self.nodes.push(ManagedNode {
                    orchestrator,
                    template: spec.desired,
                    failure_domain: spec.failure_domain,
                });
            }
        }
        self.update_expected_cluster_size();
        Ok(())
    }

    /// Drops a node group and deletes its workload. Returns whether the
    /// group was registered.
    pub async fn remove_node(&mut self, name: &str) -> Result<bool, RolloutError> {
        let Some(index) = self
            .nodes
            .iter()
            .position(|node| node.orchestrator.identity().name == name)
        else {
            return Ok(false);
        };
        self.nodes[index].orchestrator.delete_workload().await?;
        self.nodes.remove(index);
        self.update_expected_cluster_size();
        log_info("coordinator", "removed node group", &[("node", name)]);
        Ok(true)
    }

    pub fn node_names(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .map(|node| node.orchestrator.identity().name.as_str())
            .collect()
    }

    pub fn orchestrator(&self, name: &str) -> Option<&NodeRolloutOrchestrator> {
        self.nodes
            .iter()
            .map(|node| &node.orchestrator)
            .find(|orchestrator| orchestrator.identity().name == name)
    }

    /// Sum of target replicas over every registered group.
    pub fn expected_cluster_size(&self) -> u32 {
        self.nodes
            .iter()
            .map(|node| node.orchestrator.identity().replicas)
            .sum()
    }

    fn update_expected_cluster_size(&mut self) {
        let members = self.expected_cluster_size();
        for node in &mut self.nodes {
            node.orchestrator.set_expected_cluster_size(members);
        }
    }

    /// One reconcile pass over every node group.
    pub async fn reconcile(&mut self) -> ClusterRolloutStatus {
        let admin = self.deps.admin.clone();
        let mut domains: BTreeMap<String, Vec<&mut ManagedNode>> = BTreeMap::new();
        for node in &mut self.nodes {
            domains
                .entry(node.failure_domain.clone())
                .or_default()
                .push(node);
        }

        let passes = domains
            .into_iter()
            .map(|(domain, nodes)| reconcile_domain(domain, nodes));
        let nodes: Vec<NodeRolloutStatus> = tracing::with_span("coordinator", "reconcile", async {
            join_all(passes).await.into_iter().flatten().collect()
        })
        .await;

        let health = match admin.cluster_health().await {
            Ok(health) => Some(health),
            Err(err) => {
                let error_text = err.to_string();
                log_warn(
                    "coordinator",
                    "unable to read cluster health",
                    &[("error", error_text.as_str())],
                );
                None
            }
        };
        ClusterRolloutStatus { nodes, health }
    }
}

async fn reconcile_domain(
    domain: String,
    nodes: Vec<&mut ManagedNode>,
) -> Vec<NodeRolloutStatus> {
    let mut statuses = Vec::with_capacity(nodes.len());
    let mut failed: Option<String> = None;
    for node in nodes {
        let name = node.orchestrator.identity().name.clone();
        if let Some(failed_node) = &failed {
            let mut status = NodeRolloutStatus::new(&name, &domain, node.orchestrator.phase());
            status.conditions.push(NodeCondition::blocked(failed_node));
            statuses.push(status);
            continue;
        }
        let span = format!("node/{name}");
        let status = tracing::with_span("coordinator", span, reconcile_node(node)).await;
        if status.has_condition(CONDITION_FAILED) {
            log_warn(
                "coordinator",
                "node group failed; blocking the rest of its failure domain",
                &[("node", name.as_str()), ("failure_domain", domain.as_str())],
            );
            failed = Some(name);
        }
        statuses.push(status);
    }
    statuses
}

/// Fingerprint value to stamp into the pods. `None` when nothing is known yet.
fn fingerprint_to_stamp(recorded: &str, observation: &FingerprintObservation) -> Option<String> {
    match observation {
        FingerprintObservation::Changed { live, .. } => Some(live.clone()),
        _ if recorded == UNKNOWN_FINGERPRINT => None,
        _ => Some(recorded.to_string()),
    }
}

fn stamp_env(template: &mut PodTemplateSpec, name: &str, value: &str) {
    for container in &mut template.spec.containers {
        container.set_env(name, value);
    }
}

async fn reconcile_node(node: &mut ManagedNode) -> NodeRolloutStatus {
    let orchestrator = &mut node.orchestrator;
    let identity = orchestrator.identity().clone();
    let drift = orchestrator.observe_fingerprints().await;

    let mut desired = node.template.clone();
    let mut unknown: Vec<String> = Vec::new();
    let mut unreadable: Vec<String> = Vec::new();
    let mut redeploy: Vec<String> = Vec::new();
    let tracked: [(&Option<DataBagKey>, &FingerprintObservation, &str, &str); 2] = [
        (
            &identity.config,
            &drift.config,
            orchestrator.state().config_fingerprint.as_str(),
            CONFIG_FINGERPRINT_ENV,
        ),
        (
            &identity.secret,
            &drift.secret,
            orchestrator.state().secret_fingerprint.as_str(),
            SECRET_FINGERPRINT_ENV,
        ),
    ];
    for (bag, observation, recorded, env_var) in tracked {
        let Some(bag) = bag else {
            continue;
        };
        match fingerprint_to_stamp(recorded, observation) {
            Some(value) => stamp_env(&mut desired, env_var, &value),
            None => unknown.push(bag.to_string()),
        }
        if *observation == FingerprintObservation::Unknown && recorded != UNKNOWN_FINGERPRINT {
            unreadable.push(bag.to_string());
        }
        if observation.requires_redeploy() {
            redeploy.push(bag.to_string());
        }
    }

    let mut status =
        NodeRolloutStatus::new(&identity.name, &node.failure_domain, orchestrator.phase());
    if !unreadable.is_empty() {
        let sources = unreadable.join(",");
        log_warn(
            "coordinator",
            "fingerprint unreadable; rolling against the recorded baseline",
            &[("node", identity.name.as_str()), ("sources", sources.as_str())],
        );
        status.conditions.extend(
            unreadable
                .iter()
                .map(|source| NodeCondition::fingerprint_unknown(source, true)),
        );
    }
    if !unknown.is_empty() {
        let sources = unknown.join(",");
        log_warn(
            "coordinator",
            "skipping node group with unknown fingerprints",
            &[("node", identity.name.as_str()), ("sources", sources.as_str())],
        );
        status.conditions.extend(
            unknown
                .iter()
                .map(|source| NodeCondition::fingerprint_unknown(source, false)),
        );
        return status;
    }

    orchestrator.set_desired(desired);
    let result = match orchestrator.ensure_created().await {
        Ok(created) => {
            status.created = created;
            orchestrator.progress_node_changes().await
        }
        Err(err) => Err(err),
    };

    match &result {
        Ok(outcome) => {
            status.outcome = Some(outcome_label(outcome).to_string());
            status.conditions.push(NodeCondition::progressing(outcome));
        }
        Err(err) => {
            status.conditions.push(NodeCondition::failed(err));
        }
    }
    if !matches!(result, Ok(RolloutOutcome::Completed { .. })) {
        status.conditions.extend(
            redeploy
                .iter()
                .map(|source| NodeCondition::redeploy_required(source)),
        );
    }

    let phase = if result.is_err() {
        RolloutPhase::Failed
    } else {
        orchestrator.phase()
    };
    status.phase = phase.as_str().to_string();
    status.config_fingerprint = orchestrator.state().config_fingerprint.clone();
    status.secret_fingerprint = orchestrator.state().secret_fingerprint.clone();
    status
}

fn outcome_label(outcome: &RolloutOutcome) -> &'static str {
    match outcome {
        RolloutOutcome::Unchanged => "Unchanged",
        RolloutOutcome::Unverified => "Unverified",
        RolloutOutcome::Completed { .. } => "Completed",
    }
}
