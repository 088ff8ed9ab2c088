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

//! Drives one node group from its live pod template to the desired one
//! without letting the cluster lose more than one member at a time.
//!
//! Every public operation starts from [`NodeRolloutOrchestrator::refresh`]; the
//! in-memory [`RolloutState`] is a cache of what was last observed and never
//! decides anything on its own. A pass that times out leaves the workload as
//! it is and the next pass resumes from whatever the live object says.

use super::fingerprint::{
    fingerprint_data_bag, observe_fingerprint, FingerprintObservation, UNKNOWN_FINGERPRINT,
};
use super::template::{merge_template, template_differences, validate_template};
use super::topology::{strategy_for, StepContext, TopologyStrategy};
use crate::searchop::cluster::ClusterAdminApi;
use crate::searchop::config::RolloutSettings;
use crate::searchop::k8s::pod::PodTemplateSpec;
use crate::searchop::k8s::workload::{
    DataBagKey, DataBagSource, TopologyKind, UpdateOutcome, Workload, WorkloadError, WorkloadKey,
    WorkloadResource,
};
use crate::searchop::logger::{log_debug, log_error, log_info, log_warn};
use crate::searchop::observability::metrics::{self, RolloutResult};
use crate::searchop::util::PollTimeout;
use std::collections::HashSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

#[derive(Debug)]
pub enum RolloutError {
    /// Store or API failure, including exhausted conflict retries.
    Workload(WorkloadError),
    /// A bounded wait did not resolve.
    Timeout(PollTimeout),
    /// The desired template cannot be built or compared. Nothing was written.
    FatalConfiguration(String),
    /// The live template moved away from the desired one during the rollout.
    Diverged(String),
}

impl RolloutError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RolloutError::FatalConfiguration(_))
    }

    /// Short machine-readable reason for status conditions.
    pub fn reason(&self) -> &'static str {
        match self {
            RolloutError::Workload(_) => "WorkloadError",
            RolloutError::Timeout(_) => "Timeout",
            RolloutError::FatalConfiguration(_) => "InvalidConfiguration",
            RolloutError::Diverged(_) => "Diverged",
        }
    }
}

impl Display for RolloutError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RolloutError::Workload(err) => write!(f, "rollout workload error: {}", err),
            RolloutError::Timeout(err) => write!(f, "rollout timed out: {}", err),
            RolloutError::FatalConfiguration(message) => {
                write!(f, "invalid rollout configuration: {}", message)
            }
            RolloutError::Diverged(message) => write!(f, "rollout diverged: {}", message),
        }
    }
}

impl Error for RolloutError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RolloutError::Workload(err) => Some(err),
            RolloutError::Timeout(err) => Some(err),
            RolloutError::FatalConfiguration(_) | RolloutError::Diverged(_) => None,
        }
    }
}

impl From<WorkloadError> for RolloutError {
    fn from(err: WorkloadError) -> Self {
        RolloutError::Workload(err)
    }
}

impl From<PollTimeout> for RolloutError {
    fn from(err: PollTimeout) -> Self {
        RolloutError::Timeout(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutPhase {
    Stable,
    DriftDetected,
    Frozen,
    Stepping,
    Verifying,
    Failed,
}

impl RolloutPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            RolloutPhase::Stable => "Stable",
            RolloutPhase::DriftDetected => "DriftDetected",
            RolloutPhase::Frozen => "Frozen",
            RolloutPhase::Stepping => "Stepping",
            RolloutPhase::Verifying => "Verifying",
            RolloutPhase::Failed => "Failed",
        }
    }

    fn gauge_value(self) -> i64 {
        match self {
            RolloutPhase::Stable => 0,
            RolloutPhase::DriftDetected => 1,
            RolloutPhase::Frozen => 2,
            RolloutPhase::Stepping => 3,
            RolloutPhase::Verifying => 4,
            RolloutPhase::Failed => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutOutcome {
    /// Live template already matches and every replica runs it.
    Unchanged,
    /// The live workload could not be read; nothing was touched.
    Unverified,
    Completed { steps: u32 },
}

/// What the orchestrator last observed about its node group.
#[derive(Debug, Clone, PartialEq)]
pub struct RolloutState {
    pub actual_spec: Option<PodTemplateSpec>,
    pub config_fingerprint: String,
    pub secret_fingerprint: String,
    pub topology: TopologyKind,
    pub target_replicas: u32,
}

/// A node group: one workload whose replicas all play the same role.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeIdentity {
    pub name: String,
    pub namespace: String,
    pub topology: TopologyKind,
    pub replicas: u32,
    pub config: Option<DataBagKey>,
    pub secret: Option<DataBagKey>,
    /// Keys left out of fingerprints because their values churn on their own.
    pub exclude_keys: HashSet<String>,
}

impl NodeIdentity {
    pub fn new(namespace: &str, name: &str, topology: TopologyKind, replicas: u32) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            topology,
            replicas,
            config: None,
            secret: None,
            exclude_keys: HashSet::new(),
        }
    }

    pub fn with_config(mut self, key: DataBagKey) -> Self {
        self.config = Some(key);
        self
    }

    pub fn with_secret(mut self, key: DataBagKey) -> Self {
        self.secret = Some(key);
        self
    }

    pub fn with_excluded_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn key(&self) -> WorkloadKey {
        WorkloadKey::new(&self.namespace, &self.name)
    }
}

/// Collaborators shared by every orchestrator of a cluster.
#[derive(Clone)]
pub struct RolloutDependencies {
    pub workloads: Arc<dyn WorkloadResource>,
    pub admin: Arc<dyn ClusterAdminApi>,
    pub data: Arc<dyn DataBagSource>,
}

/// Config and secret observations from one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintDrift {
    pub config: FingerprintObservation,
    pub secret: FingerprintObservation,
}

impl FingerprintDrift {
    pub fn requires_redeploy(&self) -> bool {
        self.config.requires_redeploy() || self.secret.requires_redeploy()
    }
}

pub struct NodeRolloutOrchestrator {
    identity: NodeIdentity,
    key: WorkloadKey,
    desired: PodTemplateSpec,
    deps: RolloutDependencies,
    settings: RolloutSettings,
    strategy: Box<dyn TopologyStrategy>,
    state: RolloutState,
    phase: RolloutPhase,
    expected_members: u32,
}

impl NodeRolloutOrchestrator {
    pub fn new(
        identity: NodeIdentity,
        desired: PodTemplateSpec,
        deps: RolloutDependencies,
        settings: RolloutSettings,
    ) -> Self {
        let state = RolloutState {
            actual_spec: None,
            config_fingerprint: UNKNOWN_FINGERPRINT.to_string(),
            secret_fingerprint: UNKNOWN_FINGERPRINT.to_string(),
            topology: identity.topology,
            target_replicas: identity.replicas,
        };
        Self {
            key: identity.key(),
            strategy: strategy_for(identity.topology),
            expected_members: identity.replicas,
            identity,
            desired,
            deps,
            settings,
            state,
            phase: RolloutPhase::Stable,
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn desired(&self) -> &PodTemplateSpec {
        &self.desired
    }

    pub fn set_desired(&mut self, desired: PodTemplateSpec) {
        self.desired = desired;
    }

    /// Replaces the identity, keeping recorded fingerprints. The topology of
    /// an existing node group cannot change.
    pub fn set_identity(&mut self, identity: NodeIdentity) -> Result<(), RolloutError> {
        if identity.topology != self.identity.topology || identity.key() != self.key {
            return Err(RolloutError::FatalConfiguration(format!(
                "node group {} cannot change its topology or namespace",
                self.key
            )));
        }
        self.identity = identity;
        Ok(())
    }

    pub fn state(&self) -> &RolloutState {
        &self.state
    }

    pub fn phase(&self) -> RolloutPhase {
        self.phase
    }

    pub fn expected_cluster_size(&self) -> u32 {
        self.expected_members
    }

    /// Cluster size that counts as fully rejoined for ordinal membership
    /// checks. Defaults to this group's own replica count.
    pub fn set_expected_cluster_size(&mut self, members: u32) {
        self.expected_members = members;
    }

    fn set_phase(&mut self, phase: RolloutPhase) {
        if self.phase != phase {
            log_debug(
                "orchestrator",
                "phase transition",
                &[
                    ("node", self.identity.name.as_str()),
                    ("from", self.phase.as_str()),
                    ("to", phase.as_str()),
                ],
            );
        }
        self.phase = phase;
        metrics::set_node_phase(&self.identity.name, phase.gauge_value());
    }

    /// Re-reads the live workload into the cached state.
    pub async fn refresh(&mut self) -> Result<Workload, RolloutError> {
        let live = self.deps.workloads.get(&self.key).await?;
        if live.topology() != self.identity.topology {
            return Err(RolloutError::FatalConfiguration(format!(
                "{} is {} but the node group is declared {}",
                self.key,
                live.topology().as_str(),
                self.identity.topology.as_str()
            )));
        }
        self.state.actual_spec = Some(live.template().clone());
        self.state.target_replicas = live.replicas();
        Ok(live)
    }

    /// Whether the live pod template differs from the desired one. A failed
    /// read is reported as "no change".
    pub async fn is_changed(&mut self) -> bool {
        let live = match self.refresh().await {
            Ok(live) => live,
            Err(err) => {
                let error_text = err.to_string();
                log_warn(
                    "orchestrator",
                    "unable to read live workload; assuming unchanged",
                    &[
                        ("node", self.identity.name.as_str()),
                        ("error", error_text.as_str()),
                    ],
                );
                return false;
            }
        };
        match template_differences(&self.desired, live.template()) {
            Ok(differences) => !differences.is_empty(),
            Err(err) => {
                let error_text = err.to_string();
                log_warn(
                    "orchestrator",
                    "desired template cannot be compared",
                    &[
                        ("node", self.identity.name.as_str()),
                        ("error", error_text.as_str()),
                    ],
                );
                false
            }
        }
    }

    /// Creates the workload from the desired template when it is missing.
    /// Returns whether it was created.
    pub async fn ensure_created(&mut self) -> Result<bool, RolloutError> {
        validate_template(&self.desired).map_err(RolloutError::FatalConfiguration)?;
        match self.deps.workloads.get(&self.key).await {
            Ok(_) => Ok(false),
            Err(err) if err.is_not_found() => {
                let workload = Workload::for_node(
                    &self.key,
                    self.identity.topology,
                    self.identity.replicas,
                    &self.desired,
                );
                match self.deps.workloads.create(workload).await {
                    Ok(created) => {
                        let key_str = self.key.to_string();
                        log_info(
                            "orchestrator",
                            "created workload",
                            &[
                                ("workload", key_str.as_str()),
                                ("topology", self.identity.topology.as_str()),
                            ],
                        );
                        self.state.actual_spec = Some(created.template().clone());
                        self.state.target_replicas = created.replicas();
                        Ok(true)
                    }
                    // Lost a race with another writer; the object exists now.
                    Err(WorkloadError::AlreadyExists(_)) => Ok(false),
                    Err(err) => Err(err.into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Deletes the workload. A missing workload is not an error.
    pub async fn delete_workload(&mut self) -> Result<(), RolloutError> {
        match self.deps.workloads.delete(&self.key).await {
            Ok(()) => {
                let key_str = self.key.to_string();
                log_info(
                    "orchestrator",
                    "deleted workload",
                    &[("workload", key_str.as_str())],
                );
                self.state.actual_spec = None;
                Ok(())
            }
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn live_fingerprints(&self) -> (String, String) {
        let data = self.deps.data.as_ref();
        let exclude = &self.identity.exclude_keys;
        let config = match &self.identity.config {
            Some(key) => fingerprint_data_bag(data, key, exclude).await,
            None => UNKNOWN_FINGERPRINT.to_string(),
        };
        let secret = match &self.identity.secret {
            Some(key) => fingerprint_data_bag(data, key, exclude).await,
            None => UNKNOWN_FINGERPRINT.to_string(),
        };
        (config, secret)
    }

    /// Compares live config and secret fingerprints with the recorded ones.
    /// Data bags the node does not consume always observe as unchanged.
    pub async fn observe_fingerprints(&mut self) -> FingerprintDrift {
        let (live_config, live_secret) = self.live_fingerprints().await;
        let config = match self.identity.config {
            Some(_) => observe_fingerprint(&mut self.state.config_fingerprint, &live_config),
            None => FingerprintObservation::Unchanged,
        };
        let secret = match self.identity.secret {
            Some(_) => observe_fingerprint(&mut self.state.secret_fingerprint, &live_secret),
            None => FingerprintObservation::Unchanged,
        };
        let drift = FingerprintDrift { config, secret };
        if drift.requires_redeploy() {
            log_info(
                "orchestrator",
                "config or secret content changed; redeploy required",
                &[("node", self.identity.name.as_str())],
            );
        }
        drift
    }

    async fn record_fingerprints(&mut self) {
        let (config, secret) = self.live_fingerprints().await;
        // An unreadable bag keeps the previous baseline.
        if config != UNKNOWN_FINGERPRINT {
            self.state.config_fingerprint = config;
        }
        if secret != UNKNOWN_FINGERPRINT {
            self.state.secret_fingerprint = secret;
        }
    }

    fn step_context<'a>(&'a self, live: &Workload) -> StepContext<'a> {
        StepContext {
            node: &self.identity.name,
            key: &self.key,
            desired: &self.desired,
            replicas: live.replicas(),
            expected_members: self.expected_members,
            workloads: self.deps.workloads.as_ref(),
            admin: self.deps.admin.as_ref(),
            settings: &self.settings,
        }
    }

    /// Brings the live workload onto the desired template one replica at a
    /// time. Safe to call repeatedly; each call resumes from the live state.
    pub async fn progress_node_changes(&mut self) -> Result<RolloutOutcome, RolloutError> {
        let result = self.drive().await;
        let node = self.identity.name.clone();
        match &result {
            Ok(RolloutOutcome::Unchanged) => {
                metrics::record_rollout_result(&node, RolloutResult::Unchanged);
            }
            Ok(RolloutOutcome::Unverified) => {
                metrics::record_rollout_result(&node, RolloutResult::Unverified);
            }
            Ok(RolloutOutcome::Completed { steps }) => {
                metrics::record_rollout_result(&node, RolloutResult::Completed);
                let steps_str = steps.to_string();
                log_info(
                    "orchestrator",
                    "rollout completed",
                    &[("node", node.as_str()), ("steps", steps_str.as_str())],
                );
            }
            Err(err) => {
                let outcome = match err {
                    RolloutError::Timeout(_) => RolloutResult::Timeout,
                    _ => RolloutResult::Failed,
                };
                metrics::record_rollout_result(&node, outcome);
                self.set_phase(RolloutPhase::Failed);
                let error_text = err.to_string();
                log_error(
                    "orchestrator",
                    "rollout pass failed",
                    &[
                        ("node", node.as_str()),
                        ("reason", err.reason()),
                        ("error", error_text.as_str()),
                    ],
                );
            }
        }
        result
    }

    async fn drive(&mut self) -> Result<RolloutOutcome, RolloutError> {
        validate_template(&self.desired).map_err(RolloutError::FatalConfiguration)?;

        let live = match self.refresh().await {
            Ok(live) => live,
            Err(RolloutError::Workload(err)) => {
                let error_text = err.to_string();
                log_warn(
                    "orchestrator",
                    "unable to read live workload; skipping pass",
                    &[
                        ("node", self.identity.name.as_str()),
                        ("error", error_text.as_str()),
                    ],
                );
                return Ok(RolloutOutcome::Unverified);
            }
            Err(err) => return Err(err),
        };

        let differences = self.differences(&live)?;
        let drifted = !differences.is_empty();
        if drifted {
            let fields = differences.join(",");
            log_info(
                "orchestrator",
                "template drift detected",
                &[
                    ("node", self.identity.name.as_str()),
                    ("fields", fields.as_str()),
                ],
            );
        } else {
            let settled = self
                .strategy
                .is_settled(&self.step_context(&live), &live)
                .await?;
            if settled {
                self.set_phase(RolloutPhase::Stable);
                return Ok(RolloutOutcome::Unchanged);
            }
            log_info(
                "orchestrator",
                "resuming interrupted rollout",
                &[("node", self.identity.name.as_str())],
            );
        }
        self.set_phase(RolloutPhase::DriftDetected);

        if drifted {
            self.strategy.freeze(&self.step_context(&live)).await?;
            self.set_phase(RolloutPhase::Frozen);
            self.apply_desired(&live).await?;
        }

        self.set_phase(RolloutPhase::Stepping);
        let live = self.refresh().await?;
        let steps = self.strategy.step(&self.step_context(&live)).await?;

        self.set_phase(RolloutPhase::Verifying);
        self.strategy.wait_rejoin(&self.step_context(&live)).await?;
        self.verify().await?;

        self.record_fingerprints().await;
        self.set_phase(RolloutPhase::Stable);
        Ok(RolloutOutcome::Completed { steps })
    }

    fn differences(&self, live: &Workload) -> Result<Vec<String>, RolloutError> {
        template_differences(&self.desired, live.template())
            .map_err(|err| RolloutError::FatalConfiguration(err.to_string()))
    }

    /// Merges the desired template into the live object. Replicas, selector
    /// and metadata are left alone.
    async fn apply_desired(&self, live: &Workload) -> Result<(), RolloutError> {
        let mut desired = live.clone();
        merge_template(desired.template_mut(), &self.desired);
        let outcome = self
            .deps
            .workloads
            .update(
                &self.key,
                &desired,
                &|current: &Workload, desired: &Workload| {
                    template_differences(desired.template(), current.template())
                        .map(|differences| differences.is_empty())
                        .unwrap_or(false)
                },
                &|current: &mut Workload, desired: &Workload| {
                    merge_template(current.template_mut(), desired.template());
                },
            )
            .await?;
        if let UpdateOutcome::Updated { resource_version } = outcome {
            let key_str = self.key.to_string();
            log_info(
                "orchestrator",
                "applied desired template",
                &[
                    ("workload", key_str.as_str()),
                    ("resource_version", resource_version.as_str()),
                ],
            );
        }
        Ok(())
    }

    /// Refuses to report completion unless the live object still carries the
    /// desired template and every replica has been released onto it.
    async fn verify(&mut self) -> Result<(), RolloutError> {
        let live = self.refresh().await?;
        let differences = self.differences(&live)?;
        if !differences.is_empty() {
            return Err(RolloutError::Diverged(format!(
                "{} changed during the rollout: {}",
                self.key,
                differences.join(",")
            )));
        }
        let settled = self
            .strategy
            .is_settled(&self.step_context(&live), &live)
            .await?;
        if !settled {
            return Err(RolloutError::Diverged(format!(
                "{} has replicas that are not running the desired template",
                self.key
            )));
        }
        Ok(())
    }
}
