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

//! Topology strategies: how a node group's replicas are frozen, released onto
//! a new template and observed leaving and rejoining the cluster.
//!
//! Ordinal groups (StatefulSets) release one ordinal at a time by lowering the
//! partition and judge membership by the cluster's total node count.
//! Independent groups (Deployments) are released all at once by unpausing and
//! judge membership by the node's name. The count check cannot tell "my node
//! rejoined" apart from "some other node joined"; callers relying on ordinal
//! rollouts must keep the expected cluster size accurate.

use super::orchestrator::RolloutError;
use super::template::pod_spec_differences;
use crate::searchop::cluster::ClusterAdminApi;
use crate::searchop::config::RolloutSettings;
use crate::searchop::k8s::pod::{Pod, PodTemplateSpec};
use crate::searchop::k8s::workload::{
    EqualFn, MutateFn, TopologyKind, UpdateOutcome, Workload, WorkloadKey, WorkloadResource,
};
use crate::searchop::logger::{log_debug, log_info, log_warn};
use crate::searchop::observability::metrics::{self, WaitOutcome};
use crate::searchop::util::{poll_until, DynError};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::Instant;

pub type RolloutFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RolloutError>> + Send + 'a>>;

/// Everything a strategy needs for one rollout pass of one node group.
pub struct StepContext<'a> {
    /// Node group name; independent nodes join the cluster under this name.
    pub node: &'a str,
    pub key: &'a WorkloadKey,
    pub desired: &'a PodTemplateSpec,
    /// Replica count of the live workload.
    pub replicas: u32,
    /// Cluster size that counts as "everyone is back".
    pub expected_members: u32,
    pub workloads: &'a dyn WorkloadResource,
    pub admin: &'a dyn ClusterAdminApi,
    pub settings: &'a RolloutSettings,
}

impl StepContext<'_> {
    pub async fn live(&self) -> Result<Workload, RolloutError> {
        Ok(self.workloads.get(self.key).await?)
    }

    /// Writes `field` on the live workload unless `equal` already holds.
    async fn write(
        &self,
        field: &str,
        desired: &Workload,
        equal: &EqualFn<'_>,
        mutate: &MutateFn<'_>,
    ) -> Result<bool, RolloutError> {
        let outcome = self.workloads.update(self.key, desired, equal, mutate).await?;
        let key_str = self.key.to_string();
        match &outcome {
            UpdateOutcome::Unchanged => log_debug(
                "topology",
                "workload already in requested state",
                &[("workload", key_str.as_str()), ("field", field)],
            ),
            UpdateOutcome::Updated { resource_version } => log_debug(
                "topology",
                "updated workload",
                &[
                    ("workload", key_str.as_str()),
                    ("field", field),
                    ("resource_version", resource_version.as_str()),
                ],
            ),
        }
        Ok(matches!(outcome, UpdateOutcome::Updated { .. }))
    }

    async fn set_partition(&self, partition: u32) -> Result<bool, RolloutError> {
        let mut desired = self.live().await?;
        desired.set_partition(partition);
        self.write(
            "partition",
            &desired,
            &|current: &Workload, desired: &Workload| current.partition() == desired.partition(),
            &|current: &mut Workload, desired: &Workload| {
                if let Some(partition) = desired.partition() {
                    current.set_partition(partition);
                }
            },
        )
        .await
    }

    async fn set_paused(&self, paused: bool) -> Result<bool, RolloutError> {
        let mut desired = self.live().await?;
        desired.set_paused(paused);
        self.write(
            "paused",
            &desired,
            &|current: &Workload, desired: &Workload| current.paused() == desired.paused(),
            &|current: &mut Workload, desired: &Workload| {
                if let Some(paused) = desired.paused() {
                    current.set_paused(paused);
                }
            },
        )
        .await
    }

    /// Runs a bounded wait and records how long it took.
    async fn wait<F, Fut>(
        &self,
        wait: &'static str,
        condition: String,
        timeout: Duration,
        probe: F,
    ) -> Result<u32, RolloutError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, DynError>>,
    {
        let started = Instant::now();
        let result = poll_until(&condition, self.settings.poll_interval, timeout, probe).await;
        let outcome = if result.is_ok() {
            WaitOutcome::Satisfied
        } else {
            WaitOutcome::TimedOut
        };
        metrics::observe_wait(wait, outcome, started.elapsed());
        match result {
            Ok(attempts) => {
                let attempts_str = attempts.to_string();
                log_debug(
                    "topology",
                    "wait satisfied",
                    &[
                        ("node", self.node),
                        ("wait", wait),
                        ("attempts", attempts_str.as_str()),
                    ],
                );
                Ok(attempts)
            }
            Err(timeout) => {
                let error_text = timeout.to_string();
                log_warn(
                    "topology",
                    "wait timed out",
                    &[
                        ("node", self.node),
                        ("wait", wait),
                        ("error", error_text.as_str()),
                    ],
                );
                Err(RolloutError::Timeout(timeout))
            }
        }
    }
}

/// Per-topology pieces of the rollout protocol.
pub trait TopologyStrategy: Send + Sync {
    fn kind(&self) -> TopologyKind;

    /// Stops the workload controller from replacing replicas on its own.
    fn freeze<'a>(&'a self, ctx: &'a StepContext<'a>) -> RolloutFuture<'a, ()>;

    /// Releases replicas onto the applied template under supervision and
    /// returns how many release steps were taken.
    fn step<'a>(&'a self, ctx: &'a StepContext<'a>) -> RolloutFuture<'a, u32>;

    /// Hands replica replacement back to the workload controller.
    fn unfreeze<'a>(&'a self, ctx: &'a StepContext<'a>) -> RolloutFuture<'a, ()>;

    fn wait_leave<'a>(&'a self, ctx: &'a StepContext<'a>) -> RolloutFuture<'a, ()>;

    fn wait_rejoin<'a>(&'a self, ctx: &'a StepContext<'a>) -> RolloutFuture<'a, ()>;

    /// Whether every replica already runs the live workload's template.
    fn is_settled<'a>(
        &'a self,
        ctx: &'a StepContext<'a>,
        live: &'a Workload,
    ) -> RolloutFuture<'a, bool>;
}

pub fn strategy_for(kind: TopologyKind) -> Box<dyn TopologyStrategy> {
    match kind {
        TopologyKind::Ordinal => Box::new(OrdinalStrategy),
        TopologyKind::Independent => Box::new(IndependentStrategy),
    }
}

/// StatefulSet rollouts driven through the partition index.
pub struct OrdinalStrategy;

impl TopologyStrategy for OrdinalStrategy {
    fn kind(&self) -> TopologyKind {
        TopologyKind::Ordinal
    }

    fn freeze<'a>(&'a self, ctx: &'a StepContext<'a>) -> RolloutFuture<'a, ()> {
        Box::pin(async move {
            let replicas = ctx.live().await?.replicas();
            if ctx.set_partition(replicas).await? {
                let partition_str = replicas.to_string();
                log_info(
                    "topology",
                    "froze ordinal replicas",
                    &[("node", ctx.node), ("partition", partition_str.as_str())],
                );
            }
            Ok(())
        })
    }

    fn step<'a>(&'a self, ctx: &'a StepContext<'a>) -> RolloutFuture<'a, u32> {
        Box::pin(async move {
            let live = ctx.live().await?;
            let replicas = live.replicas();
            let partition = live.partition().unwrap_or(0);
            if partition != replicas {
                let partition_str = partition.to_string();
                let replicas_str = replicas.to_string();
                log_info(
                    "topology",
                    "resuming from live partition",
                    &[
                        ("node", ctx.node),
                        ("partition", partition_str.as_str()),
                        ("replicas", replicas_str.as_str()),
                    ],
                );
            }

            // Ordinals above the replica count do not exist; never wait on them.
            let start = partition.min(replicas);
            let mut steps = 0;
            for index in (1..=start).rev() {
                self.wait_rejoin(ctx).await?;
                ctx.set_partition(index - 1).await?;
                steps += 1;
                metrics::record_rollout_step(ctx.node, TopologyKind::Ordinal.as_str());
                let partition_str = (index - 1).to_string();
                log_info(
                    "topology",
                    "released ordinal",
                    &[("node", ctx.node), ("partition", partition_str.as_str())],
                );
                self.wait_leave(ctx).await?;
            }
            if start == 0 && partition != 0 {
                ctx.set_partition(0).await?;
            }
            Ok(steps)
        })
    }

    fn unfreeze<'a>(&'a self, ctx: &'a StepContext<'a>) -> RolloutFuture<'a, ()> {
        Box::pin(async move {
            ctx.set_partition(0).await?;
            Ok(())
        })
    }

    fn wait_leave<'a>(&'a self, ctx: &'a StepContext<'a>) -> RolloutFuture<'a, ()> {
        Box::pin(async move {
            let expected = ctx.expected_members;
            let admin = ctx.admin;
            ctx.wait(
                "leave",
                format!("cluster to drop below {expected} nodes"),
                ctx.settings.leave_timeout,
                || async move { Ok::<_, DynError>(admin.cluster_node_count().await? < expected) },
            )
            .await?;
            Ok(())
        })
    }

    fn wait_rejoin<'a>(&'a self, ctx: &'a StepContext<'a>) -> RolloutFuture<'a, ()> {
        Box::pin(async move {
            let expected = ctx.expected_members;
            let admin = ctx.admin;
            ctx.wait(
                "rejoin",
                format!("cluster to reach {expected} nodes"),
                ctx.settings.rejoin_timeout,
                || async move { Ok::<_, DynError>(admin.cluster_node_count().await? >= expected) },
            )
            .await?;
            Ok(())
        })
    }

    fn is_settled<'a>(
        &'a self,
        _ctx: &'a StepContext<'a>,
        live: &'a Workload,
    ) -> RolloutFuture<'a, bool> {
        Box::pin(async move { Ok(live.partition().unwrap_or(0) == 0) })
    }
}

/// Deployment rollouts driven through the paused flag.
pub struct IndependentStrategy;

impl IndependentStrategy {
    fn pods_match(desired: &PodTemplateSpec, pods: &[Pod], replicas: u32) -> Result<bool, DynError> {
        if pods.len() < replicas as usize {
            return Ok(false);
        }
        for pod in pods {
            if !pod_spec_differences(&desired.spec, &pod.spec)?.is_empty() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl TopologyStrategy for IndependentStrategy {
    fn kind(&self) -> TopologyKind {
        TopologyKind::Independent
    }

    fn freeze<'a>(&'a self, ctx: &'a StepContext<'a>) -> RolloutFuture<'a, ()> {
        Box::pin(async move {
            if ctx.set_paused(true).await? {
                log_info("topology", "paused deployment", &[("node", ctx.node)]);
            }
            Ok(())
        })
    }

    fn step<'a>(&'a self, ctx: &'a StepContext<'a>) -> RolloutFuture<'a, u32> {
        Box::pin(async move {
            self.unfreeze(ctx).await?;
            metrics::record_rollout_step(ctx.node, TopologyKind::Independent.as_str());

            let workloads = ctx.workloads;
            let key = ctx.key;
            let desired = ctx.desired;
            let replicas = ctx.replicas;
            ctx.wait(
                "pods",
                format!("pods of {key} to run the desired template"),
                ctx.settings.rollout_timeout,
                || async move {
                    let pods = workloads.pods(key).await?;
                    Self::pods_match(desired, &pods, replicas)
                },
            )
            .await?;

            self.freeze(ctx).await?;
            Ok(1)
        })
    }

    fn unfreeze<'a>(&'a self, ctx: &'a StepContext<'a>) -> RolloutFuture<'a, ()> {
        Box::pin(async move {
            if ctx.set_paused(false).await? {
                log_info("topology", "unpaused deployment", &[("node", ctx.node)]);
            }
            Ok(())
        })
    }

    fn wait_leave<'a>(&'a self, ctx: &'a StepContext<'a>) -> RolloutFuture<'a, ()> {
        Box::pin(async move {
            let admin = ctx.admin;
            let node = ctx.node;
            ctx.wait(
                "leave",
                format!("node {node} to leave the cluster"),
                ctx.settings.leave_timeout,
                || async move { Ok::<_, DynError>(!admin.is_node_in_cluster(node).await?) },
            )
            .await?;
            Ok(())
        })
    }

    fn wait_rejoin<'a>(&'a self, ctx: &'a StepContext<'a>) -> RolloutFuture<'a, ()> {
        Box::pin(async move {
            let admin = ctx.admin;
            let node = ctx.node;
            ctx.wait(
                "rejoin",
                format!("node {node} to rejoin the cluster"),
                ctx.settings.rejoin_timeout,
                || async move { admin.is_node_in_cluster(node).await },
            )
            .await?;
            Ok(())
        })
    }

    fn is_settled<'a>(
        &'a self,
        ctx: &'a StepContext<'a>,
        live: &'a Workload,
    ) -> RolloutFuture<'a, bool> {
        Box::pin(async move {
            // An unpaused deployment means a pass stopped before re-freezing.
            if live.paused() != Some(true) {
                return Ok(false);
            }
            let pods = ctx.workloads.pods(ctx.key).await?;
            Self::pods_match(live.template(), &pods, live.replicas())
                .map_err(|err| RolloutError::FatalConfiguration(err.to_string()))
        })
    }
}
