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

//! A single replicated workload as the rollout controllers see it, plus the
//! collaborator traits used to read and mutate workloads and the config and
//! secret data they consume.

use super::deployment::{Deployment, DeploymentSpec, DeploymentStrategy};
use super::pod::{ObjectMeta, Pod, PodTemplateSpec};
use super::statefulset::{LabelSelector, StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy};
use crate::searchop::util::DynError;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Label stamped on every pod of a node group so selectors stay unique.
pub const NODE_GROUP_LABEL: &str = "searchop.io/node-group";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkloadKey {
    pub namespace: String,
    pub name: String,
}

impl WorkloadKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// How replicas of a node group are identified and rolled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopologyKind {
    /// StatefulSet replicas `0..N-1` gated by a partition index.
    Ordinal,
    /// Deployment replicas gated by the paused flag.
    Independent,
}

impl TopologyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TopologyKind::Ordinal => "ordinal",
            TopologyKind::Independent => "independent",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Workload {
    StatefulSet(StatefulSet),
    Deployment(Deployment),
}

impl Workload {
    /// Builds the workload object for a node group that does not exist yet.
    /// Ordinal groups start unpartitioned and independent ones unpaused so the
    /// first replicas come up immediately.
    pub fn for_node(
        key: &WorkloadKey,
        topology: TopologyKind,
        replicas: u32,
        template: &PodTemplateSpec,
    ) -> Self {
        let mut template = template.clone();
        template
            .metadata
            .labels
            .insert(NODE_GROUP_LABEL.to_string(), key.name.clone());
        let selector = LabelSelector {
            match_labels: BTreeMap::from([(NODE_GROUP_LABEL.to_string(), key.name.clone())]),
        };
        let mut metadata = ObjectMeta::named(&key.namespace, &key.name);
        metadata.labels = selector.match_labels.clone();
        let replicas = i32::try_from(replicas).unwrap_or(i32::MAX);

        match topology {
            TopologyKind::Ordinal => Workload::StatefulSet(StatefulSet::new(
                metadata,
                StatefulSetSpec {
                    service_name: key.name.clone(),
                    replicas,
                    selector,
                    template,
                    update_strategy: StatefulSetUpdateStrategy::default(),
                },
            )),
            TopologyKind::Independent => Workload::Deployment(Deployment::new(
                metadata,
                DeploymentSpec {
                    replicas,
                    selector,
                    template,
                    strategy: DeploymentStrategy::default(),
                    paused: false,
                },
            )),
        }
    }

    pub fn topology(&self) -> TopologyKind {
        match self {
            Workload::StatefulSet(_) => TopologyKind::Ordinal,
            Workload::Deployment(_) => TopologyKind::Independent,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Workload::StatefulSet(set) => &set.metadata,
            Workload::Deployment(deployment) => &deployment.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Workload::StatefulSet(set) => &mut set.metadata,
            Workload::Deployment(deployment) => &mut deployment.metadata,
        }
    }

    pub fn key(&self) -> WorkloadKey {
        let metadata = self.metadata();
        WorkloadKey::new(
            metadata.namespace.as_deref().unwrap_or("default"),
            metadata.name.as_deref().unwrap_or_default(),
        )
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.metadata().resource_version.as_deref()
    }

    pub fn template(&self) -> &PodTemplateSpec {
        match self {
            Workload::StatefulSet(set) => &set.spec.template,
            Workload::Deployment(deployment) => &deployment.spec.template,
        }
    }

    pub fn template_mut(&mut self) -> &mut PodTemplateSpec {
        match self {
            Workload::StatefulSet(set) => &mut set.spec.template,
            Workload::Deployment(deployment) => &mut deployment.spec.template,
        }
    }

    pub fn selector(&self) -> &LabelSelector {
        match self {
            Workload::StatefulSet(set) => &set.spec.selector,
            Workload::Deployment(deployment) => &deployment.spec.selector,
        }
    }

    pub fn replicas(&self) -> u32 {
        let replicas = match self {
            Workload::StatefulSet(set) => set.spec.replicas,
            Workload::Deployment(deployment) => deployment.spec.replicas,
        };
        u32::try_from(replicas).unwrap_or(0)
    }

    /// Partition index; `None` for independent workloads.
    pub fn partition(&self) -> Option<u32> {
        match self {
            Workload::StatefulSet(set) => Some(set.spec.update_strategy.partition()),
            Workload::Deployment(_) => None,
        }
    }

    /// Returns `false` when the workload has no partition to set.
    pub fn set_partition(&mut self, partition: u32) -> bool {
        match self {
            Workload::StatefulSet(set) => {
                set.spec.update_strategy.set_partition(partition);
                true
            }
            Workload::Deployment(_) => false,
        }
    }

    /// Paused flag; `None` for ordinal workloads.
    pub fn paused(&self) -> Option<bool> {
        match self {
            Workload::StatefulSet(_) => None,
            Workload::Deployment(deployment) => Some(deployment.spec.paused),
        }
    }

    /// Returns `false` when the workload cannot be paused.
    pub fn set_paused(&mut self, paused: bool) -> bool {
        match self {
            Workload::StatefulSet(_) => false,
            Workload::Deployment(deployment) => {
                deployment.spec.paused = paused;
                true
            }
        }
    }
}

#[derive(Debug)]
pub enum WorkloadError {
    NotFound(String),
    AlreadyExists(String),
    /// The optimistic-concurrency write kept losing to other writers.
    Conflict { key: String, attempts: u32 },
    Backend(DynError),
}

impl WorkloadError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, WorkloadError::NotFound(_))
    }
}

impl fmt::Display for WorkloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadError::NotFound(key) => write!(f, "{key} not found"),
            WorkloadError::AlreadyExists(key) => write!(f, "{key} already exists"),
            WorkloadError::Conflict { key, attempts } => write!(
                f,
                "update of {key} conflicted with concurrent writers {attempts} times"
            ),
            WorkloadError::Backend(err) => write!(f, "workload backend error: {err}"),
        }
    }
}

impl Error for WorkloadError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WorkloadError::Backend(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// `equal` held on the live object; nothing was written.
    Unchanged,
    Updated { resource_version: String },
}

pub type WorkloadFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, WorkloadError>> + Send + 'a>>;

/// `equal(live, desired)`: whether the live object already satisfies the write.
pub type EqualFn<'a> = dyn Fn(&Workload, &Workload) -> bool + Send + Sync + 'a;

/// `mutate(live, desired)`: applies the write onto a copy of the live object.
pub type MutateFn<'a> = dyn Fn(&mut Workload, &Workload) + Send + Sync + 'a;

/// Generic handle over replicated workloads.
pub trait WorkloadResource: Send + Sync {
    fn get<'a>(&'a self, key: &'a WorkloadKey) -> WorkloadFuture<'a, Workload>;

    fn create(&self, workload: Workload) -> WorkloadFuture<'_, Workload>;

    /// Read, compare with `equal`, apply `mutate`, write conditionally on the
    /// read's resource version; retried on conflict up to a bounded count.
    fn update<'a>(
        &'a self,
        key: &'a WorkloadKey,
        desired: &'a Workload,
        equal: &'a EqualFn<'a>,
        mutate: &'a MutateFn<'a>,
    ) -> WorkloadFuture<'a, UpdateOutcome>;

    fn delete<'a>(&'a self, key: &'a WorkloadKey) -> WorkloadFuture<'a, ()>;

    /// Live pods selected by the workload.
    fn pods<'a>(&'a self, key: &'a WorkloadKey) -> WorkloadFuture<'a, Vec<Pod>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataBagKind {
    ConfigMap,
    Secret,
}

/// Names a config map or secret whose contents feed a node's fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataBagKey {
    pub kind: DataBagKind,
    pub namespace: String,
    pub name: String,
}

impl DataBagKey {
    pub fn config_map(namespace: &str, name: &str) -> Self {
        Self {
            kind: DataBagKind::ConfigMap,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn secret(namespace: &str, name: &str) -> Self {
        Self {
            kind: DataBagKind::Secret,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for DataBagKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            DataBagKind::ConfigMap => "configmap",
            DataBagKind::Secret => "secret",
        };
        write!(f, "{kind}/{}/{}", self.namespace, self.name)
    }
}

pub trait DataBagSource: Send + Sync {
    fn data_bag<'a>(&'a self, key: &'a DataBagKey)
        -> WorkloadFuture<'a, BTreeMap<String, Vec<u8>>>;
}
