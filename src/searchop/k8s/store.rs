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

//! In-process implementation of the workload and data-bag collaborators.
//!
//! Every write bumps a store-wide resource version and is only accepted when
//! the caller's read version still matches, mirroring the API server's
//! optimistic concurrency. Accepted writes are kept in a history so callers
//! can inspect the exact sequence of mutations a rollout produced.

use super::configmap::ConfigMap;
use super::pod::Pod;
use super::secret::Secret;
use super::workload::{
    DataBagKey, DataBagKind, DataBagSource, EqualFn, MutateFn, UpdateOutcome, Workload,
    WorkloadError, WorkloadFuture, WorkloadKey, WorkloadResource,
};
use crate::searchop::config::RolloutSettings;
use crate::searchop::logger::log_debug;
use crate::searchop::util::new_error;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

pub const DEFAULT_CONFLICT_RETRIES: u32 = 5;

#[derive(Default)]
struct StoreState {
    workloads: BTreeMap<WorkloadKey, Workload>,
    pods: BTreeMap<WorkloadKey, Vec<Pod>>,
    config_maps: BTreeMap<(String, String), ConfigMap>,
    secrets: BTreeMap<(String, String), Secret>,
    last_version: u64,
    history: Vec<Workload>,
    pending_conflicts: u32,
    pending_get_failures: u32,
    pending_bag_failures: u32,
}

impl StoreState {
    fn next_version(&mut self) -> String {
        self.last_version += 1;
        self.last_version.to_string()
    }
}

pub struct InMemoryStore {
    state: Mutex<StoreState>,
    conflict_retries: u32,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_conflict_retries(DEFAULT_CONFLICT_RETRIES)
    }

    /// Store whose conditional writes retry as often as `settings` allows.
    pub fn from_settings(settings: &RolloutSettings) -> Self {
        Self::with_conflict_retries(settings.conflict_retries)
    }

    pub fn with_conflict_retries(conflict_retries: u32) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            conflict_retries: conflict_retries.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seeds or replaces a workload outside the write history, as if another
    /// actor had written it.
    pub fn insert_workload(&self, mut workload: Workload) -> Workload {
        let mut state = self.lock();
        let version = state.next_version();
        workload.metadata_mut().resource_version = Some(version);
        state.workloads.insert(workload.key(), workload.clone());
        workload
    }

    pub fn workload(&self, key: &WorkloadKey) -> Option<Workload> {
        self.lock().workloads.get(key).cloned()
    }

    pub fn put_config_map(&self, config_map: ConfigMap) {
        let key = bag_key(&config_map.metadata);
        self.lock().config_maps.insert(key, config_map);
    }

    pub fn put_secret(&self, secret: Secret) {
        let key = bag_key(&secret.metadata);
        self.lock().secrets.insert(key, secret);
    }

    pub fn set_pods(&self, key: &WorkloadKey, pods: Vec<Pod>) {
        self.lock().pods.insert(key.clone(), pods);
    }

    pub fn pods_of(&self, key: &WorkloadKey) -> Vec<Pod> {
        self.lock().pods.get(key).cloned().unwrap_or_default()
    }

    /// Accepted writes in order, as stored.
    pub fn history(&self) -> Vec<Workload> {
        self.lock().history.clone()
    }

    pub fn write_count(&self) -> usize {
        self.lock().history.len()
    }

    /// The next `count` conditional writes lose to a simulated concurrent
    /// writer.
    pub fn inject_conflicts(&self, count: u32) {
        self.lock().pending_conflicts = count;
    }

    /// The next `count` workload reads fail with a backend error.
    pub fn fail_next_gets(&self, count: u32) {
        self.lock().pending_get_failures = count;
    }

    /// The next `count` data bag reads fail with a backend error.
    pub fn fail_next_data_bags(&self, count: u32) {
        self.lock().pending_bag_failures = count;
    }

    fn read(&self, key: &WorkloadKey) -> Result<Workload, WorkloadError> {
        self.lock()
            .workloads
            .get(key)
            .cloned()
            .ok_or_else(|| WorkloadError::NotFound(key.to_string()))
    }

    fn compare_and_swap(
        &self,
        key: &WorkloadKey,
        read_version: Option<&str>,
        mut next: Workload,
    ) -> Result<String, WorkloadError> {
        let mut state = self.lock();
        if state.pending_conflicts > 0 {
            state.pending_conflicts -= 1;
            let version = state.next_version();
            if let Some(current) = state.workloads.get_mut(key) {
                current.metadata_mut().resource_version = Some(version);
            }
        }
        let stored_version = state
            .workloads
            .get(key)
            .ok_or_else(|| WorkloadError::NotFound(key.to_string()))?
            .resource_version()
            .map(str::to_string);
        if stored_version.as_deref() != read_version {
            return Err(WorkloadError::Conflict {
                key: key.to_string(),
                attempts: 1,
            });
        }

        let version = state.next_version();
        next.metadata_mut().resource_version = Some(version.clone());
        state.history.push(next.clone());
        state.workloads.insert(key.clone(), next);
        Ok(version)
    }
}

fn bag_key(metadata: &super::pod::ObjectMeta) -> (String, String) {
    (
        metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string()),
        metadata.name.clone().unwrap_or_default(),
    )
}

impl WorkloadResource for InMemoryStore {
    fn get<'a>(&'a self, key: &'a WorkloadKey) -> WorkloadFuture<'a, Workload> {
        Box::pin(async move {
            {
                let mut state = self.lock();
                if state.pending_get_failures > 0 {
                    state.pending_get_failures -= 1;
                    return Err(WorkloadError::Backend(new_error(format!(
                        "read of {key} failed: connection reset"
                    ))));
                }
            }
            self.read(key)
        })
    }

    fn create(&self, mut workload: Workload) -> WorkloadFuture<'_, Workload> {
        Box::pin(async move {
            let key = workload.key();
            let mut state = self.lock();
            if state.workloads.contains_key(&key) {
                return Err(WorkloadError::AlreadyExists(key.to_string()));
            }
            let version = state.next_version();
            workload.metadata_mut().resource_version = Some(version);
            state.history.push(workload.clone());
            state.workloads.insert(key, workload.clone());
            Ok(workload)
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
            for attempt in 1..=self.conflict_retries {
                let current = self.read(key)?;
                if equal(&current, desired) {
                    return Ok(UpdateOutcome::Unchanged);
                }
                let mut next = current.clone();
                mutate(&mut next, desired);
                match self.compare_and_swap(key, current.resource_version(), next) {
                    Ok(resource_version) => {
                        return Ok(UpdateOutcome::Updated { resource_version });
                    }
                    Err(WorkloadError::Conflict { .. }) => {
                        let key_str = key.to_string();
                        let attempt_str = attempt.to_string();
                        log_debug(
                            "workload-store",
                            "write lost to a concurrent update; re-reading",
                            &[("workload", key_str.as_str()), ("attempt", attempt_str.as_str())],
                        );
                    }
                    Err(err) => return Err(err),
                }
            }
            Err(WorkloadError::Conflict {
                key: key.to_string(),
                attempts: self.conflict_retries,
            })
        })
    }

    fn delete<'a>(&'a self, key: &'a WorkloadKey) -> WorkloadFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.lock();
            state.pods.remove(key);
            state
                .workloads
                .remove(key)
                .map(|_| ())
                .ok_or_else(|| WorkloadError::NotFound(key.to_string()))
        })
    }

    fn pods<'a>(&'a self, key: &'a WorkloadKey) -> WorkloadFuture<'a, Vec<Pod>> {
        Box::pin(async move { Ok(self.pods_of(key)) })
    }
}

impl DataBagSource for InMemoryStore {
    fn data_bag<'a>(
        &'a self,
        key: &'a DataBagKey,
    ) -> WorkloadFuture<'a, BTreeMap<String, Vec<u8>>> {
        Box::pin(async move {
            let mut state = self.lock();
            if state.pending_bag_failures > 0 {
                state.pending_bag_failures -= 1;
                return Err(WorkloadError::Backend(new_error(format!(
                    "read of {key} failed: connection reset"
                ))));
            }
            let lookup = (key.namespace.clone(), key.name.clone());
            match key.kind {
                DataBagKind::ConfigMap => state
                    .config_maps
                    .get(&lookup)
                    .map(ConfigMap::entries)
                    .ok_or_else(|| WorkloadError::NotFound(key.to_string())),
                DataBagKind::Secret => {
                    let secret = state
                        .secrets
                        .get(&lookup)
                        .ok_or_else(|| WorkloadError::NotFound(key.to_string()))?;
                    secret
                        .entries()
                        .map_err(|err| WorkloadError::Backend(Box::new(err)))
                }
            }
        })
    }
}
