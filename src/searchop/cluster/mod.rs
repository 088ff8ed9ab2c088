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

//! The search service's cluster admin API as consumed by the rollout
//! controllers.

pub mod client;
pub mod types;

use crate::searchop::util::DynError;
use std::future::Future;
use std::pin::Pin;
use types::ClusterHealth;

pub type AdminFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DynError>> + Send + 'a>>;

/// Cluster membership and health queries.
///
/// Answers are eventually consistent: a node that just restarted may still be
/// listed for a while, and one that just started may not be listed yet.
pub trait ClusterAdminApi: Send + Sync {
    /// Whether a node with exactly this name is currently a cluster member.
    fn is_node_in_cluster<'a>(&'a self, name: &'a str) -> AdminFuture<'a, bool>;

    /// Total number of nodes currently in the cluster.
    fn cluster_node_count(&self) -> AdminFuture<'_, u32>;

    fn cluster_health(&self) -> AdminFuture<'_, ClusterHealth>;
}
