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

use std::error::Error;
use std::sync::OnceLock;
use std::time::Duration;

use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static ROLLOUT_RESULTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static ROLLOUT_STEPS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static ROLLOUT_WAIT_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static NODE_ROLLOUT_PHASE: OnceLock<IntGaugeVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        Registry::new_custom(Some("searchop".to_string()), None)
            .expect("failed to initialise searchop metrics registry")
    })
}

fn register_collector<C>(collector: C) -> C
where
    C: Clone + Collector + Send + Sync + 'static,
{
    registry()
        .register(Box::new(collector.clone()))
        .expect("failed to register searchop metric collector");
    collector
}

fn rollout_results_total() -> &'static IntCounterVec {
    ROLLOUT_RESULTS_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "rollout_results_total",
            "Node rollout passes grouped by node group and result",
        );
        let counter = IntCounterVec::new(opts, &["node", "result"])
            .expect("failed to build rollout result counter");
        register_collector(counter)
    })
}

fn rollout_steps_total() -> &'static IntCounterVec {
    ROLLOUT_STEPS_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "rollout_steps_total",
            "Replica restart steps released by the orchestrator",
        );
        let counter = IntCounterVec::new(opts, &["node", "topology"])
            .expect("failed to build rollout step counter");
        register_collector(counter)
    })
}

fn rollout_wait_seconds() -> &'static HistogramVec {
    ROLLOUT_WAIT_SECONDS.get_or_init(|| {
        let opts = HistogramOpts::new(
            "rollout_wait_seconds",
            "Time spent in bounded membership and pod waits",
        )
        .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 45.0, 60.0, 120.0]);
        let histogram = HistogramVec::new(opts, &["wait", "outcome"])
            .expect("failed to build rollout wait histogram");
        register_collector(histogram)
    })
}

fn node_rollout_phase() -> &'static IntGaugeVec {
    NODE_ROLLOUT_PHASE.get_or_init(|| {
        let opts = Opts::new(
            "node_rollout_phase",
            "Current rollout phase per node group (0 stable, 1 drift detected, 2 frozen, 3 stepping, 4 verifying, 5 failed)",
        );
        let gauge =
            IntGaugeVec::new(opts, &["node"]).expect("failed to build rollout phase gauge");
        register_collector(gauge)
    })
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RolloutResult {
    Unchanged,
    Unverified,
    Completed,
    Timeout,
    Failed,
}

impl RolloutResult {
    fn as_label(self) -> &'static str {
        match self {
            RolloutResult::Unchanged => "unchanged",
            RolloutResult::Unverified => "unverified",
            RolloutResult::Completed => "completed",
            RolloutResult::Timeout => "timeout",
            RolloutResult::Failed => "failed",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitOutcome {
    Satisfied,
    TimedOut,
}

impl WaitOutcome {
    fn as_label(self) -> &'static str {
        match self {
            WaitOutcome::Satisfied => "satisfied",
            WaitOutcome::TimedOut => "timeout",
        }
    }
}

pub fn record_rollout_result(node: &str, result: RolloutResult) {
    rollout_results_total()
        .with_label_values(&[node, result.as_label()])
        .inc();
}

pub fn record_rollout_step(node: &str, topology: &str) {
    rollout_steps_total()
        .with_label_values(&[node, topology])
        .inc();
}

pub fn observe_wait(wait: &str, outcome: WaitOutcome, elapsed: Duration) {
    rollout_wait_seconds()
        .with_label_values(&[wait, outcome.as_label()])
        .observe(elapsed.as_secs_f64());
}

pub fn set_node_phase(node: &str, phase: i64) {
    node_rollout_phase().with_label_values(&[node]).set(phase);
}

pub fn gather() -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    let metric_families = registry().gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|err| Box::new(err) as Box<dyn Error + Send + Sync>)?;
    Ok(buffer)
}
