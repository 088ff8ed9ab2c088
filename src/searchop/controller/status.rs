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

use super::orchestrator::{RolloutError, RolloutOutcome, RolloutPhase};
use crate::searchop::cluster::types::ClusterHealth;
use serde::Serialize;

pub const CONDITION_PROGRESSING: &str = "RolloutProgressing";
pub const CONDITION_FAILED: &str = "RolloutFailed";
pub const CONDITION_FINGERPRINT_UNKNOWN: &str = "FingerprintUnknown";
pub const CONDITION_REDEPLOY_REQUIRED: &str = "RedeployRequired";
pub const CONDITION_BLOCKED: &str = "Blocked";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl NodeCondition {
    fn new(condition_type: &str, status: bool, reason: &str, message: Option<String>) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            reason: Some(reason.to_string()),
            message,
        }
    }

    pub fn progressing(outcome: &RolloutOutcome) -> Self {
        match outcome {
            RolloutOutcome::Completed { steps } => Self::new(
                CONDITION_PROGRESSING,
                false,
                "RolloutComplete",
                Some(format!("released {steps} step(s) onto the desired template")),
            ),
            RolloutOutcome::Unchanged => Self::new(CONDITION_PROGRESSING, false, "UpToDate", None),
            RolloutOutcome::Unverified => Self::new(
                CONDITION_PROGRESSING,
                false,
                "Unverified",
                Some("live workload could not be read".to_string()),
            ),
        }
    }

    pub fn failed(err: &RolloutError) -> Self {
        Self::new(CONDITION_FAILED, true, err.reason(), Some(err.to_string()))
    }

    /// `baseline` tells whether the pass still ran against the recorded
    /// fingerprint or the group was skipped.
    pub fn fingerprint_unknown(source: &str, baseline: bool) -> Self {
        let message = if baseline {
            format!("{source} could not be fingerprinted; content changes cannot be ruled out")
        } else {
            format!("{source} could not be fingerprinted and no baseline is recorded")
        };
        Self::new(
            CONDITION_FINGERPRINT_UNKNOWN,
            true,
            if baseline { "DataUnreadable" } else { "NoBaseline" },
            Some(message),
        )
    }

    pub fn redeploy_required(source: &str) -> Self {
        Self::new(
            CONDITION_REDEPLOY_REQUIRED,
            true,
            "ContentChanged",
            Some(format!("{source} changed since the pods were started")),
        )
    }

    pub fn blocked(after: &str) -> Self {
        Self::new(
            CONDITION_BLOCKED,
            true,
            "EarlierNodeFailed",
            Some(format!("waiting on {after} in the same failure domain")),
        )
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// Per node group result of one coordinator pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRolloutStatus {
    pub name: String,
    pub failure_domain: String,
    pub phase: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    pub config_fingerprint: String,
    pub secret_fingerprint: String,
    pub created: bool,
    pub conditions: Vec<NodeCondition>,
}

impl NodeRolloutStatus {
    pub fn new(name: &str, failure_domain: &str, phase: RolloutPhase) -> Self {
        Self {
            name: name.to_string(),
            failure_domain: failure_domain.to_string(),
            phase: phase.as_str().to_string(),
            outcome: None,
            config_fingerprint: String::new(),
            secret_fingerprint: String::new(),
            created: false,
            conditions: Vec::new(),
        }
    }

    pub fn condition(&self, condition_type: &str) -> Option<&NodeCondition> {
        self.conditions
            .iter()
            .find(|condition| condition.condition_type == condition_type)
    }

    pub fn has_condition(&self, condition_type: &str) -> bool {
        self.condition(condition_type)
            .map(NodeCondition::is_true)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRolloutStatus {
    pub nodes: Vec<NodeRolloutStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<ClusterHealth>,
}

impl ClusterRolloutStatus {
    pub fn node(&self, name: &str) -> Option<&NodeRolloutStatus> {
        self.nodes.iter().find(|node| node.name == name)
    }

    /// True when every node group is stable and nothing failed, blocked or
    /// went unobserved.
    pub fn is_converged(&self) -> bool {
        self.nodes.iter().all(|node| {
            node.phase == RolloutPhase::Stable.as_str()
                && node.outcome.as_deref() != Some("Unverified")
                && !node.has_condition(CONDITION_FAILED)
                && !node.has_condition(CONDITION_BLOCKED)
                && !node.has_condition(CONDITION_FINGERPRINT_UNKNOWN)
        })
    }
}
