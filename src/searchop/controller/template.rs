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

//! Pod template comparison and merging.
//!
//! Only the fields a rollout owns take part: per container the image,
//! command, args, env and resources, and per pod the node selector and
//! tolerations. Metadata and scheduler-populated fields never count as drift.

use crate::searchop::k8s::pod::{ContainerSpec, PodSpec, PodTemplateSpec, ResourceRequirements};
use crate::searchop::k8s::quantity::{parse_quantity, resource_lists_equivalent, QuantityError};

/// Rejects templates that cannot be rolled out.
pub fn validate_template(template: &PodTemplateSpec) -> Result<(), String> {
    if template.spec.containers.is_empty() {
        return Err("desired template declares no containers".to_string());
    }
    for container in &template.spec.containers {
        if container.name.trim().is_empty() {
            return Err("desired template has a container without a name".to_string());
        }
        if container.image.as_deref().map_or(true, |image| image.trim().is_empty()) {
            return Err(format!("container '{}' has no image", container.name));
        }
        if let Some(resources) = &container.resources {
            for (resource, value) in resources.requests.iter().chain(resources.limits.iter()) {
                parse_quantity(value).map_err(|err| {
                    format!("container '{}' resource '{resource}': {err}", container.name)
                })?;
            }
        }
    }
    Ok(())
}

/// Field paths on which `live` differs from `desired`; empty when in sync.
pub fn template_differences(
    desired: &PodTemplateSpec,
    live: &PodTemplateSpec,
) -> Result<Vec<String>, QuantityError> {
    pod_spec_differences(&desired.spec, &live.spec)
}

pub fn pod_spec_differences(desired: &PodSpec, live: &PodSpec) -> Result<Vec<String>, QuantityError> {
    let mut differences = Vec::new();

    if !same_container_names(&desired.containers, &live.containers) {
        differences.push("containers".to_string());
    }
    for wanted in &desired.containers {
        let Some(running) = live.containers.iter().find(|c| c.name == wanted.name) else {
            continue;
        };
        let prefix = format!("containers[{}]", wanted.name);
        if wanted.image != running.image {
            differences.push(format!("{prefix}.image"));
        }
        if wanted.command != running.command {
            differences.push(format!("{prefix}.command"));
        }
        if wanted.args != running.args {
            differences.push(format!("{prefix}.args"));
        }
        if wanted.env != running.env {
            differences.push(format!("{prefix}.env"));
        }
        if !resources_equivalent(wanted.resources.as_ref(), running.resources.as_ref())? {
            differences.push(format!("{prefix}.resources"));
        }
    }

    if desired.node_selector != live.node_selector {
        differences.push("nodeSelector".to_string());
    }
    let mut wanted_tolerations = desired.tolerations.clone();
    let mut running_tolerations = live.tolerations.clone();
    wanted_tolerations.sort();
    running_tolerations.sort();
    if wanted_tolerations != running_tolerations {
        differences.push("tolerations".to_string());
    }

    Ok(differences)
}

fn same_container_names(desired: &[ContainerSpec], live: &[ContainerSpec]) -> bool {
    desired.len() == live.len()
        && desired
            .iter()
            .zip(live.iter())
            .all(|(wanted, running)| wanted.name == running.name)
}

fn resources_equivalent(
    desired: Option<&ResourceRequirements>,
    live: Option<&ResourceRequirements>,
) -> Result<bool, QuantityError> {
    let empty = ResourceRequirements::default();
    let desired = desired.unwrap_or(&empty);
    let live = live.unwrap_or(&empty);
    Ok(resource_lists_equivalent(&desired.requests, &live.requests)?
        && resource_lists_equivalent(&desired.limits, &live.limits)?)
}

/// Copies the rollout-owned fields of `desired` onto `live`. A changed
/// container set replaces the container list wholesale.
pub fn merge_template(live: &mut PodTemplateSpec, desired: &PodTemplateSpec) {
    if same_container_names(&desired.spec.containers, &live.spec.containers) {
        for (running, wanted) in live
            .spec
            .containers
            .iter_mut()
            .zip(desired.spec.containers.iter())
        {
            running.image = wanted.image.clone();
            running.command = wanted.command.clone();
            running.args = wanted.args.clone();
            running.env = wanted.env.clone();
            running.resources = wanted.resources.clone();
        }
    } else {
        live.spec.containers = desired.spec.containers.clone();
    }
    live.spec.node_selector = desired.spec.node_selector.clone();
    live.spec.tolerations = desired.spec.tolerations.clone();
}
