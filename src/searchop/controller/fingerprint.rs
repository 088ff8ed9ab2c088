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

//! Content fingerprints over config and secret data.
//!
//! A fingerprint is the SHA-256 of the per-key value digests concatenated in
//! sorted key order, so it depends only on content, never on map iteration
//! order. The empty string is reserved for "could not be computed".

use crate::searchop::k8s::workload::{DataBagKey, DataBagSource};
use crate::searchop::logger::log_warn;
use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// Sentinel for a fingerprint that is not known: never recorded yet, or the
/// data could not be read.
pub const UNKNOWN_FINGERPRINT: &str = "";

/// Fingerprints a key/value bag, skipping `exclude` keys.
pub fn compute_fingerprint<'a, I, V>(bag: I, exclude: &HashSet<String>) -> String
where
    I: IntoIterator<Item = (&'a String, V)>,
    V: AsRef<[u8]>,
{
    let mut digests: Vec<(&String, String)> = bag
        .into_iter()
        .filter(|(key, _)| !exclude.contains(key.as_str()))
        .map(|(key, value)| (key, format!("{:x}", Sha256::digest(value.as_ref()))))
        .collect();
    digests.sort_by(|left, right| left.0.cmp(right.0));

    let mut hasher = Sha256::new();
    for (_, digest) in &digests {
        hasher.update(digest.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Reads the bag behind `key` and fingerprints it. Returns
/// [`UNKNOWN_FINGERPRINT`] when the bag cannot be read.
pub async fn fingerprint_data_bag(
    source: &dyn DataBagSource,
    key: &DataBagKey,
    exclude: &HashSet<String>,
) -> String {
    match source.data_bag(key).await {
        Ok(bag) => compute_fingerprint(&bag, exclude),
        Err(err) => {
            let key_str = key.to_string();
            let error_text = err.to_string();
            log_warn(
                "fingerprint",
                "unable to read data for fingerprint",
                &[("source", key_str.as_str()), ("error", error_text.as_str())],
            );
            UNKNOWN_FINGERPRINT.to_string()
        }
    }
}

/// Result of comparing a recorded fingerprint with the live one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FingerprintObservation {
    Unchanged,
    /// Nothing was recorded; the live value became the baseline.
    Adopted,
    /// Content differs from what the running pods were started with.
    Changed { recorded: String, live: String },
    /// The live value could not be computed; nothing was updated.
    Unknown,
}

impl FingerprintObservation {
    pub fn requires_redeploy(&self) -> bool {
        matches!(self, FingerprintObservation::Changed { .. })
    }
}

/// Compares `live` against `recorded`, adopting it when nothing was recorded.
/// A detected change leaves `recorded` alone until a rollout completes.
pub fn observe_fingerprint(recorded: &mut String, live: &str) -> FingerprintObservation {
    if live == UNKNOWN_FINGERPRINT {
        return FingerprintObservation::Unknown;
    }
    if recorded.as_str() == UNKNOWN_FINGERPRINT {
        *recorded = live.to_string();
        return FingerprintObservation::Adopted;
    }
    if recorded.as_str() == live {
        FingerprintObservation::Unchanged
    } else {
        FingerprintObservation::Changed {
            recorded: recorded.clone(),
            live: live.to_string(),
        }
    }
}
