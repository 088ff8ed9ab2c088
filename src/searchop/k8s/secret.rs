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

use super::pod::ObjectMeta;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;

/// Opaque secret holding node certificates and keys. `data` values are
/// base64-encoded as on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(rename = "type", default = "default_secret_type")]
    pub secret_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,
}

fn default_secret_type() -> String {
    "Opaque".to_string()
}

#[derive(Debug)]
pub struct SecretDecodeError {
    pub key: String,
    pub source: base64::DecodeError,
}

impl fmt::Display for SecretDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "secret key '{}' is not valid base64: {}", self.key, self.source)
    }
}

impl Error for SecretDecodeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.source)
    }
}

impl Secret {
    pub fn new(metadata: ObjectMeta) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "Secret".to_string(),
            metadata,
            secret_type: default_secret_type(),
            data: BTreeMap::new(),
        }
    }

    pub fn with_entry(mut self, key: &str, value: &[u8]) -> Self {
        self.data
            .insert(key.to_string(), BASE64_STANDARD.encode(value));
        self
    }

    /// Decoded key/value bag. Unlike config maps, an undecodable value makes
    /// the whole secret unreadable.
    pub fn entries(&self) -> Result<BTreeMap<String, Vec<u8>>, SecretDecodeError> {
        self.data
            .iter()
            .map(|(key, value)| {
                BASE64_STANDARD
                    .decode(value)
                    .map(|decoded| (key.clone(), decoded))
                    .map_err(|source| SecretDecodeError {
                        key: key.clone(),
                        source,
                    })
            })
            .collect()
    }
}
