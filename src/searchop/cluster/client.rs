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

use super::types::{CatNode, ClusterHealth, ErrorBody};
use super::{AdminFuture, ClusterAdminApi};
use crate::searchop::config::Config;
use crate::searchop::logger::log_debug;
use crate::searchop::util::{new_error, with_context, DynError};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::error::Error;
use std::fmt;
use std::time::Duration;
use tokio::time::sleep;

const RETRY_ATTEMPTS: usize = 2;
const RETRY_BACKOFF: Duration = Duration::from_millis(200);
const CAT_NODE_COLUMNS: &str = "name,node.role,ip";

#[derive(Debug)]
pub struct HttpError {
    pub status: StatusCode,
    pub message: String,
}

impl HttpError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        HttpError {
            status,
            message: message.into(),
        }
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (status {})", self.message, self.status)
    }
}

impl Error for HttpError {}

fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_reqwest(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// HTTP client for the search service's admin endpoints.
pub struct SearchAdminClient {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl SearchAdminClient {
    pub fn new(
        endpoint: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, DynError> {
        let base_url = Url::parse(endpoint)
            .map_err(|err| with_context(err, format!("invalid admin endpoint '{endpoint}'")))?;
        if base_url.cannot_be_a_base() {
            return Err(new_error(format!(
                "admin endpoint '{endpoint}' cannot carry a path"
            )));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| with_context(err, "failed to construct admin HTTP client"))?;
        let token = token
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        Ok(SearchAdminClient {
            client,
            base_url,
            token,
        })
    }

    /// Builds a client from `SEARCHOP_ADMIN_*` settings.
    pub fn from_env() -> Result<Self, DynError> {
        let timeout = Config::AdminRequestTimeout.duration()?;
        let token = Some(Config::AdminToken.get());
        Self::new(&Config::AdminEndpoint.get(), token, timeout)
    }

    pub fn url_from_segments(&self, segments: &[&str]) -> Result<Url, DynError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| new_error("admin endpoint cannot carry a path"))?;
            path.pop_if_empty();
            path.extend(segments);
        }
        Ok(url)
    }

    fn apply_auth(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    pub async fn health(&self) -> Result<ClusterHealth, DynError> {
        let url = self.url_from_segments(&["_cluster", "health"])?;
        self.get_json(url).await
    }

    pub async fn nodes(&self) -> Result<Vec<CatNode>, DynError> {
        let mut url = self.url_from_segments(&["_cat", "nodes"])?;
        url.query_pairs_mut()
            .append_pair("format", "json")
            .append_pair("h", CAT_NODE_COLUMNS);
        self.get_json(url).await
    }

    async fn get_json<T>(&self, url: Url) -> Result<T, DynError>
    where
        T: DeserializeOwned,
    {
        let mut last_err: Option<DynError> = None;
        for attempt in 0..RETRY_ATTEMPTS {
            let final_attempt = attempt + 1 == RETRY_ATTEMPTS;
            match self.apply_auth(self.client.get(url.clone())).send().await {
                Ok(response) => match handle_json::<T>(response).await {
                    Ok(body) => return Ok(body),
                    Err(err) => match err.downcast::<HttpError>() {
                        Ok(http_err) if should_retry_status(http_err.status) && !final_attempt => {
                            last_err = Some(http_err);
                        }
                        Ok(http_err) => return Err(http_err),
                        Err(other) => return Err(with_context(other, format!("GET {}", url.path()))),
                    },
                },
                Err(err) if is_retryable_reqwest(&err) && !final_attempt => {
                    last_err = Some(Box::new(err));
                }
                Err(err) => return Err(with_context(err, format!("GET {}", url.path()))),
            }

            let attempt_str = (attempt + 1).to_string();
            log_debug(
                "admin-client",
                "retrying admin request",
                &[("path", url.path()), ("attempt", attempt_str.as_str())],
            );
            sleep(RETRY_BACKOFF).await;
        }

        Err(last_err.unwrap_or_else(|| {
            Box::new(HttpError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "admin request failed",
            ))
        }))
    }
}

async fn handle_json<T>(response: reqwest::Response) -> Result<T, DynError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if status.is_success() {
        let body = response.json::<T>().await?;
        return Ok(body);
    }

    let text = response.text().await.unwrap_or_default();
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(&text) {
        return Err(Box::new(HttpError::new(status, parsed.error.message())));
    }

    let message = if text.trim().is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        text
    };
    Err(Box::new(HttpError::new(status, message)))
}

impl ClusterAdminApi for SearchAdminClient {
    fn is_node_in_cluster<'a>(&'a self, name: &'a str) -> AdminFuture<'a, bool> {
        Box::pin(async move {
            let nodes = self.nodes().await?;
            Ok(nodes.iter().any(|node| node.name == name))
        })
    }

    fn cluster_node_count(&self) -> AdminFuture<'_, u32> {
        Box::pin(async move { Ok(self.health().await?.number_of_nodes) })
    }

    fn cluster_health(&self) -> AdminFuture<'_, ClusterHealth> {
        Box::pin(async move { self.health().await })
    }
}
