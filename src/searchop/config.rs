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

use crate::searchop::k8s::store::DEFAULT_CONFLICT_RETRIES;
use crate::searchop::logger::{set_log_format, LogFormat};
use crate::searchop::observability::tracing;
use std::env;
use std::error::Error;
use std::fmt;
use std::time::Duration;

/// Enum for supported configuration parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Config {
    RejoinTimeout,
    LeaveTimeout,
    RolloutTimeout,
    PollInterval,
    ConflictRetries,
    AdminEndpoint,
    AdminToken,
    AdminRequestTimeout,
    LogFormat,
}

impl Config {
    /// Returns the associated environment variable for the config parameter.
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::RejoinTimeout => "SEARCHOP_REJOIN_TIMEOUT",
            Config::LeaveTimeout => "SEARCHOP_LEAVE_TIMEOUT",
            Config::RolloutTimeout => "SEARCHOP_ROLLOUT_TIMEOUT",
            Config::PollInterval => "SEARCHOP_POLL_INTERVAL",
            Config::ConflictRetries => "SEARCHOP_CONFLICT_RETRIES",
            Config::AdminEndpoint => "SEARCHOP_ADMIN_ENDPOINT",
            Config::AdminToken => "SEARCHOP_ADMIN_TOKEN",
            Config::AdminRequestTimeout => "SEARCHOP_ADMIN_REQUEST_TIMEOUT",
            Config::LogFormat => "SEARCHOP_LOG_FORMAT",
        }
    }

    pub fn default_value(&self) -> &'static str {
        match self {
            Config::RejoinTimeout => "60s",
            Config::LeaveTimeout => "60s",
            Config::RolloutTimeout => "30s",
            Config::PollInterval => "1s",
            Config::ConflictRetries => "5",
            Config::AdminEndpoint => "https://127.0.0.1:9200",
            Config::AdminToken => "",
            Config::AdminRequestTimeout => "10s",
            Config::LogFormat => "text",
        }
    }

    /// Returns the effective value, either from environment or default.
    pub fn get(&self) -> String {
        env::var(self.env_var())
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| self.default_value().to_string())
    }

    pub fn duration(&self) -> Result<Duration, ConfigError> {
        let raw = self.get();
        humantime::parse_duration(&raw).map_err(|err| ConfigError::invalid(*self, &raw, err))
    }

    pub fn count(&self) -> Result<u32, ConfigError> {
        let raw = self.get();
        raw.parse::<u32>()
            .map_err(|err| ConfigError::invalid(*self, &raw, err))
    }

    pub fn log_format(&self) -> Result<LogFormat, ConfigError> {
        let raw = self.get();
        raw.parse::<LogFormat>()
            .map_err(|err| ConfigError::invalid(*self, &raw, err))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub env_var: &'static str,
    pub value: String,
    pub reason: String,
}

impl ConfigError {
    fn invalid(config: Config, value: &str, reason: impl fmt::Display) -> Self {
        Self {
            env_var: config.env_var(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid value '{}' for {}: {}",
            self.value, self.env_var, self.reason
        )
    }
}

impl Error for ConfigError {}

/// Applies the logging configuration and loads the rollout settings. Call
/// once at startup, before any rollout runs.
pub fn init() -> Result<RolloutSettings, ConfigError> {
    set_log_format(Config::LogFormat.log_format()?);
    tracing::init();
    RolloutSettings::from_env()
}

/// Timing and retry knobs for a node rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolloutSettings {
    /// Window for the full cluster to be observed again before and after a step.
    pub rejoin_timeout: Duration,
    /// Window for a released replica to be observed leaving.
    pub leave_timeout: Duration,
    /// Window for independent pods to pick up the new template.
    pub rollout_timeout: Duration,
    pub poll_interval: Duration,
    pub conflict_retries: u32,
}

impl Default for RolloutSettings {
    fn default() -> Self {
        Self {
            rejoin_timeout: Duration::from_secs(60),
            leave_timeout: Duration::from_secs(60),
            rollout_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
        }
    }
}

impl RolloutSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let settings = Self {
            rejoin_timeout: Config::RejoinTimeout.duration()?,
            leave_timeout: Config::LeaveTimeout.duration()?,
            rollout_timeout: Config::RolloutTimeout.duration()?,
            poll_interval: Config::PollInterval.duration()?,
            conflict_retries: Config::ConflictRetries.count()?,
        };
        if settings.poll_interval.is_zero() {
            return Err(ConfigError::invalid(
                Config::PollInterval,
                "0s",
                "poll interval must be positive",
            ));
        }
        if settings.conflict_retries == 0 {
            return Err(ConfigError::invalid(
                Config::ConflictRetries,
                "0",
                "at least one attempt is required",
            ));
        }
        Ok(settings)
    }
}
