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

//! Bounded polling.
//!
//! Every wait in the rollout protocol goes through [`poll_until`]: probe, sleep
//! for the interval, and give up once the timeout window has elapsed. A probe
//! that errors is treated as "not yet satisfied" so transient admin API
//! failures never end a wait early.

use crate::searchop::logger::log_debug;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// A wait that did not resolve inside its window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollTimeout {
    pub condition: String,
    pub attempts: u32,
    pub timeout: Duration,
    pub last_error: Option<String>,
}

impl fmt::Display for PollTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "timed out after {} waiting for {} ({} attempts",
            humantime::format_duration(self.timeout),
            self.condition,
            self.attempts
        )?;
        if let Some(error) = &self.last_error {
            write!(f, ", last error: {error}")?;
        }
        f.write_str(")")
    }
}

impl Error for PollTimeout {}

/// Polls `probe` until it yields `Ok(true)` or `timeout` elapses.
///
/// The probe always runs at least once. Returns the number of attempts it took
/// to observe the condition.
pub async fn poll_until<F, Fut, E>(
    condition: &str,
    interval: Duration,
    timeout: Duration,
    mut probe: F,
) -> Result<u32, PollTimeout>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
    E: fmt::Display,
{
    let started = Instant::now();
    let mut attempts: u32 = 0;
    let mut last_error = None;

    loop {
        attempts += 1;
        match probe().await {
            Ok(true) => return Ok(attempts),
            Ok(false) => {}
            Err(err) => {
                let error_text = err.to_string();
                let attempt_str = attempts.to_string();
                log_debug(
                    "poll",
                    "probe failed; treating as not yet satisfied",
                    &[
                        ("condition", condition),
                        ("attempt", attempt_str.as_str()),
                        ("error", error_text.as_str()),
                    ],
                );
                last_error = Some(error_text);
            }
        }

        let elapsed = started.elapsed();
        if elapsed >= timeout {
            return Err(PollTimeout {
                condition: condition.to_string(),
                attempts,
                timeout,
                last_error,
            });
        }
        sleep(interval.min(timeout - elapsed)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn resolves_on_the_attempt_that_observes_the_condition() {
        let calls = AtomicU32::new(0);
        let attempts = poll_until(
            "third probe",
            Duration::from_secs(1),
            Duration::from_secs(30),
            || {
                let seen = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok::<_, String>(seen >= 3) }
            },
        )
        .await
        .expect("condition observed");

        assert_eq!(attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_count_as_unsatisfied() {
        let calls = AtomicU32::new(0);
        let attempts = poll_until(
            "flaky probe",
            Duration::from_secs(1),
            Duration::from_secs(10),
            || {
                let seen = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if seen < 3 {
                        Err("connection reset".to_string())
                    } else {
                        Ok(true)
                    }
                }
            },
        )
        .await
        .expect("errors tolerated");

        assert_eq!(attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_once_the_window_elapses() {
        let started = Instant::now();
        let err = poll_until(
            "never",
            Duration::from_secs(1),
            Duration::from_secs(5),
            || async { Err::<bool, _>("503 Service Unavailable") },
        )
        .await
        .expect_err("window elapses");

        assert_eq!(err.condition, "never");
        assert_eq!(err.attempts, 6);
        assert_eq!(err.last_error.as_deref(), Some("503 Service Unavailable"));
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(err.to_string().contains("timed out after 5s waiting for never"));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_still_probes_once() {
        let err = poll_until("once", Duration::from_secs(1), Duration::ZERO, || async {
            Ok::<_, String>(false)
        })
        .await
        .expect_err("no time to wait");
        assert_eq!(err.attempts, 1);
    }
}
