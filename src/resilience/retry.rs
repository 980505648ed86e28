// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Exponential backoff for connection establishment.
//!
//! Store and bus *operations* are never retried: a failed save is reported
//! and the caller sees `false`. Retries are reserved for getting a connection
//! in the first place, and for re-subscribing when a pub/sub stream drops.
//!
//! ```
//! use payload_mesh::RetryConfig;
//!
//! // Startup: fail fast on bad config
//! assert_eq!(RetryConfig::startup().max_retries, Some(5));
//!
//! // Re-subscribe: never give up while the node is running
//! assert_eq!(RetryConfig::reconnect().max_retries, None);
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// `None` retries forever
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::startup()
    }
}

impl RetryConfig {
    /// Five attempts over roughly five seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Unbounded, capped at 30 seconds between attempts.
    #[must_use]
    pub fn reconnect() -> Self {
        Self {
            max_retries: None,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
        }
    }

    #[cfg(test)]
    pub fn fast() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            factor: 2.0,
        }
    }

    fn next_delay(&self, current: Duration) -> Duration {
        current.mul_f64(self.factor).min(self.max_delay)
    }
}

pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0usize;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!(operation = operation_name, attempts, "succeeded after retries");
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;
                match config.max_retries {
                    Some(max) if attempts >= max => return Err(err),
                    Some(max) => warn!(
                        operation = operation_name,
                        "attempt {}/{} failed: {}. Retrying in {:?}", attempts, max, err, delay
                    ),
                    None => warn!(
                        operation = operation_name,
                        "attempt {} failed: {}. Retrying in {:?}", attempts, err, delay
                    ),
                }
                sleep(delay).await;
                delay = config.next_delay(delay);
            }
        }
    }
}
