//! Retry policies for the serial link.
//!
//! Used for the bounded empty-read wait in the transport and for re-opening
//! the port when a run starts or resumes.

use crate::config::SerialConfig;
use crate::error::DaqError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// The maximum number of retry attempts.
    pub max_attempts: u32,
    /// The delay between retry attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 50,
            backoff_delay: Duration::from_millis(80),
        }
    }
}

impl RetryPolicy {
    /// Empty-read policy of a serial link: one retry per inter-operation delay.
    pub fn for_serial(serial: &SerialConfig) -> Self {
        Self {
            max_attempts: serial.max_empty_reads,
            backoff_delay: serial.delay(),
        }
    }
}

/// An asynchronous operation that can be retried.
#[async_trait]
pub trait Recoverable<E> {
    /// One recovery attempt.
    async fn recover(&mut self) -> Result<(), E>;
}

/// Handles a recoverable error by retrying the operation according to a policy.
pub async fn handle_recoverable_error<T: Recoverable<DaqError> + Send>(
    recoverable: &mut T,
    policy: &RetryPolicy,
) -> Result<(), DaqError> {
    let mut last_error = None;
    for attempt in 1..=policy.max_attempts {
        match recoverable.recover().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                log::warn!("Recovery attempt {}/{} failed: {}", attempt, policy.max_attempts, e);
                last_error = Some(e);
            }
        }
        if attempt < policy.max_attempts {
            sleep(policy.backoff_delay).await;
        }
    }
    Err(DaqError::Instrument(format!(
        "Failed to recover after {} attempts{}",
        policy.max_attempts,
        last_error.map(|e| format!(": {}", e)).unwrap_or_default()
    )))
}
