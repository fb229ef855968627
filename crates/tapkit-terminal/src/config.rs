use std::time::Duration;

use backoff::ExponentialBackoff;
use tapkit_core::constants::{
    DEFAULT_COMMAND_QUEUE_CAPACITY, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BASE_MS,
};

/// Retry policy for corrective reconciliation passes.
///
/// Delays double from `initial_backoff` with no jitter, so a policy of
/// 500ms and 5 retries sleeps 500ms, 1s, 2s, 4s and 8s before giving up
/// and surfacing the original error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_retries: u32,
}

impl RetryPolicy {
    pub(crate) fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_backoff,
            max_interval: Duration::from_secs(60),
            multiplier: 2.0,
            // Deterministic doubling; retries here recover from transient
            // device races, not from load on a shared service.
            randomization_factor: 0.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            initial_backoff: Duration::from_millis(DEFAULT_RETRY_BASE_MS),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Tunables for a [`Terminal`](crate::Terminal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalConfig {
    /// Bound on queued lifecycle commands.
    pub command_queue_capacity: usize,
    pub retry: RetryPolicy,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        TerminalConfig {
            command_queue_capacity: DEFAULT_COMMAND_QUEUE_CAPACITY,
            retry: RetryPolicy::default(),
        }
    }
}
