use tapkit_core::constants::{is_busy_reason, is_canceled_reason, ERR_COMMAND_CANCELED};
use thiserror::Error;

/// Result alias for driver operations.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Failure reported by a reader driver.
///
/// Drivers surface plain reason strings; classification happens by matching
/// well-known fragments, the same way the underlying SDKs report failures.
/// The raw message is preserved verbatim so it can be recorded into state
/// and re-surfaced to callers unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DriverError {
    pub message: String,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        DriverError {
            message: message.into(),
        }
    }

    /// The driver refused a command because another one is in flight.
    #[must_use]
    pub fn busy(refused: &str, in_flight: &str) -> Self {
        DriverError {
            message: format!(
                "Could not execute {refused} because the SDK is busy with another command: {in_flight}."
            ),
        }
    }

    /// The command was aborted before it produced a result.
    #[must_use]
    pub fn canceled() -> Self {
        DriverError {
            message: ERR_COMMAND_CANCELED.to_string(),
        }
    }

    /// Returns `true` for busy-refusal errors.
    #[inline]
    #[must_use]
    pub fn is_busy(&self) -> bool {
        is_busy_reason(&self.message)
    }

    /// Returns `true` for abort-induced errors.
    #[inline]
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        is_canceled_reason(&self.message)
    }
}
