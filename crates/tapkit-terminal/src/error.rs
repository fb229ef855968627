use tapkit_driver::DriverError;
use thiserror::Error;

/// Result alias for terminal operations.
pub type Result<T> = std::result::Result<T, TerminalError>;

/// Errors surfaced by the terminal control surface.
#[derive(Debug, Error)]
pub enum TerminalError {
    // Driver-reported failures, passed through with the reason verbatim.
    #[error(transparent)]
    Driver(#[from] DriverError),

    // Caller misuse. Returned synchronously, never retried.
    #[error("You must provide {what}.")]
    MissingParameter { what: &'static str },

    #[error("Terminal is not initialized.")]
    NotInitialized,

    // Infrastructure failures.
    #[error("command queue is closed")]
    QueueClosed,

    #[error("driver event stream was already taken")]
    EventStreamUnavailable,
}

impl TerminalError {
    /// Shorthand for a [`TerminalError::MissingParameter`].
    pub fn missing(what: &'static str) -> Self {
        TerminalError::MissingParameter { what }
    }

    /// Returns `true` when the underlying driver reported a user abort.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self, TerminalError::Driver(e) if e.is_canceled())
    }
}
