//! Well-known strings and defaults shared across the workspace.
//!
//! The driver layer reports failures as plain strings, and two of those
//! strings carry protocol-level meaning: the busy error (a conflicting
//! command is already in flight) and the canceled error (an operation was
//! deliberately aborted). Both are matched verbatim by the reconciliation
//! core, so they are centralized here rather than scattered across crates.

// ============================================================================
// Well-known driver error strings
// ============================================================================

/// Error reason reported when a long-running command is deliberately aborted.
///
/// Payment-method collection treats this reason as a non-error: the operation
/// resolves without a collected method instead of failing.
pub const ERR_COMMAND_CANCELED: &str = "The command was canceled.";

/// Substring present in every busy-style driver error.
///
/// Busy errors mean a conflicting command is already in flight; they are
/// recovered from locally (abort the conflicting command, then re-issue)
/// rather than surfaced to callers.
pub const ERR_SDK_BUSY_FRAGMENT: &str = "is busy with another command";

/// The exact busy error produced when discovery is requested while a previous
/// discovery session is still active.
pub const ERR_DISCOVERY_BUSY: &str =
    "Could not execute discoverReaders because the SDK is busy with another command: discoverReaders.";

/// Failure reason handed back to the driver when the host's connection-token
/// fetch fails or returns an empty token.
pub const ERR_TOKEN_FETCH: &str = "Error in fetchConnectionToken.";

/// Returns `true` if a driver failure reason is a busy error.
#[must_use]
pub fn is_busy_reason(reason: &str) -> bool {
    reason.contains(ERR_SDK_BUSY_FRAGMENT)
}

/// Returns `true` if a driver failure reason is the user-cancellation error.
#[must_use]
pub fn is_canceled_reason(reason: &str) -> bool {
    reason == ERR_COMMAND_CANCELED
}

// ============================================================================
// Payment defaults
// ============================================================================

/// Currency assumed when a payment intent is created without one.
pub const DEFAULT_CURRENCY: &str = "usd";

// ============================================================================
// Reconciliation defaults
// ============================================================================

/// Base delay for the reconciler's exponential backoff (milliseconds).
///
/// Delays double on each retry: 500, 1000, 2000, ...
pub const DEFAULT_RETRY_BASE_MS: u64 = 500;

/// Number of retries after the initial reconciliation attempt fails.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default capacity of the serialized command queue.
pub const DEFAULT_COMMAND_QUEUE_CAPACITY: usize = 32;

/// Default capacity of a driver's event channel.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// Diagnostic log parsing
// ============================================================================

/// Keys dropped from parsed diagnostic log lines.
///
/// These vary on every line (timestamps, correlation ids) and carry no state.
pub const LOG_VOLATILE_KEYS: &[&str] = &["t", "time", "timestamp", "request_id", "trace_id", "seq"];

/// Diagnostic key whose value doubles as the card-insertion signal.
///
/// Some device classes never emit a dedicated card event; for those, this
/// key in the diagnostic stream is the only way to learn that a card was
/// inserted or removed.
pub const LOG_KEY_CARD_STATUS: &str = "card_status";

/// Value of [`LOG_KEY_CARD_STATUS`] reporting an inserted card.
pub const LOG_CARD_INSERTED: &str = "inserted";

/// Value of [`LOG_KEY_CARD_STATUS`] reporting a removed card.
pub const LOG_CARD_REMOVED: &str = "removed";

// ============================================================================
// Battery reporting codes
// ============================================================================

/// Charging-status code meaning the battery is charging.
///
/// Drivers report charging state as a numeric code: 0 unknown, 1 charging,
/// 2 discharging. Only code 1 translates to `is_charging = true`.
pub const BATTERY_STATUS_CHARGING: u32 = 1;
