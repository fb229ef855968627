//! Core data model for the tapkit card-reader control surface.
//!
//! This crate defines the state records observed by host applications
//! ([`ConnectionState`], [`PaymentState`]), the declarative [`DesiredState`]
//! consumed by the reconciler, the payment value types produced by a driver,
//! and the well-known driver strings shared across the workspace.
//!
//! Everything here is pure data: no I/O, no async, no channels. The driver
//! boundary lives in `tapkit-driver` and the reconciliation core in
//! `tapkit-terminal`.

pub mod constants;
pub mod types;

pub use types::*;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
