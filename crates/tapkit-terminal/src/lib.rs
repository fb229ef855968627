//! State reconciliation core for payment card readers.
//!
//! This crate turns the unordered, partially-failing event stream of a card
//! reader driver into a single coherent observed state, and drives that
//! state toward a caller-declared target. Hosts interact with one type,
//! [`Terminal`], which assembles:
//!
//! - the **state store** ([`store`]) — the only place observed
//!   [`ConnectionState`](tapkit_core::ConnectionState) and
//!   [`PaymentState`](tapkit_core::PaymentState) mutate, with synchronous
//!   change notification and derived payment readiness;
//! - **event ingestion** — one task translating each driver event into one
//!   store mutation;
//! - the **command queue** ([`queue`]) — strict FIFO, one driver command in
//!   flight at a time, because the underlying SDKs refuse concurrent
//!   commands;
//! - the **cancellation tracker** ([`cancel`]) — a single-slot register of
//!   the abort procedure for the current cancelable operation;
//! - the **reconciler** — compares observed state against the declared
//!   [`DesiredState`](tapkit_core::DesiredState), issues one corrective
//!   command at a time, retries failures on a bounded backoff schedule and
//!   parks when a transition has to wait for driver events.
//!
//! # Example
//!
//! ```no_run
//! use tapkit_core::DesiredState;
//! use tapkit_driver::{DriverEvent, RawReader, SimulatedDriver};
//! use tapkit_terminal::{StaticTokenProvider, Terminal};
//!
//! #[tokio::main]
//! async fn main() -> tapkit_terminal::Result<()> {
//!     let (driver, handle) = SimulatedDriver::new();
//!     let terminal = Terminal::new(driver, StaticTokenProvider::new("tok_test"));
//!     terminal.initialize().await?;
//!
//!     // Declare where the connection should end up; the reconciler
//!     // starts discovery, waits for the reader and connects.
//!     let mut connection = terminal.watch_connection();
//!     terminal
//!         .set_desired_state(DesiredState::connected("SIM-1").with_location("loc_1"))
//!         .await?;
//!
//!     // The simulated hardware answers the discovery session.
//!     let reader = RawReader::new("SIM-1").with_location("loc_1");
//!     handle
//!         .emit(DriverEvent::ReadersDiscovered(vec![reader.clone()]))
//!         .await?;
//!     handle.emit(DriverEvent::ReaderConnected(reader)).await?;
//!     while !connection.borrow_and_update().status.is_connected() {
//!         connection.changed().await.expect("terminal dropped");
//!     }
//!
//!     // Payment flow against the connected reader.
//!     terminal.create_payment_intent(1000, None).await?;
//!     handle.present_card();
//!     terminal.collect_payment_method().await?;
//!     terminal.process_payment().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Driving connections: declarative or imperative
//!
//! [`Terminal::set_desired_state`] and the direct connection commands
//! ([`discover_readers`](Terminal::discover_readers),
//! [`connect_reader`](Terminal::connect_reader), ...) act on the same
//! underlying lifecycle. Once a desired state diverging from the observed
//! one is declared, the reconciler treats manual transitions as divergence
//! and corrects them; hosts should pick one of the two styles for the
//! connection lifecycle. Payment operations are always imperative.

pub mod cancel;
pub mod config;
pub mod error;
pub mod queue;
pub mod store;
pub mod terminal;
pub mod tokens;

mod commands;
mod ingest;
mod reconciler;

pub use config::{RetryPolicy, TerminalConfig};
pub use error::{Result, TerminalError};
pub use store::{StateStore, SubscriptionId};
pub use terminal::Terminal;
pub use tokens::{ConnectionTokenProvider, StaticTokenProvider, TokenError};
