//! Driver abstraction for payment card readers.
//!
//! The [`ReaderDriver`] trait is the seam between the control surface in
//! `tapkit-terminal` and whatever SDK actually talks to the hardware.
//! Long-running commands (discovery, connection) resolve as soon as the
//! driver accepts them; their outcomes arrive later on the event stream.
//! Payment commands resolve with their results.
//!
//! [`SimulatedDriver`] is the in-process implementation used by tests and
//! the demo binary. It emits the same event sequences real hardware would,
//! driven by a [`SimulatedHandle`].

pub mod error;
pub mod events;
pub mod simulated;
pub mod traits;

pub use error::{DriverError, DriverResult};
pub use events::{DriverEvent, DriverSnapshot, RawReader};
pub use simulated::{RecordedCall, SimulatedDriver, SimulatedHandle};
pub use traits::ReaderDriver;
