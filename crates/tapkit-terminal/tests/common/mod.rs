//! Shared helpers for terminal integration tests.
//!
//! Tests drive a [`Terminal`] over a [`SimulatedDriver`] and play the
//! hardware side through the [`SimulatedHandle`]: answering discovery
//! sessions with reader batches, reporting connections, presenting cards.
//! The helpers here cover the recurring steps — building the pair, waiting
//! on observed state with a timeout, and asserting the next driver call.

use std::time::Duration;

use tokio::time::timeout;

use tapkit_core::{ConnectionState, ConnectionStatus, PaymentStatus};
use tapkit_driver::{DriverEvent, RawReader, RecordedCall, SimulatedDriver, SimulatedHandle};
use tapkit_terminal::{StaticTokenProvider, Terminal};

pub const WAIT: Duration = Duration::from_secs(5);

/// Build an initialized terminal over a simulated driver. The recorded
/// `initialize` call is consumed so tests start from a clean call stream.
pub async fn initialized_terminal() -> (Terminal, SimulatedHandle) {
    let (driver, mut handle) = SimulatedDriver::new();
    let terminal = Terminal::new(driver, StaticTokenProvider::new("tok_test"));
    terminal.initialize().await.expect("initialize");
    expect_call(&mut handle, "initialize").await;
    (terminal, handle)
}

/// A discoverable bluetooth reader as the driver would report it.
pub fn sim_reader(serial: &str, location: &str) -> RawReader {
    RawReader::new(serial)
        .with_location(location)
        .with_battery(0.9, 0)
}

/// Wait for the next driver call and assert its operation name.
pub async fn expect_call(handle: &mut SimulatedHandle, op: &str) -> RecordedCall {
    let call = timeout(WAIT, handle.next_call())
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for a `{op}` call"))
        .expect("driver gone");
    assert_eq!(call.op, op, "unexpected driver call");
    call
}

/// Wait until the observed connection state satisfies `pred`.
pub async fn wait_for_connection(
    terminal: &Terminal,
    pred: impl Fn(&ConnectionState) -> bool,
) -> ConnectionState {
    let mut watch = terminal.watch_connection();
    timeout(WAIT, async {
        loop {
            let current = watch.borrow_and_update().clone();
            if pred(&current) {
                return current;
            }
            watch.changed().await.expect("terminal dropped");
        }
    })
    .await
    .expect("timed out waiting for connection state")
}

/// Wait until the observed connection status equals `status`.
pub async fn wait_for_status(terminal: &Terminal, status: ConnectionStatus) -> ConnectionState {
    wait_for_connection(terminal, |c| c.status == status).await
}

/// Wait until the observed payment status equals `status`.
pub async fn wait_for_payment_status(terminal: &Terminal, status: PaymentStatus) {
    let mut watch = terminal.watch_payment();
    timeout(WAIT, async {
        loop {
            if watch.borrow_and_update().status == status {
                return;
            }
            watch.changed().await.expect("terminal dropped");
        }
    })
    .await
    .expect("timed out waiting for payment state");
}

/// Play the hardware side of a full discovery-and-connect session for one
/// reader, synchronized on the driver calls the terminal issues.
pub async fn complete_connection(
    terminal: &Terminal,
    handle: &mut SimulatedHandle,
    serial: &str,
    location: &str,
) {
    expect_call(handle, "discover_readers").await;
    handle
        .emit(DriverEvent::ReadersDiscovered(vec![sim_reader(
            serial, location,
        )]))
        .await
        .expect("emit");

    expect_call(handle, "connect_reader").await;
    handle
        .emit(DriverEvent::ReaderConnected(sim_reader(serial, location)))
        .await
        .expect("emit");

    wait_for_status(terminal, ConnectionStatus::Connected).await;
}
