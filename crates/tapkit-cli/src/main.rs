//! Demo session against the simulated reader driver.
//!
//! Plays a full discover → connect → charge flow: the terminal runs on one
//! side, and a scripted hardware task answers its driver calls with the
//! events a real reader would emit. State snapshots are printed as JSON at
//! the interesting points.
//!
//! # Usage
//!
//! ```bash
//! # Charge 19.99 USD on the default simulated reader
//! tapkit
//!
//! # Pick the reader, location and amount
//! tapkit --serial SIM-42 --location loc_back_office --amount 2500 --currency eur
//!
//! # Verbose reconciler logging
//! RUST_LOG=debug tapkit
//! ```

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tapkit_core::{DesiredState, DiscoveryMethod};
use tapkit_driver::{DriverEvent, RawReader, SimulatedDriver, SimulatedHandle};
use tapkit_terminal::{StaticTokenProvider, Terminal};

/// Simulated card-reader payment session.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Serial number of the simulated reader to connect
    #[arg(long, default_value = "SIM-001")]
    serial: String,

    /// Location the reader registers under
    #[arg(long, default_value = "loc_demo")]
    location: String,

    /// Charge amount in minor currency units
    #[arg(long, default_value = "1999")]
    amount: u64,

    /// Charge currency
    #[arg(long, default_value = "usd")]
    currency: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let (driver, handle) = SimulatedDriver::new();
    let terminal = Terminal::new(driver, StaticTokenProvider::new("tok_demo"));

    let script = tokio::spawn(hardware_script(
        handle,
        args.serial.clone(),
        args.location.clone(),
    ));

    terminal.initialize().await?;

    info!(serial = %args.serial, "connecting");
    terminal
        .set_desired_state(
            DesiredState::connected(args.serial.as_str())
                .with_location(args.location.as_str())
                .with_discovery(DiscoveryMethod::BluetoothScan, true),
        )
        .await?;

    let mut connection = terminal.watch_connection();
    while !connection.borrow_and_update().status.is_connected() {
        connection.changed().await?;
    }
    println!("{}", serde_json::to_string_pretty(&terminal.connection())?);

    info!(amount = args.amount, currency = %args.currency, "charging");
    let intent = terminal
        .create_payment_intent(args.amount, Some(args.currency.clone()))
        .await?;
    let method = terminal
        .collect_payment_method()
        .await?
        .context("payment method collection was aborted")?;
    let payment = terminal.process_payment().await?;
    info!(
        intent = %intent.id,
        brand = method.brand.as_deref().unwrap_or("unknown"),
        amount = payment.amount,
        "charge captured"
    );
    println!("{}", serde_json::to_string_pretty(&terminal.payment())?);

    terminal.shutdown().await;
    script.abort();
    Ok(())
}

/// Answer driver calls the way the hardware would until the driver goes away.
async fn hardware_script(mut handle: SimulatedHandle, serial: String, location: String) {
    let reader = RawReader::new(serial.as_str())
        .with_location(location.as_str())
        .with_battery(0.82, 0);

    while let Some(call) = handle.next_call().await {
        let answered = match call.op {
            "discover_readers" => {
                handle
                    .emit(DriverEvent::ReadersDiscovered(vec![reader.clone()]))
                    .await
            }
            "connect_reader" => handle.emit(DriverEvent::ReaderConnected(reader.clone())).await,
            "disconnect_reader" => handle.emit(DriverEvent::ReaderDisconnected).await,
            "collect_payment_method" => {
                handle.present_card();
                Ok(())
            }
            _ => Ok(()),
        };
        if answered.is_err() {
            break;
        }
    }
}
