//! The terminal facade.
//!
//! [`Terminal`] wires the store, queue, ingestion, cancellation slot and
//! reconciler around one driver and exposes the whole assembly as a single
//! owned object. One terminal per physical reader; hosts that previously
//! reached for a process-wide singleton hold an `Arc<Terminal>` instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::cancel::CancellationTracker;
use crate::commands::DeviceCommands;
use crate::config::TerminalConfig;
use crate::error::{Result, TerminalError};
use crate::ingest::{translate_reader, EventIngestion};
use crate::queue::CommandQueue;
use crate::reconciler::Reconciler;
use crate::store::{StateStore, SubscriptionId};
use crate::tokens::ConnectionTokenProvider;
use tapkit_core::{
    ConnectionState, DesiredState, DiscoveryMethod, Payment, PaymentIntent, PaymentMethod,
    PaymentState, SimulatedCardType,
};
use tapkit_driver::ReaderDriver;

/// A card reader terminal: observed state, command lifecycles and
/// desired-state reconciliation over one driver.
///
/// Construct it, call [`initialize`](Terminal::initialize) once, then either
/// drive it declaratively through
/// [`set_desired_state`](Terminal::set_desired_state) or imperatively
/// through the individual commands. All state is observable through
/// [`connection`](Terminal::connection)/[`payment`](Terminal::payment),
/// synchronous subscriptions, or watch channels.
///
/// ```no_run
/// use tapkit_core::DesiredState;
/// use tapkit_driver::SimulatedDriver;
/// use tapkit_terminal::{StaticTokenProvider, Terminal};
///
/// # async fn demo() -> tapkit_terminal::Result<()> {
/// let (driver, _handle) = SimulatedDriver::new();
/// let terminal = Terminal::new(driver, StaticTokenProvider::new("tok_test"));
/// terminal.initialize().await?;
/// terminal
///     .set_desired_state(DesiredState::connected("SIM-1").with_location("loc_1"))
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct Terminal {
    store: Arc<StateStore>,
    driver: Arc<dyn ReaderDriver>,
    tokens: Arc<dyn ConnectionTokenProvider>,
    commands: Arc<DeviceCommands>,
    reconciler: Arc<Reconciler>,
    cancel: Arc<CancellationTracker>,
    initialized: AtomicBool,
    tasks: Mutex<JoinSet<()>>,
}

impl Terminal {
    /// Build a terminal over `driver` with the default configuration.
    pub fn new(
        driver: impl ReaderDriver + 'static,
        tokens: impl ConnectionTokenProvider + 'static,
    ) -> Self {
        Terminal::with_config(driver, tokens, TerminalConfig::default())
    }

    pub fn with_config(
        driver: impl ReaderDriver + 'static,
        tokens: impl ConnectionTokenProvider + 'static,
        config: TerminalConfig,
    ) -> Self {
        let driver: Arc<dyn ReaderDriver> = Arc::new(driver);
        let tokens: Arc<dyn ConnectionTokenProvider> = Arc::new(tokens);
        let store = Arc::new(StateStore::new());
        let cancel = Arc::new(CancellationTracker::new());

        let mut tasks = JoinSet::new();
        let queue = CommandQueue::start(config.command_queue_capacity, &mut tasks);
        let commands = Arc::new(DeviceCommands::new(
            Arc::clone(&store),
            Arc::clone(&driver),
            queue,
            Arc::clone(&cancel),
        ));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store),
            Arc::clone(&commands),
            config.retry,
        ));

        Terminal {
            store,
            driver,
            tokens,
            commands,
            reconciler,
            cancel,
            initialized: AtomicBool::new(false),
            tasks: Mutex::new(tasks),
        }
    }

    /// Start the terminal: spawn ingestion and the reconcile watcher, then
    /// initialize the driver and merge its reported state.
    ///
    /// Idempotent; a second call logs a warning and returns `Ok`. Every
    /// other operation fails with [`TerminalError::NotInitialized`] until
    /// this has succeeded.
    pub async fn initialize(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            warn!("Terminal::initialize has already been called, skipping");
            return Ok(());
        }
        match self.start_tasks_and_driver().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.initialized.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    async fn start_tasks_and_driver(&self) -> Result<()> {
        let events = self
            .driver
            .take_event_stream()
            .ok_or(TerminalError::EventStreamUnavailable)?;

        // Ingestion comes up before the driver call so nothing the driver
        // emits while initializing (token requests in particular) is lost.
        {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            let ingestion = EventIngestion::new(
                Arc::clone(&self.store),
                Arc::clone(&self.driver),
                Arc::clone(&self.tokens),
                Arc::clone(&self.cancel),
            );
            tasks.spawn(ingestion.run(events));
            self.reconciler.spawn_watcher(&mut tasks);
        }

        let snapshot = self.driver.initialize().await?;
        debug!(status = %snapshot.status, "driver initialized");
        let reader = snapshot.reader.map(translate_reader);
        self.store.update_connection(move |c| {
            c.status = snapshot.status;
            c.reader = reader;
        });
        Ok(())
    }

    /// Current connection state snapshot.
    #[must_use]
    pub fn connection(&self) -> ConnectionState {
        self.store.connection()
    }

    /// Current payment state snapshot.
    #[must_use]
    pub fn payment(&self) -> PaymentState {
        self.store.payment()
    }

    /// Watch channel tracking [`connection`](Terminal::connection).
    #[must_use]
    pub fn watch_connection(&self) -> tokio::sync::watch::Receiver<ConnectionState> {
        self.store.watch_connection()
    }

    /// Watch channel tracking [`payment`](Terminal::payment).
    #[must_use]
    pub fn watch_payment(&self) -> tokio::sync::watch::Receiver<PaymentState> {
        self.store.watch_payment()
    }

    /// Subscribe to connection changes; delivered synchronously per
    /// mutation.
    pub fn on_connection_change(
        &self,
        listener: impl Fn(&ConnectionState) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.store.on_connection_change(listener)
    }

    pub fn off_connection_change(&self, id: SubscriptionId) -> bool {
        self.store.off_connection_change(id)
    }

    /// Subscribe to payment changes; delivered synchronously per mutation.
    pub fn on_payment_change(
        &self,
        listener: impl Fn(&PaymentState) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.store.on_payment_change(listener)
    }

    pub fn off_payment_change(&self, id: SubscriptionId) -> bool {
        self.store.off_payment_change(id)
    }

    /// The desired state currently being reconciled toward.
    #[must_use]
    pub fn desired_state(&self) -> DesiredState {
        self.reconciler.desired()
    }

    /// Declare the target connection state and reconcile toward it.
    ///
    /// Returns once the target is reached or the remaining transitions are
    /// event-driven; corrective failures are retried on the configured
    /// backoff schedule before the original error surfaces.
    pub async fn set_desired_state(&self, desired: DesiredState) -> Result<()> {
        self.ensure_initialized()?;
        self.reconciler.set_desired(desired).await
    }

    /// Start a discovery session.
    pub async fn discover_readers(&self, method: DiscoveryMethod, simulated: bool) -> Result<()> {
        self.ensure_initialized()?;
        self.commands.discover(method, simulated).await
    }

    /// Abort the running discovery session.
    pub async fn abort_discover_readers(&self) -> Result<()> {
        self.ensure_initialized()?;
        self.commands.abort_discovery().await
    }

    /// Connect to a discovered reader.
    pub async fn connect_reader(
        &self,
        serial_number: impl Into<String>,
        location_id: Option<String>,
    ) -> Result<()> {
        self.ensure_initialized()?;
        self.commands.connect(serial_number.into(), location_id).await
    }

    /// Disconnect the connected reader.
    pub async fn disconnect_reader(&self) -> Result<()> {
        self.ensure_initialized()?;
        self.commands.disconnect().await
    }

    /// Create a payment intent for `amount` in minor units.
    pub async fn create_payment_intent(
        &self,
        amount: u64,
        currency: Option<String>,
    ) -> Result<PaymentIntent> {
        self.ensure_initialized()?;
        self.commands.create_payment_intent(amount, currency).await
    }

    /// Collect a payment method against the stored intent.
    ///
    /// Resolves `Ok(None)` when the collection is aborted through
    /// [`abort_collect_payment_method`](Terminal::abort_collect_payment_method)
    /// or [`abort_current_operation`](Terminal::abort_current_operation).
    pub async fn collect_payment_method(&self) -> Result<Option<PaymentMethod>> {
        self.ensure_initialized()?;
        let intent = self.store.payment().payment_intent;
        self.commands.collect_payment_method(intent).await
    }

    /// Abort a pending payment-method collection.
    pub async fn abort_collect_payment_method(&self) -> Result<()> {
        self.ensure_initialized()?;
        self.commands.abort_collect().await
    }

    /// Capture the charge for the stored intent.
    pub async fn process_payment(&self) -> Result<Payment> {
        self.ensure_initialized()?;
        let intent = self.store.payment().payment_intent;
        self.commands.process_payment(intent).await
    }

    /// Abort an installing firmware update.
    pub async fn abort_install_update(&self) -> Result<()> {
        self.ensure_initialized()?;
        self.commands.abort_install_update().await
    }

    /// Choose the test card a simulated reader presents.
    pub async fn set_simulated_card(&self, card: SimulatedCardType) -> Result<()> {
        self.ensure_initialized()?;
        self.commands.set_simulated_card(card).await
    }

    /// Abort whichever cancelable operation is currently registered.
    /// Returns whether one was.
    pub async fn abort_current_operation(&self) -> Result<bool> {
        self.ensure_initialized()?;
        Ok(self.cancel.cancel_current().await)
    }

    /// Stop the background tasks. The terminal is inert afterwards;
    /// queued commands fail with [`TerminalError::QueueClosed`].
    pub async fn shutdown(&self) {
        let mut tasks = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        tasks.shutdown().await;
        debug!("terminal shut down");
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(TerminalError::NotInitialized)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::StaticTokenProvider;
    use tapkit_core::{ConnectionStatus, PaymentStatus};
    use tapkit_driver::{DriverSnapshot, RawReader, SimulatedDriver, SimulatedHandle};

    fn terminal() -> (Terminal, SimulatedHandle) {
        let (driver, handle) = SimulatedDriver::new();
        let terminal = Terminal::new(driver, StaticTokenProvider::new("tok_test"));
        (terminal, handle)
    }

    #[tokio::test]
    async fn operations_require_initialization() {
        let (terminal, handle) = terminal();

        let err = terminal
            .set_desired_state(DesiredState::not_connected())
            .await
            .unwrap_err();
        assert!(matches!(err, TerminalError::NotInitialized));
        assert_eq!(err.to_string(), "Terminal is not initialized.");

        let err = terminal.create_payment_intent(1000, None).await.unwrap_err();
        assert!(matches!(err, TerminalError::NotInitialized));
        assert!(handle.ops().is_empty());
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let (terminal, handle) = terminal();

        terminal.initialize().await.unwrap();
        terminal.initialize().await.unwrap();

        assert_eq!(handle.ops(), vec!["initialize"]);
        assert_eq!(
            terminal.connection().status,
            ConnectionStatus::NotConnected
        );
    }

    #[tokio::test]
    async fn initialize_merges_the_driver_snapshot() {
        let (terminal, handle) = terminal();
        handle.set_initial_snapshot(DriverSnapshot {
            status: ConnectionStatus::Connected,
            reader: Some(
                RawReader::new("R7")
                    .with_location("loc_1")
                    .with_device_type(2)
                    .with_battery(0.5, 1),
            ),
        });

        terminal.initialize().await.unwrap();

        let connection = terminal.connection();
        assert_eq!(connection.status, ConnectionStatus::Connected);
        let reader = connection.reader.unwrap();
        assert_eq!(reader.serial_number, "R7");
        assert_eq!(reader.device_type_name, "wisepad_3");
        assert!(reader.is_charging);
        // Payment readiness derives from the merged connection edge.
        assert_eq!(terminal.payment().status, PaymentStatus::Ready);
    }

    #[tokio::test]
    async fn initialize_fails_without_an_event_stream() {
        let (driver, _handle) = SimulatedDriver::new();
        let _stolen = driver.take_event_stream();
        let terminal = Terminal::new(driver, StaticTokenProvider::new("tok_test"));

        let err = terminal.initialize().await.unwrap_err();
        assert!(matches!(err, TerminalError::EventStreamUnavailable));

        // The failed attempt leaves the terminal uninitialized.
        let err = terminal.disconnect_reader().await.unwrap_err();
        assert!(matches!(err, TerminalError::NotInitialized));
    }

    #[tokio::test]
    async fn payment_flow_reads_the_stored_intent() {
        let (terminal, handle) = terminal();
        terminal.initialize().await.unwrap();

        let err = terminal.collect_payment_method().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "You must provide a paymentIntent to collectPaymentMethod."
        );

        terminal.create_payment_intent(1200, None).await.unwrap();
        handle.present_card();
        let method = terminal.collect_payment_method().await.unwrap().unwrap();
        assert_eq!(method.brand.as_deref(), Some("visa"));

        let payment = terminal.process_payment().await.unwrap();
        assert_eq!(payment.amount, 1200);
        assert_eq!(terminal.payment().status, PaymentStatus::Ready);
    }

    #[tokio::test]
    async fn abort_current_operation_reports_whether_one_ran() {
        let (terminal, handle) = terminal();
        terminal.initialize().await.unwrap();

        assert!(!terminal.abort_current_operation().await.unwrap());

        terminal
            .discover_readers(DiscoveryMethod::BluetoothScan, true)
            .await
            .unwrap();
        assert!(terminal.abort_current_operation().await.unwrap());
        assert!(handle.ops().contains(&"abort_discover_readers"));
        assert_eq!(
            terminal.connection().status,
            ConnectionStatus::NotConnected
        );

        // The slot is one-shot until the next cancelable operation.
        assert!(!terminal.abort_current_operation().await.unwrap());
    }

    #[tokio::test]
    async fn shutdown_closes_the_queue() {
        let (terminal, _handle) = terminal();
        terminal.initialize().await.unwrap();

        terminal.shutdown().await;

        let err = terminal.disconnect_reader().await.unwrap_err();
        assert!(matches!(err, TerminalError::QueueClosed));
    }
}
