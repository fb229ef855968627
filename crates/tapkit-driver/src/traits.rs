//! The driver contract between the control surface and reader SDKs.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::DriverResult;
use crate::events::{DriverEvent, DriverSnapshot};
use tapkit_core::{
    DiscoveryMethod, Payment, PaymentIntent, PaymentMethod, SimulatedCardType,
};

/// A payment card reader driver.
///
/// Implementations wrap a vendor SDK or, for tests and demos, the in-process
/// [`SimulatedDriver`](crate::SimulatedDriver). The trait uses `async_trait`
/// rather than native `async fn` because the control surface holds the driver
/// as `Arc<dyn ReaderDriver>` and RPITIT methods are not object-safe.
///
/// Two completion models coexist:
///
/// - `discover_readers` and `connect_reader` resolve as soon as the driver
///   **accepts** the command. Their outcomes (found readers, the established
///   connection, failures) arrive later on the event stream. Callers must
///   not treat a resolved future as a completed discovery or connection.
/// - The payment commands resolve with their actual results.
///
/// Abort methods resolve when the abort request is accepted; the aborted
/// command settles through its own path (a canceled-error result or a
/// completion event).
#[async_trait]
pub trait ReaderDriver: Send + Sync {
    /// Bring the driver up and report what it already observes.
    ///
    /// Idempotent at the call site: the control surface calls this at most
    /// once per process.
    async fn initialize(&self) -> DriverResult<DriverSnapshot>;

    /// Start a discovery session. Resolves on acceptance; results arrive as
    /// [`DriverEvent::ReadersDiscovered`].
    async fn discover_readers(&self, method: DiscoveryMethod, simulated: bool) -> DriverResult<()>;

    /// Abort the running discovery session, if any.
    async fn abort_discover_readers(&self) -> DriverResult<()>;

    /// Connect to a discovered reader. Resolves on acceptance; the outcome
    /// arrives as [`DriverEvent::ReaderConnected`] or
    /// [`DriverEvent::ReaderConnectFailed`].
    async fn connect_reader(
        &self,
        serial_number: &str,
        location_id: Option<&str>,
    ) -> DriverResult<()>;

    /// Disconnect the connected reader. Completion arrives as
    /// [`DriverEvent::ReaderDisconnected`].
    async fn disconnect_reader(&self) -> DriverResult<()>;

    /// Create a payment intent for the given amount in minor units.
    async fn create_payment_intent(
        &self,
        amount: u64,
        currency: &str,
    ) -> DriverResult<PaymentIntent>;

    /// Wait for the cardholder to present a payment method.
    ///
    /// Long-running: resolves when a method is collected, the command is
    /// aborted (canceled error) or the reader fails.
    async fn collect_payment_method(&self, intent: &PaymentIntent) -> DriverResult<PaymentMethod>;

    /// Abort a pending `collect_payment_method`.
    async fn abort_collect_payment_method(&self) -> DriverResult<()>;

    /// Capture the charge for an intent with a collected payment method.
    async fn process_payment(&self, intent: &PaymentIntent) -> DriverResult<Payment>;

    /// Abort an installing firmware update, where the hardware allows it.
    async fn abort_install_update(&self) -> DriverResult<()>;

    /// Choose the test card a simulated reader will present. Callable while
    /// a collect is pending.
    async fn set_simulated_card(&self, card: SimulatedCardType) -> DriverResult<()>;

    /// Answer a [`DriverEvent::ConnectionTokenRequested`] with a token or a
    /// failure reason.
    async fn set_connection_token(
        &self,
        token: Option<String>,
        error: Option<String>,
    ) -> DriverResult<()>;

    /// Hand over the driver's event stream. Yields `Some` exactly once;
    /// later calls return `None`.
    fn take_event_stream(&self) -> Option<mpsc::Receiver<DriverEvent>>;
}
