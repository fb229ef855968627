//! Simulated reader driver for testing and development.
//!
//! The driver records every call, consumes failures scripted per operation,
//! and leaves event emission entirely to its [`SimulatedHandle`]. Tests and
//! the demo binary play the hardware side: observe calls as they happen,
//! then emit the events a real reader would.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;
use uuid::Uuid;

use crate::error::{DriverError, DriverResult};
use crate::events::{DriverEvent, DriverSnapshot};
use crate::traits::ReaderDriver;
use tapkit_core::constants::DEFAULT_EVENT_CHANNEL_CAPACITY;
use tapkit_core::{DiscoveryMethod, Payment, PaymentIntent, PaymentMethod, SimulatedCardType};

/// One recorded driver call: the operation name plus its rendered arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub op: &'static str,
    pub args: String,
}

struct Inner {
    calls: Vec<RecordedCall>,
    fail_next: HashMap<&'static str, VecDeque<DriverError>>,
    simulated_card: SimulatedCardType,
    initial_snapshot: DriverSnapshot,
    pending_collect: Option<oneshot::Sender<DriverResult<PaymentMethod>>>,
    collect_outcomes: VecDeque<DriverResult<PaymentMethod>>,
}

impl Inner {
    /// Record a call and pop a scripted failure for it, if one is queued.
    fn record(
        &mut self,
        call_tx: &mpsc::UnboundedSender<RecordedCall>,
        op: &'static str,
        args: String,
    ) -> DriverResult<()> {
        trace!(op, args = %args, "simulated driver call");
        let call = RecordedCall { op, args };
        self.calls.push(call.clone());
        // Nobody watching the live feed is fine.
        let _ = call_tx.send(call);

        match self.fail_next.get_mut(op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// In-process reader driver with scriptable behavior.
///
/// # Examples
///
/// ```
/// use tapkit_core::DiscoveryMethod;
/// use tapkit_driver::{ReaderDriver, SimulatedDriver};
///
/// #[tokio::main]
/// async fn main() -> Result<(), tapkit_driver::DriverError> {
///     let (driver, mut handle) = SimulatedDriver::new();
///
///     driver.discover_readers(DiscoveryMethod::BluetoothScan, true).await?;
///
///     let call = handle.next_call().await.unwrap();
///     assert_eq!(call.op, "discover_readers");
///     Ok(())
/// }
/// ```
pub struct SimulatedDriver {
    inner: Arc<Mutex<Inner>>,
    call_tx: mpsc::UnboundedSender<RecordedCall>,
    event_rx: Mutex<Option<mpsc::Receiver<DriverEvent>>>,
}

impl SimulatedDriver {
    /// Create a driver plus the handle that plays the hardware side.
    pub fn new() -> (Self, SimulatedHandle) {
        let (event_tx, event_rx) = mpsc::channel(DEFAULT_EVENT_CHANNEL_CAPACITY);
        let (call_tx, call_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Mutex::new(Inner {
            calls: Vec::new(),
            fail_next: HashMap::new(),
            simulated_card: SimulatedCardType::Visa,
            initial_snapshot: DriverSnapshot::disconnected(),
            pending_collect: None,
            collect_outcomes: VecDeque::new(),
        }));

        let driver = SimulatedDriver {
            inner: Arc::clone(&inner),
            call_tx,
            event_rx: Mutex::new(Some(event_rx)),
        };

        let handle = SimulatedHandle {
            inner,
            event_tx,
            call_rx,
        };

        (driver, handle)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, op: &'static str, args: String) -> DriverResult<()> {
        self.lock().record(&self.call_tx, op, args)
    }
}

#[async_trait]
impl ReaderDriver for SimulatedDriver {
    async fn initialize(&self) -> DriverResult<DriverSnapshot> {
        let mut inner = self.lock();
        inner.record(&self.call_tx, "initialize", String::new())?;
        Ok(inner.initial_snapshot.clone())
    }

    async fn discover_readers(&self, method: DiscoveryMethod, simulated: bool) -> DriverResult<()> {
        self.record("discover_readers", format!("{method} simulated={simulated}"))
    }

    async fn abort_discover_readers(&self) -> DriverResult<()> {
        self.record("abort_discover_readers", String::new())
    }

    async fn connect_reader(
        &self,
        serial_number: &str,
        location_id: Option<&str>,
    ) -> DriverResult<()> {
        let args = match location_id {
            Some(location) => format!("{serial_number} at {location}"),
            None => serial_number.to_string(),
        };
        self.record("connect_reader", args)
    }

    async fn disconnect_reader(&self) -> DriverResult<()> {
        self.record("disconnect_reader", String::new())
    }

    async fn create_payment_intent(
        &self,
        amount: u64,
        currency: &str,
    ) -> DriverResult<PaymentIntent> {
        self.record("create_payment_intent", format!("{amount} {currency}"))?;
        Ok(PaymentIntent {
            id: format!("pi_{}", Uuid::new_v4().simple()),
            amount,
            currency: currency.to_string(),
            created: Utc::now(),
        })
    }

    async fn collect_payment_method(&self, intent: &PaymentIntent) -> DriverResult<PaymentMethod> {
        let rx = {
            let mut inner = self.lock();
            inner.record(&self.call_tx, "collect_payment_method", intent.id.clone())?;
            if let Some(outcome) = inner.collect_outcomes.pop_front() {
                return outcome;
            }
            let (tx, rx) = oneshot::channel();
            inner.pending_collect = Some(tx);
            rx
        };
        // Parked until the handle presents a card or an abort lands.
        rx.await.unwrap_or_else(|_| Err(DriverError::canceled()))
    }

    async fn abort_collect_payment_method(&self) -> DriverResult<()> {
        let mut inner = self.lock();
        inner.record(&self.call_tx, "abort_collect_payment_method", String::new())?;
        if let Some(tx) = inner.pending_collect.take() {
            let _ = tx.send(Err(DriverError::canceled()));
        }
        Ok(())
    }

    async fn process_payment(&self, intent: &PaymentIntent) -> DriverResult<Payment> {
        let card = {
            let mut inner = self.lock();
            inner.record(&self.call_tx, "process_payment", intent.id.clone())?;
            inner.simulated_card
        };
        match card {
            SimulatedCardType::ChargeDeclined => Err(DriverError::new("Your card was declined.")),
            SimulatedCardType::ChargeDeclinedInsufficientFunds => {
                Err(DriverError::new("Your card has insufficient funds."))
            }
            _ => Ok(Payment {
                intent_id: intent.id.clone(),
                amount: intent.amount,
                currency: intent.currency.clone(),
                captured_at: Utc::now(),
            }),
        }
    }

    async fn abort_install_update(&self) -> DriverResult<()> {
        self.record("abort_install_update", String::new())
    }

    async fn set_simulated_card(&self, card: SimulatedCardType) -> DriverResult<()> {
        let mut inner = self.lock();
        inner.record(&self.call_tx, "set_simulated_card", card.to_string())?;
        inner.simulated_card = card;
        Ok(())
    }

    async fn set_connection_token(
        &self,
        token: Option<String>,
        error: Option<String>,
    ) -> DriverResult<()> {
        let args = match (&token, &error) {
            (Some(_), _) => "token".to_string(),
            (None, Some(reason)) => format!("error: {reason}"),
            (None, None) => "empty".to_string(),
        };
        self.record("set_connection_token", args)
    }

    fn take_event_stream(&self) -> Option<mpsc::Receiver<DriverEvent>> {
        self.event_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Control handle for a [`SimulatedDriver`].
///
/// Emits driver events, scripts failures, presents cards, and observes the
/// call log. Dropping the handle closes the event stream.
pub struct SimulatedHandle {
    inner: Arc<Mutex<Inner>>,
    event_tx: mpsc::Sender<DriverEvent>,
    call_rx: mpsc::UnboundedReceiver<RecordedCall>,
}

impl SimulatedHandle {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Emit an event as the hardware would.
    pub async fn emit(&self, event: DriverEvent) -> DriverResult<()> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| DriverError::new("event stream closed"))
    }

    /// Script the next call to `op` to fail with `err`. Failures queue up
    /// and are consumed one per call.
    pub fn fail_next(&self, op: &'static str, err: DriverError) {
        self.lock().fail_next.entry(op).or_default().push_back(err);
    }

    /// Wait for the next driver call. `None` once the driver is gone.
    pub async fn next_call(&mut self) -> Option<RecordedCall> {
        self.call_rx.recv().await
    }

    /// Snapshot of every call made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    /// Operation names of every call made so far.
    #[must_use]
    pub fn ops(&self) -> Vec<&'static str> {
        self.lock().calls.iter().map(|c| c.op).collect()
    }

    /// Present the configured test card, settling a parked collect. When no
    /// collect is parked the outcome queues for the next one.
    pub fn present_card(&self) {
        let mut inner = self.lock();
        let card = inner.simulated_card;
        let method = PaymentMethod {
            id: format!("pm_{}", Uuid::new_v4().simple()),
            brand: Some(card.brand().to_string()),
            last4: Some(test_card_last4(card).to_string()),
        };
        match inner.pending_collect.take() {
            Some(tx) => {
                let _ = tx.send(Ok(method));
            }
            None => inner.collect_outcomes.push_back(Ok(method)),
        }
    }

    /// Fail a parked collect (or the next one) with a reader error.
    pub fn fail_collect(&self, err: DriverError) {
        let mut inner = self.lock();
        match inner.pending_collect.take() {
            Some(tx) => {
                let _ = tx.send(Err(err));
            }
            None => inner.collect_outcomes.push_back(Err(err)),
        }
    }

    /// State the driver reports from `initialize`.
    pub fn set_initial_snapshot(&self, snapshot: DriverSnapshot) {
        self.lock().initial_snapshot = snapshot;
    }

    /// Test card currently configured on the driver.
    #[must_use]
    pub fn simulated_card(&self) -> SimulatedCardType {
        self.lock().simulated_card
    }
}

/// Last four PAN digits of the standard test card for each type.
fn test_card_last4(card: SimulatedCardType) -> &'static str {
    match card {
        SimulatedCardType::Visa => "4242",
        SimulatedCardType::VisaDebit => "5556",
        SimulatedCardType::Mastercard => "4444",
        SimulatedCardType::Amex => "0005",
        SimulatedCardType::ChargeDeclined => "0002",
        SimulatedCardType::ChargeDeclinedInsufficientFunds => "9995",
    }
}
