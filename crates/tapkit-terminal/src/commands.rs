//! Outbound command lifecycles.
//!
//! Each operation follows the same shape: validate caller input, mutate
//! status optimistically, register its abort procedure when cancelable,
//! submit the driver call through the queue, then reconcile the outcome
//! into the store. On a refused command the optimistic status is rolled
//! back and the driver's reason recorded, which is what the reconciler's
//! next corrective step keys off.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cancel::{CancellationTracker, OP_COLLECT, OP_DISCOVER, OP_INSTALL_UPDATE};
use crate::error::{Result, TerminalError};
use crate::queue::CommandQueue;
use crate::store::StateStore;
use tapkit_core::constants::DEFAULT_CURRENCY;
use tapkit_core::{
    ConnectionStatus, DiscoveryMethod, Payment, PaymentIntent, PaymentMethod, PaymentState,
    PaymentStatus, SimulatedCardType,
};
use tapkit_driver::ReaderDriver;

pub(crate) struct DeviceCommands {
    store: Arc<StateStore>,
    driver: Arc<dyn ReaderDriver>,
    queue: CommandQueue,
    cancel: Arc<CancellationTracker>,
}

impl DeviceCommands {
    pub(crate) fn new(
        store: Arc<StateStore>,
        driver: Arc<dyn ReaderDriver>,
        queue: CommandQueue,
        cancel: Arc<CancellationTracker>,
    ) -> Self {
        DeviceCommands {
            store,
            driver,
            queue,
            cancel,
        }
    }

    /// Start a discovery session with the given parameters.
    ///
    /// Resolves when the driver accepts the command; discovered readers
    /// arrive through ingestion. A refusal rolls the status back to
    /// `NotConnected` and records the driver's reason as the discovery
    /// error.
    pub(crate) async fn discover(&self, method: DiscoveryMethod, simulated: bool) -> Result<()> {
        debug!(%method, simulated, "starting discovery");
        self.store.update_connection(|c| {
            c.status = ConnectionStatus::Discovering;
            c.discovery_method = method;
            c.simulated = simulated;
            c.discovery_error = None;
            c.readers = Vec::new();
        });
        self.register_discovery_abort();

        let driver = Arc::clone(&self.driver);
        let result = self
            .queue
            .enqueue("discover_readers", move || async move {
                driver.discover_readers(method, simulated).await?;
                Ok(())
            })
            .await;

        if let Err(err) = &result {
            let reason = err.to_string();
            warn!(reason = %reason, "discovery refused");
            self.cancel.clear_if(OP_DISCOVER);
            self.store.update_connection(move |c| {
                c.status = ConnectionStatus::NotConnected;
                c.discovery_error = Some(reason);
            });
        }
        result
    }

    /// Abort the running discovery session.
    pub(crate) async fn abort_discovery(&self) -> Result<()> {
        discovery_abort(&self.store, &*self.driver, &self.cancel).await
    }

    /// Connect to a discovered reader. Resolves on acceptance; the outcome
    /// arrives through ingestion.
    pub(crate) async fn connect(&self, serial_number: String, location_id: Option<String>) -> Result<()> {
        debug!(serial = %serial_number, "connecting reader");
        self.store.update_connection(|c| {
            c.status = ConnectionStatus::Connecting;
            c.connection_error = None;
        });

        let driver = Arc::clone(&self.driver);
        let result = self
            .queue
            .enqueue("connect_reader", move || async move {
                driver
                    .connect_reader(&serial_number, location_id.as_deref())
                    .await?;
                Ok(())
            })
            .await;

        if let Err(err) = &result {
            let reason = err.to_string();
            warn!(reason = %reason, "connect refused");
            self.store.update_connection(move |c| {
                c.status = ConnectionStatus::Error;
                c.connection_error = Some(reason);
            });
        }
        result
    }

    /// Disconnect the connected reader. The state change arrives through
    /// ingestion when the driver reports completion.
    pub(crate) async fn disconnect(&self) -> Result<()> {
        debug!("disconnecting reader");
        let driver = Arc::clone(&self.driver);
        self.queue
            .enqueue("disconnect_reader", move || async move {
                driver.disconnect_reader().await?;
                Ok(())
            })
            .await
    }

    /// Create a payment intent. A zero amount is caller misuse; a missing
    /// currency falls back to the default with a warning.
    pub(crate) async fn create_payment_intent(
        &self,
        amount: u64,
        currency: Option<String>,
    ) -> Result<PaymentIntent> {
        if amount == 0 {
            return Err(TerminalError::missing("an amount to createPaymentIntent"));
        }
        let currency = currency.unwrap_or_else(|| {
            warn!("no currency provided to createPaymentIntent, defaulting to `{DEFAULT_CURRENCY}`");
            DEFAULT_CURRENCY.to_string()
        });

        debug!(amount, currency = %currency, "creating payment intent");
        let previous = self.store.payment().status;
        self.store
            .update_payment(|p| p.status = PaymentStatus::CreatingPaymentIntent);

        let driver = Arc::clone(&self.driver);
        let result = self
            .queue
            .enqueue("create_payment_intent", move || async move {
                Ok(driver.create_payment_intent(amount, &currency).await?)
            })
            .await;

        match result {
            Ok(intent) => {
                let stored = intent.clone();
                // A fresh intent supersedes whatever the previous one
                // collected or captured.
                self.store.update_payment(move |p| {
                    *p = PaymentState {
                        status: PaymentStatus::Ready,
                        payment_intent: Some(stored),
                        ..Default::default()
                    };
                });
                Ok(intent)
            }
            Err(err) => {
                warn!(error = %err, "payment intent creation failed");
                self.store.update_payment(move |p| p.status = previous);
                Err(err)
            }
        }
    }

    /// Wait for the cardholder to present a payment method.
    ///
    /// A user-initiated abort resolves `Ok(None)`: cancellation is an
    /// outcome here, not an error. Every other failure restores the prior
    /// payment status and surfaces.
    pub(crate) async fn collect_payment_method(
        &self,
        intent: Option<PaymentIntent>,
    ) -> Result<Option<PaymentMethod>> {
        let Some(intent) = intent else {
            return Err(TerminalError::missing(
                "a paymentIntent to collectPaymentMethod",
            ));
        };

        debug!(intent = %intent.id, "collecting payment method");
        let previous = self.store.payment().status;
        self.store
            .update_payment(|p| p.status = PaymentStatus::WaitingForInput);
        self.register_collect_abort();

        let driver = Arc::clone(&self.driver);
        let result = self
            .queue
            .enqueue("collect_payment_method", move || async move {
                Ok(driver.collect_payment_method(&intent).await?)
            })
            .await;
        self.cancel.clear_if(OP_COLLECT);

        match result {
            Ok(method) => {
                let stored = method.clone();
                self.store.update_payment(move |p| {
                    p.payment_method = Some(stored);
                    p.status = PaymentStatus::ReadyToProcess;
                    p.display_message = None;
                    p.input_request = None;
                });
                Ok(Some(method))
            }
            Err(err) if err.is_canceled() => {
                debug!("payment method collection canceled");
                self.store.update_payment(|p| {
                    p.payment_method = None;
                    p.status = PaymentStatus::Ready;
                    p.display_message = None;
                    p.input_request = None;
                });
                Ok(None)
            }
            Err(err) => {
                warn!(error = %err, "payment method collection failed");
                // The reader stopped prompting either way.
                self.store.update_payment(move |p| {
                    p.status = previous;
                    p.display_message = None;
                    p.input_request = None;
                });
                Err(err)
            }
        }
    }

    /// Abort a pending payment-method collection.
    pub(crate) async fn abort_collect(&self) -> Result<()> {
        collect_abort(&self.store, &*self.driver).await?;
        self.cancel.clear_if(OP_COLLECT);
        Ok(())
    }

    /// Capture the charge. A driver cancel is NOT swallowed here: by the
    /// time processing starts, an abort is a failed charge the caller must
    /// see.
    pub(crate) async fn process_payment(&self, intent: Option<PaymentIntent>) -> Result<Payment> {
        let Some(intent) = intent else {
            return Err(TerminalError::missing("a paymentIntent to processPayment"));
        };

        debug!(intent = %intent.id, "processing payment");
        let previous = self.store.payment().status;
        self.store
            .update_payment(|p| p.status = PaymentStatus::Processing);

        let driver = Arc::clone(&self.driver);
        let result = self
            .queue
            .enqueue("process_payment", move || async move {
                Ok(driver.process_payment(&intent).await?)
            })
            .await;

        match result {
            Ok(payment) => {
                let stored = payment.clone();
                self.store.update_payment(move |p| {
                    p.payment = Some(stored);
                    p.status = PaymentStatus::Ready;
                });
                Ok(payment)
            }
            Err(err) => {
                warn!(error = %err, "payment processing failed");
                self.store.update_payment(move |p| p.status = previous);
                Err(err)
            }
        }
    }

    /// Abort an installing firmware update.
    pub(crate) async fn abort_install_update(&self) -> Result<()> {
        self.driver.abort_install_update().await?;
        self.cancel.clear_if(OP_INSTALL_UPDATE);
        Ok(())
    }

    /// Choose the test card a simulated reader presents. Bypasses the
    /// queue so it can take effect while a collect is pending.
    pub(crate) async fn set_simulated_card(&self, card: SimulatedCardType) -> Result<()> {
        debug!(card = %card, "setting simulated card");
        self.driver.set_simulated_card(card).await?;
        Ok(())
    }

    fn register_discovery_abort(&self) {
        let store = Arc::clone(&self.store);
        let driver = Arc::clone(&self.driver);
        let cancel = Arc::clone(&self.cancel);
        self.cancel.register(OP_DISCOVER, move || {
            let store = Arc::clone(&store);
            let driver = Arc::clone(&driver);
            let cancel = Arc::clone(&cancel);
            Box::pin(async move {
                if let Err(err) = discovery_abort(&store, &*driver, &cancel).await {
                    warn!(error = %err, "abort discovery failed");
                }
            })
        });
    }

    fn register_collect_abort(&self) {
        let store = Arc::clone(&self.store);
        let driver = Arc::clone(&self.driver);
        self.cancel.register(OP_COLLECT, move || {
            let store = Arc::clone(&store);
            let driver = Arc::clone(&driver);
            Box::pin(async move {
                if let Err(err) = collect_abort(&store, &*driver).await {
                    warn!(error = %err, "abort collect failed");
                }
            })
        });
    }
}

async fn discovery_abort(
    store: &StateStore,
    driver: &dyn ReaderDriver,
    cancel: &CancellationTracker,
) -> Result<()> {
    driver.abort_discover_readers().await?;
    cancel.clear_if(OP_DISCOVER);
    store.update_connection(|c| {
        // Another command may have moved on; only a live discovery resets.
        if c.status == ConnectionStatus::Discovering {
            c.status = ConnectionStatus::NotConnected;
        }
    });
    Ok(())
}

async fn collect_abort(store: &StateStore, driver: &dyn ReaderDriver) -> Result<()> {
    driver.abort_collect_payment_method().await?;
    store.update_payment(|p| p.status = PaymentStatus::Ready);
    Ok(())
}
