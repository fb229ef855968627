//! Observed-state store with synchronous change notification.
//!
//! The store owns the [`ConnectionState`] and [`PaymentState`] snapshots and
//! is the only place they mutate. Two invariants are enforced on every
//! connection mutation rather than at each call site:
//!
//! - `readers` is non-empty only while `status == Discovering`; any mutation
//!   that leaves another status clears the list.
//! - Payment status derives from connection transitions: an edge into
//!   `Connected` sets it to `Ready`, an edge out of `Connected` sets it to
//!   `NotConnected`. The derived payment notification is delivered before
//!   the connection notification for the same mutation.
//!
//! Listeners run synchronously, before the mutating call returns, against
//! the snapshot the mutation produced. State locks are released first, so a
//! listener may call back into the store; one that needs the latest state
//! re-reads it instead of trusting its argument.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::trace;

use tapkit_core::{ConnectionState, ConnectionStatus, PaymentState, PaymentStatus};

/// Identifies one registered listener, for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct SubscriberSet<T> {
    next_id: u64,
    entries: Vec<(SubscriptionId, Arc<dyn Fn(&T) + Send + Sync>)>,
}

impl<T> SubscriberSet<T> {
    fn new() -> Self {
        SubscriberSet {
            next_id: 0,
            entries: Vec::new(),
        }
    }

    fn add(&mut self, listener: Arc<dyn Fn(&T) + Send + Sync>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, listener));
        id
    }

    fn remove(&mut self, id: SubscriptionId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() < before
    }

    fn snapshot(&self) -> Vec<Arc<dyn Fn(&T) + Send + Sync>> {
        self.entries.iter().map(|(_, l)| Arc::clone(l)).collect()
    }
}

struct Observed {
    connection: ConnectionState,
    payment: PaymentState,
}

/// Shared observed state plus its notification fan-out.
pub struct StateStore {
    state: Mutex<Observed>,
    connection_subs: Mutex<SubscriberSet<ConnectionState>>,
    payment_subs: Mutex<SubscriberSet<PaymentState>>,
    connection_watch: watch::Sender<ConnectionState>,
    payment_watch: watch::Sender<PaymentState>,
}

impl StateStore {
    pub fn new() -> Self {
        let connection = ConnectionState::default();
        let payment = PaymentState::default();
        let (connection_watch, _) = watch::channel(connection.clone());
        let (payment_watch, _) = watch::channel(payment.clone());
        StateStore {
            state: Mutex::new(Observed {
                connection,
                payment,
            }),
            connection_subs: Mutex::new(SubscriberSet::new()),
            payment_subs: Mutex::new(SubscriberSet::new()),
            connection_watch,
            payment_watch,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, Observed> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current connection snapshot.
    #[must_use]
    pub fn connection(&self) -> ConnectionState {
        self.lock_state().connection.clone()
    }

    /// Current payment snapshot.
    #[must_use]
    pub fn payment(&self) -> PaymentState {
        self.lock_state().payment.clone()
    }

    /// Watch-channel view of the connection state, for async observers.
    #[must_use]
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection_watch.subscribe()
    }

    /// Watch-channel view of the payment state.
    #[must_use]
    pub fn watch_payment(&self) -> watch::Receiver<PaymentState> {
        self.payment_watch.subscribe()
    }

    /// Replace the connection state wholesale. Same invariants and
    /// notifications as [`StateStore::update_connection`].
    pub fn set_connection(&self, next: ConnectionState) {
        self.update_connection(move |c| *c = next);
    }

    /// Replace the payment state wholesale.
    pub fn set_payment(&self, next: PaymentState) {
        self.update_payment(move |p| *p = next);
    }

    /// Mutate the connection state, enforce invariants, notify listeners.
    pub fn update_connection(&self, mutate: impl FnOnce(&mut ConnectionState)) {
        let (connection, derived_payment) = {
            let mut state = self.lock_state();
            let was_connected = state.connection.status == ConnectionStatus::Connected;
            mutate(&mut state.connection);

            if state.connection.status != ConnectionStatus::Discovering {
                state.connection.readers.clear();
            }

            let is_connected = state.connection.status == ConnectionStatus::Connected;
            let derived = match (was_connected, is_connected) {
                (false, true) => {
                    state.payment.status = PaymentStatus::Ready;
                    Some(state.payment.clone())
                }
                (true, false) => {
                    state.payment.status = PaymentStatus::NotConnected;
                    Some(state.payment.clone())
                }
                _ => None,
            };
            (state.connection.clone(), derived)
        };

        trace!(status = %connection.status, "connection state changed");

        if let Some(payment) = derived_payment {
            self.payment_watch.send_replace(payment.clone());
            self.notify_payment(&payment);
        }
        self.connection_watch.send_replace(connection.clone());
        self.notify_connection(&connection);
    }

    /// Mutate the payment state and notify listeners.
    pub fn update_payment(&self, mutate: impl FnOnce(&mut PaymentState)) {
        let payment = {
            let mut state = self.lock_state();
            mutate(&mut state.payment);
            state.payment.clone()
        };

        trace!(status = %payment.status, "payment state changed");

        self.payment_watch.send_replace(payment.clone());
        self.notify_payment(&payment);
    }

    fn notify_connection(&self, snapshot: &ConnectionState) {
        let listeners = self
            .connection_subs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot();
        for listener in listeners {
            listener(snapshot);
        }
    }

    fn notify_payment(&self, snapshot: &PaymentState) {
        let listeners = self
            .payment_subs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot();
        for listener in listeners {
            listener(snapshot);
        }
    }

    /// Register a connection listener.
    pub fn on_connection_change(
        &self,
        listener: impl Fn(&ConnectionState) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.connection_subs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add(Arc::new(listener))
    }

    /// Remove a connection listener. Returns `false` for unknown ids.
    pub fn off_connection_change(&self, id: SubscriptionId) -> bool {
        self.connection_subs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    /// Register a payment listener.
    pub fn on_payment_change(
        &self,
        listener: impl Fn(&PaymentState) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.payment_subs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add(Arc::new(listener))
    }

    /// Remove a payment listener. Returns `false` for unknown ids.
    pub fn off_payment_change(&self, id: SubscriptionId) -> bool {
        self.payment_subs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}
