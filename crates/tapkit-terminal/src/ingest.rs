//! Driver event ingestion.
//!
//! One task per terminal owns the driver's event receiver and applies one
//! state-store mutation per event, in arrival order. Everything here is a
//! translation of what the device already did; command-side state changes
//! live in [`crate::commands`].

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::cancel::{CancellationTracker, OP_DISCOVER, OP_INSTALL_UPDATE};
use crate::store::StateStore;
use crate::tokens::ConnectionTokenProvider;
use tapkit_core::constants::{
    BATTERY_STATUS_CHARGING, ERR_TOKEN_FETCH, LOG_CARD_INSERTED, LOG_CARD_REMOVED,
    LOG_KEY_CARD_STATUS, LOG_VOLATILE_KEYS,
};
use tapkit_core::{ConnectionStatus, DeviceType, PaymentStatus, Reader, UpdateProgress};
use tapkit_driver::{DriverEvent, RawReader, ReaderDriver};

/// Translate a driver-reported reader into its host-facing form.
pub(crate) fn translate_reader(raw: RawReader) -> Reader {
    Reader {
        serial_number: raw.serial_number,
        location_id: raw.location_id,
        device_type_name: DeviceType::from_code(raw.device_type).to_string(),
        battery_level: raw.battery_level,
        is_charging: raw.charging_status == BATTERY_STATUS_CHARGING,
        is_card_inserted: false,
    }
}

/// Parse a diagnostic log line into `key=value` pairs, dropping keys that
/// change on every line.
pub(crate) fn parse_log_pairs(line: &str) -> Vec<(&str, &str)> {
    line.split_whitespace()
        .filter_map(|token| token.split_once('='))
        .filter(|(key, _)| !LOG_VOLATILE_KEYS.contains(key))
        .collect()
}

pub(crate) struct EventIngestion {
    store: Arc<StateStore>,
    driver: Arc<dyn ReaderDriver>,
    tokens: Arc<dyn ConnectionTokenProvider>,
    cancel: Arc<CancellationTracker>,
}

impl EventIngestion {
    pub(crate) fn new(
        store: Arc<StateStore>,
        driver: Arc<dyn ReaderDriver>,
        tokens: Arc<dyn ConnectionTokenProvider>,
        cancel: Arc<CancellationTracker>,
    ) -> Self {
        EventIngestion {
            store,
            driver,
            tokens,
            cancel,
        }
    }

    /// Consume events until the driver closes the stream.
    pub(crate) async fn run(self, mut events: mpsc::Receiver<DriverEvent>) {
        while let Some(event) = events.recv().await {
            trace!(kind = event.kind(), "driver event");
            self.apply(event);
        }
        debug!("driver event stream ended");
    }

    fn apply(&self, event: DriverEvent) {
        match event {
            DriverEvent::ConnectionTokenRequested => self.spawn_token_fetch(),

            DriverEvent::ReadersDiscovered(raw) => {
                let readers: Vec<Reader> = raw.into_iter().map(translate_reader).collect();
                debug!(count = readers.len(), "readers discovered");
                self.store.update_connection(|c| c.readers = readers);
            }

            DriverEvent::ReaderConnected(raw) => {
                self.cancel.clear_if(OP_DISCOVER);
                let reader = translate_reader(raw);
                debug!(serial = %reader.serial_number, "reader connected");
                self.store.update_connection(|c| {
                    c.status = ConnectionStatus::Connected;
                    c.reader = Some(reader);
                });
            }

            DriverEvent::ReaderConnectFailed { reason } => {
                warn!(reason = %reason, "reader connection failed");
                self.store.update_connection(|c| {
                    c.status = ConnectionStatus::Error;
                    c.connection_error = Some(reason);
                });
            }

            DriverEvent::ReaderDisconnected => {
                debug!("reader disconnected");
                self.store.update_connection(|c| {
                    c.status = ConnectionStatus::NotConnected;
                    c.reader = None;
                });
            }

            DriverEvent::UnexpectedDisconnect => {
                warn!("reader disconnected unexpectedly");
                self.store.update_connection(|c| {
                    c.status = ConnectionStatus::NotConnected;
                    c.reader = None;
                });
            }

            DriverEvent::DiscoveryCompleted { error } => {
                self.cancel.clear_if(OP_DISCOVER);
                match error {
                    Some(reason) => {
                        warn!(reason = %reason, "discovery failed");
                        self.store.update_connection(|c| {
                            c.status = ConnectionStatus::NotConnected;
                            c.discovery_error = Some(reason);
                        });
                    }
                    // Completion without a result is not itself a state
                    // change; the terminal state arrives on its own event.
                    None => trace!("discovery completed"),
                }
            }

            DriverEvent::UpdateStarted => {
                debug!("reader update started");
                self.register_update_abort();
                let was_connected = self.store.connection().status == ConnectionStatus::Connected;
                self.store.update_connection(|c| {
                    c.update = Some(UpdateProgress { progress: 0.0 });
                    if c.status == ConnectionStatus::Connecting {
                        c.status = ConnectionStatus::Updating;
                    }
                });
                if was_connected {
                    self.store
                        .update_payment(|p| p.status = PaymentStatus::NotReady);
                }
            }

            DriverEvent::UpdateProgress { progress } => {
                self.store
                    .update_connection(|c| c.update = Some(UpdateProgress { progress }));
            }

            DriverEvent::UpdateFinished => {
                debug!("reader update finished");
                self.cancel.clear_if(OP_INSTALL_UPDATE);
                let was_connected = self.store.connection().status == ConnectionStatus::Connected;
                self.store.update_connection(|c| c.update = None);
                if was_connected {
                    self.store
                        .update_payment(|p| p.status = PaymentStatus::Ready);
                }
            }

            DriverEvent::DisplayMessage { text } => {
                self.store
                    .update_payment(|p| p.display_message = Some(text));
            }

            DriverEvent::InputRequested { text } => {
                self.store.update_payment(|p| p.input_request = Some(text));
            }

            DriverEvent::Log { line } => self.apply_log_line(&line),
        }
    }

    /// Answer a token request off-task so ingestion never blocks on the
    /// host's backend.
    fn spawn_token_fetch(&self) {
        let tokens = Arc::clone(&self.tokens);
        let driver = Arc::clone(&self.driver);
        tokio::spawn(async move {
            let (token, error) = match tokens.fetch_connection_token().await {
                Ok(token) if !token.is_empty() => (Some(token), None),
                Ok(_) => {
                    warn!("token provider returned an empty token");
                    (None, Some(ERR_TOKEN_FETCH.to_string()))
                }
                Err(err) => {
                    warn!(error = %err, "connection token fetch failed");
                    (None, Some(ERR_TOKEN_FETCH.to_string()))
                }
            };
            if let Err(err) = driver.set_connection_token(token, error).await {
                warn!(error = %err, "failed to hand the token to the driver");
            }
        });
    }

    fn register_update_abort(&self) {
        let driver = Arc::clone(&self.driver);
        self.cancel.register(OP_INSTALL_UPDATE, move || {
            let driver = Arc::clone(&driver);
            Box::pin(async move {
                if let Err(err) = driver.abort_install_update().await {
                    warn!(error = %err, "abort install update failed");
                }
            })
        });
    }

    /// Diagnostic lines double as a card-presence signal on device classes
    /// that never emit a dedicated card event.
    fn apply_log_line(&self, line: &str) {
        let pairs = parse_log_pairs(line);
        if pairs.is_empty() {
            return;
        }

        let rendered = pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        trace!(fields = %rendered, "reader log");

        let card_status = pairs
            .iter()
            .find(|(key, _)| *key == LOG_KEY_CARD_STATUS)
            .map(|(_, value)| *value);
        let inserted = match card_status {
            Some(LOG_CARD_INSERTED) => true,
            Some(LOG_CARD_REMOVED) => false,
            _ => return,
        };
        self.store.update_connection(|c| {
            if let Some(reader) = &mut c.reader {
                reader.is_card_inserted = inserted;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::{StaticTokenProvider, TokenError};
    use async_trait::async_trait;
    use tapkit_driver::SimulatedDriver;

    struct FailingTokenProvider;

    #[async_trait]
    impl ConnectionTokenProvider for FailingTokenProvider {
        async fn fetch_connection_token(&self) -> Result<String, TokenError> {
            Err(TokenError::new("backend is down"))
        }
    }

    fn ingestion_with(
        tokens: Arc<dyn ConnectionTokenProvider>,
    ) -> (
        EventIngestion,
        Arc<StateStore>,
        Arc<CancellationTracker>,
        tapkit_driver::SimulatedHandle,
    ) {
        let store = Arc::new(StateStore::new());
        let cancel = Arc::new(CancellationTracker::new());
        let (driver, handle) = SimulatedDriver::new();
        let ingest = EventIngestion::new(
            Arc::clone(&store),
            Arc::new(driver),
            tokens,
            Arc::clone(&cancel),
        );
        (ingest, store, cancel, handle)
    }

    fn ingestion() -> (
        EventIngestion,
        Arc<StateStore>,
        Arc<CancellationTracker>,
        tapkit_driver::SimulatedHandle,
    ) {
        ingestion_with(Arc::new(StaticTokenProvider::new("tok_test")))
    }

    #[test]
    fn translates_device_and_charging_codes() {
        let raw = RawReader::new("R1")
            .with_location("loc_1")
            .with_device_type(4)
            .with_battery(0.5, BATTERY_STATUS_CHARGING);
        let reader = translate_reader(raw);
        assert_eq!(reader.device_type_name, "wisepos_e");
        assert!(reader.is_charging);
        assert_eq!(reader.location_id.as_deref(), Some("loc_1"));
        assert!(!reader.is_card_inserted);
    }

    #[test]
    fn volatile_keys_are_dropped_from_log_lines() {
        let pairs = parse_log_pairs("t=123 level=info starting card_status=inserted seq=9");
        assert_eq!(pairs, vec![("level", "info"), ("card_status", "inserted")]);
    }

    #[tokio::test]
    async fn discovered_readers_replace_the_list_while_discovering() {
        let (ingest, store, _cancel, _handle) = ingestion();
        store.update_connection(|c| c.status = ConnectionStatus::Discovering);

        ingest.apply(DriverEvent::ReadersDiscovered(vec![
            RawReader::new("R1"),
            RawReader::new("R2"),
        ]));

        let readers = store.connection().readers;
        assert_eq!(readers.len(), 2);
        assert_eq!(readers[0].serial_number, "R1");
    }

    #[tokio::test]
    async fn connecting_clears_the_discovery_slot_and_list() {
        let (ingest, store, cancel, _handle) = ingestion();
        store.update_connection(|c| c.status = ConnectionStatus::Discovering);
        cancel.register(OP_DISCOVER, || Box::pin(async {}));

        ingest.apply(DriverEvent::ReaderConnected(RawReader::new("R1")));

        let connection = store.connection();
        assert_eq!(connection.status, ConnectionStatus::Connected);
        assert_eq!(connection.reader.unwrap().serial_number, "R1");
        assert!(connection.readers.is_empty());
        assert_eq!(cancel.current(), None);
        assert_eq!(store.payment().status, PaymentStatus::Ready);
    }

    #[tokio::test]
    async fn connect_failure_is_recorded() {
        let (ingest, store, _cancel, _handle) = ingestion();
        store.update_connection(|c| c.status = ConnectionStatus::Connecting);

        ingest.apply(DriverEvent::ReaderConnectFailed {
            reason: "bluetooth timeout".to_string(),
        });

        let connection = store.connection();
        assert_eq!(connection.status, ConnectionStatus::Error);
        assert_eq!(connection.connection_error.as_deref(), Some("bluetooth timeout"));
    }

    #[tokio::test]
    async fn disconnects_reset_to_not_connected() {
        let (ingest, store, _cancel, _handle) = ingestion();
        store.update_connection(|c| {
            c.status = ConnectionStatus::Connected;
            c.reader = Some(translate_reader(RawReader::new("R1")));
        });

        ingest.apply(DriverEvent::UnexpectedDisconnect);

        let connection = store.connection();
        assert_eq!(connection.status, ConnectionStatus::NotConnected);
        assert!(connection.reader.is_none());
        assert_eq!(store.payment().status, PaymentStatus::NotConnected);
    }

    #[tokio::test]
    async fn failed_discovery_records_the_reason() {
        let (ingest, store, _cancel, _handle) = ingestion();
        store.update_connection(|c| c.status = ConnectionStatus::Discovering);

        ingest.apply(DriverEvent::DiscoveryCompleted {
            error: Some("adapter unavailable".to_string()),
        });

        let connection = store.connection();
        assert_eq!(connection.status, ConnectionStatus::NotConnected);
        assert_eq!(
            connection.discovery_error.as_deref(),
            Some("adapter unavailable")
        );
    }

    #[tokio::test]
    async fn mandatory_update_interposes_during_connecting() {
        let (ingest, store, cancel, _handle) = ingestion();
        store.update_connection(|c| c.status = ConnectionStatus::Connecting);

        ingest.apply(DriverEvent::UpdateStarted);
        assert_eq!(store.connection().status, ConnectionStatus::Updating);
        assert_eq!(cancel.current(), Some(OP_INSTALL_UPDATE));

        ingest.apply(DriverEvent::UpdateProgress { progress: 42.0 });
        assert_eq!(store.connection().update.unwrap().progress, 42.0);

        ingest.apply(DriverEvent::UpdateFinished);
        assert!(store.connection().update.is_none());
        assert_eq!(cancel.current(), None);
        // Still mid-connect; the connected event arrives on its own.
        assert_eq!(store.connection().status, ConnectionStatus::Updating);
    }

    #[tokio::test]
    async fn optional_update_parks_payment_while_connected() {
        let (ingest, store, _cancel, _handle) = ingestion();
        store.update_connection(|c| c.status = ConnectionStatus::Connected);
        assert_eq!(store.payment().status, PaymentStatus::Ready);

        ingest.apply(DriverEvent::UpdateStarted);
        assert_eq!(store.connection().status, ConnectionStatus::Connected);
        assert_eq!(store.payment().status, PaymentStatus::NotReady);

        ingest.apply(DriverEvent::UpdateFinished);
        assert_eq!(store.payment().status, PaymentStatus::Ready);
    }

    #[tokio::test]
    async fn prompts_land_in_payment_state() {
        let (ingest, store, _cancel, _handle) = ingestion();

        ingest.apply(DriverEvent::DisplayMessage {
            text: "Remove card".to_string(),
        });
        ingest.apply(DriverEvent::InputRequested {
            text: "swipe_or_tap".to_string(),
        });

        let payment = store.payment();
        assert_eq!(payment.display_message.as_deref(), Some("Remove card"));
        assert_eq!(payment.input_request.as_deref(), Some("swipe_or_tap"));
    }

    #[tokio::test]
    async fn card_presence_follows_log_lines() {
        let (ingest, store, _cancel, _handle) = ingestion();
        store.update_connection(|c| {
            c.status = ConnectionStatus::Connected;
            c.reader = Some(translate_reader(RawReader::new("R1")));
        });

        ingest.apply(DriverEvent::Log {
            line: "t=1 card_status=inserted".to_string(),
        });
        assert!(store.connection().reader.unwrap().is_card_inserted);

        ingest.apply(DriverEvent::Log {
            line: "t=2 card_status=removed".to_string(),
        });
        assert!(!store.connection().reader.unwrap().is_card_inserted);
    }

    #[tokio::test]
    async fn token_request_answers_with_the_fetched_token() {
        let (ingest, _store, _cancel, mut handle) = ingestion();

        ingest.apply(DriverEvent::ConnectionTokenRequested);

        let call = handle.next_call().await.unwrap();
        assert_eq!(call.op, "set_connection_token");
        assert_eq!(call.args, "token");
    }

    #[tokio::test]
    async fn token_fetch_failure_reports_the_wire_string() {
        let (ingest, _store, _cancel, mut handle) = ingestion_with(Arc::new(FailingTokenProvider));

        ingest.apply(DriverEvent::ConnectionTokenRequested);

        let call = handle.next_call().await.unwrap();
        assert_eq!(call.op, "set_connection_token");
        assert_eq!(call.args, format!("error: {ERR_TOKEN_FETCH}"));
    }
}
