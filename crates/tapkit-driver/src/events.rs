use tapkit_core::ConnectionStatus;

/// Unsolicited event pushed by a reader driver.
///
/// The union is closed on purpose: ingestion matches it exhaustively, and a
/// new variant is a breaking change every consumer has to handle.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    /// The driver needs a fresh connection token from the host.
    ConnectionTokenRequested,
    /// Discovery progress: the full result set so far, not a delta.
    ReadersDiscovered(Vec<RawReader>),
    /// A connection attempt succeeded.
    ReaderConnected(RawReader),
    /// A connection attempt failed.
    ReaderConnectFailed { reason: String },
    /// A requested disconnect completed.
    ReaderDisconnected,
    /// The reader dropped off without being asked to.
    UnexpectedDisconnect,
    /// A discovery session ended. `error` is populated when the session
    /// failed rather than being aborted or superseded by a connect.
    DiscoveryCompleted { error: Option<String> },
    /// A firmware update started installing.
    UpdateStarted,
    /// Firmware install progress, 0–100.
    UpdateProgress { progress: f32 },
    /// The firmware update finished, successfully or not.
    UpdateFinished,
    /// The reader wants the host to show a message to the cardholder.
    DisplayMessage { text: String },
    /// The reader is waiting for cardholder input of the given kinds.
    InputRequested { text: String },
    /// Raw diagnostic log line from the device.
    Log { line: String },
}

impl DriverEvent {
    /// Short stable name for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            DriverEvent::ConnectionTokenRequested => "connection_token_requested",
            DriverEvent::ReadersDiscovered(_) => "readers_discovered",
            DriverEvent::ReaderConnected(_) => "reader_connected",
            DriverEvent::ReaderConnectFailed { .. } => "reader_connect_failed",
            DriverEvent::ReaderDisconnected => "reader_disconnected",
            DriverEvent::UnexpectedDisconnect => "unexpected_disconnect",
            DriverEvent::DiscoveryCompleted { .. } => "discovery_completed",
            DriverEvent::UpdateStarted => "update_started",
            DriverEvent::UpdateProgress { .. } => "update_progress",
            DriverEvent::UpdateFinished => "update_finished",
            DriverEvent::DisplayMessage { .. } => "display_message",
            DriverEvent::InputRequested { .. } => "input_requested",
            DriverEvent::Log { .. } => "log",
        }
    }
}

/// Reader record as the driver reports it, before translation.
///
/// Numeric codes stay numeric here; `tapkit-terminal` translates them into
/// the host-facing [`tapkit_core::Reader`] form.
#[derive(Debug, Clone, PartialEq)]
pub struct RawReader {
    pub serial_number: String,
    pub location_id: Option<String>,
    /// Device model code, translated via [`tapkit_core::DeviceType::from_code`].
    pub device_type: u32,
    /// Battery charge in the range 0–1, absent for mains-powered readers.
    pub battery_level: Option<f32>,
    /// Charging status code; 1 means charging.
    pub charging_status: u32,
}

impl RawReader {
    pub fn new(serial_number: impl Into<String>) -> Self {
        RawReader {
            serial_number: serial_number.into(),
            location_id: None,
            device_type: 0,
            battery_level: None,
            charging_status: 0,
        }
    }

    #[must_use]
    pub fn with_location(mut self, location_id: impl Into<String>) -> Self {
        self.location_id = Some(location_id.into());
        self
    }

    #[must_use]
    pub fn with_device_type(mut self, code: u32) -> Self {
        self.device_type = code;
        self
    }

    #[must_use]
    pub fn with_battery(mut self, level: f32, charging_status: u32) -> Self {
        self.battery_level = Some(level);
        self.charging_status = charging_status;
        self
    }
}

/// Driver-observed state at initialization time.
///
/// Lets the control surface pick up an existing connection instead of
/// assuming a cold start.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverSnapshot {
    pub status: ConnectionStatus,
    pub reader: Option<RawReader>,
}

impl DriverSnapshot {
    /// Snapshot of a driver with nothing connected.
    #[must_use]
    pub fn disconnected() -> Self {
        DriverSnapshot {
            status: ConnectionStatus::NotConnected,
            reader: None,
        }
    }
}

impl Default for DriverSnapshot {
    fn default() -> Self {
        Self::disconnected()
    }
}
