use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection lifecycle status reported to host applications.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    /// The driver has not been initialized yet.
    #[default]
    NotInitialized,
    /// Initialized, no reader connected and no discovery running.
    NotConnected,
    /// A discovery session is running; results accumulate in `readers`.
    Discovering,
    /// A connection attempt to a specific reader is in flight.
    Connecting,
    /// A reader is connected and usable.
    Connected,
    /// A mandatory firmware update is installing during connection setup.
    Updating,
    /// The last connection attempt failed; see `connection_error`.
    Error,
}

impl ConnectionStatus {
    /// Returns `true` when a reader is connected and usable.
    #[inline]
    #[must_use]
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ConnectionStatus::NotInitialized => "NOT_INITIALIZED",
            ConnectionStatus::NotConnected => "NOT_CONNECTED",
            ConnectionStatus::Discovering => "DISCOVERING",
            ConnectionStatus::Connecting => "CONNECTING",
            ConnectionStatus::Connected => "CONNECTED",
            ConnectionStatus::Updating => "UPDATING",
            ConnectionStatus::Error => "ERROR",
        };
        write!(f, "{name}")
    }
}

/// Payment flow status reported to host applications.
///
/// `PaymentSuccess` is part of the closed status set for hosts that render a
/// dedicated success screen, but the core itself returns to `Ready` after a
/// successful charge; the captured [`Payment`] is the durable signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    /// No reader connection; payment operations are meaningless.
    #[default]
    NotConnected,
    /// Connected but temporarily unusable (e.g. a firmware update is
    /// installing on the live connection).
    NotReady,
    /// Connected and idle; ready to start a payment.
    Ready,
    /// A payment intent is being created.
    CreatingPaymentIntent,
    /// Waiting for the cardholder to present a payment method.
    WaitingForInput,
    /// A payment method has been collected; the intent can be processed.
    ReadyToProcess,
    /// The charge is being captured.
    Processing,
    /// Reserved for hosts; never set by the core.
    PaymentSuccess,
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            PaymentStatus::NotConnected => "NOT_CONNECTED",
            PaymentStatus::NotReady => "NOT_READY",
            PaymentStatus::Ready => "READY",
            PaymentStatus::CreatingPaymentIntent => "CREATING_PAYMENT_INTENT",
            PaymentStatus::WaitingForInput => "WAITING_FOR_INPUT",
            PaymentStatus::ReadyToProcess => "READY_TO_PROCESS",
            PaymentStatus::Processing => "PROCESSING",
            PaymentStatus::PaymentSuccess => "PAYMENT_SUCCESS",
        };
        write!(f, "{name}")
    }
}

/// How a discovery session looks for readers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DiscoveryMethod {
    /// Scan for nearby bluetooth readers.
    #[default]
    BluetoothScan,
    /// Connect to the closest bluetooth reader without a full scan.
    BluetoothProximity,
    /// Look up readers registered to the account over the network.
    Internet,
    /// Enumerate readers attached over USB.
    Usb,
}

impl fmt::Display for DiscoveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            DiscoveryMethod::BluetoothScan => "bluetoothScan",
            DiscoveryMethod::BluetoothProximity => "bluetoothProximity",
            DiscoveryMethod::Internet => "internet",
            DiscoveryMethod::Usb => "usb",
        };
        write!(f, "{name}")
    }
}

/// Reader hardware model, translated from the driver's numeric code.
///
/// Unknown codes map to [`DeviceType::Unknown`] instead of failing: a new
/// hardware revision must not break discovery for hosts that only display
/// the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Chipper2X,
    VerifoneP400,
    WisePad3,
    StripeM2,
    WisePosE,
    StripeS700,
    Unknown(u32),
}

impl DeviceType {
    /// Translate a driver device-type code into a model.
    #[must_use]
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => DeviceType::Chipper2X,
            1 => DeviceType::VerifoneP400,
            2 => DeviceType::WisePad3,
            3 => DeviceType::StripeM2,
            4 => DeviceType::WisePosE,
            5 => DeviceType::StripeS700,
            other => DeviceType::Unknown(other),
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DeviceType::Chipper2X => write!(f, "chipper_2x"),
            DeviceType::VerifoneP400 => write!(f, "verifone_p400"),
            DeviceType::WisePad3 => write!(f, "wisepad_3"),
            DeviceType::StripeM2 => write!(f, "stripe_m2"),
            DeviceType::WisePosE => write!(f, "wisepos_e"),
            DeviceType::StripeS700 => write!(f, "stripe_s700"),
            DeviceType::Unknown(code) => write!(f, "unknown({code})"),
        }
    }
}

/// Immutable snapshot of a physical card-acceptance device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reader {
    pub serial_number: String,
    /// Location the reader is registered to, when known.
    pub location_id: Option<String>,
    /// Stable model name, translated from the driver's numeric code.
    pub device_type_name: String,
    /// Battery charge in the range 0–1, absent for mains-powered readers.
    pub battery_level: Option<f32>,
    pub is_charging: bool,
    /// Derived from diagnostic log lines on device classes that never emit
    /// a dedicated card event.
    pub is_card_inserted: bool,
}

/// In-progress firmware update, progress 0–100.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProgress {
    pub progress: f32,
}

/// Live connection state, owned by the state store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Readers found during the current discovery session. Non-empty only
    /// while `status == Discovering`.
    pub readers: Vec<Reader>,
    /// The currently connected reader, if any.
    pub reader: Option<Reader>,
    /// Parameters of the in-progress or most recent discovery.
    pub discovery_method: DiscoveryMethod,
    pub simulated: bool,
    /// Last discovery failure reason; cleared when a new discovery starts.
    pub discovery_error: Option<String>,
    /// Last connection failure reason; cleared when a new connect starts.
    pub connection_error: Option<String>,
    /// Firmware update in progress, if any.
    pub update: Option<UpdateProgress>,
}

/// Live payment state, owned by the state store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentState {
    pub status: PaymentStatus,
    pub payment_intent: Option<PaymentIntent>,
    pub payment_method: Option<PaymentMethod>,
    /// Result of the most recent successful capture.
    pub payment: Option<Payment>,
    /// Text the reader asked the host to display.
    pub display_message: Option<String>,
    /// Input prompt the reader asked the host to surface.
    pub input_request: Option<String>,
}

/// Declarative connection target consumed by the reconciler.
///
/// Every populated field must match the observed [`ConnectionState`] for the
/// target to count as reached; absent fields are unconstrained.
/// `serial_number` and `location_id` compare against the connected reader.
///
/// # Examples
///
/// ```
/// use tapkit_core::{ConnectionState, ConnectionStatus, DesiredState};
///
/// let desired = DesiredState::connected("R1").with_location("loc_1");
/// let observed = ConnectionState { status: ConnectionStatus::NotConnected, ..Default::default() };
/// assert!(!desired.matches(&observed));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredState {
    pub status: Option<ConnectionStatus>,
    pub serial_number: Option<String>,
    pub location_id: Option<String>,
    pub discovery_method: Option<DiscoveryMethod>,
    pub simulated: Option<bool>,
}

impl DesiredState {
    /// Target: no reader connected.
    #[must_use]
    pub fn not_connected() -> Self {
        DesiredState {
            status: Some(ConnectionStatus::NotConnected),
            ..Default::default()
        }
    }

    /// Target: an active discovery session with the given parameters.
    #[must_use]
    pub fn discovering(method: DiscoveryMethod, simulated: bool) -> Self {
        DesiredState {
            status: Some(ConnectionStatus::Discovering),
            discovery_method: Some(method),
            simulated: Some(simulated),
            ..Default::default()
        }
    }

    /// Target: connected to the reader with the given serial number.
    #[must_use]
    pub fn connected(serial_number: impl Into<String>) -> Self {
        DesiredState {
            status: Some(ConnectionStatus::Connected),
            serial_number: Some(serial_number.into()),
            ..Default::default()
        }
    }

    /// Constrain the location the reader connects under.
    #[must_use]
    pub fn with_location(mut self, location_id: impl Into<String>) -> Self {
        self.location_id = Some(location_id.into());
        self
    }

    /// Constrain the discovery parameters used to find the reader.
    #[must_use]
    pub fn with_discovery(mut self, method: DiscoveryMethod, simulated: bool) -> Self {
        self.discovery_method = Some(method);
        self.simulated = Some(simulated);
        self
    }

    /// Returns `true` when every populated field matches the observed state.
    #[must_use]
    pub fn matches(&self, observed: &ConnectionState) -> bool {
        if let Some(status) = self.status
            && observed.status != status
        {
            return false;
        }
        if let Some(serial) = &self.serial_number {
            let connected = observed
                .reader
                .as_ref()
                .is_some_and(|r| r.serial_number == *serial);
            if !connected {
                return false;
            }
        }
        if let Some(location) = &self.location_id {
            let at_location = observed
                .reader
                .as_ref()
                .is_some_and(|r| r.location_id.as_deref() == Some(location.as_str()));
            if !at_location {
                return false;
            }
        }
        if let Some(method) = self.discovery_method
            && observed.discovery_method != method
        {
            return false;
        }
        if let Some(simulated) = self.simulated
            && observed.simulated != simulated
        {
            return false;
        }
        true
    }
}

/// A created payment intent, the anchor of one charge attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntent {
    pub id: String,
    /// Amount in minor currency units.
    pub amount: u64,
    pub currency: String,
    pub created: DateTime<Utc>,
}

/// A collected payment method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentMethod {
    pub id: String,
    pub brand: Option<String>,
    pub last4: Option<String>,
}

/// Result of a successful capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub intent_id: String,
    pub amount: u64,
    pub currency: String,
    pub captured_at: DateTime<Utc>,
}

/// Test card presented by a simulated reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulatedCardType {
    Visa,
    Mastercard,
    Amex,
    VisaDebit,
    ChargeDeclined,
    ChargeDeclinedInsufficientFunds,
}

impl SimulatedCardType {
    /// Card network the simulated card reports.
    #[must_use]
    pub fn brand(self) -> &'static str {
        match self {
            SimulatedCardType::Visa
            | SimulatedCardType::VisaDebit
            | SimulatedCardType::ChargeDeclined
            | SimulatedCardType::ChargeDeclinedInsufficientFunds => "visa",
            SimulatedCardType::Mastercard => "mastercard",
            SimulatedCardType::Amex => "amex",
        }
    }
}

impl fmt::Display for SimulatedCardType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            SimulatedCardType::Visa => "visa",
            SimulatedCardType::Mastercard => "mastercard",
            SimulatedCardType::Amex => "amex",
            SimulatedCardType::VisaDebit => "visa_debit",
            SimulatedCardType::ChargeDeclined => "charge_declined",
            SimulatedCardType::ChargeDeclinedInsufficientFunds => {
                "charge_declined_insufficient_funds"
            }
        };
        write!(f, "{name}")
    }
}
