// WiFi radio seam: station configuration, connect/disconnect requests and radio events

use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::config::{MAX_KEY_LEN, MAX_SSID_LEN};

/// Station disconnect reason code (IEEE 802.11 plus vendor extensions)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectReason(pub u16);

impl DisconnectReason {
    pub const UNSPECIFIED: DisconnectReason = DisconnectReason(1);
    pub const AUTH_EXPIRE: DisconnectReason = DisconnectReason(2);
    pub const ASSOC_LEAVE: DisconnectReason = DisconnectReason(8);
    pub const BEACON_TIMEOUT: DisconnectReason = DisconnectReason(200);
    pub const NO_AP_FOUND: DisconnectReason = DisconnectReason(201);

    /// Reasons produced by a deliberate leave or a reconfiguration in progress
    pub fn is_expected(&self) -> bool {
        *self == Self::ASSOC_LEAVE || *self == Self::AUTH_EXPIRE
    }

    pub fn name(&self) -> &'static str {
        match self.0 {
            1 => "UNSPECIFIED",
            2 => "AUTH_EXPIRE",
            3 => "AUTH_LEAVE",
            4 => "ASSOC_EXPIRE",
            5 => "ASSOC_TOOMANY",
            6 => "NOT_AUTHED",
            7 => "NOT_ASSOCED",
            8 => "ASSOC_LEAVE",
            9 => "ASSOC_NOT_AUTHED",
            10 => "DISASSOC_PWRCAP_BAD",
            11 => "DISASSOC_SUPCHAN_BAD",
            12 => "BSS_TRANSITION_DISASSOC",
            13 => "IE_INVALID",
            14 => "MIC_FAILURE",
            15 => "4WAY_HANDSHAKE_TIMEOUT",
            16 => "GROUP_KEY_UPDATE_TIMEOUT",
            17 => "IE_IN_4WAY_DIFFERS",
            18 => "GROUP_CIPHER_INVALID",
            19 => "PAIRWISE_CIPHER_INVALID",
            20 => "AKMP_INVALID",
            21 => "UNSUPP_RSN_IE_VERSION",
            22 => "INVALID_RSN_IE_CAP",
            23 => "802_1X_AUTH_FAILED",
            24 => "CIPHER_SUITE_REJECTED",
            200 => "BEACON_TIMEOUT",
            201 => "NO_AP_FOUND",
            202 => "AUTH_FAIL",
            203 => "ASSOC_FAIL",
            204 => "HANDSHAKE_TIMEOUT",
            205 => "CONNECTION_FAIL",
            206 => "AP_TSF_RESET",
            207 => "ROAMING",
            208 => "ASSOC_COMEBACK_TIME_TOO_LONG",
            209 => "SA_QUERY_TIMEOUT",
            _ => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

/// Radio events, forwarded verbatim to the diagnostic listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WifiEvent {
    StationStarted,
    StationStopped,
    StationConnected,
    StationDisconnected { reason: DisconnectReason },
    GotIp(Ipv4Addr),
    LostIp,
    AccessPointStarted,
    AccessPointStopped,
    AccessPointClientJoined,
    AccessPointClientLeft,
}

/// Classified driver failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiErrorKind {
    /// A connection attempt is already running
    AlreadyConnecting,
    NotStarted,
    NotInitialized,
    InvalidArgument,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WifiDriverError {
    pub code: i32,
    pub kind: WifiErrorKind,
}

impl WifiDriverError {
    pub fn new(code: i32, kind: WifiErrorKind) -> Self {
        Self { code, kind }
    }
}

impl std::fmt::Display for WifiDriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WiFi driver error {} ({:?})", self.code, self.kind)
    }
}

impl std::error::Error for WifiDriverError {}

/// Station SSID and key, clipped to the radio's field sizes
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StationCredentials {
    pub ssid: String,
    pub key: String,
}

impl StationCredentials {
    pub fn new(ssid: &str, key: &str) -> Self {
        Self {
            ssid: clip(ssid, MAX_SSID_LEN).to_string(),
            key: clip(key, MAX_KEY_LEN).to_string(),
        }
    }
}

// Longest prefix of at most `max` bytes ending on a char boundary
fn clip(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

pub type WifiEventHandler = Arc<dyn Fn(WifiEvent) + Send + Sync>;

/// The WiFi driver the connection manager drives
pub trait WifiDriver: Send + Sync {
    /// Install the callback receiving every radio event
    fn set_event_handler(&self, handler: WifiEventHandler);

    /// Start the radio in its configured mode; STA_START follows as an event
    fn start(&self) -> Result<(), WifiDriverError>;

    fn set_station_config(&self, credentials: &StationCredentials) -> Result<(), WifiDriverError>;

    /// Begin association; completion is reported through events
    fn connect(&self) -> Result<(), WifiDriverError>;

    fn disconnect(&self) -> Result<(), WifiDriverError>;

    /// True while the station is associated with an access point
    fn is_associated(&self) -> bool;
}
