// WiFi connection manager
// Owns the station state machine and reconnection policy, and is the single
// teardown entry point for every transport socket.

// Import logging macros
use log::{error, info, warn};

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::ble_server::lock_recover;
use crate::config::{CommConfig, WifiMode, AP_ADDRESS};
use crate::tcp_transport::{TransportConnection, TransportRole};
use crate::wifi_driver::{StationCredentials, WifiDriver, WifiErrorKind, WifiEvent};

/// Station connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected(Ipv4Addr),
}

/// Receives every radio event for diagnostics
pub type WifiEventListener = Arc<dyn Fn(&WifiEvent) + Send + Sync>;

struct ManagerState {
    connection: ConnectionState,
    reconnect_disabled: bool,
    auto_reconnect: bool,
    credentials: Option<StationCredentials>,
    listener: Option<WifiEventListener>,
}

pub struct WifiManager {
    driver: Arc<dyn WifiDriver>,
    mode: WifiMode,
    state: Mutex<ManagerState>,
    transports: Mutex<Vec<Arc<TransportConnection>>>,
}

impl WifiManager {
    /// Create the manager, subscribe it to the driver's events, then start the radio
    pub fn new(driver: Arc<dyn WifiDriver>, config: &CommConfig) -> Arc<Self> {
        let credentials = config
            .wifi_mode
            .has_station()
            .then(|| StationCredentials::new(&config.sta_ssid, &config.sta_key));

        let manager = Arc::new(Self {
            driver: driver.clone(),
            mode: config.wifi_mode,
            state: Mutex::new(ManagerState {
                connection: ConnectionState::Idle,
                reconnect_disabled: !config.wifi_mode.has_station(),
                auto_reconnect: true,
                credentials,
                listener: None,
            }),
            transports: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&manager);
        driver.set_event_handler(Arc::new(move |event| {
            if let Some(manager) = weak.upgrade() {
                manager.handle_event(event);
            }
        }));

        if config.wifi_mode != WifiMode::Disabled {
            if let Err(e) = driver.start() {
                error!("❌ WiFi start failed: {}", e);
            }
        }

        manager
    }

    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        lock_recover(&self.state)
    }

    fn set_connection(&self, connection: ConnectionState) {
        self.lock_state().connection = connection;
    }

    /// Drive the state machine from one radio event
    pub fn handle_event(&self, event: WifiEvent) {
        let listener = self.lock_state().listener.clone();
        if let Some(listener) = listener {
            listener(&event);
        }

        match event {
            WifiEvent::StationStarted => {
                let disabled = self.lock_state().reconnect_disabled;
                if !disabled {
                    info!("📶 Station started, connecting");
                    self.begin_connect();
                }
            }
            WifiEvent::StationDisconnected { reason } => {
                let will_reconnect = {
                    let mut state = self.lock_state();
                    let will = !state.reconnect_disabled && (state.auto_reconnect || reason.is_expected());
                    state.connection = if will {
                        ConnectionState::Connecting
                    } else {
                        ConnectionState::Idle
                    };
                    will
                };
                if will_reconnect {
                    info!("📶 Station disconnected: {}, reconnecting", reason);
                    if let Err(e) = self.driver.connect() {
                        if e.kind != WifiErrorKind::AlreadyConnecting {
                            warn!("⚠️ Reconnect request failed: {}", e);
                            self.set_connection(ConnectionState::Idle);
                        }
                    }
                } else {
                    info!("📶 Station disconnected: {}, staying idle", reason);
                }
            }
            WifiEvent::GotIp(address) => {
                info!("✅ Station got address {}", address);
                self.set_connection(ConnectionState::Connected(address));
            }
            WifiEvent::StationStopped => {
                info!("📶 Station stopped");
                self.disconnect();
                self.set_connection(ConnectionState::Idle);
            }
            _ => {}
        }
    }

    // Idle -> connecting; a connect already in progress counts as success
    fn begin_connect(&self) -> bool {
        self.set_connection(ConnectionState::Connecting);
        match self.driver.connect() {
            Ok(()) => true,
            Err(e) if e.kind == WifiErrorKind::AlreadyConnecting => true,
            Err(e) => {
                error!("❌ WiFi connect failed: {}", e);
                self.set_connection(ConnectionState::Idle);
                false
            }
        }
    }

    /// Apply new station credentials and force a fresh association
    pub fn reconfigure_and_reconnect(&self, ssid: &str, key: &str) -> bool {
        if self.mode != WifiMode::Station {
            warn!("⚠️ Reconfigure ignored, station mode is not active");
            return false;
        }

        let credentials = StationCredentials::new(ssid, key);
        let connected = {
            let mut state = self.lock_state();
            state.credentials = Some(credentials.clone());
            state.reconnect_disabled = false;
            matches!(state.connection, ConnectionState::Connected(_))
        };

        if let Err(e) = self.driver.set_station_config(&credentials) {
            error!("❌ Could not apply station config for '{}': {}", credentials.ssid, e);
            return false;
        }
        info!("📋 Station config set to '{}'", credentials.ssid);

        if connected || self.driver.is_associated() {
            // The disconnect event (ASSOC_LEAVE) brings the link back up
            match self.driver.disconnect() {
                Ok(()) => true,
                Err(e) => {
                    error!("❌ WiFi disconnect failed: {}", e);
                    false
                }
            }
        } else {
            self.begin_connect()
        }
    }

    /// Stop reconnecting, close the transport sockets and leave the network
    pub fn disable_and_disconnect(&self) -> bool {
        if self.mode != WifiMode::Station {
            return false;
        }
        self.lock_state().reconnect_disabled = true;
        self.disconnect();
        let ok = match self.driver.disconnect() {
            Ok(()) => true,
            Err(e) => {
                error!("❌ WiFi disconnect failed: {}", e);
                false
            }
        };
        self.set_connection(ConnectionState::Idle);
        ok
    }

    pub fn set_auto_reconnect(&self, enabled: bool) -> bool {
        if self.mode != WifiMode::Station {
            return false;
        }
        self.lock_state().auto_reconnect = enabled;
        true
    }

    pub fn set_event_listener(&self, listener: WifiEventListener) {
        self.lock_state().listener = Some(listener);
    }

    /// Enrol a transport so `disconnect` can tear it down
    pub fn register_transport(&self, connection: Arc<TransportConnection>) {
        lock_recover(&self.transports).push(connection);
    }

    /// Close every open transport socket
    pub fn disconnect(&self) {
        let transports: Vec<Arc<TransportConnection>> = lock_recover(&self.transports).clone();
        for transport in transports {
            transport.shutdown();
        }
    }

    pub fn mode(&self) -> WifiMode {
        self.mode
    }

    pub fn state(&self) -> ConnectionState {
        self.lock_state().connection
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state(), ConnectionState::Connected(_))
    }

    pub fn is_connecting(&self) -> bool {
        self.state() == ConnectionState::Connecting
    }

    pub fn auto_reconnect(&self) -> bool {
        self.lock_state().auto_reconnect
    }

    pub fn reconnect_disabled(&self) -> bool {
        self.lock_state().reconnect_disabled
    }

    pub fn credentials(&self) -> Option<StationCredentials> {
        self.lock_state().credentials.clone()
    }

    pub fn station_address(&self) -> Option<Ipv4Addr> {
        match self.state() {
            ConnectionState::Connected(address) => Some(address),
            _ => None,
        }
    }

    /// Address peers should use: the AP address when running an access point
    pub fn discovery_address(&self) -> Option<Ipv4Addr> {
        if self.mode.has_access_point() {
            Some(AP_ADDRESS)
        } else {
            self.station_address()
        }
    }

    fn transport_peer(&self, role: TransportRole) -> Option<SocketAddr> {
        let transports = lock_recover(&self.transports).clone();
        transports
            .iter()
            .filter(|t| t.role() == role)
            .find_map(|t| t.peer_addr())
    }

    /// Local client address if one is connected, else the hub peer
    pub fn client_address(&self) -> Option<SocketAddr> {
        self.transport_peer(TransportRole::Local)
            .or_else(|| self.transport_peer(TransportRole::Hub))
    }

    pub fn is_local_client_connected(&self) -> bool {
        self.transport_peer(TransportRole::Local).is_some()
    }

    pub fn is_hub_connected(&self) -> bool {
        self.transport_peer(TransportRole::Hub).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimWifiCall, SimWifiDriver};
    use crate::wifi_driver::{DisconnectReason, WifiDriverError};

    fn station_manager() -> (Arc<SimWifiDriver>, Arc<WifiManager>) {
        let driver = Arc::new(SimWifiDriver::new());
        let config = CommConfig {
            wifi_mode: WifiMode::Station,
            sta_ssid: "shop".to_string(),
            ..Default::default()
        };
        let manager = WifiManager::new(driver.clone(), &config);
        driver.clear_calls();
        (driver, manager)
    }

    fn connected(driver: &SimWifiDriver, manager: &WifiManager) {
        driver.emit(WifiEvent::StationStarted);
        driver.emit(WifiEvent::GotIp(Ipv4Addr::new(10, 0, 0, 7)));
        assert_eq!(manager.state(), ConnectionState::Connected(Ipv4Addr::new(10, 0, 0, 7)));
        driver.clear_calls();
    }

    #[test]
    fn station_start_connects() {
        // The radio reports STA_START from inside `start`
        let driver = Arc::new(SimWifiDriver::station());
        let config = CommConfig {
            wifi_mode: WifiMode::Station,
            sta_ssid: "shop".to_string(),
            ..Default::default()
        };
        let manager = WifiManager::new(driver.clone(), &config);
        assert!(manager.is_connecting());
        assert_eq!(driver.calls(), vec![SimWifiCall::Start, SimWifiCall::Connect]);
    }

    #[test]
    fn disabled_radio_is_never_started() {
        let driver = Arc::new(SimWifiDriver::station());
        let config = CommConfig {
            wifi_mode: WifiMode::Disabled,
            ..Default::default()
        };
        let manager = WifiManager::new(driver.clone(), &config);
        assert!(driver.calls().is_empty());
        assert_eq!(manager.state(), ConnectionState::Idle);
    }

    #[test]
    fn access_point_mode_never_connects() {
        let driver = Arc::new(SimWifiDriver::new());
        let manager = WifiManager::new(driver.clone(), &CommConfig::default());
        driver.emit(WifiEvent::StationStarted);
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert_eq!(driver.calls(), vec![SimWifiCall::Start]);
        assert!(!manager.set_auto_reconnect(false));
        assert!(!manager.reconfigure_and_reconnect("x", "y"));
        assert!(!manager.disable_and_disconnect());
        assert_eq!(manager.discovery_address(), Some(AP_ADDRESS));
    }

    #[test]
    fn mixed_mode_rejects_station_only_controls() {
        let driver = Arc::new(SimWifiDriver::new());
        let config = CommConfig {
            wifi_mode: WifiMode::StationAccessPoint,
            sta_ssid: "shop".to_string(),
            ..Default::default()
        };
        let manager = WifiManager::new(driver.clone(), &config);
        driver.clear_calls();
        assert!(!manager.set_auto_reconnect(false));
        assert!(manager.auto_reconnect());
        assert!(!manager.reconfigure_and_reconnect("lab", "secret99"));
        assert!(!manager.disable_and_disconnect());
        assert!(!manager.reconnect_disabled());
        assert!(driver.calls().is_empty());
    }

    #[test]
    fn expected_leave_reconnects_without_auto_reconnect() {
        let (driver, manager) = station_manager();
        connected(&driver, &manager);
        manager.set_auto_reconnect(false);

        driver.emit(WifiEvent::StationDisconnected {
            reason: DisconnectReason::ASSOC_LEAVE,
        });
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert_eq!(driver.calls(), vec![SimWifiCall::Connect]);
    }

    #[test]
    fn unexpected_reason_stays_idle_without_auto_reconnect() {
        let (driver, manager) = station_manager();
        connected(&driver, &manager);
        manager.set_auto_reconnect(false);

        driver.emit(WifiEvent::StationDisconnected {
            reason: DisconnectReason::BEACON_TIMEOUT,
        });
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert!(driver.calls().is_empty());
    }

    #[test]
    fn auto_reconnect_retries_any_reason() {
        let (driver, manager) = station_manager();
        connected(&driver, &manager);
        driver.emit(WifiEvent::StationDisconnected {
            reason: DisconnectReason::NO_AP_FOUND,
        });
        assert!(manager.is_connecting());
    }

    #[test]
    fn reconfigure_while_connected_disconnects() {
        let (driver, manager) = station_manager();
        connected(&driver, &manager);
        assert!(manager.reconfigure_and_reconnect("lab", "secret99"));
        assert_eq!(
            driver.calls(),
            vec![
                SimWifiCall::SetStationConfig(StationCredentials::new("lab", "secret99")),
                SimWifiCall::Disconnect,
            ]
        );
    }

    #[test]
    fn reconfigure_while_idle_connects_and_accepts_already_connecting() {
        let (driver, manager) = station_manager();
        driver.fail_connect(Some(WifiDriverError::new(0x300f, WifiErrorKind::AlreadyConnecting)));
        assert!(manager.reconfigure_and_reconnect("lab", "secret99"));
        assert_eq!(
            driver.calls(),
            vec![
                SimWifiCall::SetStationConfig(StationCredentials::new("lab", "secret99")),
                SimWifiCall::Connect,
            ]
        );
        assert!(manager.is_connecting());
    }

    #[test]
    fn reconfigure_reports_connect_failure() {
        let (driver, manager) = station_manager();
        driver.fail_connect(Some(WifiDriverError::new(0x3002, WifiErrorKind::NotStarted)));
        assert!(!manager.reconfigure_and_reconnect("lab", "secret99"));
        assert_eq!(manager.state(), ConnectionState::Idle);
    }

    #[test]
    fn disable_blocks_reconnection() {
        let (driver, manager) = station_manager();
        connected(&driver, &manager);
        assert!(manager.disable_and_disconnect());
        assert!(manager.reconnect_disabled());

        driver.emit(WifiEvent::StationDisconnected {
            reason: DisconnectReason::ASSOC_LEAVE,
        });
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert_eq!(driver.calls(), vec![SimWifiCall::Disconnect]);
    }

    #[test]
    fn listener_sees_every_event() {
        let (driver, manager) = station_manager();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        manager.set_event_listener(Arc::new(move |event: &WifiEvent| {
            lock_recover(&sink).push(event.clone());
        }));
        driver.emit(WifiEvent::AccessPointClientJoined);
        driver.emit(WifiEvent::LostIp);
        assert_eq!(
            *lock_recover(&seen),
            vec![WifiEvent::AccessPointClientJoined, WifiEvent::LostIp]
        );
    }

    #[test]
    fn station_address_only_in_station_mode_discovery() {
        let (driver, manager) = station_manager();
        assert_eq!(manager.discovery_address(), None);
        connected(&driver, &manager);
        assert_eq!(manager.discovery_address(), Some(Ipv4Addr::new(10, 0, 0, 7)));
    }
}
