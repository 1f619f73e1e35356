// Communication configuration shared by the BLE, socket and discovery transports
// Loaded once at startup and treated as immutable afterwards

// Import logging macros
use log::{info, warn};

// Import Serde traits for JSON (de)serialization of the stored configuration
use serde::{Deserialize, Serialize};

use std::net::Ipv4Addr;
use std::time::Duration;

/// TCP port the local socket server listens on
pub const LOCAL_SERVER_PORT: u16 = 65102;

/// UDP port discovery announcements are broadcast to
pub const DISCOVERY_PORT: u16 = 65109;

/// Address the node owns on its own access point network
pub const AP_ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 4, 1);

// Field limits matching the radio stack's fixed-size buffers
pub const MAX_DEVICE_NAME_LEN: usize = 30;
pub const MAX_SSID_LEN: usize = 32;
pub const MAX_KEY_LEN: usize = 64;
pub const MAX_BLE_PIN: u32 = 999_999;

// Configuration error types
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    InvalidDeviceName(String),
    InvalidSsid(String),
    InvalidKey(String),
    InvalidHub(String),
    InvalidPin(u32),
    Parse(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidDeviceName(msg) => write!(f, "Invalid device name: {}", msg),
            ConfigError::InvalidSsid(msg) => write!(f, "Invalid SSID: {}", msg),
            ConfigError::InvalidKey(msg) => write!(f, "Invalid key: {}", msg),
            ConfigError::InvalidHub(msg) => write!(f, "Invalid hub configuration: {}", msg),
            ConfigError::InvalidPin(pin) => write!(f, "BLE PIN {} exceeds six digits", pin),
            ConfigError::Parse(msg) => write!(f, "Configuration parse error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Which WiFi interfaces the node brings up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WifiMode {
    #[default]
    Disabled,
    Station,
    AccessPoint,
    StationAccessPoint,
}

impl WifiMode {
    /// True when the node runs its own access point (discovery then announces AP_ADDRESS)
    pub fn has_access_point(&self) -> bool {
        matches!(self, WifiMode::AccessPoint | WifiMode::StationAccessPoint)
    }

    pub fn has_station(&self) -> bool {
        matches!(self, WifiMode::Station | WifiMode::StationAccessPoint)
    }
}

/// Outbound hub relay settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubConfig {
    pub host: String,
    pub port: u16,
    pub id: String,
    pub pass: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: "vedder.se".to_string(),
            port: 65101,
            id: String::new(),
            pass: String::new(),
        }
    }
}

impl HubConfig {
    /// Identification line sent right after the hub connection is established
    pub fn handshake(&self) -> Vec<u8> {
        let mut line = format!("VESC:{}:{}\n", self.id, self.pass).into_bytes();
        // The hub expects the terminating NUL as part of the line
        line.push(0);
        line
    }
}

/// Complete communication configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommConfig {
    pub wifi_mode: WifiMode,
    pub sta_ssid: String,
    pub sta_key: String,
    pub ap_ssid: String,
    pub ap_key: String,
    pub use_local_server: bool,
    pub use_hub: bool,
    pub hub: HubConfig,
    pub device_name: String, // Shared by BLE advertising and discovery announcements
    pub ble_enabled: bool,
    pub ble_pin: u32,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            wifi_mode: WifiMode::AccessPoint,
            sta_ssid: String::new(),
            sta_key: String::new(),
            ap_ssid: "VESC WiFi".to_string(),
            ap_key: "vesc6wifi".to_string(),
            use_local_server: true,
            use_hub: false,
            hub: HubConfig::default(),
            device_name: "VESC Express".to_string(),
            ble_enabled: true,
            ble_pin: 0,
        }
    }
}

impl CommConfig {
    /// Validate field lengths and cross-field requirements
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_name.is_empty() || self.device_name.len() > MAX_DEVICE_NAME_LEN {
            return Err(ConfigError::InvalidDeviceName(format!(
                "'{}' must be 1..={} bytes",
                self.device_name, MAX_DEVICE_NAME_LEN
            )));
        }

        for ssid in [&self.sta_ssid, &self.ap_ssid] {
            if ssid.len() > MAX_SSID_LEN {
                return Err(ConfigError::InvalidSsid(format!(
                    "'{}' exceeds {} bytes",
                    ssid, MAX_SSID_LEN
                )));
            }
        }

        if self.sta_key.len() > MAX_KEY_LEN || self.ap_key.len() > MAX_KEY_LEN {
            return Err(ConfigError::InvalidKey(format!(
                "keys may not exceed {} bytes",
                MAX_KEY_LEN
            )));
        }

        if self.use_hub {
            if self.hub.host.trim().is_empty() {
                return Err(ConfigError::InvalidHub("hub host is empty".to_string()));
            }
            if self.hub.port == 0 {
                return Err(ConfigError::InvalidHub("hub port is zero".to_string()));
            }
        }

        // The handshake line is colon and newline delimited
        for field in [&self.hub.id, &self.hub.pass] {
            if field.contains(':') || field.contains('\n') || field.contains('\0') {
                return Err(ConfigError::InvalidHub(format!(
                    "'{}' contains a reserved character",
                    field
                )));
            }
        }

        if self.ble_pin > MAX_BLE_PIN {
            return Err(ConfigError::InvalidPin(self.ble_pin));
        }

        Ok(())
    }

    /// Parse and validate a stored JSON configuration
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: CommConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        info!(
            "📋 Loaded comm config: mode={:?}, local={}, hub={}, name='{}'",
            config.wifi_mode, config.use_local_server, config.use_hub, config.device_name
        );
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load a stored configuration, falling back to defaults when it is missing or invalid
    pub fn load_or_default(json: Option<&str>) -> Self {
        match json {
            Some(json) => match Self::from_json(json) {
                Ok(config) => config,
                Err(e) => {
                    warn!("⚠️ Stored comm config rejected ({}), using defaults", e);
                    Self::default()
                }
            },
            None => Self::default(),
        }
    }
}

/// TCP socket options applied to every accepted or dialed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketTuning {
    pub keep_alive: bool,
    pub keep_idle: Duration,
    pub keep_interval: Duration,
    pub keep_count: u32,
    pub no_delay: bool,
    pub send_buffer: usize,
    pub recv_buffer: usize,
}

impl Default for SocketTuning {
    fn default() -> Self {
        // Short probes so a vanished peer is detected within a few seconds
        Self {
            keep_alive: true,
            keep_idle: Duration::from_secs(3),
            keep_interval: Duration::from_secs(2),
            keep_count: 5,
            no_delay: true,
            send_buffer: 64 * 1024,
            recv_buffer: 64 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(CommConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_long_device_name() {
        let config = CommConfig {
            device_name: "x".repeat(31),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDeviceName(_))
        ));
    }

    #[test]
    fn hub_requires_host_when_enabled() {
        let mut config = CommConfig {
            use_hub: true,
            ..Default::default()
        };
        config.hub.host = "  ".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidHub(_))));
    }

    #[test]
    fn hub_id_may_not_contain_separator() {
        let mut config = CommConfig::default();
        config.hub.id = "a:b".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidHub(_))));
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config = CommConfig::from_json(
            r#"{"wifi_mode":"station","sta_ssid":"shop","device_name":"Rig-7"}"#,
        )
        .unwrap();
        assert_eq!(config.wifi_mode, WifiMode::Station);
        assert_eq!(config.sta_ssid, "shop");
        assert_eq!(config.device_name, "Rig-7");
        assert!(config.use_local_server);
        assert_eq!(config.hub, HubConfig::default());
    }

    #[test]
    fn invalid_json_falls_back_to_defaults() {
        let config = CommConfig::load_or_default(Some("{not json"));
        assert_eq!(config, CommConfig::default());
    }

    #[test]
    fn handshake_line_is_nul_terminated() {
        let hub = HubConfig {
            id: "rig7".to_string(),
            pass: "secret".to_string(),
            ..Default::default()
        };
        assert_eq!(hub.handshake(), b"VESC:rig7:secret\n\0".to_vec());
    }

    #[test]
    fn access_point_modes() {
        assert!(WifiMode::AccessPoint.has_access_point());
        assert!(WifiMode::StationAccessPoint.has_access_point());
        assert!(!WifiMode::Station.has_access_point());
        assert!(WifiMode::StationAccessPoint.has_station());
    }
}
