// ESP-IDF WiFi driver behind the `WifiDriver` trait
// Station connect/disconnect go straight to the IDF so the reconnect policy
// stays in `WifiManager`; WIFI_EVENT/IP_EVENT are forwarded as `WifiEvent`.

// Import logging macros
use log::{debug, error, info, warn};

// Import ESP-IDF WiFi types
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::hal::modem::WifiModemPeripheral;
use esp_idf_svc::hal::peripheral::Peripheral;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::sys::{self as esp_idf_sys, EspError};
use esp_idf_svc::wifi::EspWifi;

// Import WiFi configuration traits and types
use embedded_svc::wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration};

// Standard library imports
use std::ffi::c_void;
use std::net::Ipv4Addr;
use std::sync::{Mutex, OnceLock};

use crate::ble_server::lock_recover;
use crate::config::{CommConfig, WifiMode};
use crate::wifi_driver::{
    DisconnectReason, StationCredentials, WifiDriver, WifiDriverError, WifiErrorKind, WifiEvent,
    WifiEventHandler,
};

// Handler the IDF event callbacks forward into
static EVENT_HANDLER: OnceLock<Mutex<Option<WifiEventHandler>>> = OnceLock::new();

fn dispatch(event: WifiEvent) {
    let handler = EVENT_HANDLER
        .get()
        .and_then(|slot| lock_recover(slot).clone());
    match handler {
        Some(handler) => handler(event),
        None => debug!("WiFi event without handler: {:?}", event),
    }
}

fn classify(code: esp_idf_sys::esp_err_t) -> WifiDriverError {
    let kind = match code as u32 {
        esp_idf_sys::ESP_ERR_WIFI_CONN => WifiErrorKind::AlreadyConnecting,
        esp_idf_sys::ESP_ERR_WIFI_NOT_STARTED => WifiErrorKind::NotStarted,
        esp_idf_sys::ESP_ERR_WIFI_NOT_INIT => WifiErrorKind::NotInitialized,
        esp_idf_sys::ESP_ERR_INVALID_ARG => WifiErrorKind::InvalidArgument,
        _ => WifiErrorKind::Other,
    };
    WifiDriverError::new(code, kind)
}

fn check(code: esp_idf_sys::esp_err_t) -> Result<(), WifiDriverError> {
    if code == esp_idf_sys::ESP_OK {
        Ok(())
    } else {
        Err(classify(code))
    }
}

fn from_esp(e: EspError) -> WifiDriverError {
    classify(e.code())
}

fn invalid_arg() -> EspError {
    EspError::from_infallible::<{ esp_idf_sys::ESP_ERR_INVALID_ARG }>()
}

fn auth_method(key: &str) -> AuthMethod {
    if key.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPA2Personal
    }
}

fn client_configuration(credentials: &StationCredentials) -> Result<ClientConfiguration, EspError> {
    Ok(ClientConfiguration {
        ssid: credentials.ssid.as_str().try_into().map_err(|_| {
            error!("Invalid SSID format");
            invalid_arg()
        })?,
        password: credentials.key.as_str().try_into().map_err(|_| {
            error!("Invalid password format");
            invalid_arg()
        })?,
        channel: None,
        auth_method: auth_method(&credentials.key),
        ..Default::default()
    })
}

fn access_point_configuration(config: &CommConfig) -> Result<AccessPointConfiguration, EspError> {
    Ok(AccessPointConfiguration {
        ssid: config.ap_ssid.as_str().try_into().map_err(|_| invalid_arg())?,
        password: config.ap_key.as_str().try_into().map_err(|_| invalid_arg())?,
        auth_method: auth_method(&config.ap_key),
        ..Default::default()
    })
}

/// IDF WiFi in the mode the configuration asks for
pub struct EspWifiDriver {
    wifi: Mutex<EspWifi<'static>>,
    access_point: Option<AccessPointConfiguration>,
    configured: bool,
}

impl EspWifiDriver {
    /// Configure the radio; `start` brings it up, nothing is done for `WifiMode::Disabled`
    pub fn new<M: WifiModemPeripheral>(
        modem: impl Peripheral<P = M> + 'static,
        sys_loop: EspSystemEventLoop,
        nvs: EspDefaultNvsPartition,
        config: &CommConfig,
    ) -> Result<Self, EspError> {
        EVENT_HANDLER.get_or_init(|| Mutex::new(None));
        let mut wifi = EspWifi::new(modem, sys_loop, Some(nvs))?;

        let access_point = if config.wifi_mode.has_access_point() {
            Some(access_point_configuration(config)?)
        } else {
            None
        };
        let station = StationCredentials::new(&config.sta_ssid, &config.sta_key);

        register_event_handlers()?;

        let initial = match (config.wifi_mode, &access_point) {
            (WifiMode::Disabled, _) => None,
            (WifiMode::Station, _) => Some(Configuration::Client(client_configuration(&station)?)),
            (WifiMode::AccessPoint, Some(ap)) => Some(Configuration::AccessPoint(ap.clone())),
            (_, Some(ap)) => Some(Configuration::Mixed(client_configuration(&station)?, ap.clone())),
            (_, None) => None,
        };
        let configured = initial.is_some();
        if let Some(initial) = initial {
            wifi.set_configuration(&initial)?;
            info!("📶 WiFi configured in {:?} mode", config.wifi_mode);
        }

        Ok(Self {
            wifi: Mutex::new(wifi),
            access_point,
            configured,
        })
    }
}

impl WifiDriver for EspWifiDriver {
    fn set_event_handler(&self, handler: WifiEventHandler) {
        let slot = EVENT_HANDLER.get_or_init(|| Mutex::new(None));
        *lock_recover(slot) = Some(handler);
    }

    fn start(&self) -> Result<(), WifiDriverError> {
        if !self.configured {
            return Ok(());
        }
        lock_recover(&self.wifi).start().map_err(from_esp)?;
        info!("📶 WiFi started");
        Ok(())
    }

    fn set_station_config(&self, credentials: &StationCredentials) -> Result<(), WifiDriverError> {
        let client = client_configuration(credentials).map_err(from_esp)?;
        let configuration = match &self.access_point {
            Some(ap) => Configuration::Mixed(client, ap.clone()),
            None => Configuration::Client(client),
        };
        lock_recover(&self.wifi)
            .set_configuration(&configuration)
            .map_err(from_esp)
    }

    fn connect(&self) -> Result<(), WifiDriverError> {
        check(unsafe { esp_idf_sys::esp_wifi_connect() })
    }

    fn disconnect(&self) -> Result<(), WifiDriverError> {
        check(unsafe { esp_idf_sys::esp_wifi_disconnect() })
    }

    fn is_associated(&self) -> bool {
        let mut info = esp_idf_sys::wifi_ap_record_t::default();
        unsafe { esp_idf_sys::esp_wifi_sta_get_ap_info(&mut info) == esp_idf_sys::ESP_OK }
    }
}

fn register_event_handlers() -> Result<(), EspError> {
    esp_idf_sys::esp!(unsafe {
        esp_idf_sys::esp_event_handler_register(
            esp_idf_sys::WIFI_EVENT,
            esp_idf_sys::ESP_EVENT_ANY_ID,
            Some(idf_event_handler),
            std::ptr::null_mut(),
        )
    })?;
    esp_idf_sys::esp!(unsafe {
        esp_idf_sys::esp_event_handler_register(
            esp_idf_sys::IP_EVENT,
            esp_idf_sys::ESP_EVENT_ANY_ID,
            Some(idf_event_handler),
            std::ptr::null_mut(),
        )
    })
}

extern "C" fn idf_event_handler(
    _arg: *mut c_void,
    event_base: esp_idf_sys::esp_event_base_t,
    event_id: i32,
    event_data: *mut c_void,
) {
    let result = std::panic::catch_unwind(|| idf_event_handler_impl(event_base, event_id, event_data));
    if let Err(panic_info) = result {
        error!("🚨 PANIC in WiFi event handler: {:?}", panic_info);
    }
}

fn idf_event_handler_impl(
    event_base: esp_idf_sys::esp_event_base_t,
    event_id: i32,
    event_data: *mut c_void,
) {
    let event_id = event_id as u32;
    let mapped = if event_base == unsafe { esp_idf_sys::WIFI_EVENT } {
        match event_id {
            esp_idf_sys::wifi_event_t_WIFI_EVENT_STA_START => WifiEvent::StationStarted,
            esp_idf_sys::wifi_event_t_WIFI_EVENT_STA_STOP => WifiEvent::StationStopped,
            esp_idf_sys::wifi_event_t_WIFI_EVENT_STA_CONNECTED => WifiEvent::StationConnected,
            esp_idf_sys::wifi_event_t_WIFI_EVENT_STA_DISCONNECTED => {
                let reason = if event_data.is_null() {
                    DisconnectReason::UNSPECIFIED
                } else {
                    let data = unsafe { &*(event_data as *const esp_idf_sys::wifi_event_sta_disconnected_t) };
                    DisconnectReason(data.reason as u16)
                };
                WifiEvent::StationDisconnected { reason }
            }
            esp_idf_sys::wifi_event_t_WIFI_EVENT_AP_START => WifiEvent::AccessPointStarted,
            esp_idf_sys::wifi_event_t_WIFI_EVENT_AP_STOP => WifiEvent::AccessPointStopped,
            esp_idf_sys::wifi_event_t_WIFI_EVENT_AP_STACONNECTED => WifiEvent::AccessPointClientJoined,
            esp_idf_sys::wifi_event_t_WIFI_EVENT_AP_STADISCONNECTED => WifiEvent::AccessPointClientLeft,
            _ => return,
        }
    } else if event_base == unsafe { esp_idf_sys::IP_EVENT } {
        match event_id {
            esp_idf_sys::ip_event_t_IP_EVENT_STA_GOT_IP => {
                if event_data.is_null() {
                    warn!("⚠️ GOT_IP without payload");
                    return;
                }
                let data = unsafe { &*(event_data as *const esp_idf_sys::ip_event_got_ip_t) };
                WifiEvent::GotIp(Ipv4Addr::from(data.ip_info.ip.addr.to_le_bytes()))
            }
            esp_idf_sys::ip_event_t_IP_EVENT_STA_LOST_IP => WifiEvent::LostIp,
            _ => return,
        }
    } else {
        return;
    };
    dispatch(mapped);
}
