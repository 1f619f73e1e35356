// Simulated radio stacks for host builds and tests
// The BLE stack confirms requests from a separate thread like the real callback task;
// peer activity and WiFi events are injected synchronously by the caller.

use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;

use crate::ble_server::lock_recover;
use crate::ble_stack::{
    BleStack, BleUuid, CharacteristicDef, DescriptorDef, StackError, StackEvent, StackEventHandler,
    STATUS_OK,
};
use crate::wifi_driver::{StationCredentials, WifiDriver, WifiDriverError, WifiEvent, WifiEventHandler};

/// First handle the simulated GATT database hands out
pub const SIM_FIRST_HANDLE: u16 = 100;

/// A request the simulated BLE stack received
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCall {
    RegisterApp,
    SetDeviceName(String),
    SetAdvData(Vec<u8>),
    SetScanResponse(Vec<u8>),
    StartAdvertising,
    StopAdvertising,
    CreateService(BleUuid, u16),
    AddCharacteristic(u16, BleUuid),
    AddDescriptor(u16, BleUuid),
    StartService(u16),
    DeleteService(u16),
    SetAttrValue(u16, Vec<u8>),
}

/// `(conn_id, handle, value, confirm)` of a pushed notification
pub type SimNotification = (u16, u16, Vec<u8>, bool);

struct SimBleState {
    handler: Option<StackEventHandler>,
    next_handle: u16,
    calls: Vec<SimCall>,
    notifications: Vec<SimNotification>,
    fail_characteristic: Option<i32>,
}

pub struct SimBleStack {
    state: Mutex<SimBleState>,
    responsive: AtomicBool,
}

impl Default for SimBleStack {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBleStack {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimBleState {
                handler: None,
                next_handle: SIM_FIRST_HANDLE,
                calls: Vec::new(),
                notifications: Vec::new(),
                fail_characteristic: None,
            }),
            responsive: AtomicBool::new(true),
        }
    }

    /// When false, requests are accepted but never confirmed
    pub fn set_responsive(&self, responsive: bool) {
        self.responsive.store(responsive, Ordering::Release);
    }

    /// Confirm the next characteristic add with a failure status
    pub fn fail_next_characteristic(&self, status: i32) {
        lock_recover(&self.state).fail_characteristic = Some(status);
    }

    pub fn calls(&self) -> Vec<SimCall> {
        lock_recover(&self.state).calls.clone()
    }

    pub fn notifications(&self) -> Vec<SimNotification> {
        lock_recover(&self.state).notifications.clone()
    }

    pub fn connect_peer(&self, conn_id: u16) {
        self.deliver(StackEvent::PeerConnected { conn_id });
    }

    pub fn disconnect_peer(&self, conn_id: u16) {
        self.deliver(StackEvent::PeerDisconnected {
            conn_id,
            reason: 0x13,
        });
    }

    pub fn peer_write(&self, conn_id: u16, handle: u16, value: &[u8]) {
        self.deliver(StackEvent::PeerWrite {
            conn_id,
            handle,
            value: value.to_vec(),
        });
    }

    /// Subscription reported by the stack itself rather than a CCCD write
    pub fn subscribe_peer(&self, conn_id: u16, handle: u16, notify: bool, indicate: bool) {
        self.deliver(StackEvent::SubscriptionChanged {
            conn_id,
            handle,
            notify,
            indicate,
        });
    }

    pub fn negotiate_mtu(&self, conn_id: u16, mtu: u16) {
        self.deliver(StackEvent::MtuChanged { conn_id, mtu });
    }

    // Peer-side events arrive on the caller's thread
    fn deliver(&self, event: StackEvent) {
        let handler = lock_recover(&self.state).handler.clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }

    // Completions arrive later from another thread
    fn record(&self, call: SimCall, completion: Option<StackEvent>) -> Result<(), StackError> {
        let handler = {
            let mut state = lock_recover(&self.state);
            state.calls.push(call);
            state.handler.clone()
        };
        if let (Some(handler), Some(event)) = (handler, completion) {
            if self.responsive.load(Ordering::Acquire) {
                thread::spawn(move || handler(event));
            } else {
                debug!("sim stack swallowing {:?}", event);
            }
        }
        Ok(())
    }

    fn allocate(&self) -> u16 {
        let mut state = lock_recover(&self.state);
        let handle = state.next_handle;
        state.next_handle += 1;
        handle
    }
}

impl BleStack for SimBleStack {
    fn set_event_handler(&self, handler: StackEventHandler) {
        lock_recover(&self.state).handler = Some(handler);
    }

    fn register_app(&self) -> Result<(), StackError> {
        self.record(SimCall::RegisterApp, Some(StackEvent::AppRegistered { status: STATUS_OK }))
    }

    fn set_device_name(&self, name: &str) -> Result<(), StackError> {
        self.record(SimCall::SetDeviceName(name.to_string()), None)
    }

    fn set_adv_data(&self, data: &[u8]) -> Result<(), StackError> {
        self.record(
            SimCall::SetAdvData(data.to_vec()),
            Some(StackEvent::AdvDataSet { status: STATUS_OK }),
        )
    }

    fn set_scan_response(&self, data: &[u8]) -> Result<(), StackError> {
        self.record(
            SimCall::SetScanResponse(data.to_vec()),
            Some(StackEvent::ScanResponseSet { status: STATUS_OK }),
        )
    }

    fn start_advertising(&self) -> Result<(), StackError> {
        self.record(SimCall::StartAdvertising, Some(StackEvent::AdvStarted { status: STATUS_OK }))
    }

    fn stop_advertising(&self) -> Result<(), StackError> {
        self.record(SimCall::StopAdvertising, Some(StackEvent::AdvStopped { status: STATUS_OK }))
    }

    fn create_service(&self, uuid: &BleUuid, num_handles: u16) -> Result<(), StackError> {
        let handle = self.allocate();
        self.record(
            SimCall::CreateService(*uuid, num_handles),
            Some(StackEvent::ServiceCreated {
                status: STATUS_OK,
                handle,
            }),
        )
    }

    fn add_characteristic(&self, service_handle: u16, def: &CharacteristicDef) -> Result<(), StackError> {
        let failure = lock_recover(&self.state).fail_characteristic.take();
        let event = match failure {
            Some(status) => StackEvent::CharacteristicAdded { status, handle: 0 },
            None => StackEvent::CharacteristicAdded {
                status: STATUS_OK,
                handle: self.allocate(),
            },
        };
        self.record(SimCall::AddCharacteristic(service_handle, def.uuid), Some(event))
    }

    fn add_descriptor(&self, service_handle: u16, def: &DescriptorDef) -> Result<(), StackError> {
        let handle = self.allocate();
        self.record(
            SimCall::AddDescriptor(service_handle, def.uuid),
            Some(StackEvent::DescriptorAdded {
                status: STATUS_OK,
                handle,
            }),
        )
    }

    fn start_service(&self, service_handle: u16) -> Result<(), StackError> {
        self.record(
            SimCall::StartService(service_handle),
            Some(StackEvent::ServiceStarted {
                status: STATUS_OK,
                handle: service_handle,
            }),
        )
    }

    fn delete_service(&self, service_handle: u16) -> Result<(), StackError> {
        self.record(
            SimCall::DeleteService(service_handle),
            Some(StackEvent::ServiceDeleted {
                status: STATUS_OK,
                handle: service_handle,
            }),
        )
    }

    fn set_attr_value(&self, handle: u16, value: &[u8]) -> Result<(), StackError> {
        self.record(SimCall::SetAttrValue(handle, value.to_vec()), None)
    }

    fn notify(&self, conn_id: u16, handle: u16, value: &[u8], confirm: bool) -> Result<(), StackError> {
        lock_recover(&self.state)
            .notifications
            .push((conn_id, handle, value.to_vec(), confirm));
        Ok(())
    }
}

/// A request the simulated WiFi driver received
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimWifiCall {
    Start,
    SetStationConfig(StationCredentials),
    Connect,
    Disconnect,
}

struct SimWifiState {
    handler: Option<WifiEventHandler>,
    calls: Vec<SimWifiCall>,
    connect_error: Option<WifiDriverError>,
    associated: bool,
    station_on_start: bool,
}

pub struct SimWifiDriver {
    state: Mutex<SimWifiState>,
}

impl Default for SimWifiDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SimWifiDriver {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimWifiState {
                handler: None,
                calls: Vec::new(),
                connect_error: None,
                associated: false,
                station_on_start: false,
            }),
        }
    }

    /// Driver whose `start` reports STA_START like a radio in station mode
    pub fn station() -> Self {
        let driver = Self::new();
        lock_recover(&driver.state).station_on_start = true;
        driver
    }

    /// Deliver a radio event on the caller's thread
    pub fn emit(&self, event: WifiEvent) {
        let handler = {
            let mut state = lock_recover(&self.state);
            match event {
                WifiEvent::StationConnected | WifiEvent::GotIp(_) => state.associated = true,
                WifiEvent::StationDisconnected { .. } | WifiEvent::StationStopped => {
                    state.associated = false
                }
                _ => {}
            }
            state.handler.clone()
        };
        if let Some(handler) = handler {
            handler(event);
        }
    }

    /// Make every following `connect` fail with `error`
    pub fn fail_connect(&self, error: Option<WifiDriverError>) {
        lock_recover(&self.state).connect_error = error;
    }

    pub fn calls(&self) -> Vec<SimWifiCall> {
        lock_recover(&self.state).calls.clone()
    }

    pub fn clear_calls(&self) {
        lock_recover(&self.state).calls.clear();
    }
}

impl WifiDriver for SimWifiDriver {
    fn set_event_handler(&self, handler: WifiEventHandler) {
        lock_recover(&self.state).handler = Some(handler);
    }

    fn start(&self) -> Result<(), WifiDriverError> {
        let station = {
            let mut state = lock_recover(&self.state);
            state.calls.push(SimWifiCall::Start);
            state.station_on_start
        };
        if station {
            self.emit(WifiEvent::StationStarted);
        }
        Ok(())
    }

    fn set_station_config(&self, credentials: &StationCredentials) -> Result<(), WifiDriverError> {
        lock_recover(&self.state)
            .calls
            .push(SimWifiCall::SetStationConfig(credentials.clone()));
        Ok(())
    }

    fn connect(&self) -> Result<(), WifiDriverError> {
        let mut state = lock_recover(&self.state);
        state.calls.push(SimWifiCall::Connect);
        match state.connect_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn disconnect(&self) -> Result<(), WifiDriverError> {
        lock_recover(&self.state).calls.push(SimWifiCall::Disconnect);
        Ok(())
    }

    fn is_associated(&self) -> bool {
        lock_recover(&self.state).associated
    }
}
