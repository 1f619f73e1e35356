// Bluedroid GATT server/GAP bindings behind the `BleStack` trait

// Import logging macros
use log::{debug, error, warn};

// Import ESP-IDF Bluetooth driver and raw bindings
use esp_idf_svc::bt::{Ble, BtDriver};
use esp_idf_svc::sys as esp_idf_sys;

// Standard library imports
use std::ffi::CString;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::ble_server::lock_recover;
use crate::ble_stack::{
    BleStack, BleUuid, CharacteristicDef, DescriptorDef, StackError, StackEvent, StackEventHandler,
};

// Handler the C callbacks forward into
static EVENT_HANDLER: OnceLock<Mutex<Option<StackEventHandler>>> = OnceLock::new();

// GATT interface assigned at app registration
static GATT_INTERFACE: AtomicU8 = AtomicU8::new(esp_idf_sys::ESP_GATT_IF_NONE as u8);

// Advertising interval in 0.625 ms units
const ADV_INTERVAL_MIN: u16 = 0x20;
const ADV_INTERVAL_MAX: u16 = 0x40;

fn dispatch(event: StackEvent) {
    let handler = EVENT_HANDLER
        .get()
        .and_then(|slot| lock_recover(slot).clone());
    match handler {
        Some(handler) => handler(event),
        None => debug!("BLE event without handler: {:?}", event),
    }
}

fn call_esp_api_with_context<F>(f: F, context: &str) -> Result<(), StackError>
where
    F: FnOnce() -> esp_idf_sys::esp_err_t,
{
    let result = f();
    if result == esp_idf_sys::ESP_OK {
        Ok(())
    } else {
        warn!("⚠️ {} failed: 0x{:x}", context, result);
        Err(StackError(result))
    }
}

fn to_esp_uuid(uuid: &BleUuid) -> esp_idf_sys::esp_bt_uuid_t {
    match uuid {
        BleUuid::Uuid16(value) => esp_idf_sys::esp_bt_uuid_t {
            len: esp_idf_sys::ESP_UUID_LEN_16 as u16,
            uuid: esp_idf_sys::esp_bt_uuid_t__bindgen_ty_1 { uuid16: *value },
        },
        BleUuid::Uuid32(value) => esp_idf_sys::esp_bt_uuid_t {
            len: esp_idf_sys::ESP_UUID_LEN_32 as u16,
            uuid: esp_idf_sys::esp_bt_uuid_t__bindgen_ty_1 { uuid32: *value },
        },
        BleUuid::Uuid128(_) => {
            let mut uuid128 = [0u8; 16];
            uuid128.copy_from_slice(&uuid.to_le_bytes());
            esp_idf_sys::esp_bt_uuid_t {
                len: esp_idf_sys::ESP_UUID_LEN_128 as u16,
                uuid: esp_idf_sys::esp_bt_uuid_t__bindgen_ty_1 { uuid128 },
            }
        }
    }
}

fn gatt_interface() -> esp_idf_sys::esp_gatt_if_t {
    GATT_INTERFACE.load(Ordering::Acquire)
}

/// ESP32 Bluedroid stack; owns the BT driver for its lifetime
pub struct EspBleStack {
    _driver: BtDriver<'static, Ble>,
}

impl EspBleStack {
    /// Wrap an initialized driver and hook the GATTS/GAP callbacks
    pub fn new(driver: BtDriver<'static, Ble>) -> Result<Self, StackError> {
        EVENT_HANDLER.get_or_init(|| Mutex::new(None));
        call_esp_api_with_context(
            || unsafe { esp_idf_sys::esp_ble_gatts_register_callback(Some(gatts_event_handler)) },
            "GATT server callback registration",
        )?;
        call_esp_api_with_context(
            || unsafe { esp_idf_sys::esp_ble_gap_register_callback(Some(gap_event_handler)) },
            "GAP callback registration",
        )?;
        Ok(Self { _driver: driver })
    }
}

impl BleStack for EspBleStack {
    fn set_event_handler(&self, handler: StackEventHandler) {
        let slot = EVENT_HANDLER.get_or_init(|| Mutex::new(None));
        *lock_recover(slot) = Some(handler);
    }

    fn register_app(&self) -> Result<(), StackError> {
        call_esp_api_with_context(
            || unsafe { esp_idf_sys::esp_ble_gatts_app_register(0) },
            "GATT application registration",
        )
    }

    fn set_device_name(&self, name: &str) -> Result<(), StackError> {
        let name = CString::new(name).map_err(|_| StackError(esp_idf_sys::ESP_ERR_INVALID_ARG))?;
        call_esp_api_with_context(
            || unsafe { esp_idf_sys::esp_ble_gap_set_device_name(name.as_ptr()) },
            "device name",
        )
    }

    fn set_adv_data(&self, data: &[u8]) -> Result<(), StackError> {
        let mut raw = data.to_vec();
        call_esp_api_with_context(
            || unsafe { esp_idf_sys::esp_ble_gap_config_adv_data_raw(raw.as_mut_ptr(), raw.len() as u32) },
            "raw advertising data",
        )
    }

    fn set_scan_response(&self, data: &[u8]) -> Result<(), StackError> {
        let mut raw = data.to_vec();
        call_esp_api_with_context(
            || unsafe {
                esp_idf_sys::esp_ble_gap_config_scan_rsp_data_raw(raw.as_mut_ptr(), raw.len() as u32)
            },
            "raw scan response",
        )
    }

    fn start_advertising(&self) -> Result<(), StackError> {
        let mut params = esp_idf_sys::esp_ble_adv_params_t {
            adv_int_min: ADV_INTERVAL_MIN,
            adv_int_max: ADV_INTERVAL_MAX,
            adv_type: esp_idf_sys::esp_ble_adv_type_t_ADV_TYPE_IND,
            own_addr_type: esp_idf_sys::esp_ble_addr_type_t_BLE_ADDR_TYPE_PUBLIC,
            channel_map: esp_idf_sys::esp_ble_adv_channel_t_ADV_CHNL_ALL,
            adv_filter_policy: esp_idf_sys::esp_ble_adv_filter_t_ADV_FILTER_ALLOW_SCAN_ANY_CON_ANY,
            ..Default::default()
        };
        call_esp_api_with_context(
            || unsafe { esp_idf_sys::esp_ble_gap_start_advertising(&mut params) },
            "advertising start",
        )
    }

    fn stop_advertising(&self) -> Result<(), StackError> {
        call_esp_api_with_context(
            || unsafe { esp_idf_sys::esp_ble_gap_stop_advertising() },
            "advertising stop",
        )
    }

    fn create_service(&self, uuid: &BleUuid, num_handles: u16) -> Result<(), StackError> {
        let mut service_id = esp_idf_sys::esp_gatt_srvc_id_t {
            is_primary: true,
            id: esp_idf_sys::esp_gatt_id_t {
                uuid: to_esp_uuid(uuid),
                inst_id: 0,
            },
        };
        call_esp_api_with_context(
            || unsafe {
                esp_idf_sys::esp_ble_gatts_create_service(gatt_interface(), &mut service_id, num_handles)
            },
            "service creation",
        )
    }

    fn add_characteristic(&self, service_handle: u16, def: &CharacteristicDef) -> Result<(), StackError> {
        let mut uuid = to_esp_uuid(&def.uuid);
        let mut value = def.value.clone();
        let mut attr_value = esp_idf_sys::esp_attr_value_t {
            attr_max_len: def.max_len,
            attr_len: value.len() as u16,
            attr_value: value.as_mut_ptr(),
        };
        let mut control = esp_idf_sys::esp_attr_control_t {
            auto_rsp: esp_idf_sys::ESP_GATT_AUTO_RSP as u8,
        };
        call_esp_api_with_context(
            || unsafe {
                esp_idf_sys::esp_ble_gatts_add_char(
                    service_handle,
                    &mut uuid,
                    def.permissions.bits(),
                    def.properties.bits(),
                    &mut attr_value,
                    &mut control,
                )
            },
            "characteristic add",
        )
    }

    fn add_descriptor(&self, service_handle: u16, def: &DescriptorDef) -> Result<(), StackError> {
        let mut uuid = to_esp_uuid(&def.uuid);
        let mut value = def.value.clone();
        let mut attr_value = esp_idf_sys::esp_attr_value_t {
            attr_max_len: def.max_len,
            attr_len: value.len() as u16,
            attr_value: value.as_mut_ptr(),
        };
        let mut control = esp_idf_sys::esp_attr_control_t {
            auto_rsp: esp_idf_sys::ESP_GATT_AUTO_RSP as u8,
        };
        call_esp_api_with_context(
            || unsafe {
                esp_idf_sys::esp_ble_gatts_add_char_descr(
                    service_handle,
                    &mut uuid,
                    def.permissions.bits(),
                    &mut attr_value,
                    &mut control,
                )
            },
            "descriptor add",
        )
    }

    fn start_service(&self, service_handle: u16) -> Result<(), StackError> {
        call_esp_api_with_context(
            || unsafe { esp_idf_sys::esp_ble_gatts_start_service(service_handle) },
            "service start",
        )
    }

    fn delete_service(&self, service_handle: u16) -> Result<(), StackError> {
        call_esp_api_with_context(
            || unsafe { esp_idf_sys::esp_ble_gatts_delete_service(service_handle) },
            "service delete",
        )
    }

    fn set_attr_value(&self, handle: u16, value: &[u8]) -> Result<(), StackError> {
        call_esp_api_with_context(
            || unsafe { esp_idf_sys::esp_ble_gatts_set_attr_value(handle, value.len() as u16, value.as_ptr()) },
            "attribute value",
        )
    }

    fn notify(&self, conn_id: u16, handle: u16, value: &[u8], confirm: bool) -> Result<(), StackError> {
        let mut data = value.to_vec();
        call_esp_api_with_context(
            || unsafe {
                esp_idf_sys::esp_ble_gatts_send_indicate(
                    gatt_interface(),
                    conn_id,
                    handle,
                    data.len() as u16,
                    data.as_mut_ptr(),
                    confirm,
                )
            },
            "notification",
        )
    }
}

extern "C" fn gatts_event_handler(
    event: esp_idf_sys::esp_gatts_cb_event_t,
    gatt_interface: esp_idf_sys::esp_gatt_if_t,
    event_param: *mut esp_idf_sys::esp_ble_gatts_cb_param_t,
) {
    let result =
        std::panic::catch_unwind(|| gatts_event_handler_impl(event, gatt_interface, event_param));
    if let Err(panic_info) = result {
        error!("🚨 PANIC in GATT event handler: {:?}", panic_info);
    }
}

fn gatts_event_handler_impl(
    event: esp_idf_sys::esp_gatts_cb_event_t,
    gatt_interface: esp_idf_sys::esp_gatt_if_t,
    event_param: *mut esp_idf_sys::esp_ble_gatts_cb_param_t,
) {
    if event_param.is_null() {
        warn!("⚠️ GATT event {} without parameters", event);
        return;
    }

    let mapped = match event {
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_REG_EVT => {
            let reg = unsafe { &(*event_param).reg };
            if reg.status == esp_idf_sys::esp_gatt_status_t_ESP_GATT_OK {
                GATT_INTERFACE.store(gatt_interface, Ordering::Release);
            }
            StackEvent::AppRegistered {
                status: reg.status as i32,
            }
        }
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_CREATE_EVT => {
            let create = unsafe { &(*event_param).create };
            StackEvent::ServiceCreated {
                status: create.status as i32,
                handle: create.service_handle,
            }
        }
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_ADD_CHAR_EVT => {
            let add_char = unsafe { &(*event_param).add_char };
            StackEvent::CharacteristicAdded {
                status: add_char.status as i32,
                handle: add_char.attr_handle,
            }
        }
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_ADD_CHAR_DESCR_EVT => {
            let add_descr = unsafe { &(*event_param).add_char_descr };
            StackEvent::DescriptorAdded {
                status: add_descr.status as i32,
                handle: add_descr.attr_handle,
            }
        }
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_START_EVT => {
            let start = unsafe { &(*event_param).start };
            StackEvent::ServiceStarted {
                status: start.status as i32,
                handle: start.service_handle,
            }
        }
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_DELETE_EVT => {
            let delete = unsafe { &(*event_param).del };
            StackEvent::ServiceDeleted {
                status: delete.status as i32,
                handle: delete.service_handle,
            }
        }
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_CONNECT_EVT => {
            let connect = unsafe { &(*event_param).connect };
            StackEvent::PeerConnected {
                conn_id: connect.conn_id,
            }
        }
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_DISCONNECT_EVT => {
            let disconnect = unsafe { &(*event_param).disconnect };
            StackEvent::PeerDisconnected {
                conn_id: disconnect.conn_id,
                reason: disconnect.reason as u16,
            }
        }
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_MTU_EVT => {
            let mtu = unsafe { &(*event_param).mtu };
            StackEvent::MtuChanged {
                conn_id: mtu.conn_id,
                mtu: mtu.mtu,
            }
        }
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_WRITE_EVT => {
            let write = unsafe { &(*event_param).write };
            if write.is_prep {
                // Long writes are not reassembled
                debug!("ignoring prepared write on handle {}", write.handle);
                return;
            }
            let value = if write.value.is_null() || write.len == 0 {
                Vec::new()
            } else {
                unsafe { std::slice::from_raw_parts(write.value, write.len as usize) }.to_vec()
            };
            StackEvent::PeerWrite {
                conn_id: write.conn_id,
                handle: write.handle,
                value,
            }
        }
        _ => {
            debug!("unhandled GATT event {}", event);
            return;
        }
    };
    dispatch(mapped);
}

extern "C" fn gap_event_handler(
    event: esp_idf_sys::esp_gap_ble_cb_event_t,
    param: *mut esp_idf_sys::esp_ble_gap_cb_param_t,
) {
    let result = std::panic::catch_unwind(|| gap_event_handler_impl(event, param));
    if let Err(panic_info) = result {
        error!("🚨 PANIC in GAP event handler: {:?}", panic_info);
    }
}

fn gap_event_handler_impl(
    event: esp_idf_sys::esp_gap_ble_cb_event_t,
    param: *mut esp_idf_sys::esp_ble_gap_cb_param_t,
) {
    if param.is_null() {
        warn!("⚠️ GAP event {} without parameters", event);
        return;
    }

    let mapped = match event {
        esp_idf_sys::esp_gap_ble_cb_event_t_ESP_GAP_BLE_ADV_DATA_RAW_SET_COMPLETE_EVT => {
            let complete = unsafe { &(*param).adv_data_raw_cmpl };
            StackEvent::AdvDataSet {
                status: complete.status as i32,
            }
        }
        esp_idf_sys::esp_gap_ble_cb_event_t_ESP_GAP_BLE_SCAN_RSP_DATA_RAW_SET_COMPLETE_EVT => {
            let complete = unsafe { &(*param).scan_rsp_data_raw_cmpl };
            StackEvent::ScanResponseSet {
                status: complete.status as i32,
            }
        }
        esp_idf_sys::esp_gap_ble_cb_event_t_ESP_GAP_BLE_ADV_START_COMPLETE_EVT => {
            let complete = unsafe { &(*param).adv_start_cmpl };
            StackEvent::AdvStarted {
                status: complete.status as i32,
            }
        }
        esp_idf_sys::esp_gap_ble_cb_event_t_ESP_GAP_BLE_ADV_STOP_COMPLETE_EVT => {
            let complete = unsafe { &(*param).adv_stop_cmpl };
            StackEvent::AdvStopped {
                status: complete.status as i32,
            }
        }
        _ => {
            debug!("unhandled GAP event {}", event);
            return;
        }
    };
    dispatch(mapped);
}
