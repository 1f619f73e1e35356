// Packet transports for a motor-controller bridge: BLE GATT, local TCP,
// outbound hub TCP and UDP discovery, sharing one packet boundary.

pub mod ble_advertising;
pub mod ble_server;
pub mod ble_stack;
pub mod ble_transport;
pub mod comm;
pub mod config;
pub mod discovery;
pub mod packet;
pub mod retry;
pub mod tcp_hub;
pub mod tcp_local;
pub mod tcp_transport;
pub mod wifi_driver;
pub mod wifi_manager;
pub mod worker;

// Radio backends
#[cfg(target_os = "espidf")]
pub mod esp_ble;
#[cfg(target_os = "espidf")]
pub mod esp_wifi;
#[cfg(not(target_os = "espidf"))]
pub mod sim;

pub use comm::{CommNode, CommParts};
pub use config::CommConfig;
