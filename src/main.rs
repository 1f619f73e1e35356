use std::sync::Arc;
use std::thread;
use std::time::Duration;

use vesc_link::packet::{echo_handler, FramedPacketBoundary};
use vesc_link::{CommConfig, CommNode, CommParts};

#[cfg(target_os = "espidf")]
fn main() -> anyhow::Result<()> {
    use esp_idf_hal::peripherals::Peripherals;
    use esp_idf_svc::bt::{Ble, BtDriver};
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use vesc_link::esp_ble::EspBleStack;
    use vesc_link::esp_wifi::EspWifiDriver;

    // It is necessary to call this function once. Otherwise some patches to the runtime
    // implemented by esp-idf-sys might not link properly. See https://github.com/esp-rs/esp-idf-template/issues/71
    esp_idf_svc::sys::link_patches();

    // Bind the log crate to the ESP Logging facilities
    esp_idf_svc::log::EspLogger::initialize_default();

    log::info!("🚀 Starting vesc-link");

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;
    let config = CommConfig::default();

    // WiFi and Bluetooth share the radio
    let (wifi_modem, bt_modem) = peripherals.modem.split();
    let wifi = EspWifiDriver::new(wifi_modem, sys_loop, nvs.clone(), &config)?;
    let ble = if config.ble_enabled {
        let driver = BtDriver::<Ble>::new(bt_modem, Some(nvs))?;
        Some(Arc::new(EspBleStack::new(driver)?) as Arc<dyn vesc_link::ble_stack::BleStack>)
    } else {
        None
    };

    let parts = CommParts::new(
        Arc::new(wifi),
        ble,
        Arc::new(FramedPacketBoundary),
        echo_handler(),
    );
    let _node = CommNode::start(config, parts)?;

    loop {
        thread::sleep(Duration::from_secs(1));
    }
}

#[cfg(not(target_os = "espidf"))]
fn main() -> anyhow::Result<()> {
    use anyhow::Context;
    use vesc_link::sim::{SimBleStack, SimWifiDriver};

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("🚀 Starting vesc-link on the simulated radio");

    // Optional JSON configuration file as the only argument
    let stored = match std::env::args().nth(1) {
        Some(path) => Some(std::fs::read_to_string(&path).with_context(|| format!("reading {}", path))?),
        None => None,
    };
    let config = CommConfig::load_or_default(stored.as_deref());

    let parts = CommParts::new(
        Arc::new(SimWifiDriver::new()),
        Some(Arc::new(SimBleStack::new())),
        Arc::new(FramedPacketBoundary),
        echo_handler(),
    );
    let node = CommNode::start(config, parts)?;
    if let Some(port) = node.local_port() {
        log::info!("📡 Local packet server on port {}", port);
    }

    loop {
        thread::sleep(Duration::from_secs(1));
    }
}
