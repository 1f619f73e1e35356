// UDP discovery broadcaster announcing `<name>::<address>::<port>`

use log::{debug, info, warn};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::DISCOVERY_PORT;
use crate::retry::DISCOVERY_PERIOD;
use crate::wifi_manager::WifiManager;
use crate::worker::{nap, WorkerHandle};

/// Announcement text for one node
pub fn announcement(name: &str, address: Ipv4Addr, port: u16) -> String {
    format!("{}::{}::{}", name, address, port)
}

/// Datagram payload: the announcement plus a terminating NUL
pub fn datagram(name: &str, address: Ipv4Addr, port: u16) -> Vec<u8> {
    let mut bytes = announcement(name, address, port).into_bytes();
    bytes.push(0);
    bytes
}

pub struct DiscoveryBroadcaster {
    name: String,
    announced_port: u16,
    destination: SocketAddr,
    period: Duration,
    manager: Arc<WifiManager>,
}

impl DiscoveryBroadcaster {
    pub fn new(name: &str, announced_port: u16, manager: Arc<WifiManager>) -> Self {
        Self {
            name: name.to_string(),
            announced_port,
            destination: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, DISCOVERY_PORT)),
            period: DISCOVERY_PERIOD,
            manager,
        }
    }

    pub fn with_destination(mut self, destination: SocketAddr) -> Self {
        self.destination = destination;
        self
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Current announcement, `None` while the node has no reachable address
    pub fn current(&self) -> Option<Vec<u8>> {
        self.manager
            .discovery_address()
            .map(|address| datagram(&self.name, address, self.announced_port))
    }

    /// Send one announcement; false when skipped for lack of an address
    pub fn announce_once(&self, socket: &UdpSocket) -> io::Result<bool> {
        match self.current() {
            Some(payload) => {
                socket.send_to(&payload, self.destination)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn spawn(self) -> io::Result<WorkerHandle> {
        WorkerHandle::spawn("discovery", move |stop| self.run(&stop))
    }

    pub fn run(&self, stop: &AtomicBool) {
        let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).and_then(|s| {
            s.set_broadcast(true)?;
            Ok(s)
        }) {
            Ok(socket) => socket,
            Err(e) => {
                warn!("⚠️ Discovery socket unavailable: {}", e);
                return;
            }
        };
        info!("📣 Announcing '{}' to {}", self.name, self.destination);

        while !stop.load(Ordering::Acquire) {
            match self.announce_once(&socket) {
                Ok(true) => {}
                Ok(false) => debug!("no address yet, discovery skipped"),
                Err(e) => debug!("discovery send failed: {}", e),
            }
            if !nap(stop, self.period) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommConfig, WifiMode, AP_ADDRESS, LOCAL_SERVER_PORT};
    use crate::sim::SimWifiDriver;
    use crate::wifi_driver::WifiEvent;

    #[test]
    fn announcement_format() {
        let text = announcement("Rig-7", Ipv4Addr::new(10, 0, 0, 7), LOCAL_SERVER_PORT);
        assert_eq!(text, "Rig-7::10.0.0.7::65102");
        assert_eq!(text.matches("::").count(), 2);
        assert_eq!(datagram("a", AP_ADDRESS, 1).last(), Some(&0));
    }

    #[test]
    fn access_point_address_wins_over_station_address() {
        let driver = Arc::new(SimWifiDriver::new());
        let config = CommConfig {
            wifi_mode: WifiMode::StationAccessPoint,
            ..Default::default()
        };
        let manager = WifiManager::new(driver.clone(), &config);
        driver.emit(WifiEvent::GotIp(Ipv4Addr::new(10, 0, 0, 7)));

        let broadcaster = DiscoveryBroadcaster::new("Rig-7", LOCAL_SERVER_PORT, manager);
        assert_eq!(
            broadcaster.current().unwrap(),
            b"Rig-7::192.168.4.1::65102\0".to_vec()
        );
    }

    #[test]
    fn skipped_without_station_address() {
        let driver = Arc::new(SimWifiDriver::new());
        let config = CommConfig {
            wifi_mode: WifiMode::Station,
            ..Default::default()
        };
        let manager = WifiManager::new(driver, &config);
        let broadcaster = DiscoveryBroadcaster::new("Rig-7", LOCAL_SERVER_PORT, manager);
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        assert!(!broadcaster.announce_once(&socket).unwrap());
    }
}
