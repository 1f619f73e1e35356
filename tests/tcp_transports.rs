mod common;

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use common::{echo_round_trip, init_logging, wait_for};
use vesc_link::config::{CommConfig, HubConfig, SocketTuning, WifiMode};
use vesc_link::packet::{echo_handler, encode_frame, FramedPacketBoundary};
use vesc_link::retry::RetryPolicy;
use vesc_link::sim::SimWifiDriver;
use vesc_link::tcp_hub::{HubClient, Resolver};
use vesc_link::tcp_local::LocalServer;
use vesc_link::wifi_driver::WifiEvent;
use vesc_link::wifi_manager::WifiManager;

fn manager() -> Arc<WifiManager> {
    WifiManager::new(Arc::new(SimWifiDriver::new()), &CommConfig::default())
}

fn station_manager(driver: Arc<SimWifiDriver>) -> Arc<WifiManager> {
    let config = CommConfig {
        wifi_mode: WifiMode::Station,
        sta_ssid: "shop".to_string(),
        ..Default::default()
    };
    WifiManager::new(driver, &config)
}

// True once the server has closed its end
fn sees_eof(client: &mut TcpStream) -> bool {
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = [0u8; 16];
    matches!(client.read(&mut buf), Ok(0))
}

fn local_server() -> Arc<LocalServer> {
    LocalServer::new(
        0,
        SocketTuning::default(),
        Arc::new(FramedPacketBoundary),
        echo_handler(),
    )
}

#[test]
fn local_server_echoes_frames() {
    init_logging();
    let manager = manager();
    let server = local_server();
    let worker = server.spawn(&manager).unwrap();
    assert!(wait_for(Duration::from_secs(2), || server.port() != 0));

    let mut client = TcpStream::connect(("127.0.0.1", server.port())).unwrap();
    let reply = echo_round_trip(&mut client, b"COMM_FW_VERSION");
    assert_eq!(reply, encode_frame(b"COMM_FW_VERSION").unwrap());
    assert!(manager.is_local_client_connected());
    assert_eq!(manager.client_address().map(|a| a.port()), client.local_addr().ok().map(|a| a.port()));

    worker.join();
    assert!(!server.connection().is_connected());
}

#[test]
fn local_server_serves_one_client_at_a_time() {
    init_logging();
    let manager = manager();
    let server = local_server();
    let worker = server.spawn(&manager).unwrap();
    assert!(wait_for(Duration::from_secs(2), || server.port() != 0));
    let port = server.port();

    let first = TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert!(wait_for(Duration::from_secs(2), || manager.is_local_client_connected()));
    assert!(TcpStream::connect(("127.0.0.1", port)).is_err());

    drop(first);
    let mut second = None;
    assert!(wait_for(Duration::from_secs(2), || {
        second = TcpStream::connect(("127.0.0.1", port)).ok();
        second.is_some()
    }));
    let mut second = second.unwrap();
    let reply = echo_round_trip(&mut second, &[1, 2, 3]);
    assert_eq!(reply, encode_frame(&[1, 2, 3]).unwrap());

    worker.join();
}

#[test]
fn disable_and_disconnect_closes_the_local_client() {
    init_logging();
    let manager = station_manager(Arc::new(SimWifiDriver::new()));
    let server = local_server();
    let worker = server.spawn(&manager).unwrap();
    assert!(wait_for(Duration::from_secs(2), || server.port() != 0));

    let mut client = TcpStream::connect(("127.0.0.1", server.port())).unwrap();
    assert!(wait_for(Duration::from_secs(2), || manager.is_local_client_connected()));

    assert!(manager.disable_and_disconnect());
    assert!(sees_eof(&mut client));
    assert!(wait_for(Duration::from_secs(2), || !manager.is_local_client_connected()));

    worker.join();
}

#[test]
fn station_stop_closes_the_local_client() {
    init_logging();
    let driver = Arc::new(SimWifiDriver::new());
    let manager = station_manager(driver.clone());
    let server = local_server();
    let worker = server.spawn(&manager).unwrap();
    assert!(wait_for(Duration::from_secs(2), || server.port() != 0));

    let mut client = TcpStream::connect(("127.0.0.1", server.port())).unwrap();
    assert!(wait_for(Duration::from_secs(2), || manager.is_local_client_connected()));

    driver.emit(WifiEvent::StationStopped);
    assert!(sees_eof(&mut client));
    assert!(wait_for(Duration::from_secs(2), || !manager.is_local_client_connected()));

    worker.join();
}

struct NeverResolves;

impl Resolver for NeverResolves {
    fn resolve(&self, host: &str, _port: u16) -> io::Result<SocketAddr> {
        Err(io::Error::new(io::ErrorKind::NotFound, host.to_string()))
    }
}

#[test]
fn hub_keeps_retrying_an_unresolvable_host() {
    init_logging();
    let manager = manager();
    let hub = Arc::new(
        HubClient::new(
            HubConfig {
                host: "hub.invalid".to_string(),
                ..Default::default()
            },
            SocketTuning::default(),
            Arc::new(NeverResolves),
            Arc::new(FramedPacketBoundary),
            echo_handler(),
        )
        .with_redial(RetryPolicy::unbounded(Duration::from_millis(5))),
    );
    let worker = hub.spawn(&manager).unwrap();

    assert!(wait_for(Duration::from_secs(2), || hub.resolve_attempts() >= 5));
    assert!(!worker.is_finished());
    assert!(!manager.is_hub_connected());

    worker.join();
}

#[test]
fn hub_identifies_then_carries_frames() {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let hub_config = HubConfig {
        host: "127.0.0.1".to_string(),
        port: listener.local_addr().unwrap().port(),
        id: "rig7".to_string(),
        pass: "secret".to_string(),
    };
    let expected_handshake = hub_config.handshake();

    let manager = manager();
    let hub = Arc::new(HubClient::new(
        hub_config,
        SocketTuning::default(),
        Arc::new(vesc_link::tcp_hub::SystemResolver),
        Arc::new(FramedPacketBoundary),
        echo_handler(),
    ));
    let worker = hub.spawn(&manager).unwrap();

    let (mut relay, _) = listener.accept().unwrap();
    relay.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut handshake = vec![0u8; expected_handshake.len()];
    relay.read_exact(&mut handshake).unwrap();
    assert_eq!(handshake, b"VESC:rig7:secret\n\0".to_vec());

    assert!(wait_for(Duration::from_secs(2), || manager.is_hub_connected()));
    let frame = encode_frame(b"ping").unwrap();
    relay.write_all(&frame).unwrap();
    let mut echoed = vec![0u8; frame.len()];
    relay.read_exact(&mut echoed).unwrap();
    assert_eq!(echoed, frame);

    worker.join();
}
