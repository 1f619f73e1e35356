// Hub client: dial out to the configured relay, identify, then carry packets
// Any failure sends the worker back to name resolution after a fixed pause.

use log::{debug, info, warn};
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{HubConfig, SocketTuning};
use crate::packet::{PacketBoundary, PayloadHandler};
use crate::retry::{RetryPolicy, HUB_REDIAL, RAW_SEND};
use crate::tcp_transport::{pump, tune_socket, write_bounded, TransportConnection, TransportRole};
use crate::wifi_manager::WifiManager;
use crate::worker::{nap, WorkerHandle};

/// Name resolution for the hub host
pub trait Resolver: Send + Sync {
    fn resolve(&self, host: &str, port: u16) -> io::Result<SocketAddr>;
}

/// System resolver, preferring IPv4 results
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, host: &str, port: u16) -> io::Result<SocketAddr> {
        let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", host)))
    }
}

pub struct HubClient {
    hub: HubConfig,
    tuning: SocketTuning,
    resolver: Arc<dyn Resolver>,
    boundary: Arc<dyn PacketBoundary>,
    handler: PayloadHandler,
    connection: Arc<TransportConnection>,
    redial: RetryPolicy,
    connect_timeout: Duration,
    resolve_attempts: AtomicU64,
}

impl HubClient {
    pub fn new(
        hub: HubConfig,
        tuning: SocketTuning,
        resolver: Arc<dyn Resolver>,
        boundary: Arc<dyn PacketBoundary>,
        handler: PayloadHandler,
    ) -> Self {
        Self {
            hub,
            tuning,
            resolver,
            boundary,
            handler,
            connection: TransportConnection::new(TransportRole::Hub),
            redial: HUB_REDIAL,
            connect_timeout: Duration::from_secs(5),
            resolve_attempts: AtomicU64::new(0),
        }
    }

    /// Override the pause between resolution and dial attempts
    pub fn with_redial(mut self, redial: RetryPolicy) -> Self {
        self.redial = redial;
        self
    }

    pub fn connection(&self) -> &Arc<TransportConnection> {
        &self.connection
    }

    /// Resolution attempts made so far
    pub fn resolve_attempts(&self) -> u64 {
        self.resolve_attempts.load(Ordering::Acquire)
    }

    pub fn spawn(self: &Arc<Self>, manager: &WifiManager) -> io::Result<WorkerHandle> {
        manager.register_transport(self.connection.clone());
        let client = self.clone();
        WorkerHandle::spawn("tcp-hub", move |stop| client.run(&stop))
    }

    fn resolve(&self, stop: &AtomicBool) -> Option<SocketAddr> {
        let outcome = self.redial.retry_until_stopped(stop, |attempt| {
            self.resolve_attempts.fetch_add(1, Ordering::AcqRel);
            self.resolver
                .resolve(&self.hub.host, self.hub.port)
                .map_err(|e| {
                    if attempt == 0 {
                        warn!("⚠️ Hub host '{}' did not resolve: {}", self.hub.host, e);
                    } else {
                        debug!("hub resolution attempt {} failed: {}", attempt, e);
                    }
                    e
                })
        });
        match outcome {
            Some(Ok(addr)) => Some(addr),
            _ => None,
        }
    }

    /// Resolve, dial, identify and serve until `stop` is raised
    pub fn run(&self, stop: &AtomicBool) {
        while !stop.load(Ordering::Acquire) {
            let Some(addr) = self.resolve(stop) else {
                break;
            };

            let stream = match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("⚠️ Hub connect to {} failed: {}", addr, e);
                    nap(stop, self.redial.interval);
                    continue;
                }
            };

            self.serve(stream, addr, stop);
            nap(stop, self.redial.interval);
        }
        self.connection.detach();
        debug!("hub client loop finished");
    }

    fn serve(&self, stream: TcpStream, addr: SocketAddr, stop: &AtomicBool) {
        if let Err(e) = tune_socket(&stream, &self.tuning) {
            debug!("hub socket tuning incomplete: {}", e);
        }

        let handshake = self.hub.handshake();
        if write_bounded(&stream, &handshake, RAW_SEND) < handshake.len() {
            warn!("⚠️ Hub handshake to {} failed", addr);
            return;
        }

        if let Err(e) = self.connection.attach(&stream, addr) {
            warn!("⚠️ Could not attach hub link: {}", e);
            return;
        }
        info!("🌐 Connected to hub {} as '{}'", addr, self.hub.id);

        let mut context = self
            .boundary
            .init(self.connection.raw_sender(), self.handler.clone());
        match pump(&stream, context.as_mut(), stop) {
            Ok(bytes) => info!("🌐 Hub closed the link after {} bytes", bytes),
            Err(e) => info!("🌐 Hub link dropped: {}", e),
        }
        self.connection.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Unresolvable;

    impl Resolver for Unresolvable {
        fn resolve(&self, host: &str, _port: u16) -> io::Result<SocketAddr> {
            Err(io::Error::new(io::ErrorKind::NotFound, host.to_string()))
        }
    }

    #[test]
    fn system_resolver_handles_literals() {
        let addr = SystemResolver.resolve("127.0.0.1", 65101).unwrap();
        assert_eq!(addr, "127.0.0.1:65101".parse().unwrap());
    }

    #[test]
    fn unresolvable_host_stops_cleanly() {
        let client = HubClient::new(
            HubConfig::default(),
            SocketTuning::default(),
            Arc::new(Unresolvable),
            Arc::new(crate::packet::FramedPacketBoundary),
            crate::packet::echo_handler(),
        )
        .with_redial(RetryPolicy::unbounded(Duration::ZERO));

        let stop = AtomicBool::new(true);
        client.run(&stop);
        assert_eq!(client.resolve_attempts(), 0);
        assert!(!client.connection().is_connected());
    }
}
