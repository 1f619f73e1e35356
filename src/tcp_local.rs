// Local socket server: one client at a time on the fixed LAN port

use log::{debug, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::SocketTuning;
use crate::packet::{PacketBoundary, PayloadHandler};
use crate::retry::RELISTEN;
use crate::tcp_transport::{pump, tune_socket, TransportConnection, TransportRole};
use crate::wifi_manager::WifiManager;
use crate::worker::{nap, WorkerHandle};

// Poll interval of the non-blocking accept
const ACCEPT_POLL: Duration = Duration::from_millis(20);

pub struct LocalServer {
    port: AtomicU16,
    tuning: SocketTuning,
    boundary: Arc<dyn PacketBoundary>,
    handler: PayloadHandler,
    connection: Arc<TransportConnection>,
}

impl LocalServer {
    /// `port` 0 binds an ephemeral port once and keeps it for later relistens
    pub fn new(
        port: u16,
        tuning: SocketTuning,
        boundary: Arc<dyn PacketBoundary>,
        handler: PayloadHandler,
    ) -> Arc<Self> {
        Arc::new(Self {
            port: AtomicU16::new(port),
            tuning,
            boundary,
            handler,
            connection: TransportConnection::new(TransportRole::Local),
        })
    }

    pub fn connection(&self) -> &Arc<TransportConnection> {
        &self.connection
    }

    /// Port being listened on, 0 until the first bind of an ephemeral port
    pub fn port(&self) -> u16 {
        self.port.load(Ordering::Acquire)
    }

    /// Enrol with the manager and run the accept loop on its own thread
    pub fn spawn(self: &Arc<Self>, manager: &WifiManager) -> io::Result<WorkerHandle> {
        manager.register_transport(self.connection.clone());
        let server = self.clone();
        WorkerHandle::spawn("tcp-local", move |stop| server.run(&stop))
    }

    fn listen(&self) -> io::Result<TcpListener> {
        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.port());
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&SocketAddr::V4(addr).into())?;
        socket.listen(1)?;
        let listener: TcpListener = socket.into();
        let bound = listener.local_addr()?.port();
        self.port.store(bound, Ordering::Release);
        Ok(listener)
    }

    // Wait for one client, giving up when `stop` is raised
    fn accept(&self, listener: &TcpListener, stop: &AtomicBool) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        listener.set_nonblocking(true)?;
        loop {
            match listener.accept() {
                Ok(accepted) => return Ok(Some(accepted)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !nap(stop, ACCEPT_POLL) {
                        return Ok(None);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Accept, serve and relisten until `stop` is raised
    pub fn run(&self, stop: &AtomicBool) {
        while !stop.load(Ordering::Acquire) {
            let listener = match self.listen() {
                Ok(listener) => listener,
                Err(e) => {
                    warn!("⚠️ Local server could not listen on {}: {}", self.port(), e);
                    if !nap(stop, RELISTEN.interval) {
                        break;
                    }
                    continue;
                }
            };
            info!("👂 Local server listening on port {}", self.port());

            let (stream, peer) = match self.accept(&listener, stop) {
                Ok(Some(accepted)) => accepted,
                Ok(None) => break,
                Err(e) => {
                    warn!("⚠️ Local accept failed: {}", e);
                    nap(stop, RELISTEN.interval);
                    continue;
                }
            };
            // Stop listening while a client is served
            drop(listener);

            self.serve(stream, peer, stop);
            nap(stop, RELISTEN.interval);
        }
        self.connection.detach();
        debug!("local server loop finished");
    }

    fn serve(&self, stream: TcpStream, peer: SocketAddr, stop: &AtomicBool) {
        if let Err(e) = stream.set_nonblocking(false) {
            warn!("⚠️ Could not make client socket blocking: {}", e);
            return;
        }
        if let Err(e) = tune_socket(&stream, &self.tuning) {
            debug!("socket tuning for {} incomplete: {}", peer, e);
        }
        if let Err(e) = self.connection.attach(&stream, peer) {
            warn!("⚠️ Could not attach local client {}: {}", peer, e);
            return;
        }
        info!("📱 Local client {} connected", peer);

        let mut context = self
            .boundary
            .init(self.connection.raw_sender(), self.handler.clone());
        match pump(&stream, context.as_mut(), stop) {
            Ok(bytes) => info!("📱 Local client {} left after {} bytes", peer, bytes),
            Err(e) => info!("📱 Local client {} dropped: {}", peer, e),
        }
        self.connection.detach();
    }
}
