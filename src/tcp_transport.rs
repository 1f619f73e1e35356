// Socket plumbing shared by the local server and the hub client

use log::{debug, info, warn};
use socket2::{SockRef, TcpKeepalive};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::ble_server::lock_recover;
use crate::config::SocketTuning;
use crate::packet::{PacketContext, RawSender};
use crate::retry::{RetryPolicy, RAW_SEND};

/// Bytes read from the socket per `recv`
pub const READ_BUFFER_LEN: usize = 128;

/// Read timeout so blocked readers notice the stop flag
pub const READ_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportRole {
    Local,
    Hub,
}

struct Link {
    stream: TcpStream,
    peer: SocketAddr,
}

/// The socket slot of one transport; empty while listening or redialing
pub struct TransportConnection {
    role: TransportRole,
    link: Mutex<Option<Link>>,
}

impl TransportConnection {
    pub fn new(role: TransportRole) -> Arc<Self> {
        Arc::new(Self {
            role,
            link: Mutex::new(None),
        })
    }

    pub fn role(&self) -> TransportRole {
        self.role
    }

    /// Publish an established stream so raw senders and teardown can reach it
    pub fn attach(&self, stream: &TcpStream, peer: SocketAddr) -> io::Result<()> {
        let stream = stream.try_clone()?;
        *lock_recover(&self.link) = Some(Link { stream, peer });
        Ok(())
    }

    pub fn detach(&self) {
        lock_recover(&self.link).take();
    }

    /// Close the socket; the owning worker sees the error and loops back
    pub fn shutdown(&self) {
        if let Some(link) = lock_recover(&self.link).take() {
            info!("🔌 Closing {:?} link to {}", self.role, link.peer);
            if let Err(e) = link.stream.shutdown(std::net::Shutdown::Both) {
                debug!("shutdown of {:?} link: {}", self.role, e);
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        lock_recover(&self.link).is_some()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        lock_recover(&self.link).as_ref().map(|l| l.peer)
    }

    /// Write `data` with the bounded raw-send policy; returns bytes written
    pub fn send_raw(&self, data: &[u8]) -> usize {
        let guard = lock_recover(&self.link);
        match guard.as_ref() {
            Some(link) => write_bounded(&link.stream, data, RAW_SEND),
            None => 0,
        }
    }

    /// Raw sender for the packet context owned by this transport
    pub fn raw_sender(self: &Arc<Self>) -> RawSender {
        let connection = self.clone();
        Arc::new(move |data: &[u8]| {
            connection.send_raw(data);
        })
    }
}

/// Write all of `data`, retrying short or failed writes until the policy gives up
///
/// Remaining bytes are dropped once the ceiling is exceeded.
pub fn write_bounded<W: Write>(mut writer: W, data: &[u8], policy: RetryPolicy) -> usize {
    let mut sent = 0;
    let mut failures = 0;
    while sent < data.len() {
        match writer.write(&data[sent..]) {
            Ok(n) if n > 0 => {
                sent += n;
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Ok(_) => {}
            Err(e) => debug!("raw write failed: {}", e),
        }
        failures += 1;
        if policy.exhausted(failures) {
            warn!(
                "⚠️ Dropping {} of {} bytes after {} failed writes",
                data.len() - sent,
                data.len(),
                failures
            );
            break;
        }
        policy.pause();
    }
    sent
}

/// Apply keep-alive, no-delay and buffer sizing to a connected stream
pub fn tune_socket(stream: &TcpStream, tuning: &SocketTuning) -> io::Result<()> {
    let socket = SockRef::from(stream);
    if tuning.keep_alive {
        let keepalive = TcpKeepalive::new().with_time(tuning.keep_idle);
        #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos", target_os = "windows"))]
        let keepalive = keepalive.with_interval(tuning.keep_interval);
        #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
        let keepalive = keepalive.with_retries(tuning.keep_count);
        socket.set_tcp_keepalive(&keepalive)?;
    }
    stream.set_nodelay(tuning.no_delay)?;
    socket.set_send_buffer_size(tuning.send_buffer)?;
    socket.set_recv_buffer_size(tuning.recv_buffer)?;
    Ok(())
}

/// Feed every received byte into `context` until the peer closes, an error occurs or `stop` is raised
///
/// Returns the number of bytes fed.
pub fn pump(stream: &TcpStream, context: &mut dyn PacketContext, stop: &AtomicBool) -> io::Result<usize> {
    stream.set_read_timeout(Some(READ_POLL))?;
    let mut reader = stream;
    let mut buf = [0u8; READ_BUFFER_LEN];
    let mut total = 0;
    loop {
        if stop.load(Ordering::Acquire) {
            return Ok(total);
        }
        match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => {
                for &byte in &buf[..n] {
                    context.feed_byte(byte);
                }
                total += n;
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => return Err(e),
        }
    }
}
