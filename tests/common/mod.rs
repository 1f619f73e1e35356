#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use vesc_link::packet::encode_frame;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Send one framed payload and read back a frame of the same size
pub fn echo_round_trip(stream: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
    let frame = encode_frame(payload).expect("payload fits a frame");
    stream.write_all(&frame).expect("write frame");
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("read timeout");
    let mut reply = vec![0u8; frame.len()];
    stream.read_exact(&mut reply).expect("read echo");
    reply
}
