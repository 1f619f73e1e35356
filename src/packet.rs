// Packet boundary between the byte transports and the command dispatcher
// Every transport owns exactly one PacketContext created through a PacketBoundary

use log::{debug, warn};
use std::sync::Arc;

/// Writes already-framed bytes to the transport that owns the context
pub type RawSender = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Receives every decoded payload together with a sink for replies
pub type PayloadHandler = Arc<dyn Fn(&[u8], &dyn FrameSink) + Send + Sync>;

/// Something that can frame a payload and push it out through a raw sender
pub trait FrameSink {
    fn send_frame(&self, payload: &[u8]);
}

/// Per-transport packet assembly state
pub trait PacketContext: Send {
    /// Feed one received byte; completed frames are handed to the payload handler
    fn feed_byte(&mut self, byte: u8);

    /// Frame `payload` and write it through the raw sender
    fn send_frame(&self, payload: &[u8]);
}

/// Factory for packet contexts (`packet_context_init`)
pub trait PacketBoundary: Send + Sync {
    fn init(&self, raw_sender: RawSender, handler: PayloadHandler) -> Box<dyn PacketContext>;
}

// Framing constants
pub const MAX_PAYLOAD_LEN: usize = 512;
const START_SHORT: u8 = 2;
const START_LONG: u8 = 3;
const END_BYTE: u8 = 3;

/// CRC-16/XMODEM (poly 0x1021, init 0) as used by the frame trailer
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Frame a payload: start byte, length, payload, big-endian CRC, end byte
pub fn encode_frame(payload: &[u8]) -> Option<Vec<u8>> {
    if payload.is_empty() || payload.len() > MAX_PAYLOAD_LEN {
        return None;
    }

    let mut frame = Vec::with_capacity(payload.len() + 6);
    if payload.len() <= u8::MAX as usize {
        frame.push(START_SHORT);
        frame.push(payload.len() as u8);
    } else {
        frame.push(START_LONG);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    }
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&crc16(payload).to_be_bytes());
    frame.push(END_BYTE);
    Some(frame)
}

/// Encoder half of a framed context, handed to payload handlers for replies
#[derive(Clone)]
pub struct FrameEncoder {
    raw_sender: RawSender,
}

impl FrameEncoder {
    pub fn new(raw_sender: RawSender) -> Self {
        Self { raw_sender }
    }
}

impl FrameSink for FrameEncoder {
    fn send_frame(&self, payload: &[u8]) {
        match encode_frame(payload) {
            Some(frame) => (self.raw_sender)(&frame),
            None => warn!(
                "⚠️ Dropping outgoing payload of {} bytes (limit {})",
                payload.len(),
                MAX_PAYLOAD_LEN
            ),
        }
    }
}

// Receive state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    Idle,
    LengthHigh,
    LengthLow,
    Payload,
    CrcHigh,
    CrcLow,
    End,
}

/// Length-prefixed, CRC-checked framing context
pub struct FramedContext {
    encoder: FrameEncoder,
    handler: PayloadHandler,
    state: RxState,
    expected_len: usize,
    payload: Vec<u8>,
    crc: u16,
}

impl FramedContext {
    pub fn new(raw_sender: RawSender, handler: PayloadHandler) -> Self {
        Self {
            encoder: FrameEncoder::new(raw_sender),
            handler,
            state: RxState::Idle,
            expected_len: 0,
            payload: Vec::with_capacity(MAX_PAYLOAD_LEN),
            crc: 0,
        }
    }

    fn reset(&mut self) {
        self.state = RxState::Idle;
        self.expected_len = 0;
        self.payload.clear();
        self.crc = 0;
    }

    fn accept_length(&mut self, len: usize) {
        if len == 0 || len > MAX_PAYLOAD_LEN {
            debug!("frame length {} out of range, resyncing", len);
            self.reset();
        } else {
            self.expected_len = len;
            self.state = RxState::Payload;
        }
    }
}

impl PacketContext for FramedContext {
    fn feed_byte(&mut self, byte: u8) {
        match self.state {
            RxState::Idle => match byte {
                START_SHORT => self.state = RxState::LengthLow,
                START_LONG => self.state = RxState::LengthHigh,
                _ => {}
            },
            RxState::LengthHigh => {
                self.expected_len = (byte as usize) << 8;
                self.state = RxState::LengthLow;
            }
            RxState::LengthLow => {
                let len = self.expected_len | byte as usize;
                self.accept_length(len);
            }
            RxState::Payload => {
                self.payload.push(byte);
                if self.payload.len() == self.expected_len {
                    self.state = RxState::CrcHigh;
                }
            }
            RxState::CrcHigh => {
                self.crc = (byte as u16) << 8;
                self.state = RxState::CrcLow;
            }
            RxState::CrcLow => {
                self.crc |= byte as u16;
                self.state = RxState::End;
            }
            RxState::End => {
                if byte == END_BYTE && crc16(&self.payload) == self.crc {
                    let payload = std::mem::take(&mut self.payload);
                    (self.handler)(&payload, &self.encoder);
                    self.payload = payload;
                } else {
                    debug!("dropping frame with bad trailer or CRC");
                }
                self.reset();
            }
        }
    }

    fn send_frame(&self, payload: &[u8]) {
        self.encoder.send_frame(payload);
    }
}

/// Boundary producing `FramedContext`s
#[derive(Debug, Default, Clone, Copy)]
pub struct FramedPacketBoundary;

impl PacketBoundary for FramedPacketBoundary {
    fn init(&self, raw_sender: RawSender, handler: PayloadHandler) -> Box<dyn PacketContext> {
        Box::new(FramedContext::new(raw_sender, handler))
    }
}

/// Dispatcher that answers every payload with the same payload
pub fn echo_handler() -> PayloadHandler {
    Arc::new(|payload: &[u8], sink: &dyn FrameSink| sink.send_frame(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collecting_context() -> (Box<dyn PacketContext>, Arc<Mutex<Vec<Vec<u8>>>>, Arc<Mutex<Vec<u8>>>) {
        let payloads = Arc::new(Mutex::new(Vec::new()));
        let wire = Arc::new(Mutex::new(Vec::new()));
        let seen = payloads.clone();
        let out = wire.clone();
        let ctx = FramedPacketBoundary.init(
            Arc::new(move |bytes: &[u8]| out.lock().unwrap().extend_from_slice(bytes)),
            Arc::new(move |payload: &[u8], sink: &dyn FrameSink| {
                seen.lock().unwrap().push(payload.to_vec());
                sink.send_frame(b"ack");
            }),
        );
        (ctx, payloads, wire)
    }

    #[test]
    fn crc_matches_xmodem_check_value() {
        assert_eq!(crc16(b"123456789"), 0x31C3);
    }

    #[test]
    fn decodes_frame_with_leading_noise() {
        let (mut ctx, payloads, wire) = collecting_context();
        let mut bytes = vec![0xFF, 0x00];
        bytes.extend(encode_frame(&[4, 1, 2]).unwrap());
        for b in bytes {
            ctx.feed_byte(b);
        }
        assert_eq!(*payloads.lock().unwrap(), vec![vec![4, 1, 2]]);
        assert_eq!(*wire.lock().unwrap(), encode_frame(b"ack").unwrap());
    }

    #[test]
    fn long_payload_uses_sixteen_bit_length() {
        let payload = vec![0xAB; 300];
        let frame = encode_frame(&payload).unwrap();
        assert_eq!(&frame[..3], &[START_LONG, 0x01, 0x2C]);

        let (mut ctx, payloads, _) = collecting_context();
        frame.iter().for_each(|b| ctx.feed_byte(*b));
        assert_eq!(payloads.lock().unwrap()[0].len(), 300);
    }

    #[test]
    fn corrupted_frame_is_dropped_and_next_frame_decodes() {
        let (mut ctx, payloads, _) = collecting_context();
        let mut bad = encode_frame(&[9, 9]).unwrap();
        bad[3] ^= 0x55;
        for b in bad.into_iter().chain(encode_frame(&[7]).unwrap()) {
            ctx.feed_byte(b);
        }
        assert_eq!(*payloads.lock().unwrap(), vec![vec![7]]);
    }

    #[test]
    fn oversized_payload_is_not_framed() {
        assert!(encode_frame(&vec![0; MAX_PAYLOAD_LEN + 1]).is_none());
        assert!(encode_frame(&[]).is_none());
    }
}
