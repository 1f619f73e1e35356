// Framed packet transport over a vendor GATT service
// Peer writes to RX are fed into the packet context, outgoing frames are
// notified on TX in chunks that fit the negotiated MTU.

use log::{debug, info};
use std::sync::{Arc, Mutex, Weak};

use crate::ble_server::{lock_recover, AttributeServer, BleResult};
use crate::ble_stack::{BleUuid, CharacteristicDef, DescriptorDef, Permissions, Properties};
use crate::packet::{PacketBoundary, PacketContext, PayloadHandler, RawSender};

// Vendor service and characteristic UUIDs
pub const SERVICE_UUID: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";
pub const RX_UUID: &str = "6e400002-b5a3-f393-e0a9-e50e24dcca9e";
pub const TX_UUID: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";

/// Largest value the RX and TX characteristics hold
pub const CHARACTERISTIC_MAX_LEN: u16 = 512;

pub fn service_uuid() -> BleUuid {
    vendor_uuid(SERVICE_UUID)
}

fn vendor_uuid(text: &str) -> BleUuid {
    BleUuid::parse(text).unwrap_or(BleUuid::Uuid16(0xFFF0))
}

pub struct BleTransport {
    server: Arc<AttributeServer>,
    service_handle: u16,
    rx_handle: u16,
    tx_handle: u16,
    context: Arc<Mutex<Box<dyn PacketContext>>>,
}

impl BleTransport {
    /// Add the vendor service and bind a packet context to it
    pub fn register(
        server: &Arc<AttributeServer>,
        boundary: &dyn PacketBoundary,
        handler: PayloadHandler,
    ) -> BleResult<Self> {
        let rx = CharacteristicDef::new(
            vendor_uuid(RX_UUID),
            Permissions::WRITE,
            Properties::WRITE | Properties::WRITE_NO_RESPONSE,
            CHARACTERISTIC_MAX_LEN,
        );
        let tx = CharacteristicDef::new(
            vendor_uuid(TX_UUID),
            Permissions::READ,
            Properties::READ | Properties::NOTIFY,
            CHARACTERISTIC_MAX_LEN,
        )
        .with_descriptor(DescriptorDef::cccd());

        let handles = server.add_service(service_uuid(), &[rx, tx])?;
        // [service, rx, tx, tx cccd]
        let (service_handle, rx_handle, tx_handle) = (handles[0], handles[1], handles[2]);

        let context = Arc::new(Mutex::new(
            boundary.init(tx_sender(Arc::downgrade(server), tx_handle), handler),
        ));

        let sink = context.clone();
        server.add_write_listener(Arc::new(move |handle, value: &[u8]| {
            if handle != rx_handle {
                return;
            }
            let mut context = lock_recover(&sink);
            for &byte in value {
                context.feed_byte(byte);
            }
        }));

        info!(
            "✅ BLE packet transport on service {} (rx {}, tx {})",
            service_handle, rx_handle, tx_handle
        );
        Ok(Self {
            server: server.clone(),
            service_handle,
            rx_handle,
            tx_handle,
            context,
        })
    }

    pub fn handles(&self) -> (u16, u16, u16) {
        (self.service_handle, self.rx_handle, self.tx_handle)
    }

    /// Frame and notify a payload to subscribed peers
    pub fn send_frame(&self, payload: &[u8]) {
        lock_recover(&self.context).send_frame(payload);
    }

    pub fn server(&self) -> &Arc<AttributeServer> {
        &self.server
    }
}

// Writes framed bytes to the TX value in notification-sized chunks
fn tx_sender(server: Weak<AttributeServer>, tx_handle: u16) -> RawSender {
    Arc::new(move |data: &[u8]| {
        let Some(server) = server.upgrade() else {
            return;
        };
        let chunk_len = server
            .notify_payload_len()
            .min(CHARACTERISTIC_MAX_LEN as usize);
        for chunk in data.chunks(chunk_len) {
            if let Err(e) = server.set_value(tx_handle, chunk) {
                debug!("dropping BLE frame remainder: {}", e);
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble_server::ServerOptions;
    use crate::packet::{echo_handler, encode_frame, FramedPacketBoundary};
    use crate::sim::SimBleStack;

    fn transport() -> (Arc<SimBleStack>, BleTransport) {
        let stack = Arc::new(SimBleStack::new());
        let server = AttributeServer::new(
            stack.clone(),
            "Rig-7",
            Some(service_uuid()),
            ServerOptions::default(),
        );
        server.start().unwrap();
        let transport = BleTransport::register(&server, &FramedPacketBoundary, echo_handler()).unwrap();
        (stack, transport)
    }

    #[test]
    fn echoes_frames_to_subscribed_peer_in_chunks() {
        let (stack, transport) = transport();
        let (_, rx, tx) = transport.handles();

        stack.connect_peer(1);
        stack.peer_write(1, tx + 1, &[0x01, 0x00]);

        let payload = vec![0x42; 30];
        let frame = encode_frame(&payload).unwrap();
        stack.peer_write(1, rx, &frame[..10]);
        stack.peer_write(1, rx, &frame[10..]);

        let notified: Vec<u8> = stack
            .notifications()
            .into_iter()
            .inspect(|(_, handle, chunk, _)| {
                assert_eq!(*handle, tx);
                assert!(chunk.len() <= 20);
            })
            .flat_map(|(_, _, chunk, _)| chunk)
            .collect();
        assert_eq!(notified, frame);
    }

    #[test]
    fn larger_mtu_means_fewer_chunks() {
        let (stack, transport) = transport();
        let (_, _, tx) = transport.handles();
        stack.connect_peer(1);
        stack.negotiate_mtu(1, 185);
        stack.peer_write(1, tx + 1, &[0x01, 0x00]);

        transport.send_frame(&[7; 100]);
        assert_eq!(stack.notifications().len(), 1);
    }
}
