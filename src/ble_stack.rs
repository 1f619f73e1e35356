// Radio stack seam for the attribute server
// Requests are submitted synchronously; their completion arrives later as a StackEvent
// delivered from the stack's own callback context.

use bitflags::bitflags;
use std::sync::Arc;
use uuid::Uuid;

/// Status code reported by the stack, 0 means success
pub type StackStatus = i32;

pub const STATUS_OK: StackStatus = 0;

/// A stack call was rejected before being queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackError(pub i32);

impl std::fmt::Display for StackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stack call rejected with code {}", self.0)
    }
}

impl std::error::Error for StackError {}

/// Attribute type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BleUuid {
    Uuid16(u16),
    Uuid32(u32),
    Uuid128(Uuid),
}

impl BleUuid {
    /// Client Characteristic Configuration descriptor
    pub const CCCD: BleUuid = BleUuid::Uuid16(0x2902);

    /// Parse a full 128-bit UUID string such as `6e400001-b5a3-f393-e0a9-e50e24dcca9e`
    pub fn parse(text: &str) -> Option<Self> {
        Uuid::parse_str(text).ok().map(BleUuid::Uuid128)
    }

    /// Little-endian wire representation (the order used in advertising data)
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            BleUuid::Uuid16(v) => v.to_le_bytes().to_vec(),
            BleUuid::Uuid32(v) => v.to_le_bytes().to_vec(),
            BleUuid::Uuid128(v) => {
                let mut bytes = v.as_bytes().to_vec();
                bytes.reverse();
                bytes
            }
        }
    }
}

bitflags! {
    /// Attribute access permissions
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u16 {
        const READ = 1 << 0;
        const READ_ENCRYPTED = 1 << 1;
        const READ_ENC_MITM = 1 << 2;
        const WRITE = 1 << 4;
        const WRITE_ENCRYPTED = 1 << 5;
        const WRITE_ENC_MITM = 1 << 6;
        const WRITE_SIGNED = 1 << 7;
        const WRITE_SIGNED_MITM = 1 << 8;
    }
}

bitflags! {
    /// Characteristic property mask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Properties: u8 {
        const BROADCAST = 1 << 0;
        const READ = 1 << 1;
        const WRITE_NO_RESPONSE = 1 << 2;
        const WRITE = 1 << 3;
        const NOTIFY = 1 << 4;
        const INDICATE = 1 << 5;
        const AUTH = 1 << 6;
        const EXTENDED = 1 << 7;
    }
}

/// Descriptor to create under a characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorDef {
    pub uuid: BleUuid,
    pub permissions: Permissions,
    pub max_len: u16,
    pub value: Vec<u8>,
}

impl DescriptorDef {
    pub fn new(uuid: BleUuid, permissions: Permissions, max_len: u16) -> Self {
        Self {
            uuid,
            permissions,
            max_len,
            value: Vec::new(),
        }
    }

    pub fn with_value(mut self, value: &[u8]) -> Self {
        self.value = value.to_vec();
        self
    }

    /// Client configuration descriptor a peer writes to subscribe
    pub fn cccd() -> Self {
        Self::new(BleUuid::CCCD, Permissions::READ | Permissions::WRITE, 2).with_value(&[0, 0])
    }
}

/// Characteristic to create, with its descriptors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDef {
    pub uuid: BleUuid,
    pub permissions: Permissions,
    pub properties: Properties,
    pub max_len: u16,
    pub value: Vec<u8>,
    pub descriptors: Vec<DescriptorDef>,
}

impl CharacteristicDef {
    pub fn new(uuid: BleUuid, permissions: Permissions, properties: Properties, max_len: u16) -> Self {
        Self {
            uuid,
            permissions,
            properties,
            max_len,
            value: Vec::new(),
            descriptors: Vec::new(),
        }
    }

    pub fn with_value(mut self, value: &[u8]) -> Self {
        self.value = value.to_vec();
        self
    }

    pub fn with_descriptor(mut self, descriptor: DescriptorDef) -> Self {
        self.descriptors.push(descriptor);
        self
    }
}

/// Callback results and peer activity reported by the stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackEvent {
    AppRegistered { status: StackStatus },
    AdvDataSet { status: StackStatus },
    ScanResponseSet { status: StackStatus },
    AdvStarted { status: StackStatus },
    AdvStopped { status: StackStatus },
    ServiceCreated { status: StackStatus, handle: u16 },
    CharacteristicAdded { status: StackStatus, handle: u16 },
    DescriptorAdded { status: StackStatus, handle: u16 },
    ServiceStarted { status: StackStatus, handle: u16 },
    ServiceDeleted { status: StackStatus, handle: u16 },
    PeerConnected { conn_id: u16 },
    PeerDisconnected { conn_id: u16, reason: u16 },
    PeerWrite { conn_id: u16, handle: u16, value: Vec<u8> },
    SubscriptionChanged { conn_id: u16, handle: u16, notify: bool, indicate: bool },
    MtuChanged { conn_id: u16, mtu: u16 },
}

/// Completion events a blocking server call can wait for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    AppRegistered,
    AdvDataSet,
    ScanResponseSet,
    AdvStarted,
    ServiceCreated,
    CharacteristicAdded,
    DescriptorAdded,
    ServiceStarted,
    ServiceDeleted,
}

impl StackEvent {
    /// The completion this event answers, if any
    pub fn completion_kind(&self) -> Option<CompletionKind> {
        match self {
            StackEvent::AppRegistered { .. } => Some(CompletionKind::AppRegistered),
            StackEvent::AdvDataSet { .. } => Some(CompletionKind::AdvDataSet),
            StackEvent::ScanResponseSet { .. } => Some(CompletionKind::ScanResponseSet),
            StackEvent::AdvStarted { .. } => Some(CompletionKind::AdvStarted),
            StackEvent::ServiceCreated { .. } => Some(CompletionKind::ServiceCreated),
            StackEvent::CharacteristicAdded { .. } => Some(CompletionKind::CharacteristicAdded),
            StackEvent::DescriptorAdded { .. } => Some(CompletionKind::DescriptorAdded),
            StackEvent::ServiceStarted { .. } => Some(CompletionKind::ServiceStarted),
            StackEvent::ServiceDeleted { .. } => Some(CompletionKind::ServiceDeleted),
            _ => None,
        }
    }

    /// Status and handle carried by a completion event
    pub fn completion(&self) -> Option<(StackStatus, u16)> {
        match *self {
            StackEvent::AppRegistered { status }
            | StackEvent::AdvDataSet { status }
            | StackEvent::ScanResponseSet { status }
            | StackEvent::AdvStarted { status }
            | StackEvent::AdvStopped { status } => Some((status, 0)),
            StackEvent::ServiceCreated { status, handle }
            | StackEvent::CharacteristicAdded { status, handle }
            | StackEvent::DescriptorAdded { status, handle }
            | StackEvent::ServiceStarted { status, handle }
            | StackEvent::ServiceDeleted { status, handle } => Some((status, handle)),
            _ => None,
        }
    }
}

/// Receives every event the stack produces
pub type StackEventHandler = Arc<dyn Fn(StackEvent) + Send + Sync>;

/// The BLE GATT/GAP stack the attribute server drives
pub trait BleStack: Send + Sync {
    /// Install the callback that receives every stack event
    fn set_event_handler(&self, handler: StackEventHandler);

    fn register_app(&self) -> Result<(), StackError>;
    fn set_device_name(&self, name: &str) -> Result<(), StackError>;
    fn set_adv_data(&self, data: &[u8]) -> Result<(), StackError>;
    fn set_scan_response(&self, data: &[u8]) -> Result<(), StackError>;
    fn start_advertising(&self) -> Result<(), StackError>;
    fn stop_advertising(&self) -> Result<(), StackError>;

    /// Create a service reserving `num_handles` attribute handles
    fn create_service(&self, uuid: &BleUuid, num_handles: u16) -> Result<(), StackError>;
    fn add_characteristic(&self, service_handle: u16, def: &CharacteristicDef) -> Result<(), StackError>;
    fn add_descriptor(&self, service_handle: u16, def: &DescriptorDef) -> Result<(), StackError>;
    fn start_service(&self, service_handle: u16) -> Result<(), StackError>;
    fn delete_service(&self, service_handle: u16) -> Result<(), StackError>;

    /// Replace the value the stack serves for `handle`
    fn set_attr_value(&self, handle: u16, value: &[u8]) -> Result<(), StackError>;

    /// Push a notification (or an indication when `confirm` is set) to one peer
    fn notify(&self, conn_id: u16, handle: u16, value: &[u8], confirm: bool) -> Result<(), StackError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid128_is_reversed_on_the_wire() {
        let uuid = BleUuid::parse("6e400001-b5a3-f393-e0a9-e50e24dcca9e").unwrap();
        let bytes = uuid.to_le_bytes();
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes[0], 0x9e);
        assert_eq!(bytes[15], 0x6e);
    }

    #[test]
    fn short_uuids_are_little_endian() {
        assert_eq!(BleUuid::CCCD.to_le_bytes(), vec![0x02, 0x29]);
        assert_eq!(BleUuid::Uuid32(0x0102_0304).to_le_bytes(), vec![4, 3, 2, 1]);
    }

    #[test]
    fn completion_kinds() {
        let event = StackEvent::ServiceCreated { status: 0, handle: 40 };
        assert_eq!(event.completion_kind(), Some(CompletionKind::ServiceCreated));
        assert_eq!(event.completion(), Some((0, 40)));
        assert_eq!(StackEvent::PeerConnected { conn_id: 1 }.completion_kind(), None);
        // stop confirmation drives the advertising swap, nobody blocks on it
        assert_eq!(StackEvent::AdvStopped { status: 0 }.completion_kind(), None);
    }
}
