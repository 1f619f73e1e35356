// GATT attribute server driven by an asynchronous radio stack
// Mutating calls submit a stack request and block on a single-slot completion channel
// filled from the stack callback, bounded by a timeout.

// Import Embassy's critical section mutex and channel for the callback rendezvous
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;

// Import logging macros
use log::{debug, error, info, warn};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crate::ble_advertising::{AdvUpdate, AdvertisingController};
use crate::ble_stack::{
    BleStack, BleUuid, CharacteristicDef, CompletionKind, Permissions, Properties, StackError,
    StackEvent, STATUS_OK,
};
use crate::config::MAX_DEVICE_NAME_LEN;

// BLE error types, one per result the attribute server can report
#[derive(Debug, Clone, PartialEq)]
pub enum BleError {
    // Lifecycle errors
    AlreadyStarted,
    NotStarted,
    NameTooLong(usize),

    // Attribute table errors
    TooManyServices,
    TooManyAttributes,
    InvalidHandle(u16),
    ServiceNotLast(u16),
    TooLong { len: usize, max: usize },

    // Stack coordination errors
    Timeout(String),
    Stack(i32, String),
    Busy,
    Internal(String),
}

impl std::fmt::Display for BleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BleError::AlreadyStarted => write!(f, "BLE server already started"),
            BleError::NotStarted => write!(f, "BLE server not started"),
            BleError::NameTooLong(len) => write!(
                f,
                "Device name of {} bytes exceeds {} bytes",
                len, MAX_DEVICE_NAME_LEN
            ),
            BleError::TooManyServices => write!(f, "Service table is full"),
            BleError::TooManyAttributes => write!(f, "Characteristic and descriptor table is full"),
            BleError::InvalidHandle(handle) => write!(f, "No attribute with handle {}", handle),
            BleError::ServiceNotLast(handle) => {
                write!(f, "Service {} is not the most recently added service", handle)
            }
            BleError::TooLong { len, max } => {
                write!(f, "Value of {} bytes exceeds the {} byte limit", len, max)
            }
            BleError::Timeout(op) => write!(f, "BLE stack did not confirm {} in time", op),
            BleError::Stack(code, op) => write!(f, "BLE stack error {} during {}", code, op),
            BleError::Busy => write!(f, "Another BLE operation is in flight"),
            BleError::Internal(msg) => write!(f, "Internal BLE error: {}", msg),
        }
    }
}

impl std::error::Error for BleError {}

// Result type for BLE operations
pub type BleResult<T> = Result<T, BleError>;

/// Called with `(handle, value)` after a peer write has been stored
pub type WriteListener = Arc<dyn Fn(u16, &[u8]) + Send + Sync>;

/// Default ATT payload per notification before any MTU exchange
pub const DEFAULT_NOTIFY_LEN: usize = 20;

/// Table limits and stack timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerOptions {
    pub max_services: usize,
    /// Characteristics plus descriptors across all services
    pub max_attributes: usize,
    pub op_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_services: 10,
            max_attributes: 40,
            op_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKind {
    Characteristic,
    Descriptor { characteristic: u16 },
}

/// One characteristic or descriptor with its value buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub handle: u16,
    pub kind: AttributeKind,
    pub uuid: BleUuid,
    pub permissions: Permissions,
    pub properties: Properties,
    pub max_len: usize,
    pub value: Vec<u8>,
}

/// Summary of an active service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub handle: u16,
    pub uuid: BleUuid,
    pub attribute_handles: Vec<u16>,
}

struct ServiceEntry {
    handle: u16,
    uuid: BleUuid,
    attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Subscription {
    notify: bool,
    indicate: bool,
}

struct Peer {
    mtu: u16,
    subscriptions: HashMap<u16, Subscription>,
}

// Table and peer state, guarded by a single mutex
struct ServerState {
    started: bool,
    device_name: String,
    // Ordered by creation; only the last entry may be removed
    services: Vec<ServiceEntry>,
    peers: HashMap<u16, Peer>,
}

impl ServerState {
    fn attribute_count(&self) -> usize {
        self.services.iter().map(|s| s.attributes.len()).sum()
    }

    fn attribute_mut(&mut self, handle: u16) -> Option<&mut Attribute> {
        self.services
            .iter_mut()
            .flat_map(|s| s.attributes.iter_mut())
            .find(|a| a.handle == handle)
    }

    fn attribute(&self, handle: u16) -> Option<&Attribute> {
        self.services
            .iter()
            .flat_map(|s| s.attributes.iter())
            .find(|a| a.handle == handle)
    }
}

// Single-slot rendezvous between a blocked caller and the stack callback
struct Rendezvous {
    slot: Channel<CriticalSectionRawMutex, StackEvent, 1>,
    expecting: Mutex<Option<CompletionKind>>,
}

impl Rendezvous {
    fn new() -> Self {
        Self {
            slot: Channel::new(),
            expecting: Mutex::new(None),
        }
    }

    fn arm(&self, kind: CompletionKind) {
        while self.slot.try_receive().is_ok() {}
        *lock_recover(&self.expecting) = Some(kind);
    }

    fn disarm(&self) {
        *lock_recover(&self.expecting) = None;
    }

    // Called from the stack callback; true when a waiter took the event
    fn offer(&self, event: &StackEvent) -> bool {
        let kind = match event.completion_kind() {
            Some(kind) => kind,
            None => return false,
        };
        let matched = {
            let mut expecting = lock_recover(&self.expecting);
            if *expecting == Some(kind) {
                *expecting = None;
                true
            } else {
                false
            }
        };
        matched && self.slot.try_send(event.clone()).is_ok()
    }

    fn wait(&self, timeout: Duration) -> Option<StackEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(event) = self.slot.try_receive() {
                return Some(event);
            }
            if Instant::now() >= deadline {
                self.disarm();
                // The completion may have landed between the last poll and disarming
                return self.slot.try_receive().ok();
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

// Releases the in-flight flag when a blocking operation ends
struct OpGuard<'a>(&'a AtomicBool);

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub(crate) fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory attribute table mirrored into the radio stack
pub struct AttributeServer {
    stack: Arc<dyn BleStack>,
    options: ServerOptions,
    state: Mutex<ServerState>,
    advertising: AdvertisingController,
    rendezvous: Rendezvous,
    op_in_flight: AtomicBool,
    listeners: Mutex<Vec<WriteListener>>,
}

impl AttributeServer {
    /// Create the server and install it as the stack's event handler
    pub fn new(
        stack: Arc<dyn BleStack>,
        device_name: &str,
        advertised_service: Option<BleUuid>,
        options: ServerOptions,
    ) -> Arc<Self> {
        let server = Arc::new(Self {
            stack: stack.clone(),
            options,
            state: Mutex::new(ServerState {
                started: false,
                device_name: device_name.to_string(),
                services: Vec::new(),
                peers: HashMap::new(),
            }),
            advertising: AdvertisingController::new(device_name, advertised_service),
            rendezvous: Rendezvous::new(),
            op_in_flight: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&server);
        stack.set_event_handler(Arc::new(move |event| {
            if let Some(server) = weak.upgrade() {
                server.handle_event(event);
            }
        }));

        server
    }

    fn begin_op(&self) -> BleResult<OpGuard<'_>> {
        self.op_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| BleError::Busy)?;
        Ok(OpGuard(&self.op_in_flight))
    }

    // Submit one stack request and block until its completion event or the timeout
    fn request<F>(&self, kind: CompletionKind, context: &str, submit: F) -> BleResult<u16>
    where
        F: FnOnce(&dyn BleStack) -> Result<(), StackError>,
    {
        self.rendezvous.arm(kind);
        if let Err(e) = submit(self.stack.as_ref()) {
            self.rendezvous.disarm();
            error!("❌ {} rejected by BLE stack: {}", context, e);
            return Err(BleError::Stack(e.0, context.to_string()));
        }

        let event = self.rendezvous.wait(self.options.op_timeout).ok_or_else(|| {
            warn!("⏰ Timed out waiting for {}", context);
            BleError::Timeout(context.to_string())
        })?;

        match event.completion() {
            Some((STATUS_OK, handle)) => Ok(handle),
            Some((status, _)) => {
                error!("❌ {} failed with status {}", context, status);
                Err(BleError::Stack(status, context.to_string()))
            }
            None => Err(BleError::Internal(format!(
                "unexpected completion {:?} for {}",
                event, context
            ))),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ServerState> {
        lock_recover(&self.state)
    }

    /// Set the advertised device name; only allowed before `start`
    pub fn set_device_name(&self, name: &str) -> BleResult<()> {
        if name.len() > MAX_DEVICE_NAME_LEN {
            return Err(BleError::NameTooLong(name.len()));
        }
        {
            let mut state = self.lock_state();
            if state.started {
                return Err(BleError::AlreadyStarted);
            }
            state.device_name = name.to_string();
        }
        self.advertising.set_name(name);
        Ok(())
    }

    pub fn device_name(&self) -> String {
        self.lock_state().device_name.clone()
    }

    /// Replace the advertising payload, generated from the name or raw blocks
    pub fn configure_advertising(
        &self,
        raw: bool,
        adv: Option<&[u8]>,
        scan: Option<&[u8]>,
    ) -> BleResult<AdvUpdate> {
        let _op = self.begin_op()?;
        self.advertising.update(self.stack.as_ref(), raw, adv, scan)
    }

    /// Register with the stack, push the advertising payload and start advertising
    pub fn start(&self) -> BleResult<()> {
        let _op = self.begin_op()?;
        let name = {
            let state = self.lock_state();
            if state.started {
                return Err(BleError::AlreadyStarted);
            }
            state.device_name.clone()
        };

        self.request(CompletionKind::AppRegistered, "app registration", |s| {
            s.register_app()
        })?;
        self.stack
            .set_device_name(&name)
            .map_err(|e| BleError::Stack(e.0, "device name".to_string()))?;

        let (adv, scan) = self.advertising.blocks();
        self.request(CompletionKind::AdvDataSet, "advertising data", |s| {
            s.set_adv_data(&adv)
        })?;
        self.request(CompletionKind::ScanResponseSet, "scan response", |s| {
            s.set_scan_response(&scan)
        })?;
        self.request(CompletionKind::AdvStarted, "advertising start", |s| {
            s.start_advertising()
        })?;

        self.lock_state().started = true;
        self.advertising.mark_started();
        info!("✅ BLE server '{}' started and advertising", name);
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.lock_state().started
    }

    /// Add a service with its characteristics and descriptors
    ///
    /// Returns the service handle followed by every characteristic and descriptor
    /// handle in declaration order. A failure after the stack created the service
    /// deletes it again so the table and the stack stay in agreement.
    pub fn add_service(&self, uuid: BleUuid, characteristics: &[CharacteristicDef]) -> BleResult<Vec<u16>> {
        let _op = self.begin_op()?;

        let needed: usize = characteristics.iter().map(|c| 1 + c.descriptors.len()).sum();
        {
            let state = self.lock_state();
            if !state.started {
                return Err(BleError::NotStarted);
            }
            if state.services.len() >= self.options.max_services {
                return Err(BleError::TooManyServices);
            }
            if state.attribute_count() + needed > self.options.max_attributes {
                return Err(BleError::TooManyAttributes);
            }
        }
        for chr in characteristics {
            check_len(chr.value.len(), chr.max_len as usize)?;
            for descr in &chr.descriptors {
                check_len(descr.value.len(), descr.max_len as usize)?;
            }
        }

        // Declaration plus value per characteristic, one per descriptor
        let reserved: usize = 1 + characteristics
            .iter()
            .map(|c| 2 + c.descriptors.len())
            .sum::<usize>();
        let num_handles = u16::try_from(reserved).map_err(|_| BleError::TooManyAttributes)?;

        let service_handle = self.request(CompletionKind::ServiceCreated, "service creation", |s| {
            s.create_service(&uuid, num_handles)
        })?;

        match self.populate_service(service_handle, num_handles, characteristics) {
            Ok(attributes) => {
                let mut handles = Vec::with_capacity(attributes.len() + 1);
                handles.push(service_handle);
                handles.extend(attributes.iter().map(|a| a.handle));
                self.lock_state().services.push(ServiceEntry {
                    handle: service_handle,
                    uuid,
                    attributes,
                });
                info!("✅ Service {} added with handles {:?}", service_handle, handles);
                Ok(handles)
            }
            Err(e) => {
                warn!("🔄 Rolling back service {} after: {}", service_handle, e);
                if let Err(rollback) =
                    self.request(CompletionKind::ServiceDeleted, "service rollback", |s| {
                        s.delete_service(service_handle)
                    })
                {
                    error!("❌ Rollback of service {} failed: {}", service_handle, rollback);
                }
                Err(e)
            }
        }
    }

    fn populate_service(
        &self,
        service_handle: u16,
        num_handles: u16,
        characteristics: &[CharacteristicDef],
    ) -> BleResult<Vec<Attribute>> {
        let end = service_handle as u32 + num_handles as u32;
        let mut last = service_handle;
        let mut attributes = Vec::new();

        let mut accept = |handle: u16| -> BleResult<u16> {
            if handle <= last || handle as u32 >= end {
                return Err(BleError::Internal(format!(
                    "stack assigned handle {} outside {}..{}",
                    handle, service_handle, end
                )));
            }
            last = handle;
            Ok(handle)
        };

        for chr in characteristics {
            let handle = self.request(CompletionKind::CharacteristicAdded, "characteristic add", |s| {
                s.add_characteristic(service_handle, chr)
            })?;
            let chr_handle = accept(handle)?;
            attributes.push(Attribute {
                handle: chr_handle,
                kind: AttributeKind::Characteristic,
                uuid: chr.uuid,
                permissions: chr.permissions,
                properties: chr.properties,
                max_len: chr.max_len as usize,
                value: chr.value.clone(),
            });

            for descr in &chr.descriptors {
                let handle = self.request(CompletionKind::DescriptorAdded, "descriptor add", |s| {
                    s.add_descriptor(service_handle, descr)
                })?;
                attributes.push(Attribute {
                    handle: accept(handle)?,
                    kind: AttributeKind::Descriptor {
                        characteristic: chr_handle,
                    },
                    uuid: descr.uuid,
                    permissions: descr.permissions,
                    properties: Properties::empty(),
                    max_len: descr.max_len as usize,
                    value: descr.value.clone(),
                });
            }
        }

        self.request(CompletionKind::ServiceStarted, "service start", |s| {
            s.start_service(service_handle)
        })?;
        Ok(attributes)
    }

    /// Remove the most recently added service
    pub fn remove_service(&self, handle: u16) -> BleResult<()> {
        let _op = self.begin_op()?;
        {
            let state = self.lock_state();
            if !state.started {
                return Err(BleError::NotStarted);
            }
            match state.services.iter().position(|s| s.handle == handle) {
                None => return Err(BleError::InvalidHandle(handle)),
                Some(index) if index + 1 != state.services.len() => {
                    return Err(BleError::ServiceNotLast(handle))
                }
                Some(_) => {}
            }
        }

        self.request(CompletionKind::ServiceDeleted, "service deletion", |s| {
            s.delete_service(handle)
        })?;

        let mut state = self.lock_state();
        if let Some(service) = state.services.pop() {
            let handles: Vec<u16> = service.attributes.iter().map(|a| a.handle).collect();
            for peer in state.peers.values_mut() {
                peer.subscriptions.retain(|h, _| !handles.contains(h));
            }
        }
        info!("🗑️ Service {} removed", handle);
        Ok(())
    }

    pub fn get_value(&self, handle: u16) -> BleResult<Vec<u8>> {
        self.lock_state()
            .attribute(handle)
            .map(|a| a.value.clone())
            .ok_or(BleError::InvalidHandle(handle))
    }

    /// Store a value and push it to every peer subscribed to it
    pub fn set_value(&self, handle: u16, value: &[u8]) -> BleResult<()> {
        let targets: Vec<(u16, bool)> = {
            let mut state = self.lock_state();
            let attribute = state
                .attribute_mut(handle)
                .ok_or(BleError::InvalidHandle(handle))?;
            check_len(value.len(), attribute.max_len)?;
            attribute.value = value.to_vec();

            let properties = attribute.properties;
            state
                .peers
                .iter()
                .filter_map(|(conn_id, peer)| {
                    let sub = peer.subscriptions.get(&handle)?;
                    if sub.notify && properties.contains(Properties::NOTIFY) {
                        Some((*conn_id, false))
                    } else if sub.indicate && properties.contains(Properties::INDICATE) {
                        Some((*conn_id, true))
                    } else {
                        None
                    }
                })
                .collect()
        };

        self.stack
            .set_attr_value(handle, value)
            .map_err(|e| BleError::Stack(e.0, "attribute value update".to_string()))?;

        for (conn_id, confirm) in targets {
            if let Err(e) = self.stack.notify(conn_id, handle, value, confirm) {
                warn!("⚠️ Notification of handle {} to peer {} failed: {}", handle, conn_id, e);
            }
        }
        Ok(())
    }

    pub fn enumerate_services(&self) -> Vec<ServiceInfo> {
        self.lock_state()
            .services
            .iter()
            .map(|s| ServiceInfo {
                handle: s.handle,
                uuid: s.uuid,
                attribute_handles: s.attributes.iter().map(|a| a.handle).collect(),
            })
            .collect()
    }

    /// Characteristics and descriptors of one service, in handle order
    pub fn enumerate_attributes(&self, service_handle: u16) -> BleResult<Vec<Attribute>> {
        self.lock_state()
            .services
            .iter()
            .find(|s| s.handle == service_handle)
            .map(|s| s.attributes.clone())
            .ok_or(BleError::InvalidHandle(service_handle))
    }

    pub fn service_count(&self) -> usize {
        self.lock_state().services.len()
    }

    pub fn attribute_count(&self) -> usize {
        self.lock_state().attribute_count()
    }

    pub fn connected_peers(&self) -> Vec<u16> {
        let mut peers: Vec<u16> = self.lock_state().peers.keys().copied().collect();
        peers.sort_unstable();
        peers
    }

    /// Largest notification payload every connected peer accepts
    pub fn notify_payload_len(&self) -> usize {
        self.lock_state()
            .peers
            .values()
            .map(|p| (p.mtu as usize).saturating_sub(3))
            .min()
            .unwrap_or(DEFAULT_NOTIFY_LEN)
            .max(DEFAULT_NOTIFY_LEN)
    }

    pub fn add_write_listener(&self, listener: WriteListener) {
        lock_recover(&self.listeners).push(listener);
    }

    pub fn advertising(&self) -> &AdvertisingController {
        &self.advertising
    }

    /// Entry point for every event reported by the stack
    pub fn handle_event(&self, event: StackEvent) {
        if self.advertising.on_event(self.stack.as_ref(), &event) {
            return;
        }
        if self.rendezvous.offer(&event) {
            return;
        }

        match event {
            StackEvent::PeerConnected { conn_id } => {
                info!("📱 BLE peer {} connected", conn_id);
                self.lock_state().peers.insert(
                    conn_id,
                    Peer {
                        mtu: 23,
                        subscriptions: HashMap::new(),
                    },
                );
            }
            StackEvent::PeerDisconnected { conn_id, reason } => {
                info!("📱 BLE peer {} disconnected (reason 0x{:02x})", conn_id, reason);
                let started = {
                    let mut state = self.lock_state();
                    state.peers.remove(&conn_id);
                    state.started
                };
                if started {
                    self.advertising.resume(self.stack.as_ref());
                }
            }
            StackEvent::MtuChanged { conn_id, mtu } => {
                debug!("BLE peer {} negotiated MTU {}", conn_id, mtu);
                if let Some(peer) = self.lock_state().peers.get_mut(&conn_id) {
                    peer.mtu = mtu;
                }
            }
            StackEvent::SubscriptionChanged {
                conn_id,
                handle,
                notify,
                indicate,
            } => self.update_subscription(conn_id, handle, Subscription { notify, indicate }),
            StackEvent::PeerWrite {
                conn_id,
                handle,
                value,
            } => self.handle_peer_write(conn_id, handle, value),
            other => debug!("Ignoring BLE stack event {:?}", other),
        }
    }

    fn update_subscription(&self, conn_id: u16, handle: u16, sub: Subscription) {
        debug!(
            "BLE peer {} subscription on {}: notify={} indicate={}",
            conn_id, handle, sub.notify, sub.indicate
        );
        let mut state = self.lock_state();
        if let Some(peer) = state.peers.get_mut(&conn_id) {
            if sub.notify || sub.indicate {
                peer.subscriptions.insert(handle, sub);
            } else {
                peer.subscriptions.remove(&handle);
            }
        }
    }

    fn handle_peer_write(&self, conn_id: u16, handle: u16, value: Vec<u8>) {
        let subscription = {
            let mut state = self.lock_state();
            let attribute = match state.attribute_mut(handle) {
                Some(attribute) => attribute,
                None => {
                    warn!("⚠️ BLE peer {} wrote unknown handle {}", conn_id, handle);
                    return;
                }
            };
            if value.len() > attribute.max_len {
                warn!(
                    "⚠️ BLE peer {} wrote {} bytes to handle {} (max {})",
                    conn_id,
                    value.len(),
                    handle,
                    attribute.max_len
                );
                return;
            }
            attribute.value = value.clone();

            match attribute.kind {
                AttributeKind::Descriptor { characteristic } if attribute.uuid == BleUuid::CCCD => {
                    let bits = value.first().copied().unwrap_or(0);
                    Some((
                        characteristic,
                        Subscription {
                            notify: bits & 0x01 != 0,
                            indicate: bits & 0x02 != 0,
                        },
                    ))
                }
                _ => None,
            }
        };

        if let Some((characteristic, sub)) = subscription {
            self.update_subscription(conn_id, characteristic, sub);
        }

        let listeners: Vec<WriteListener> = lock_recover(&self.listeners).clone();
        for listener in listeners {
            listener(handle, &value);
        }
    }
}

fn check_len(len: usize, max: usize) -> BleResult<()> {
    if len > max {
        Err(BleError::TooLong { len, max })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble_stack::DescriptorDef;
    use crate::sim::{SimBleStack, SimCall};

    fn started_server(options: ServerOptions) -> (Arc<SimBleStack>, Arc<AttributeServer>) {
        let stack = Arc::new(SimBleStack::new());
        let server = AttributeServer::new(stack.clone(), "Rig-7", None, options);
        server.start().unwrap();
        (stack, server)
    }

    fn uuid16(v: u16) -> BleUuid {
        BleUuid::Uuid16(v)
    }

    fn rw_notify(uuid: u16) -> CharacteristicDef {
        CharacteristicDef::new(
            uuid16(uuid),
            Permissions::READ | Permissions::WRITE,
            Properties::READ | Properties::WRITE | Properties::NOTIFY,
            20,
        )
    }

    #[test]
    fn handles_are_contiguous_and_counted() {
        let (_, server) = started_server(ServerOptions::default());
        let chars = vec![
            rw_notify(0xAA01).with_descriptor(DescriptorDef::cccd()),
            rw_notify(0xAA02),
            rw_notify(0xAA03)
                .with_descriptor(DescriptorDef::cccd())
                .with_descriptor(DescriptorDef::new(uuid16(0x2901), Permissions::READ, 8)),
        ];
        let handles = server.add_service(uuid16(0xAA00), &chars).unwrap();

        // 1 + sum(1 + descriptor_count)
        assert_eq!(handles.len(), 1 + 2 + 1 + 3);
        assert!(handles.windows(2).all(|w| w[1] == w[0] + 1));
        assert_eq!(server.attribute_count(), 6);
    }

    #[test]
    fn remove_requires_last_service() {
        let (_, server) = started_server(ServerOptions::default());
        let first = server.add_service(uuid16(0x1000), &[rw_notify(0x1001)]).unwrap();
        let second = server.add_service(uuid16(0x2000), &[rw_notify(0x2001)]).unwrap();
        let before = server.enumerate_services();

        assert_eq!(
            server.remove_service(first[0]),
            Err(BleError::ServiceNotLast(first[0]))
        );
        assert_eq!(server.enumerate_services(), before);

        server.remove_service(second[0]).unwrap();
        server.remove_service(first[0]).unwrap();
        assert_eq!(server.service_count(), 0);
    }

    #[test]
    fn name_rules() {
        let stack = Arc::new(SimBleStack::new());
        let server = AttributeServer::new(stack, "a", None, ServerOptions::default());
        assert_eq!(
            server.set_device_name(&"n".repeat(31)),
            Err(BleError::NameTooLong(31))
        );
        server.set_device_name("Rig-7").unwrap();
        server.start().unwrap();
        assert_eq!(server.set_device_name("other"), Err(BleError::AlreadyStarted));
        assert_eq!(server.start(), Err(BleError::AlreadyStarted));
    }

    #[test]
    fn add_before_start_is_rejected() {
        let stack = Arc::new(SimBleStack::new());
        let server = AttributeServer::new(stack, "Rig-7", None, ServerOptions::default());
        assert_eq!(
            server.add_service(uuid16(0x1000), &[rw_notify(0x1001)]),
            Err(BleError::NotStarted)
        );
    }

    #[test]
    fn capacity_limits() {
        let options = ServerOptions {
            max_services: 1,
            max_attributes: 2,
            ..Default::default()
        };
        let (_, server) = started_server(options);
        assert_eq!(
            server.add_service(uuid16(0x1000), &[rw_notify(1), rw_notify(2), rw_notify(3)]),
            Err(BleError::TooManyAttributes)
        );
        server.add_service(uuid16(0x1000), &[rw_notify(1)]).unwrap();
        assert_eq!(
            server.add_service(uuid16(0x2000), &[rw_notify(2)]),
            Err(BleError::TooManyServices)
        );
    }

    #[test]
    fn oversized_values_are_rejected() {
        let (_, server) = started_server(ServerOptions::default());
        let too_big = rw_notify(1).with_value(&[0; 21]);
        assert_eq!(
            server.add_service(uuid16(0x1000), &[too_big]),
            Err(BleError::TooLong { len: 21, max: 20 })
        );

        let handles = server.add_service(uuid16(0x1000), &[rw_notify(1)]).unwrap();
        assert_eq!(
            server.set_value(handles[1], &[0; 21]),
            Err(BleError::TooLong { len: 21, max: 20 })
        );
        assert_eq!(server.set_value(999, &[1]), Err(BleError::InvalidHandle(999)));
    }

    #[test]
    fn unresponsive_stack_times_out() {
        let options = ServerOptions {
            op_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let (stack, server) = started_server(options);
        stack.set_responsive(false);
        assert!(matches!(
            server.add_service(uuid16(0x1000), &[rw_notify(1)]),
            Err(BleError::Timeout(_))
        ));
        assert_eq!(server.service_count(), 0);
    }

    #[test]
    fn rejected_characteristic_rolls_back_service() {
        let (stack, server) = started_server(ServerOptions::default());
        stack.fail_next_characteristic(0x85);
        assert_eq!(
            server.add_service(uuid16(0x1000), &[rw_notify(1)]),
            Err(BleError::Stack(0x85, "characteristic add".to_string()))
        );
        assert!(stack
            .calls()
            .iter()
            .any(|c| matches!(c, SimCall::DeleteService(_))));
        assert_eq!(server.service_count(), 0);
    }

    #[test]
    fn cccd_write_subscribes_and_listeners_see_writes() {
        let (stack, server) = started_server(ServerOptions::default());
        let handles = server
            .add_service(
                uuid16(0x1000),
                &[rw_notify(0x1001).with_descriptor(DescriptorDef::cccd())],
            )
            .unwrap();
        let (chr, cccd) = (handles[1], handles[2]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        server.add_write_listener(Arc::new(move |handle, value: &[u8]| {
            lock_recover(&sink).push((handle, value.to_vec()));
        }));

        stack.connect_peer(4);
        stack.peer_write(4, cccd, &[0x01, 0x00]);
        stack.peer_write(4, chr, b"hi");
        assert_eq!(server.get_value(chr).unwrap(), b"hi".to_vec());
        assert_eq!(lock_recover(&seen).len(), 2);

        server.set_value(chr, &[9]).unwrap();
        assert_eq!(stack.notifications(), vec![(4, chr, vec![9], false)]);

        stack.disconnect_peer(4);
        assert!(server.connected_peers().is_empty());
        server.set_value(chr, &[10]).unwrap();
        assert_eq!(stack.notifications().len(), 1);
    }

    #[test]
    fn concurrent_operation_reports_busy() {
        let (_, server) = started_server(ServerOptions::default());
        let _held = server.begin_op().unwrap();
        assert_eq!(
            server.add_service(uuid16(0x1000), &[rw_notify(1)]),
            Err(BleError::Busy)
        );
    }
}
