// Advertising payload ownership and the stop/swap/restart cycle
// Once advertising runs, a payload change stops it first; the new blocks are applied
// and advertising restarted from the stack's confirmation events.

use log::{debug, info, warn};
use std::sync::Mutex;

use crate::ble_server::{lock_recover, BleError, BleResult};
use crate::ble_stack::{BleStack, BleUuid, StackEvent, STATUS_OK};

/// Maximum size of one advertising or scan response block
pub const MAX_ADV_BLOCK_LEN: usize = 31;

// AD types
const AD_FLAGS: u8 = 0x01;
const AD_UUID16_COMPLETE: u8 = 0x03;
const AD_UUID32_COMPLETE: u8 = 0x05;
const AD_UUID128_COMPLETE: u8 = 0x07;
const AD_NAME_SHORT: u8 = 0x08;
const AD_NAME_COMPLETE: u8 = 0x09;

// LE general discoverable, BR/EDR not supported
const FLAGS_GENERAL_NO_BREDR: u8 = 0x06;

/// What the controller advertises
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvPayload {
    /// Built from the device name and the advertised service
    Generated,
    Raw { adv: Vec<u8>, scan: Vec<u8> },
}

/// Outcome of an `update`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvUpdate {
    /// Not advertising yet, payload remembered for `start`
    Stored,
    /// Advertising stopped, swap happens on the stop confirmation
    Pending,
    /// A swap was already in flight, its payload was overwritten
    Replaced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwapStage {
    Idle,
    Stopping,
    SettingAdv,
    SettingScan,
    Restarting,
}

struct AdvState {
    name: String,
    service: Option<BleUuid>,
    payload: AdvPayload,
    started: bool,
    stage: SwapStage,
    pending: Option<AdvPayload>,
}

impl AdvState {
    fn blocks(&self) -> (Vec<u8>, Vec<u8>) {
        match &self.payload {
            AdvPayload::Generated => (
                generated_adv_block(&self.name),
                generated_scan_block(self.service.as_ref()),
            ),
            AdvPayload::Raw { adv, scan } => (adv.clone(), scan.clone()),
        }
    }
}

/// Flags plus the device name, shortened when it does not fit
pub fn generated_adv_block(name: &str) -> Vec<u8> {
    let mut block = vec![2, AD_FLAGS, FLAGS_GENERAL_NO_BREDR];
    let room = MAX_ADV_BLOCK_LEN - block.len() - 2;
    let bytes = name.as_bytes();
    let (ad_type, name_bytes) = if bytes.len() > room {
        (AD_NAME_SHORT, &bytes[..room])
    } else {
        (AD_NAME_COMPLETE, bytes)
    };
    block.push(name_bytes.len() as u8 + 1);
    block.push(ad_type);
    block.extend_from_slice(name_bytes);
    block
}

/// Complete service UUID list with the advertised service, empty without one
pub fn generated_scan_block(service: Option<&BleUuid>) -> Vec<u8> {
    let Some(uuid) = service else {
        return Vec::new();
    };
    let ad_type = match uuid {
        BleUuid::Uuid16(_) => AD_UUID16_COMPLETE,
        BleUuid::Uuid32(_) => AD_UUID32_COMPLETE,
        BleUuid::Uuid128(_) => AD_UUID128_COMPLETE,
    };
    let bytes = uuid.to_le_bytes();
    let mut block = vec![bytes.len() as u8 + 1, ad_type];
    block.extend(bytes);
    block
}

pub struct AdvertisingController {
    state: Mutex<AdvState>,
}

impl AdvertisingController {
    pub fn new(name: &str, service: Option<BleUuid>) -> Self {
        Self {
            state: Mutex::new(AdvState {
                name: name.to_string(),
                service,
                payload: AdvPayload::Generated,
                started: false,
                stage: SwapStage::Idle,
                pending: None,
            }),
        }
    }

    pub(crate) fn set_name(&self, name: &str) {
        lock_recover(&self.state).name = name.to_string();
    }

    /// Current advertising and scan response blocks
    pub fn blocks(&self) -> (Vec<u8>, Vec<u8>) {
        lock_recover(&self.state).blocks()
    }

    pub fn payload(&self) -> AdvPayload {
        lock_recover(&self.state).payload.clone()
    }

    pub fn is_swap_pending(&self) -> bool {
        lock_recover(&self.state).stage != SwapStage::Idle
    }

    pub(crate) fn mark_started(&self) {
        lock_recover(&self.state).started = true;
    }

    /// Replace the payload; `None` raw blocks keep the previous raw block
    pub fn update(
        &self,
        stack: &dyn BleStack,
        raw: bool,
        adv: Option<&[u8]>,
        scan: Option<&[u8]>,
    ) -> BleResult<AdvUpdate> {
        for block in [adv, scan].into_iter().flatten() {
            if block.len() > MAX_ADV_BLOCK_LEN {
                return Err(BleError::TooLong {
                    len: block.len(),
                    max: MAX_ADV_BLOCK_LEN,
                });
            }
        }

        let mut state = lock_recover(&self.state);
        let payload = if raw {
            let (old_adv, old_scan) = match state.pending.as_ref().unwrap_or(&state.payload) {
                AdvPayload::Raw { adv, scan } => (adv.clone(), scan.clone()),
                AdvPayload::Generated => (Vec::new(), Vec::new()),
            };
            AdvPayload::Raw {
                adv: adv.map(<[u8]>::to_vec).unwrap_or(old_adv),
                scan: scan.map(<[u8]>::to_vec).unwrap_or(old_scan),
            }
        } else {
            AdvPayload::Generated
        };

        if !state.started {
            state.payload = payload;
            return Ok(AdvUpdate::Stored);
        }

        if state.stage != SwapStage::Idle {
            debug!("advertising swap in flight, replacing its payload");
            state.pending = Some(payload);
            return Ok(AdvUpdate::Replaced);
        }

        state.pending = Some(payload);
        state.stage = SwapStage::Stopping;
        drop(state);

        if let Err(e) = stack.stop_advertising() {
            let mut state = lock_recover(&self.state);
            state.stage = SwapStage::Idle;
            state.pending = None;
            return Err(BleError::Stack(e.0, "advertising stop".to_string()));
        }
        info!("📡 Advertising stopped for payload swap");
        Ok(AdvUpdate::Pending)
    }

    /// Restart advertising after a peer left, unless a swap will do it
    pub(crate) fn resume(&self, stack: &dyn BleStack) {
        let idle = {
            let state = lock_recover(&self.state);
            state.started && state.stage == SwapStage::Idle
        };
        if idle {
            if let Err(e) = stack.start_advertising() {
                warn!("⚠️ Could not resume advertising: {}", e);
            }
        }
    }

    // Advance the swap; true when the event belonged to it
    pub(crate) fn on_event(&self, stack: &dyn BleStack, event: &StackEvent) -> bool {
        let mut state = lock_recover(&self.state);
        let (status, next) = match (state.stage, event) {
            (SwapStage::Stopping, StackEvent::AdvStopped { status }) => {
                if let Some(payload) = state.pending.take() {
                    state.payload = payload;
                }
                (*status, SwapStage::SettingAdv)
            }
            (SwapStage::SettingAdv, StackEvent::AdvDataSet { status }) => (*status, SwapStage::SettingScan),
            (SwapStage::SettingScan, StackEvent::ScanResponseSet { status }) => {
                (*status, SwapStage::Restarting)
            }
            (SwapStage::Restarting, StackEvent::AdvStarted { status }) => {
                if state.pending.is_some() {
                    (*status, SwapStage::Stopping)
                } else {
                    (*status, SwapStage::Idle)
                }
            }
            _ => return false,
        };
        if status != STATUS_OK {
            warn!("⚠️ Advertising step {:?} reported status {}", state.stage, status);
        }
        state.stage = next;
        let (adv, scan) = state.blocks();
        drop(state);

        let submitted = match next {
            SwapStage::SettingAdv => stack.set_adv_data(&adv),
            SwapStage::SettingScan => stack.set_scan_response(&scan),
            SwapStage::Restarting => stack.start_advertising(),
            SwapStage::Stopping => stack.stop_advertising(),
            SwapStage::Idle => {
                info!("✅ Advertising restarted with new payload");
                Ok(())
            }
        };

        if let Err(e) = submitted {
            warn!("⚠️ Advertising swap step {:?} rejected: {}", next, e);
            let mut state = lock_recover(&self.state);
            state.stage = SwapStage::Idle;
            state.pending = None;
        }
        true
    }
}
