mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{init_logging, wait_for};
use vesc_link::ble_advertising::AdvUpdate;
use vesc_link::ble_server::{AttributeServer, BleError, ServerOptions};
use vesc_link::ble_stack::{BleUuid, CharacteristicDef, Permissions, Properties, StackEvent, STATUS_OK};
use vesc_link::sim::{SimBleStack, SimCall};

fn rig() -> (Arc<SimBleStack>, Arc<AttributeServer>) {
    let stack = Arc::new(SimBleStack::new());
    let server = AttributeServer::new(stack.clone(), "Rig-7", None, ServerOptions::default());
    server.start().unwrap();
    (stack, server)
}

fn read_write_notify() -> CharacteristicDef {
    CharacteristicDef::new(
        BleUuid::Uuid16(0x2A6E),
        Permissions::READ | Permissions::WRITE,
        Properties::READ | Properties::WRITE | Properties::NOTIFY,
        20,
    )
}

#[test]
fn single_characteristic_service_lifecycle() {
    init_logging();
    let (stack, server) = rig();

    let handles = server
        .add_service(BleUuid::Uuid16(0x181A), &[read_write_notify()])
        .unwrap();
    assert_eq!(handles, vec![100, 101]);

    stack.connect_peer(1);
    stack.subscribe_peer(1, 101, true, false);
    server.set_value(101, &[1, 2, 3]).unwrap();
    assert_eq!(server.get_value(101).unwrap(), vec![1, 2, 3]);
    assert_eq!(stack.notifications(), vec![(1, 101, vec![1, 2, 3], false)]);

    server.remove_service(100).unwrap();
    assert_eq!(server.remove_service(100), Err(BleError::InvalidHandle(100)));
    assert_eq!(server.service_count(), 0);
}

#[test]
fn unsubscribed_peers_are_not_notified() {
    init_logging();
    let (stack, server) = rig();
    server
        .add_service(BleUuid::Uuid16(0x181A), &[read_write_notify()])
        .unwrap();

    stack.connect_peer(1);
    stack.connect_peer(2);
    stack.subscribe_peer(2, 101, true, false);
    stack.subscribe_peer(2, 101, false, false);
    server.set_value(101, &[9]).unwrap();

    assert!(stack.notifications().is_empty());
    assert_eq!(server.connected_peers().len(), 2);
}

#[test]
fn advertising_resumes_after_peer_leaves() {
    init_logging();
    let (stack, _server) = rig();
    let starts = |stack: &SimBleStack| {
        stack
            .calls()
            .into_iter()
            .filter(|c| *c == SimCall::StartAdvertising)
            .count()
    };
    assert_eq!(starts(&stack), 1);

    stack.connect_peer(4);
    stack.disconnect_peer(4);
    assert_eq!(starts(&stack), 2);
}

#[test]
fn advertising_swap_after_start_restarts_with_new_blocks() {
    init_logging();
    let (stack, server) = rig();
    let before = stack.calls().len();

    assert_eq!(
        server.configure_advertising(true, Some(&[7]), Some(&[3])).unwrap(),
        AdvUpdate::Pending
    );
    assert!(wait_for(Duration::from_secs(2), || {
        !server.advertising().is_swap_pending() && stack.calls().len() >= before + 4
    }));
    assert_eq!(
        stack.calls()[before..],
        [
            SimCall::StopAdvertising,
            SimCall::SetAdvData(vec![7]),
            SimCall::SetScanResponse(vec![3]),
            SimCall::StartAdvertising,
        ]
    );
    assert_eq!(server.advertising().blocks(), (vec![7], vec![3]));
}

#[test]
fn update_during_swap_replaces_the_pending_payload() {
    init_logging();
    let (stack, server) = rig();
    stack.set_responsive(false);
    let before = stack.calls().len();

    assert_eq!(
        server.configure_advertising(true, Some(&[7]), Some(&[3])).unwrap(),
        AdvUpdate::Pending
    );
    assert_eq!(
        server.configure_advertising(true, Some(&[8]), None).unwrap(),
        AdvUpdate::Replaced
    );
    assert_eq!(stack.calls()[before..], [SimCall::StopAdvertising]);

    // Step the swap by hand since the stack stays silent
    server.handle_event(StackEvent::AdvStopped { status: STATUS_OK });
    server.handle_event(StackEvent::AdvDataSet { status: STATUS_OK });
    server.handle_event(StackEvent::ScanResponseSet { status: STATUS_OK });
    assert!(server.advertising().is_swap_pending());
    server.handle_event(StackEvent::AdvStarted { status: STATUS_OK });

    assert!(!server.advertising().is_swap_pending());
    assert_eq!(
        stack.calls()[before..],
        [
            SimCall::StopAdvertising,
            SimCall::SetAdvData(vec![8]),
            SimCall::SetScanResponse(vec![3]),
            SimCall::StartAdvertising,
        ]
    );
}
