//! Connection lifecycle and operation-serialization tests against the
//! scripted mock platform.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;
use uuid::Uuid;

use blelink::mock::MockPlatform;
use blelink::{
    Characteristic, Error, OperationRequest, OperationResponse, Peripheral, PeripheralState,
    PlatformError, PlatformErrorKind, WriteType,
};

const TICK: Duration = Duration::from_millis(20);

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

fn rig() -> (MockPlatform, Peripheral) {
    init_tracing();
    let mock = MockPlatform::new();
    let peripheral = Peripheral::new(mock.clone());
    (mock, peripheral)
}

fn characteristic() -> Characteristic {
    Characteristic::new(Uuid::new_v4(), Uuid::new_v4())
}

async fn wait_for_state(
    state: &mut watch::Receiver<PeripheralState>,
    predicate: impl Fn(&PeripheralState) -> bool,
) {
    timeout(Duration::from_secs(1), async {
        loop {
            if predicate(&state.borrow_and_update()) {
                return;
            }
            state.changed().await.expect("state channel closed");
        }
    })
    .await
    .expect("state never reached");
}

#[tokio::test]
async fn concurrent_connects_share_one_handshake() {
    let (mock, peripheral) = rig();
    mock.hold_handshake();
    let mut state = peripheral.state();

    let first = tokio::spawn({
        let peripheral = peripheral.clone();
        async move { peripheral.connect().await }
    });
    let second = tokio::spawn({
        let peripheral = peripheral.clone();
        async move { peripheral.connect().await }
    });

    wait_for_state(&mut state, |s| *s == PeripheralState::Connecting).await;
    // Let the second caller join the attempt before it settles.
    tokio::time::sleep(TICK).await;
    mock.release_handshake();

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    assert_eq!(mock.connect_count(), 1);
    wait_for_state(&mut state, |s| *s == PeripheralState::Connected).await;
}

#[tokio::test]
async fn connect_is_idempotent_once_connected() {
    let (mock, peripheral) = rig();

    peripheral.connect().await.unwrap();
    peripheral.connect().await.unwrap();
    assert_eq!(mock.connect_count(), 1);
}

#[tokio::test]
async fn connect_failure_reaches_every_waiter() {
    let (mock, peripheral) = rig();
    mock.hold_handshake();
    mock.fail_next_connect(PlatformError::new(PlatformErrorKind::Rejected, "busy"));
    let mut state = peripheral.state();

    let first = tokio::spawn({
        let peripheral = peripheral.clone();
        async move { peripheral.connect().await }
    });
    let second = tokio::spawn({
        let peripheral = peripheral.clone();
        async move { peripheral.connect().await }
    });
    wait_for_state(&mut state, |s| *s == PeripheralState::Connecting).await;
    tokio::time::sleep(TICK).await;
    mock.release_handshake();

    let expected = Error::ConnectionRejected("busy".into());
    assert_eq!(first.await.unwrap().unwrap_err(), expected);
    assert_eq!(second.await.unwrap().unwrap_err(), expected);
    wait_for_state(&mut state, |s| {
        matches!(s, PeripheralState::Disconnected { reason: Some(_) })
    })
    .await;
    assert_eq!(mock.connect_count(), 1);
}

#[tokio::test]
async fn connect_with_adapter_disabled() {
    let (mock, peripheral) = rig();
    mock.fail_next_connect(PlatformError::new(
        PlatformErrorKind::AdapterDisabled,
        "radio off",
    ));

    let error = peripheral.connect().await.unwrap_err();
    assert_eq!(error, Error::BluetoothDisabled);
    assert!(error.is_bluetooth());
}

#[tokio::test]
async fn disconnect_is_idempotent_when_disconnected() {
    let (mock, peripheral) = rig();

    peripheral.disconnect().await;
    assert_eq!(mock.close_count(), 0);
    assert_eq!(
        *peripheral.state().borrow(),
        PeripheralState::Disconnected { reason: None }
    );
}

#[tokio::test]
async fn disconnect_cancels_inflight_connect() {
    let (mock, peripheral) = rig();
    mock.hold_handshake();
    let mut state = peripheral.state();

    let waiter = tokio::spawn({
        let peripheral = peripheral.clone();
        async move { peripheral.connect().await }
    });
    wait_for_state(&mut state, |s| *s == PeripheralState::Connecting).await;

    peripheral.disconnect().await;
    let error = waiter.await.unwrap().unwrap_err();
    assert!(matches!(error, Error::ConnectionRejected(_)));
    wait_for_state(&mut state, |s| {
        matches!(s, PeripheralState::Disconnected { .. })
    })
    .await;
}

#[tokio::test]
async fn disconnect_releases_native_resource_once() {
    let (mock, peripheral) = rig();

    peripheral.connect().await.unwrap();
    peripheral.disconnect().await;
    peripheral.disconnect().await;
    assert_eq!(mock.close_count(), 1);
}

#[tokio::test]
async fn operations_before_connect_fail_not_ready() {
    let (_mock, peripheral) = rig();
    let characteristic = characteristic();

    let error = peripheral.read(&characteristic).await.unwrap_err();
    assert_eq!(error, Error::NotReady);
    assert!(error.is_not_connected());
    assert_eq!(peripheral.rssi().await.unwrap_err(), Error::NotReady);
}

#[tokio::test]
async fn sequential_operations_get_their_own_responses() {
    let (mock, peripheral) = rig();
    peripheral.connect().await.unwrap();
    let characteristic = characteristic();

    let responder = tokio::spawn({
        let mock = mock.clone();
        async move {
            mock.next_issued().await;
            mock.respond(OperationResponse::Value(vec![0x01])).await;
            mock.next_issued().await;
            mock.respond(OperationResponse::Value(vec![0x02])).await;
            mock.next_issued().await;
            mock.respond(OperationResponse::Rssi(-54)).await;
        }
    });

    assert_eq!(peripheral.read(&characteristic).await.unwrap(), vec![0x01]);
    assert_eq!(peripheral.read(&characteristic).await.unwrap(), vec![0x02]);
    assert_eq!(peripheral.rssi().await.unwrap(), -54);
    responder.await.unwrap();

    let issued = mock.issued();
    assert_eq!(issued.len(), 3);
    assert!(matches!(issued[2], OperationRequest::ReadRssi));
}

#[tokio::test]
async fn cancelled_write_orphan_is_drained_by_next_operation() {
    let (mock, peripheral) = rig();
    peripheral.connect().await.unwrap();
    let characteristic = characteristic();

    // Cancel a write after its platform action fired but before the
    // response arrives.
    let write = tokio::spawn({
        let peripheral = peripheral.clone();
        async move {
            peripheral
                .write(&characteristic, &[0x01], WriteType::WithResponse)
                .await
        }
    });
    let issued = mock.next_issued().await;
    assert!(matches!(issued, OperationRequest::Write { .. }));
    // Let the write task reach its response await before aborting it.
    tokio::time::sleep(TICK).await;
    write.abort();
    let _ = write.await;

    // The hardware action still completes; its response now sits orphaned
    // in the single-slot channel.
    mock.respond(OperationResponse::WriteComplete).await;

    let responder = tokio::spawn({
        let mock = mock.clone();
        async move {
            mock.next_issued().await;
            mock.respond(OperationResponse::Value(vec![0x09])).await;
        }
    });

    // The read first drains and discards the orphan, then issues its own
    // action and receives only its own payload.
    assert_eq!(peripheral.read(&characteristic).await.unwrap(), vec![0x09]);
    responder.await.unwrap();
    assert_eq!(peripheral.discarded_responses().await, 1);

    let issued = mock.issued();
    assert_eq!(issued.len(), 2);
    assert!(matches!(issued[0], OperationRequest::Write { .. }));
    assert!(matches!(issued[1], OperationRequest::Read { .. }));
}

#[tokio::test]
async fn cancellation_inside_backend_call_still_drains_the_orphan() {
    let (mock, peripheral) = rig();
    peripheral.connect().await.unwrap();
    let characteristic = characteristic();

    // Suspend the backend call itself, after the hardware action fired.
    mock.hold_issue();
    let write = tokio::spawn({
        let peripheral = peripheral.clone();
        async move {
            peripheral
                .write(&characteristic, &[0x01], WriteType::WithResponse)
                .await
        }
    });
    let issued = mock.next_issued().await;
    assert!(matches!(issued, OperationRequest::Write { .. }));

    // Abort the caller while its write is still suspended inside the
    // backend call, then let the call finish on its own.
    tokio::time::sleep(TICK).await;
    write.abort();
    let _ = write.await;
    mock.release_issue();
    tokio::time::sleep(TICK).await;

    // The fired action still resolves; its response is an orphan.
    mock.respond(OperationResponse::WriteComplete).await;

    let responder = tokio::spawn({
        let mock = mock.clone();
        async move {
            mock.next_issued().await;
            mock.respond(OperationResponse::Value(vec![0x09])).await;
        }
    });

    // The next operation must drain the orphan rather than receive it.
    assert_eq!(peripheral.read(&characteristic).await.unwrap(), vec![0x09]);
    responder.await.unwrap();
    assert_eq!(peripheral.discarded_responses().await, 1);
}

#[tokio::test]
async fn gatt_status_response_surfaces_as_error() {
    let (mock, peripheral) = rig();
    peripheral.connect().await.unwrap();
    let characteristic = characteristic();

    let responder = tokio::spawn({
        let mock = mock.clone();
        async move {
            mock.next_issued().await;
            mock.respond(OperationResponse::Failure {
                status: Some(0x85),
                description: "GATT_ERROR".into(),
            })
            .await;
        }
    });

    let error = peripheral.read(&characteristic).await.unwrap_err();
    assert_eq!(
        error,
        Error::GattStatus { status: 0x85, description: "GATT_ERROR".into() }
    );
    responder.await.unwrap();
}

#[tokio::test]
async fn link_loss_fails_pending_operation_and_settles_disconnected() {
    let (mock, peripheral) = rig();
    let mut state = peripheral.state();
    peripheral.connect().await.unwrap();
    let characteristic = characteristic();

    let read = tokio::spawn({
        let peripheral = peripheral.clone();
        async move { peripheral.read(&characteristic).await }
    });
    mock.next_issued().await;

    mock.drop_link(MockPlatform::loss_error());

    let error = read.await.unwrap().unwrap_err();
    assert!(matches!(error, Error::ConnectionLost(_)));
    wait_for_state(&mut state, |s| {
        matches!(
            s,
            PeripheralState::Disconnected { reason: Some(Error::ConnectionLost(_)) }
        )
    })
    .await;
    assert_eq!(mock.close_count(), 1);
}

#[tokio::test]
async fn reconnect_after_loss_drives_a_fresh_handshake() {
    let (mock, peripheral) = rig();
    let mut state = peripheral.state();

    peripheral.connect().await.unwrap();
    mock.drop_link(MockPlatform::loss_error());
    wait_for_state(&mut state, |s| {
        matches!(s, PeripheralState::Disconnected { .. })
    })
    .await;

    peripheral.connect().await.unwrap();
    assert_eq!(mock.connect_count(), 2);
    assert_eq!(*state.borrow(), PeripheralState::Connected);
}

#[tokio::test]
async fn adapter_power_off_mid_connection_is_reported_as_loss() {
    let (mock, peripheral) = rig();
    let mut state = peripheral.state();
    peripheral.connect().await.unwrap();

    mock.drop_link(PlatformError::new(
        PlatformErrorKind::AdapterDisabled,
        "radio powered off",
    ));

    wait_for_state(&mut state, |s| {
        matches!(s, PeripheralState::Disconnected { .. })
    })
    .await;
    let reason = match &*state.borrow() {
        PeripheralState::Disconnected { reason: Some(reason) } => reason.clone(),
        other => panic!("unexpected state {other:?}"),
    };
    match reason {
        Error::ConnectionLost(Some(cause)) => assert_eq!(*cause, Error::BluetoothDisabled),
        other => panic!("unexpected reason {other:?}"),
    }
    assert_eq!(mock.close_count(), 1);
}
