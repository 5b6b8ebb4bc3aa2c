use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use uvclink::simulator::{FrameStep, PermissionBehavior};
use uvclink::{
    DeviceRef, Error, FailureReason, FillReport, ManagerConfig, ReconcileReport, SessionStatus,
    SimulatedDevice, SimulatedPlugin, SlotManager, SlotState,
};

fn bus(devices: Vec<SimulatedDevice>) -> Arc<SimulatedPlugin> {
    let plugin = Arc::new(SimulatedPlugin::new());
    for device in devices {
        plugin.attach(device);
    }
    plugin
}

fn manager(plugin: &Arc<SimulatedPlugin>, slots: usize) -> SlotManager {
    SlotManager::new(
        plugin.clone(),
        ManagerConfig {
            max_slots: slots,
            ..ManagerConfig::default()
        },
    )
}

fn streaming() -> SlotState {
    SlotState::Active(SessionStatus::Streaming)
}

#[tokio::test(start_paused = true)]
async fn two_cameras_one_permission_timeout() {
    let plugin = bus(vec![
        SimulatedDevice::new("cam-A").with_permission(PermissionBehavior::Never),
        SimulatedDevice::new("cam-B"),
    ]);
    let manager = manager(&plugin, 2);
    manager.init().await.unwrap();

    let fill = manager.initial_fill().await.unwrap();
    assert_eq!(
        fill,
        FillReport {
            discovered: 2,
            attempted: 2,
            streaming: 1,
        }
    );

    let status = manager.status().await;
    assert_eq!(status[0].device, Some(DeviceRef::from("cam-A")));
    assert_eq!(status[0].state, SlotState::NotAuthorized);
    assert!(status[0].last_error.is_some());
    assert_eq!(status[1].device, Some(DeviceRef::from("cam-B")));
    assert_eq!(status[1].state, streaming());

    // an unauthorized camera is never opened
    assert_eq!(plugin.device_calls("cam-A").open, 0);

    let mut frames = manager.subscribe(1).unwrap();
    frames.changed().await.unwrap();
    {
        let frame = frames.borrow();
        let frame = frame.as_ref().expect("frame committed");
        assert_eq!((frame.width, frame.height), (640, 480));
        assert_eq!(frame.data.len(), 640 * 480 * 3);
    }

    let status = manager.status().await;
    assert!(status[1].frames >= 1);
    assert!(status[1].frame_number.unwrap_or_default() >= 1);

    manager.shutdown().await.unwrap();
    assert!(!plugin.is_open("cam-B"));
}

#[tokio::test(start_paused = true)]
async fn reconcile_cleans_ghost_and_connects_new_device() {
    let plugin = bus(vec![SimulatedDevice::new("cam-A"), SimulatedDevice::new("cam-B")]);
    let manager = manager(&plugin, 2);
    assert_eq!(manager.initial_fill().await.unwrap().streaming, 2);

    plugin.detach("cam-A");
    plugin.attach(SimulatedDevice::new("cam-C"));

    let report = manager.reconcile().await.unwrap();
    assert_eq!(
        report,
        ReconcileReport {
            cleaned: 1,
            attempted: 1,
            reconnected: 1,
            unassigned: 0,
        }
    );

    let status = manager.status().await;
    assert_eq!(status[0].device, Some(DeviceRef::from("cam-C")));
    assert_eq!(status[0].state, streaming());
    assert_eq!(status[1].device, Some(DeviceRef::from("cam-B")));
    assert_eq!(status[1].state, streaming());

    manager.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn concurrent_pass_is_rejected() {
    let plugin = bus(vec![SimulatedDevice::new("cam-A")]);
    let manager = manager(&plugin, 1);

    let (first, second) = tokio::join!(manager.reconcile(), manager.reconcile());
    assert_eq!(first.unwrap().reconnected, 1);
    assert!(matches!(second, Err(Error::ReconcileInProgress)));

    // the guard is released once the first pass ends
    assert_eq!(manager.reconcile().await.unwrap(), ReconcileReport::default());
    manager.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn fill_and_reconcile_are_serialized() {
    let plugin = bus(vec![SimulatedDevice::new("cam-A")]);
    let manager = manager(&plugin, 1);

    let (fill, reconcile) = tokio::join!(manager.initial_fill(), manager.reconcile());
    assert_eq!(fill.unwrap().streaming, 1);
    assert!(matches!(reconcile, Err(Error::ReconcileInProgress)));
    manager.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn devices_are_never_bound_twice() {
    let plugin = bus(vec![
        SimulatedDevice::new("cam-A"),
        SimulatedDevice::new("cam-B"),
        SimulatedDevice::new("cam-C"),
    ]);
    let manager = manager(&plugin, 2);

    let fill = manager.initial_fill().await.unwrap();
    assert_eq!(fill.discovered, 3);
    assert_eq!(fill.attempted, 2);

    for _ in 0..2 {
        let report = manager.reconcile().await.unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(report.unassigned, 1);
    }

    let bound: Vec<DeviceRef> = manager
        .status()
        .await
        .into_iter()
        .filter_map(|s| s.device)
        .collect();
    let distinct: HashSet<&DeviceRef> = bound.iter().collect();
    assert_eq!(bound.len(), 2);
    assert_eq!(distinct.len(), 2);
    assert_eq!(plugin.device_calls("cam-C").open, 0);

    manager.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn enumeration_failure_leaves_slots_alone() {
    let plugin = bus(vec![SimulatedDevice::new("cam-A")]);
    let manager = manager(&plugin, 1);
    manager.initial_fill().await.unwrap();

    plugin.fail_enumeration(true);
    assert!(matches!(manager.reconcile().await, Err(Error::Enumeration(_))));

    let status = manager.status().await;
    assert_eq!(status[0].device, Some(DeviceRef::from("cam-A")));
    assert_eq!(status[0].state, streaming());
    manager.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failed_negotiation_is_retried_on_reconcile() {
    let plugin = bus(vec![
        SimulatedDevice::new("cam-A")
            .rejecting(640, 480)
            .rejecting(848, 480)
            .rejecting(320, 240)
            .rejecting(424, 240),
    ]);
    let manager = manager(&plugin, 1);

    assert_eq!(manager.initial_fill().await.unwrap().streaming, 0);
    let status = manager.status().await;
    assert_eq!(
        status[0].state,
        SlotState::Active(SessionStatus::Failed(FailureReason::AllCandidatesRejected))
    );
    assert!(status[0].last_error.is_some());
    assert!(!plugin.is_open("cam-A"));

    let report = manager.reconcile().await.unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.reconnected, 0);
    assert_eq!(report.cleaned, 0);
    assert_eq!(plugin.device_calls("cam-A").start, 8);
}

#[tokio::test(start_paused = true)]
async fn pump_failure_recovers_after_replug() {
    let plugin = bus(vec![
        SimulatedDevice::new("cam-A").with_frames([FrameStep::Error], FrameStep::Error),
    ]);
    let manager = manager(&plugin, 1);
    let mut frames = manager.subscribe(0).unwrap();

    assert_eq!(manager.initial_fill().await.unwrap().streaming, 1);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(
        manager.status().await[0].state,
        SlotState::Active(SessionStatus::Failed(FailureReason::TooManyFrameErrors))
    );

    plugin.detach("cam-A");
    plugin.attach(SimulatedDevice::new("cam-A"));
    let report = manager.reconcile().await.unwrap();
    assert_eq!(report.cleaned, 0);
    assert_eq!(report.reconnected, 1);

    // the slot channel outlives the failed session; teardown publishes a
    // cleared frame first
    loop {
        frames.changed().await.unwrap();
        if frames.borrow().is_some() {
            break;
        }
    }
    manager.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unauthorized_device_gets_a_fresh_handshake() {
    let plugin = bus(vec![
        SimulatedDevice::new("cam-A").with_permission(PermissionBehavior::Never),
    ]);
    let manager = manager(&plugin, 1);

    manager.initial_fill().await.unwrap();
    assert_eq!(plugin.device_calls("cam-A").obtain_permission, 4);

    let report = manager.reconcile().await.unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.reconnected, 0);

    let calls = plugin.device_calls("cam-A");
    assert_eq!(calls.obtain_permission, 8);
    assert_eq!(calls.has_permission, 14);
    assert_eq!(manager.status().await[0].state, SlotState::NotAuthorized);
}

#[tokio::test(start_paused = true)]
async fn shutdown_releases_every_slot() {
    let plugin = Arc::new(SimulatedPlugin::with_cameras(2));
    let manager = manager(&plugin, 2);
    manager.initial_fill().await.unwrap();

    manager.shutdown().await.unwrap();
    for snapshot in manager.status().await {
        assert_eq!(snapshot.state, SlotState::Empty);
        assert!(snapshot.device.is_none());
    }
    assert!(!plugin.is_open("sim-0"));
    assert!(!plugin.is_open("sim-1"));
    assert_eq!(plugin.device_calls("sim-0").stop, 1);
}

#[tokio::test(start_paused = true)]
async fn cancelled_fill_is_cleaned_up_by_reconcile() {
    let plugin = bus(vec![SimulatedDevice::new("cam-A").rejecting(640, 480)]);
    let manager = manager(&plugin, 1);

    // settles for 1 s before opening, then waits between candidates
    let fill = tokio::time::timeout(Duration::from_millis(1150), manager.initial_fill()).await;
    assert!(fill.is_err());

    let status = manager.status().await;
    assert_eq!(
        status[0].state,
        SlotState::Active(SessionStatus::Failed(FailureReason::Interrupted))
    );
    assert!(plugin.is_open("cam-A"));

    let report = manager.reconcile().await.unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.reconnected, 1);
    assert_eq!(manager.status().await[0].state, streaming());

    manager.shutdown().await.unwrap();
    assert!(!plugin.is_open("cam-A"));
}

#[tokio::test(start_paused = true)]
async fn cancelled_fill_handle_is_closed_on_shutdown() {
    let plugin = bus(vec![SimulatedDevice::new("cam-A").rejecting(640, 480)]);
    let manager = manager(&plugin, 1);

    let fill = tokio::time::timeout(Duration::from_millis(1150), manager.initial_fill()).await;
    assert!(fill.is_err());
    assert!(plugin.is_open("cam-A"));

    manager.shutdown().await.unwrap();
    assert!(!plugin.is_open("cam-A"));
    // the stale-handle close before opening, then the shutdown close
    assert_eq!(plugin.device_calls("cam-A").close, 2);
    assert_eq!(manager.status().await[0].state, SlotState::Empty);
}

#[tokio::test(start_paused = true)]
async fn failed_pump_closes_its_device_without_reconcile() {
    let plugin = bus(vec![
        SimulatedDevice::new("cam-A").with_frames([FrameStep::Error], FrameStep::Error),
    ]);
    let manager = manager(&plugin, 1);
    let frames = manager.subscribe(0).unwrap();

    assert_eq!(manager.initial_fill().await.unwrap().streaming, 1);
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(
        manager.status().await[0].state,
        SlotState::Active(SessionStatus::Failed(FailureReason::TooManyFrameErrors))
    );
    assert!(!plugin.is_open("cam-A"));
    let calls = plugin.device_calls("cam-A");
    assert_eq!((calls.stop, calls.close), (1, 2));
    assert!(frames.borrow().is_none());

    // nothing left for shutdown to release natively
    manager.shutdown().await.unwrap();
    let calls = plugin.device_calls("cam-A");
    assert_eq!((calls.stop, calls.close), (1, 2));
}
