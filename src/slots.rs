//! Multi-camera slot table: initial fill, hot-plug reconciliation and status
//!
//! The manager owns a fixed number of slots. Each slot is empty or bound to
//! exactly one device; a device is never bound to two slots. Fill and
//! reconcile passes are serialized: a second pass requested while one runs
//! fails fast with [`Error::ReconcileInProgress`].

use crate::device::{DeviceDirectory, DeviceRef};
use crate::error::{Error, Result};
use crate::format::{FormatDescriptor, ResolutionCandidate};
use crate::metrics;
use crate::permission::{PermissionGate, PermissionPolicy, PermissionState};
use crate::plugin::SharedPlugin;
use crate::pump::{Frame, FramePublisher, frame_channel};
use crate::session::{CaptureSession, FailureReason, SessionPolicy, SessionStatus, StatusCell};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Resolved settings of a [`SlotManager`]
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    /// Number of slots
    pub max_slots: usize,
    /// Pause between slot setups during the initial fill
    pub stagger: Duration,
    /// Enumeration rounds during the initial fill
    pub discovery_attempts: u32,
    /// Pause between enumeration rounds
    pub discovery_interval: Duration,
    /// Authorization polling
    pub permission: PermissionPolicy,
    /// Per-session behaviour
    pub session: SessionPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_slots: 2,
            stagger: Duration::from_secs(1),
            discovery_attempts: 10,
            discovery_interval: Duration::from_secs(1),
            permission: PermissionPolicy::default(),
            session: SessionPolicy::default(),
        }
    }
}

/// What a slot is doing, as seen by status readers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", content = "session", rename_all = "snake_case")]
pub enum SlotState {
    /// No device bound
    Empty,
    /// Waiting for the authorization handshake
    Authorizing,
    /// The device was never authorized
    NotAuthorized,
    /// A capture session exists for the device
    Active(SessionStatus),
}

impl SlotState {
    /// Whether frames are flowing
    pub fn is_streaming(&self) -> bool {
        matches!(self, SlotState::Active(status) if status.is_streaming())
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotState::Empty => f.write_str("empty"),
            SlotState::Authorizing => f.write_str("authorizing"),
            SlotState::NotAuthorized => f.write_str("not authorized"),
            SlotState::Active(status) => write!(f, "{status}"),
        }
    }
}

/// Point-in-time view of one slot
#[derive(Debug, Clone, Serialize)]
pub struct SlotSnapshot {
    /// Slot position
    pub index: usize,
    /// Bound device
    pub device: Option<DeviceRef>,
    /// Slot state
    pub state: SlotState,
    /// Selected capture format
    pub format: Option<FormatDescriptor>,
    /// Accepted negotiation candidate
    pub negotiated: Option<ResolutionCandidate>,
    /// Frames committed by the current session
    pub frames: u64,
    /// Failed frame fetches of the current session
    pub frame_errors: u64,
    /// Frame counter reported by the native layer
    pub frame_number: Option<i64>,
    /// Most recent error
    pub last_error: Option<String>,
}

/// Outcome of [`SlotManager::initial_fill`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FillReport {
    /// Devices enumerated
    pub discovered: usize,
    /// Slot setups run
    pub attempted: usize,
    /// Setups that reached `Streaming`
    pub streaming: usize,
}

/// Outcome of [`SlotManager::reconcile`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Slots torn down because their device disappeared
    pub cleaned: usize,
    /// Slot setups run
    pub attempted: usize,
    /// Setups that reached `Streaming`
    pub reconnected: usize,
    /// Live devices left without a slot
    pub unassigned: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Empty,
    Authorizing,
    NotAuthorized,
    Session,
}

#[derive(Debug)]
struct Binding {
    device: Option<DeviceRef>,
    previous: Option<DeviceRef>,
    phase: Phase,
    status: StatusCell,
}

impl Binding {
    fn state(&self) -> SlotState {
        match self.phase {
            Phase::Empty => SlotState::Empty,
            Phase::Authorizing => SlotState::Authorizing,
            Phase::NotAuthorized => SlotState::NotAuthorized,
            Phase::Session => SlotState::Active(self.status.get()),
        }
    }
}

struct Slot {
    index: usize,
    binding: Mutex<Binding>,
    session: tokio::sync::Mutex<Option<CaptureSession>>,
    publisher: FramePublisher,
}

impl Slot {
    fn new(index: usize) -> Self {
        Self {
            index,
            binding: Mutex::new(Binding {
                device: None,
                previous: None,
                phase: Phase::Empty,
                status: StatusCell::default(),
            }),
            session: tokio::sync::Mutex::new(None),
            publisher: frame_channel(),
        }
    }

    fn binding(&self) -> std::sync::MutexGuard<'_, Binding> {
        self.binding.lock().expect("slot mutex poisoned")
    }

    fn device(&self) -> Option<DeviceRef> {
        self.binding().device.clone()
    }

    fn previous(&self) -> Option<DeviceRef> {
        self.binding().previous.clone()
    }

    fn state(&self) -> SlotState {
        self.binding().state()
    }

    fn bind(&self, device: DeviceRef) -> StatusCell {
        let mut binding = self.binding();
        let status = StatusCell::default();
        binding.device = Some(device);
        binding.phase = Phase::Authorizing;
        binding.status = status.clone();
        status
    }

    fn set_phase(&self, phase: Phase) {
        self.binding().phase = phase;
    }

    fn unbind(&self) -> Option<DeviceRef> {
        let mut binding = self.binding();
        let device = binding.device.take();
        if device.is_some() {
            binding.previous = device.clone();
        }
        binding.phase = Phase::Empty;
        device
    }
}

/// Marks a slot whose setup future was dropped midway
///
/// An interrupted handshake leaves the slot `NotAuthorized`; an interrupted
/// session leaves it `Failed(Interrupted)` with the session stored in the
/// slot. Either way the next reconcile releases and retries it.
struct SetupGuard<'a> {
    slot: &'a Slot,
    device: DeviceRef,
    armed: bool,
}

impl<'a> SetupGuard<'a> {
    fn new(slot: &'a Slot, device: DeviceRef) -> Self {
        Self {
            slot,
            device,
            armed: true,
        }
    }

    fn finish(mut self) {
        self.armed = false;
    }
}

impl Drop for SetupGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let err = Error::SetupInterrupted(self.device.to_string());
        let mut binding = self.slot.binding();
        match binding.phase {
            Phase::Authorizing => {
                binding.status.note(&err);
                binding.phase = Phase::NotAuthorized;
            }
            Phase::Session => binding.status.fail(FailureReason::Interrupted, &err),
            Phase::Empty | Phase::NotAuthorized => return,
        }
        tracing::warn!(slot = self.slot.index, device = %self.device, "Slot setup interrupted");
    }
}

/// Clears the pass flag when a fill or reconcile pass ends, however it ends
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owner of every capture slot
pub struct SlotManager {
    plugin: SharedPlugin,
    directory: DeviceDirectory,
    gate: PermissionGate,
    policy: Arc<SessionPolicy>,
    config: ManagerConfig,
    slots: Vec<Slot>,
    pass_running: AtomicBool,
}

impl SlotManager {
    /// Create a manager with `config.max_slots` empty slots
    pub fn new(plugin: SharedPlugin, config: ManagerConfig) -> Self {
        let slots = (0..config.max_slots).map(Slot::new).collect();
        Self {
            directory: DeviceDirectory::new(Arc::clone(&plugin)),
            gate: PermissionGate::new(Arc::clone(&plugin), config.permission),
            policy: Arc::new(config.session.clone()),
            plugin,
            config,
            slots,
            pass_running: AtomicBool::new(false),
        }
    }

    /// Settings in use
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the table has no slots at all
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Bind the native plugin; call once before any pass
    pub async fn init(&self) -> Result<()> {
        self.plugin.init().await?;
        tracing::info!(slots = self.slots.len(), "Camera plugin initialised");
        Ok(())
    }

    fn begin_pass(&self) -> Result<PassGuard<'_>> {
        self.pass_running
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .map_err(|_| Error::ReconcileInProgress)?;
        Ok(PassGuard(&self.pass_running))
    }

    fn is_bound(&self, device: &DeviceRef) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.device().as_ref() == Some(device))
    }

    /// Discover cameras and bring up one per free slot
    pub async fn initial_fill(&self) -> Result<FillReport> {
        let _pass = self.begin_pass()?;
        let devices = self
            .directory
            .discover(self.config.discovery_attempts, self.config.discovery_interval)
            .await;

        let mut report = FillReport {
            discovered: devices.len(),
            ..FillReport::default()
        };
        let mut pending = devices.into_iter().filter(|d| !self.is_bound(d));

        for slot in &self.slots {
            if slot.device().is_some() {
                continue;
            }
            let Some(device) = pending.next() else {
                break;
            };

            if report.attempted > 0 {
                tokio::time::sleep(self.config.stagger).await;
            }
            report.attempted += 1;
            if self.setup(slot, device).await {
                report.streaming += 1;
            }
        }

        metrics::record_reconcile(0, report.streaming);
        self.publish_active();
        tracing::info!(
            discovered = report.discovered,
            attempted = report.attempted,
            streaming = report.streaming,
            "Initial fill complete"
        );
        Ok(report)
    }

    /// Re-enumerate and bring the slot table in line with attached cameras
    ///
    /// Slots whose device vanished are torn down, failed and unauthorized
    /// slots are released, and every attached camera without a slot gets one
    /// while any are free. An enumeration failure leaves all slots untouched.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let _pass = self.begin_pass()?;
        let live = self.directory.list_devices().await?;
        let mut report = ReconcileReport::default();

        for slot in &self.slots {
            let Some(device) = slot.device() else {
                continue;
            };

            if !live.contains(&device) {
                tracing::info!(slot = slot.index, %device, "Device gone, releasing slot");
                self.release(slot).await;
                report.cleaned += 1;
                continue;
            }

            if let Some(session) = slot.session.lock().await.as_mut() {
                session.refresh().await;
            }
            match slot.state() {
                SlotState::NotAuthorized => {
                    tracing::info!(slot = slot.index, %device, "Releasing unauthorized slot for retry");
                    self.release(slot).await;
                }
                SlotState::Active(status) if status.is_failed() => {
                    tracing::info!(slot = slot.index, %device, %status, "Releasing failed slot for retry");
                    self.release(slot).await;
                }
                _ => {}
            }
        }

        for device in live {
            if self.is_bound(&device) {
                continue;
            }
            let Some(slot) = self.free_slot_for(&device) else {
                tracing::debug!(%device, "No free slot");
                report.unassigned += 1;
                continue;
            };

            report.attempted += 1;
            if self.setup(slot, device).await {
                report.reconnected += 1;
            }
        }

        metrics::record_reconcile(report.cleaned, report.reconnected);
        self.publish_active();
        if report != ReconcileReport::default() {
            tracing::info!(
                cleaned = report.cleaned,
                attempted = report.attempted,
                reconnected = report.reconnected,
                unassigned = report.unassigned,
                "Reconcile pass"
            );
        }
        Ok(report)
    }

    fn free_slot_for(&self, device: &DeviceRef) -> Option<&Slot> {
        let free: Vec<&Slot> = self
            .slots
            .iter()
            .filter(|slot| slot.device().is_none())
            .collect();
        free.iter()
            .find(|slot| slot.previous().as_ref() == Some(device))
            .or(free.first())
            .copied()
    }

    /// Authorize and establish `device` in `slot`
    ///
    /// Returns whether the slot ended up streaming. Failures stay visible in
    /// the slot's status until the next reconcile releases it. The session
    /// lives in the slot from before the first native call, so dropping this
    /// future never strands an open handle.
    async fn setup(&self, slot: &Slot, device: DeviceRef) -> bool {
        tracing::info!(slot = slot.index, %device, "Setting up slot");
        let status = slot.bind(device.clone());
        let guard = SetupGuard::new(slot, device.clone());

        if self.gate.authorize(&device).await != PermissionState::Granted {
            status.note(&Error::NotAuthorized(device.to_string()));
            slot.set_phase(Phase::NotAuthorized);
            guard.finish();
            tracing::warn!(slot = slot.index, %device, "Camera not authorized");
            return false;
        }

        let mut held = slot.session.lock().await;
        let session = held.insert(CaptureSession::new(
            device.clone(),
            Arc::clone(&self.plugin),
            Arc::clone(&self.policy),
            status,
            Arc::clone(&slot.publisher),
        ));
        slot.set_phase(Phase::Session);

        let streaming = match session.establish().await {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(slot = slot.index, %device, error = %err, "Slot setup failed");
                session.close().await;
                false
            }
        };
        guard.finish();
        streaming
    }

    async fn release(&self, slot: &Slot) {
        if let Some(mut session) = slot.session.lock().await.take() {
            session.close().await;
        }
        if let Some(device) = slot.unbind() {
            self.gate.reset(&device);
        }
    }

    fn publish_active(&self) {
        let active = self
            .slots
            .iter()
            .filter(|slot| slot.state().is_streaming())
            .count();
        metrics::record_active_slots(active);
    }

    /// Snapshot every slot
    ///
    /// Never waits for a running setup; a slot that is mid-setup reports
    /// its state without format or counters.
    pub async fn status(&self) -> Vec<SlotSnapshot> {
        let mut snapshots = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let (device, state, last_error) = {
                let binding = slot.binding();
                (
                    binding.device.clone(),
                    binding.state(),
                    binding.status.last_error(),
                )
            };

            let mut snapshot = SlotSnapshot {
                index: slot.index,
                device,
                state,
                format: None,
                negotiated: None,
                frames: 0,
                frame_errors: 0,
                frame_number: None,
                last_error,
            };

            if let Ok(guard) = slot.session.try_lock() {
                if let Some(session) = guard.as_ref() {
                    snapshot.format = session.format().cloned();
                    snapshot.negotiated = session.negotiated().copied();
                    if let Some(stats) = session.pump_stats() {
                        snapshot.frames = stats.frames;
                        snapshot.frame_errors = stats.errors;
                    }
                }
            }

            if state.is_streaming() {
                if let Some(device) = &snapshot.device {
                    snapshot.frame_number = self.plugin.frame_number(device).await.ok();
                }
            }
            snapshots.push(snapshot);
        }
        snapshots
    }

    /// Receiver for frames committed in `slot`
    ///
    /// The channel belongs to the slot, so it keeps delivering across
    /// reconnects.
    pub fn subscribe(&self, slot: usize) -> Result<watch::Receiver<Option<Frame>>> {
        self.slots
            .get(slot)
            .map(|s| s.publisher.subscribe())
            .ok_or(Error::SlotOutOfRange {
                index: slot,
                len: self.slots.len(),
            })
    }

    /// Close every session and empty the table
    pub async fn shutdown(&self) -> Result<()> {
        let _pass = self.begin_pass()?;
        for slot in &self.slots {
            if slot.device().is_some() {
                self.release(slot).await;
            }
        }
        metrics::record_active_slots(0);
        tracing::info!("All slots released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{PermissionBehavior, SimulatedDevice, SimulatedPlugin};

    fn manager(plugin: &Arc<SimulatedPlugin>, slots: usize) -> SlotManager {
        SlotManager::new(
            plugin.clone(),
            ManagerConfig {
                max_slots: slots,
                ..ManagerConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_subscribe_out_of_range() {
        let plugin = Arc::new(SimulatedPlugin::new());
        let manager = manager(&plugin, 2);
        assert!(manager.subscribe(1).is_ok());
        assert!(matches!(
            manager.subscribe(2),
            Err(Error::SlotOutOfRange { index: 2, len: 2 })
        ));
    }

    #[tokio::test]
    async fn test_pass_guard_released_on_error() {
        let plugin = Arc::new(SimulatedPlugin::new());
        plugin.fail_enumeration(true);
        let manager = manager(&plugin, 1);

        assert!(matches!(manager.reconcile().await, Err(Error::Enumeration(_))));
        plugin.fail_enumeration(false);
        assert_eq!(manager.reconcile().await.unwrap(), ReconcileReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_free_slot_prefers_previous_device() {
        let plugin = Arc::new(SimulatedPlugin::new());
        for name in ["cam-A", "cam-B"] {
            plugin.attach(SimulatedDevice::new(name));
        }
        let manager = manager(&plugin, 2);
        manager.initial_fill().await.unwrap();

        plugin.detach("cam-A");
        plugin.detach("cam-B");
        assert_eq!(manager.reconcile().await.unwrap().cleaned, 2);

        let cam_b = DeviceRef::from("cam-B");
        let slot = manager.free_slot_for(&cam_b).unwrap();
        assert_eq!(slot.index, 1);
        let stranger = DeviceRef::from("cam-Z");
        assert_eq!(manager.free_slot_for(&stranger).unwrap().index, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_handshake_is_retried() {
        let plugin = Arc::new(SimulatedPlugin::new());
        plugin.attach(SimulatedDevice::new("cam-A").with_permission(PermissionBehavior::Never));
        let manager = manager(&plugin, 1);

        let fill = tokio::time::timeout(Duration::from_millis(500), manager.initial_fill()).await;
        assert!(fill.is_err());

        let slot = &manager.status().await[0];
        assert_eq!(slot.state, SlotState::NotAuthorized);
        assert!(slot.last_error.as_deref().is_some_and(|e| e.contains("interrupted")));
        assert_eq!(plugin.device_calls("cam-A").open, 0);

        plugin.detach("cam-A");
        plugin.attach(SimulatedDevice::new("cam-A"));
        let report = manager.reconcile().await.unwrap();
        assert_eq!(report.reconnected, 1);
        assert!(manager.status().await[0].state.is_streaming());
        manager.shutdown().await.unwrap();
    }

    #[test]
    fn test_slot_state_display() {
        assert_eq!(SlotState::NotAuthorized.to_string(), "not authorized");
        assert_eq!(
            SlotState::Active(SessionStatus::Streaming).to_string(),
            "streaming"
        );
        assert!(SlotState::Active(SessionStatus::Streaming).is_streaming());
        assert!(!SlotState::Authorizing.is_streaming());
    }
}
