//! Per-device capture session lifecycle
//!
//! ```text
//! Closed -> Opening -> FormatSelected -> Starting -> Streaming -> Stopped
//!              |                            |           |
//!              +------------------------> Failed(reason) <+
//! ```
//!
//! A session owns the native handle, the frame buffer and the pump task of
//! one camera. [`CaptureSession::close`] releases them in that reverse order:
//! pump first, then the handle, then the buffer.

use crate::device::DeviceRef;
use crate::error::{Error, Result};
use crate::format::{FormatCatalog, FormatDescriptor, NegotiationPolicy, ResolutionCandidate};
use crate::metrics;
use crate::plugin::{SharedPlugin, START_OK, StartFlags};
use crate::pump::{
    FrameBuffer, FramePublisher, FramePump, PumpHandle, PumpPolicy, PumpSnapshot, PumpStats,
    frame_channel,
};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Why a session failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The device could not be opened
    OpenFailed,
    /// The device advertised no MJPEG format
    NoEligibleFormat,
    /// The driver refused every negotiation candidate
    AllCandidatesRejected,
    /// The frame pump hit its error ceiling
    TooManyFrameErrors,
    /// Setup was abandoned before it finished
    Interrupted,
}

/// Lifecycle state of a capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum SessionStatus {
    /// Nothing acquired yet
    #[default]
    Closed,
    /// Opening the native device
    Opening,
    /// A capture format has been chosen
    FormatSelected,
    /// Negotiating a start request
    Starting,
    /// Frames are flowing
    Streaming,
    /// Torn down after running
    Stopped,
    /// Terminal failure
    Failed(FailureReason),
}

impl SessionStatus {
    /// Whether the session is delivering frames
    pub fn is_streaming(&self) -> bool {
        matches!(self, SessionStatus::Streaming)
    }

    /// Whether the session ended in failure
    pub fn is_failed(&self) -> bool {
        matches!(self, SessionStatus::Failed(_))
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Closed => f.write_str("closed"),
            SessionStatus::Opening => f.write_str("opening"),
            SessionStatus::FormatSelected => f.write_str("format-selected"),
            SessionStatus::Starting => f.write_str("starting"),
            SessionStatus::Streaming => f.write_str("streaming"),
            SessionStatus::Stopped => f.write_str("stopped"),
            SessionStatus::Failed(reason) => write!(f, "failed ({reason:?})"),
        }
    }
}

#[derive(Debug, Default)]
struct StatusRecord {
    status: SessionStatus,
    last_error: Option<String>,
}

/// Status shared between a session, its pump and status readers
#[derive(Debug, Clone, Default)]
pub struct StatusCell(Arc<Mutex<StatusRecord>>);

impl StatusCell {
    /// Cell starting in `status`
    pub fn new(status: SessionStatus) -> Self {
        Self(Arc::new(Mutex::new(StatusRecord {
            status,
            last_error: None,
        })))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StatusRecord> {
        self.0.lock().expect("status mutex poisoned")
    }

    /// Current status
    pub fn get(&self) -> SessionStatus {
        self.lock().status
    }

    /// Most recent error message
    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    /// Move to `status`
    pub fn set(&self, status: SessionStatus) {
        self.lock().status = status;
    }

    /// Record an error without changing state
    pub fn note(&self, err: &Error) {
        self.lock().last_error = Some(err.to_string());
    }

    /// Move to `Failed(reason)` and remember the error
    pub fn fail(&self, reason: FailureReason, err: &Error) {
        let mut record = self.lock();
        record.status = SessionStatus::Failed(reason);
        record.last_error = Some(err.to_string());
    }
}

/// Open and started flags of one device's native handle
///
/// Shared by a session and its frame pump so whichever of them tears the
/// stream down first releases the handle, and the other finds nothing left.
pub struct NativeHandle {
    device: DeviceRef,
    plugin: SharedPlugin,
    open: AtomicBool,
    started: AtomicBool,
}

impl NativeHandle {
    /// Handle for `device` with nothing acquired yet
    pub fn new(device: DeviceRef, plugin: SharedPlugin) -> Self {
        Self {
            device,
            plugin,
            open: AtomicBool::new(false),
            started: AtomicBool::new(false),
        }
    }

    /// Whether the native device is open
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn mark_open(&self) {
        self.open.store(true, Ordering::Release);
    }

    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    /// Stop the stream if it was started, then close the device
    ///
    /// Returns whether anything was released. Each flag is cleared only
    /// after its call returns, so a release cancelled halfway is finished by
    /// the next one.
    pub async fn release(&self) -> bool {
        if !self.is_open() {
            return false;
        }

        if self.started.load(Ordering::Acquire) {
            if let Err(err) = self.plugin.stop(&self.device).await {
                tracing::warn!(device = %self.device, error = %err, "Stop failed");
            }
            self.started.store(false, Ordering::Release);
        }
        if let Err(err) = self.plugin.close(&self.device).await {
            tracing::warn!(device = %self.device, error = %err, "Close failed");
        }
        self.open.store(false, Ordering::Release);
        true
    }
}

/// Candidate table and pacing used by negotiation
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiationPlan {
    /// How the table is walked
    pub policy: NegotiationPolicy,
    /// Ordered candidates
    pub candidates: Vec<ResolutionCandidate>,
    /// Wait after each rejected candidate
    pub settle: Duration,
    /// Flags passed with every start request
    pub flags: StartFlags,
}

impl Default for NegotiationPlan {
    fn default() -> Self {
        let policy = NegotiationPolicy::default();
        Self {
            policy,
            candidates: policy.default_candidates(),
            settle: Duration::from_millis(300),
            flags: StartFlags::default(),
        }
    }
}

/// Everything a session needs to know to bring a camera up
#[derive(Debug, Clone, PartialEq)]
pub struct SessionPolicy {
    /// Open attempts before giving up
    pub open_attempts: u32,
    /// Backoff after failed open n is `n * open_backoff_unit`
    pub open_backoff_unit: Duration,
    /// Wait between device preparation and the first open
    pub settle_delay: Duration,
    /// Close any handle left over from an earlier run before opening
    pub close_stale_handle: bool,
    /// Format selection
    pub catalog: FormatCatalog,
    /// Mode negotiation
    pub negotiation: NegotiationPlan,
    /// Frame pump tuning
    pub pump: PumpPolicy,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            open_attempts: 3,
            open_backoff_unit: Duration::from_secs(1),
            settle_delay: Duration::from_secs(1),
            close_stale_handle: true,
            catalog: FormatCatalog::default(),
            negotiation: NegotiationPlan::default(),
            pump: PumpPolicy::default(),
        }
    }
}

/// Runtime state of one camera
pub struct CaptureSession {
    device: DeviceRef,
    plugin: SharedPlugin,
    policy: Arc<SessionPolicy>,
    status: StatusCell,
    publisher: FramePublisher,
    format: Option<FormatDescriptor>,
    negotiated: Option<ResolutionCandidate>,
    native: Arc<NativeHandle>,
    buffer: Option<Arc<Mutex<FrameBuffer>>>,
    pump: Option<PumpHandle>,
    stats: Option<Arc<PumpStats>>,
}

impl CaptureSession {
    /// Create a closed session publishing into `publisher` and reporting through `status`
    pub fn new(
        device: DeviceRef,
        plugin: SharedPlugin,
        policy: Arc<SessionPolicy>,
        status: StatusCell,
        publisher: FramePublisher,
    ) -> Self {
        status.set(SessionStatus::Closed);
        let native = Arc::new(NativeHandle::new(device.clone(), Arc::clone(&plugin)));
        Self {
            device,
            plugin,
            policy,
            status,
            publisher,
            format: None,
            negotiated: None,
            native,
            buffer: None,
            pump: None,
            stats: None,
        }
    }

    /// Session with its own status cell and frame channel
    pub fn standalone(device: DeviceRef, plugin: SharedPlugin, policy: Arc<SessionPolicy>) -> Self {
        Self::new(device, plugin, policy, StatusCell::default(), frame_channel())
    }

    /// Bound device
    pub fn device(&self) -> &DeviceRef {
        &self.device
    }

    /// Current lifecycle state
    pub fn status(&self) -> SessionStatus {
        self.status.get()
    }

    /// Shared status cell
    pub fn status_cell(&self) -> &StatusCell {
        &self.status
    }

    /// Most recent error
    pub fn last_error(&self) -> Option<String> {
        self.status.last_error()
    }

    /// Selected capture format
    pub fn format(&self) -> Option<&FormatDescriptor> {
        self.format.as_ref()
    }

    /// Accepted negotiation candidate
    pub fn negotiated(&self) -> Option<&ResolutionCandidate> {
        self.negotiated.as_ref()
    }

    /// Whether the native device is currently open
    pub fn is_open(&self) -> bool {
        self.native.is_open()
    }

    /// Pump counters, kept after the pump stops
    pub fn pump_stats(&self) -> Option<PumpSnapshot> {
        self.stats.as_ref().map(|s| s.snapshot())
    }

    /// Receiver for committed frames
    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<Option<crate::pump::Frame>> {
        self.publisher.subscribe()
    }

    /// Bring the camera from `Closed` to `Streaming`
    ///
    /// On failure the session is left in `Failed(_)`; resources acquired on
    /// the way are released by [`close`](Self::close).
    pub async fn establish(&mut self) -> Result<()> {
        if self.status() != SessionStatus::Closed {
            return Err(Error::Other(format!(
                "session for {} already {}",
                self.device,
                self.status()
            )));
        }

        self.prepare().await;
        let descriptors = self.open().await?;
        self.select_format(&descriptors)?;
        let candidate = self.negotiate().await?;
        self.begin_streaming(candidate);
        Ok(())
    }

    async fn prepare(&mut self) {
        match self.plugin.device_info(&self.device).await {
            Ok(info) => tracing::debug!(device = %self.device, %info, "Device info"),
            Err(err) => tracing::warn!(device = %self.device, error = %err, "Device info unavailable"),
        }

        if self.policy.close_stale_handle {
            if let Err(err) = self.plugin.close(&self.device).await {
                tracing::debug!(device = %self.device, error = %err, "No stale handle to close");
            }
        }

        tokio::time::sleep(self.policy.settle_delay).await;
    }

    /// Open the native device and return its raw descriptors
    ///
    /// Retries with linear backoff; an empty descriptor list counts as a
    /// failed attempt.
    pub async fn open(&mut self) -> Result<Vec<String>> {
        self.status.set(SessionStatus::Opening);
        let attempts = self.policy.open_attempts.max(1);
        let mut reason = String::new();

        for attempt in 1..=attempts {
            match self.plugin.open(&self.device).await {
                Ok(descriptors) if !descriptors.is_empty() => {
                    self.native.mark_open();
                    tracing::info!(
                        device = %self.device,
                        attempt,
                        formats = descriptors.len(),
                        "Camera opened"
                    );
                    return Ok(descriptors);
                }
                Ok(_) => {
                    self.native.mark_open();
                    reason = "open returned no formats".to_string();
                }
                Err(err) => reason = err.to_string(),
            }

            tracing::warn!(device = %self.device, attempt, attempts, %reason, "Open failed");
            if attempt < attempts {
                tokio::time::sleep(self.policy.open_backoff_unit * attempt).await;
            }
        }

        let err = Error::Open {
            device: self.device.to_string(),
            attempts,
            reason,
        };
        self.status.fail(FailureReason::OpenFailed, &err);
        Err(err)
    }

    /// Choose the capture format from the advertised descriptors
    pub fn select_format(&mut self, descriptors: &[String]) -> Result<FormatDescriptor> {
        match self.policy.catalog.select(descriptors) {
            Ok(format) => {
                tracing::info!(device = %self.device, format = %format, "Format selected");
                self.format = Some(format.clone());
                self.status.set(SessionStatus::FormatSelected);
                Ok(format)
            }
            Err(err) => {
                tracing::error!(device = %self.device, error = %err, "No usable format");
                self.status.fail(FailureReason::NoEligibleFormat, &err);
                Err(err)
            }
        }
    }

    /// Issue one start request for `candidate`
    ///
    /// A non-zero status rejects only this candidate.
    pub async fn start(&mut self, candidate: &ResolutionCandidate) -> Result<()> {
        self.status.set(SessionStatus::Starting);
        let request = candidate.start_request(self.policy.negotiation.flags);
        let status = self.plugin.start(&self.device, &request).await?;

        if status == START_OK {
            self.native.mark_started();
            Ok(())
        } else {
            Err(Error::CandidateRejected {
                width: candidate.width,
                height: candidate.height,
                fps: candidate.fps,
                status,
            })
        }
    }

    /// Walk the candidate table until the driver accepts one
    pub async fn negotiate(&mut self) -> Result<ResolutionCandidate> {
        let plan = self.policy.negotiation.clone();
        let mut smallest_rejected: Option<u64> = None;
        let mut tried = 0usize;

        for candidate in &plan.candidates {
            if !plan.policy.admits(candidate, smallest_rejected) {
                tracing::debug!(device = %self.device, %candidate, "Skipping larger candidate");
                continue;
            }

            tried += 1;
            tracing::debug!(device = %self.device, %candidate, "Trying candidate");
            match self.start(candidate).await {
                Ok(()) => {
                    metrics::record_negotiation(true);
                    tracing::info!(device = %self.device, %candidate, "Mode accepted");
                    self.negotiated = Some(*candidate);
                    return Ok(*candidate);
                }
                Err(err) => {
                    metrics::record_negotiation(false);
                    tracing::warn!(device = %self.device, %candidate, error = %err, "Mode rejected");
                    self.status.note(&err);
                    let pixels = candidate.pixels();
                    smallest_rejected = Some(smallest_rejected.map_or(pixels, |p| p.min(pixels)));
                }
            }

            tokio::time::sleep(plan.settle).await;
        }

        let err = Error::AllCandidatesRejected(tried);
        tracing::error!(device = %self.device, error = %err, "Negotiation failed");
        self.status.fail(FailureReason::AllCandidatesRejected, &err);
        Err(err)
    }

    fn begin_streaming(&mut self, candidate: ResolutionCandidate) {
        let buffer = Arc::new(Mutex::new(FrameBuffer::new(
            candidate.width,
            candidate.height,
            Arc::clone(&self.publisher),
        )));
        self.buffer = Some(Arc::clone(&buffer));
        self.status.set(SessionStatus::Streaming);

        let pump = FramePump::new(
            Arc::clone(&self.plugin),
            self.device.clone(),
            buffer,
            self.policy.pump,
            self.status.clone(),
            Arc::clone(&self.native),
        );
        self.stats = Some(pump.stats());
        self.pump = Some(pump.spawn());
        tracing::info!(
            device = %self.device,
            width = candidate.width,
            height = candidate.height,
            fps = candidate.fps,
            "Streaming"
        );
    }

    /// Collect a pump that stopped on its own
    ///
    /// Returns the current status. The pump has already marked the session
    /// failed and released the native handle; this only reaps its task.
    pub async fn refresh(&mut self) -> SessionStatus {
        if self.pump.as_ref().is_some_and(PumpHandle::is_finished) {
            if let Some(pump) = self.pump.take() {
                if let Some(err) = pump.cancel().await {
                    tracing::debug!(device = %self.device, error = %err, "Frame pump ended");
                }
            }
        }
        self.status()
    }

    /// Release everything the session holds
    ///
    /// Safe from any state and idempotent. Order: cancel the pump and wait
    /// for it, stop and close the native handle, drop the frame buffer.
    pub async fn close(&mut self) {
        let mut released = false;

        if let Some(pump) = self.pump.take() {
            if let Some(err) = pump.cancel().await {
                tracing::debug!(device = %self.device, error = %err, "Frame pump had already stopped");
            }
            released = true;
        }

        if self.native.release().await {
            released = true;
        }

        if let Some(buffer) = self.buffer.take() {
            buffer.lock().expect("frame buffer mutex poisoned").clear();
            released = true;
        }

        if released {
            if !self.status().is_failed() {
                self.status.set(SessionStatus::Stopped);
            }
            tracing::info!(device = %self.device, status = %self.status(), "Session closed");
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if self.native.is_open() {
            tracing::warn!(device = %self.device, "Session dropped without close; native handle leaked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{FrameStep, SimulatedDevice, SimulatedPlugin};

    fn policy_with(candidates: Vec<ResolutionCandidate>, policy: NegotiationPolicy) -> Arc<SessionPolicy> {
        Arc::new(SessionPolicy {
            negotiation: NegotiationPlan {
                policy,
                candidates,
                ..NegotiationPlan::default()
            },
            ..SessionPolicy::default()
        })
    }

    fn hd_table() -> Vec<ResolutionCandidate> {
        vec![
            ResolutionCandidate::new(1920, 1080, 30, 9, 0.3),
            ResolutionCandidate::new(1280, 720, 30, 9, 0.3),
            ResolutionCandidate::new(640, 480, 30, 9, 0.3),
        ]
    }

    fn session(plugin: &Arc<SimulatedPlugin>, policy: Arc<SessionPolicy>) -> CaptureSession {
        CaptureSession::standalone(DeviceRef::from("cam"), plugin.clone(), policy)
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiation_falls_back_to_third_candidate() {
        let plugin = Arc::new(SimulatedPlugin::new());
        plugin.attach(SimulatedDevice::new("cam").rejecting(1920, 1080).rejecting(1280, 720));
        let mut session = session(&plugin, policy_with(hd_table(), NegotiationPolicy::Table));

        session.establish().await.unwrap();

        assert_eq!(session.status(), SessionStatus::Streaming);
        let negotiated = session.negotiated().copied().unwrap();
        assert_eq!((negotiated.width, negotiated.height), (640, 480));
        assert_eq!(plugin.device_calls("cam").start, 3);

        session.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_candidates_rejected() {
        let plugin = Arc::new(SimulatedPlugin::new());
        plugin.attach(
            SimulatedDevice::new("cam")
                .rejecting(1920, 1080)
                .rejecting(1280, 720)
                .rejecting(640, 480),
        );
        let mut session = session(&plugin, policy_with(hd_table(), NegotiationPolicy::Descending));

        let err = session.establish().await.unwrap_err();
        assert!(matches!(err, Error::AllCandidatesRejected(3)));
        assert_eq!(
            session.status(),
            SessionStatus::Failed(FailureReason::AllCandidatesRejected)
        );

        session.close().await;
        assert!(!plugin.is_open("cam"));
        assert_eq!(
            session.status(),
            SessionStatus::Failed(FailureReason::AllCandidatesRejected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_descending_policy_never_climbs() {
        let table = vec![
            ResolutionCandidate::new(1280, 720, 30, 9, 0.3),
            ResolutionCandidate::new(1920, 1080, 30, 9, 0.3),
            ResolutionCandidate::new(640, 480, 30, 9, 0.3),
        ];
        let plugin = Arc::new(SimulatedPlugin::new());
        plugin.attach(SimulatedDevice::new("cam").rejecting(1280, 720));
        let mut session = session(&plugin, policy_with(table, NegotiationPolicy::Descending));

        session.establish().await.unwrap();
        let widths: Vec<u32> = plugin.start_requests("cam").iter().map(|r| r.width).collect();
        assert_eq!(widths, vec![1280, 640]);
        session.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_retries_with_linear_backoff() {
        let plugin = Arc::new(SimulatedPlugin::new());
        plugin.attach(SimulatedDevice::new("cam").with_open_failures(2));
        let mut session = session(&plugin, Arc::new(SessionPolicy::default()));

        let started = tokio::time::Instant::now();
        session.open().await.unwrap();
        // waits of 1 s then 2 s between the three attempts
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(3) && waited < Duration::from_secs(4));
        assert_eq!(plugin.device_calls("cam").open, 3);
        session.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_gives_up() {
        let plugin = Arc::new(SimulatedPlugin::new());
        plugin.attach(SimulatedDevice::new("cam").with_open_failures(5));
        let mut session = session(&plugin, Arc::new(SessionPolicy::default()));

        let err = session.establish().await.unwrap_err();
        assert!(matches!(err, Error::Open { attempts: 3, .. }));
        assert_eq!(session.status(), SessionStatus::Failed(FailureReason::OpenFailed));
        assert!(session.last_error().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_mjpeg_fails_without_start() {
        let plugin = Arc::new(SimulatedPlugin::new());
        plugin.attach(SimulatedDevice::new("cam").with_descriptors(["4,640,480,30", "3,320,240,15"]));
        let mut session = session(&plugin, Arc::new(SessionPolicy::default()));

        let err = session.establish().await.unwrap_err();
        assert!(matches!(err, Error::NoEligibleFormat(2)));
        assert_eq!(
            session.status(),
            SessionStatus::Failed(FailureReason::NoEligibleFormat)
        );
        assert_eq!(plugin.device_calls("cam").start, 0);
        session.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent() {
        let plugin = Arc::new(SimulatedPlugin::new());
        plugin.attach(SimulatedDevice::new("cam"));
        let mut session = session(&plugin, Arc::new(SessionPolicy::default()));
        let rx = session.subscribe();

        session.establish().await.unwrap();
        let before = plugin.device_calls("cam");

        session.close().await;
        session.close().await;

        let after = plugin.device_calls("cam");
        assert_eq!(after.close, before.close + 1);
        assert_eq!(after.stop, before.stop + 1);
        assert_eq!(session.status(), SessionStatus::Stopped);
        assert!(rx.borrow().is_none());
        assert!(!plugin.is_open("cam"));
    }

    #[tokio::test]
    async fn test_close_on_fresh_session_is_noop() {
        let plugin = Arc::new(SimulatedPlugin::new());
        plugin.attach(SimulatedDevice::new("cam"));
        let mut session = session(&plugin, Arc::new(SessionPolicy::default()));

        session.close().await;
        assert_eq!(session.status(), SessionStatus::Closed);
        assert_eq!(plugin.device_calls("cam").close, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pump_failure_surfaces_through_refresh() {
        let plugin = Arc::new(SimulatedPlugin::new());
        plugin.attach(SimulatedDevice::new("cam").with_frames([FrameStep::Frame], FrameStep::Error));
        let mut session = session(&plugin, Arc::new(SessionPolicy::default()));

        session.establish().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(
            session.refresh().await,
            SessionStatus::Failed(FailureReason::TooManyFrameErrors)
        );
        assert_eq!(session.pump_stats().map(|s| s.frames), Some(1));
        // the pump released the handle on its way out
        assert!(!session.is_open());
        assert!(!plugin.is_open("cam"));
        let calls = plugin.device_calls("cam");
        assert_eq!((calls.stop, calls.close), (1, 2));

        session.close().await;
        let after = plugin.device_calls("cam");
        assert_eq!((after.stop, after.close), (1, 2));
    }
}
