//! Steady-state frame acquisition for a streaming session
//!
//! A [`FramePump`] runs as its own tokio task. It fetches one frame at a
//! time from the plugin, loads it into the session's [`FrameBuffer`] and
//! publishes it for the renderer. Consecutive failures are counted; any
//! committed frame resets the count, and reaching the ceiling fails the
//! session, withdraws the last picture and releases the native handle
//! before the pump ends.

use crate::device::DeviceRef;
use crate::error::{Error, Result};
use crate::metrics;
use crate::plugin::SharedPlugin;
use crate::session::{FailureReason, NativeHandle, StatusCell};
use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// One committed RGB24 frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Commit counter of the buffer that produced the frame, starting at 1
    pub sequence: u64,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Packed RGB24 pixels, `width * height * 3` bytes
    pub data: Bytes,
}

/// Channel committed frames are published on; `None` means "no picture"
pub type FramePublisher = Arc<watch::Sender<Option<Frame>>>;

/// Create a publisher with no frame yet
pub fn frame_channel() -> FramePublisher {
    let (tx, _rx) = watch::channel(None);
    Arc::new(tx)
}

/// Frame sink sized to a negotiated resolution
pub struct FrameBuffer {
    width: u32,
    height: u32,
    staging: Vec<u8>,
    sequence: u64,
    publisher: FramePublisher,
}

impl FrameBuffer {
    /// Allocate a buffer for `width x height` RGB24 frames
    pub fn new(width: u32, height: u32, publisher: FramePublisher) -> Self {
        let len = width as usize * height as usize * 3;
        Self {
            width,
            height,
            staging: vec![0; len],
            sequence: 0,
            publisher,
        }
    }

    /// Bytes in one frame
    pub fn frame_len(&self) -> usize {
        self.staging.len()
    }

    /// Negotiated size
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Copy a fetched payload into the staging area
    ///
    /// Payloads longer than a frame are truncated; shorter ones are rejected.
    pub fn load(&mut self, data: &[u8]) -> Result<()> {
        let len = self.staging.len();
        if data.len() < len {
            return Err(Error::FrameDecode(format!(
                "payload of {} bytes is short of {}x{} RGB24 ({} bytes)",
                data.len(),
                self.width,
                self.height,
                len
            )));
        }
        self.staging.copy_from_slice(&data[..len]);
        Ok(())
    }

    /// Publish the staged frame and return its sequence number
    pub fn apply(&mut self) -> u64 {
        self.sequence += 1;
        self.publisher.send_replace(Some(Frame {
            sequence: self.sequence,
            width: self.width,
            height: self.height,
            data: Bytes::copy_from_slice(&self.staging),
        }));
        self.sequence
    }

    /// Withdraw the published frame
    pub fn clear(&self) {
        self.publisher.send_replace(None);
    }
}

/// Pump tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpPolicy {
    /// Consecutive failures that end the pump
    pub error_ceiling: u32,
    /// Wait after a failed iteration
    pub retry_delay: Duration,
    /// Emit a progress log every n committed frames (0 disables)
    pub log_every: u64,
}

impl Default for PumpPolicy {
    fn default() -> Self {
        Self {
            error_ceiling: 10,
            retry_delay: Duration::from_millis(100),
            log_every: 60,
        }
    }
}

/// Counters shared between a running pump and its observers
#[derive(Debug, Default)]
pub struct PumpStats {
    frames: AtomicU64,
    errors: AtomicU64,
    consecutive: AtomicU32,
}

/// Point-in-time copy of [`PumpStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PumpSnapshot {
    /// Frames committed
    pub frames: u64,
    /// Failed iterations in total
    pub errors: u64,
    /// Current run of failures
    pub consecutive_errors: u32,
}

impl PumpStats {
    /// Read the counters
    pub fn snapshot(&self) -> PumpSnapshot {
        PumpSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            consecutive_errors: self.consecutive.load(Ordering::Relaxed),
        }
    }
}

/// Frame acquisition loop bound to one streaming session
pub struct FramePump {
    plugin: SharedPlugin,
    device: DeviceRef,
    buffer: Arc<Mutex<FrameBuffer>>,
    policy: PumpPolicy,
    stats: Arc<PumpStats>,
    status: StatusCell,
    native: Arc<NativeHandle>,
}

impl FramePump {
    /// Bind a pump to a device and its frame buffer
    pub fn new(
        plugin: SharedPlugin,
        device: DeviceRef,
        buffer: Arc<Mutex<FrameBuffer>>,
        policy: PumpPolicy,
        status: StatusCell,
        native: Arc<NativeHandle>,
    ) -> Self {
        Self {
            plugin,
            device,
            buffer,
            policy,
            stats: Arc::new(PumpStats::default()),
            status,
            native,
        }
    }

    /// Shared counters of this pump
    pub fn stats(&self) -> Arc<PumpStats> {
        Arc::clone(&self.stats)
    }

    /// Run on a new tokio task
    pub fn spawn(self) -> PumpHandle {
        let stats = self.stats();
        let task = tokio::spawn(self.run());
        PumpHandle { task, stats }
    }

    /// Pump frames until the error ceiling is reached
    ///
    /// Only returns with [`Error::FrameBudgetExceeded`], after stopping and
    /// closing the device; a healthy pump runs until its task is cancelled.
    pub async fn run(self) -> Result<()> {
        let ceiling = self.policy.error_ceiling.max(1);
        let mut consecutive: u32 = 0;
        let mut last_commit: Option<Instant> = None;

        tracing::info!(device = %self.device, "Frame pump started");

        loop {
            match self.next_frame().await {
                Ok(sequence) => {
                    consecutive = 0;
                    self.stats.consecutive.store(0, Ordering::Relaxed);
                    self.stats.frames.fetch_add(1, Ordering::Relaxed);
                    metrics::record_frame(self.device.name(), true);

                    let now = Instant::now();
                    if let Some(previous) = last_commit {
                        metrics::record_frame_interval(now.saturating_duration_since(previous));
                    }
                    last_commit = Some(now);

                    if self.policy.log_every > 0 && sequence % self.policy.log_every == 0 {
                        tracing::debug!(device = %self.device, frames = sequence, "Frames committed");
                    }

                    tokio::task::yield_now().await;
                }
                Err(err) => {
                    consecutive += 1;
                    self.stats.consecutive.store(consecutive, Ordering::Relaxed);
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    metrics::record_frame(self.device.name(), false);

                    tracing::warn!(
                        device = %self.device,
                        consecutive,
                        ceiling,
                        error = %err,
                        "Frame iteration failed"
                    );

                    if consecutive >= ceiling {
                        let exit = Error::FrameBudgetExceeded(ceiling);
                        tracing::error!(device = %self.device, error = %exit, "Frame pump giving up");
                        self.status.fail(FailureReason::TooManyFrameErrors, &exit);
                        metrics::record_pump_exit(self.device.name());
                        self.buffer.lock().expect("frame buffer mutex poisoned").clear();
                        if self.native.release().await {
                            tracing::info!(device = %self.device, "Native handle released after pump failure");
                        }
                        return Err(exit);
                    }

                    tokio::time::sleep(self.policy.retry_delay).await;
                }
            }
        }
    }

    async fn next_frame(&self) -> Result<u64> {
        let data = self
            .plugin
            .frame_data(&self.device)
            .await
            .map_err(|e| Error::FrameFetch(e.to_string()))?;

        if data.is_empty() {
            return Err(Error::FrameFetch("empty frame payload".to_string()));
        }

        let mut buffer = self.buffer.lock().expect("frame buffer mutex poisoned");
        buffer.load(&data)?;
        Ok(buffer.apply())
    }
}

/// Handle to a spawned pump task
pub struct PumpHandle {
    task: JoinHandle<Result<()>>,
    stats: Arc<PumpStats>,
}

impl PumpHandle {
    /// Whether the task has ended on its own
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Shared counters of the pump
    pub fn stats(&self) -> Arc<PumpStats> {
        Arc::clone(&self.stats)
    }

    /// Cancel the task and wait until it is gone
    ///
    /// Returns the pump's own exit error when it had already stopped.
    pub async fn cancel(self) -> Option<Error> {
        self.task.abort();
        match self.task.await {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err),
            Err(join) if join.is_cancelled() => None,
            Err(join) => Some(Error::Other(format!("frame pump panicked: {join}"))),
        }
    }

    /// Abort without waiting; used when the owner is dropped
    pub(crate) fn abort(&self) {
        self.task.abort();
    }
}
