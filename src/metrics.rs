//! Lightweight runtime metrics aggregation for the uvclink daemon
//!
//! Recording is a no-op until [`enable`] is called, so library users that
//! never opt in pay nothing beyond an uninitialised `OnceLock` check.

use crate::config::MetricsFormat;
use crate::error::{Error, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};

static METRICS: OnceLock<Arc<MetricsInner>> = OnceLock::new();
static LAST_SNAPSHOT: OnceLock<Mutex<Option<Snapshot>>> = OnceLock::new();

/// Enable periodic metrics emission with the provided interval in seconds.
pub fn enable(interval_secs: u64) {
    let interval = interval_secs.max(5);
    let inner = Arc::clone(METRICS.get_or_init(|| Arc::new(MetricsInner::new(interval))));
    inner.update_interval(interval);
    inner.ensure_task();
}

/// Record one frame pump iteration.
pub fn record_frame(device: &str, committed: bool) {
    if let Some(inner) = METRICS.get() {
        inner.with_state(|state| {
            let entry = state.per_device.entry(device.to_string()).or_default();
            if committed {
                state.frames_committed += 1;
                entry.frames += 1;
            } else {
                state.frame_errors += 1;
                entry.errors += 1;
            }
        });
    }
}

/// Record the observed interval between two committed frames.
pub fn record_frame_interval(interval: Duration) {
    if let Some(inner) = METRICS.get() {
        inner.with_state(|state| {
            state.frame_interval_total += interval;
            state.frame_interval_samples += 1;
            if interval > state.frame_interval_max {
                state.frame_interval_max = interval;
            }
        });
    }
}

/// Record a pump that ended because of its error ceiling.
pub fn record_pump_exit(device: &str) {
    if let Some(inner) = METRICS.get() {
        inner.with_state(|state| {
            state.pump_exits += 1;
            state
                .per_device
                .entry(device.to_string())
                .or_default()
                .pump_exits += 1;
        });
    }
}

/// Record one negotiation start request and whether the driver accepted it.
pub fn record_negotiation(accepted: bool) {
    if let Some(inner) = METRICS.get() {
        inner.with_state(|state| {
            state.negotiation_attempts += 1;
            if accepted {
                state.negotiation_accepted += 1;
            }
        });
    }
}

/// Record the outcome of a fill or reconcile pass.
pub fn record_reconcile(cleaned: usize, reconnected: usize) {
    if let Some(inner) = METRICS.get() {
        inner.with_state(|state| {
            state.reconcile_passes += 1;
            state.devices_cleaned += cleaned as u64;
            state.devices_reconnected += reconnected as u64;
        });
    }
}

/// Register how many slots are currently streaming.
pub fn record_active_slots(active: usize) {
    if let Some(inner) = METRICS.get() {
        inner.with_state(|state| state.active_slots = active as u64);
    }
}

/// Spawn a lightweight HTTP endpoint that exposes the latest metrics snapshot.
pub fn spawn_http_endpoint(addr: SocketAddr, format: MetricsFormat) -> Result<()> {
    let std_listener = std::net::TcpListener::bind(addr).map_err(Error::Io)?;
    std_listener.set_nonblocking(true).map_err(Error::Io)?;
    let listener = TcpListener::from_std(std_listener).map_err(Error::Io)?;

    tokio::spawn(async move {
        if let Err(err) = run_http_listener(listener, format).await {
            tracing::error!(target: "uvclink::metrics", error = %err, "metrics endpoint error");
        }
    });

    Ok(())
}

struct MetricsInner {
    state: Mutex<MetricsState>,
    interval_secs: AtomicU64,
    task_spawned: AtomicBool,
}

impl MetricsInner {
    fn new(interval_secs: u64) -> Self {
        Self {
            state: Mutex::new(MetricsState::new()),
            interval_secs: AtomicU64::new(interval_secs.max(5)),
            task_spawned: AtomicBool::new(false),
        }
    }

    fn update_interval(&self, interval_secs: u64) {
        self.interval_secs
            .store(interval_secs.max(5), Ordering::Relaxed);
    }

    fn ensure_task(self: &Arc<Self>) {
        if self
            .task_spawned
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let runner = Arc::clone(self);
            tokio::spawn(async move {
                runner.run().await;
            });
        }
    }

    fn with_state(&self, update: impl FnOnce(&mut MetricsState)) {
        let mut state = self.state.lock().expect("metrics mutex poisoned");
        update(&mut state);
    }

    fn snapshot_current(&self) -> Snapshot {
        let state = self.state.lock().expect("metrics mutex poisoned");
        state.snapshot()
    }

    async fn run(self: Arc<Self>) {
        let mut current_secs = self.interval_secs.load(Ordering::Relaxed).max(5);
        loop {
            let mut ticker = time::interval(Duration::from_secs(current_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately; skip it so reports cover a full window
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let snapshot = self.snapshot_and_reset();
                store_snapshot(&snapshot);
                log_snapshot(&snapshot);

                let next_secs = self.interval_secs.load(Ordering::Relaxed).max(5);
                if next_secs != current_secs {
                    current_secs = next_secs;
                    break;
                }
            }
        }
    }

    fn snapshot_and_reset(&self) -> Snapshot {
        let mut state = self.state.lock().expect("metrics mutex poisoned");
        let snapshot = state.snapshot();
        state.reset_window();
        snapshot
    }
}

#[derive(Default)]
struct DeviceCounters {
    frames: u64,
    errors: u64,
    pump_exits: u64,
}

struct MetricsState {
    frames_committed: u64,
    frame_errors: u64,
    pump_exits: u64,
    negotiation_attempts: u64,
    negotiation_accepted: u64,
    reconcile_passes: u64,
    devices_cleaned: u64,
    devices_reconnected: u64,
    active_slots: u64,
    per_device: HashMap<String, DeviceCounters>,
    last_reset: Instant,
    frame_interval_total: Duration,
    frame_interval_samples: u64,
    frame_interval_max: Duration,
}

impl MetricsState {
    fn new() -> Self {
        Self {
            frames_committed: 0,
            frame_errors: 0,
            pump_exits: 0,
            negotiation_attempts: 0,
            negotiation_accepted: 0,
            reconcile_passes: 0,
            devices_cleaned: 0,
            devices_reconnected: 0,
            active_slots: 0,
            per_device: HashMap::new(),
            last_reset: Instant::now(),
            frame_interval_total: Duration::ZERO,
            frame_interval_samples: 0,
            frame_interval_max: Duration::ZERO,
        }
    }

    fn snapshot(&self) -> Snapshot {
        let mut per_device: Vec<DeviceSnapshot> = self
            .per_device
            .iter()
            .map(|(device, counters)| DeviceSnapshot {
                device: device.clone(),
                frames: counters.frames,
                errors: counters.errors,
                pump_exits: counters.pump_exits,
            })
            .collect();
        per_device.sort_by(|a, b| a.device.cmp(&b.device));

        let frame_interval_avg = if self.frame_interval_samples > 0 {
            let divisor = u32::try_from(self.frame_interval_samples).unwrap_or(u32::MAX);
            self.frame_interval_total.checked_div(divisor)
        } else {
            None
        };

        Snapshot {
            frames_committed: self.frames_committed,
            frame_errors: self.frame_errors,
            pump_exits: self.pump_exits,
            negotiation_attempts: self.negotiation_attempts,
            negotiation_accepted: self.negotiation_accepted,
            reconcile_passes: self.reconcile_passes,
            devices_cleaned: self.devices_cleaned,
            devices_reconnected: self.devices_reconnected,
            active_slots: self.active_slots,
            elapsed: self.last_reset.elapsed(),
            per_device,
            frame_interval_avg,
            frame_interval_max: (self.frame_interval_samples > 0).then_some(self.frame_interval_max),
        }
    }

    fn reset_window(&mut self) {
        self.frames_committed = 0;
        self.frame_errors = 0;
        self.pump_exits = 0;
        self.negotiation_attempts = 0;
        self.negotiation_accepted = 0;
        self.reconcile_passes = 0;
        self.devices_cleaned = 0;
        self.devices_reconnected = 0;
        self.per_device.clear();
        self.last_reset = Instant::now();
        self.frame_interval_total = Duration::ZERO;
        self.frame_interval_samples = 0;
        self.frame_interval_max = Duration::ZERO;
    }
}

#[derive(Clone)]
struct Snapshot {
    frames_committed: u64,
    frame_errors: u64,
    pump_exits: u64,
    negotiation_attempts: u64,
    negotiation_accepted: u64,
    reconcile_passes: u64,
    devices_cleaned: u64,
    devices_reconnected: u64,
    active_slots: u64,
    elapsed: Duration,
    per_device: Vec<DeviceSnapshot>,
    frame_interval_avg: Option<Duration>,
    frame_interval_max: Option<Duration>,
}

#[derive(Clone, Serialize)]
struct DeviceSnapshot {
    device: String,
    frames: u64,
    errors: u64,
    pump_exits: u64,
}

impl Snapshot {
    fn frame_error_rate(&self) -> f64 {
        let total = self.frames_committed + self.frame_errors;
        if total == 0 {
            0.0
        } else {
            self.frame_errors as f64 / total as f64
        }
    }

    fn fps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= f64::EPSILON {
            0.0
        } else {
            self.frames_committed as f64 / secs
        }
    }
}

fn log_snapshot(snapshot: &Snapshot) {
    let frame_avg_ms = snapshot
        .frame_interval_avg
        .map(|d| d.as_secs_f64() * 1_000.0);
    let frame_max_ms = snapshot
        .frame_interval_max
        .map(|d| d.as_secs_f64() * 1_000.0);

    info!(
        target: "uvclink::metrics",
        interval_secs = snapshot.elapsed.as_secs(),
        frames = snapshot.frames_committed,
        frame_errors = snapshot.frame_errors,
        fps = format_args!("{:.1}", snapshot.fps()),
        error_rate = format_args!("{:.1}%", snapshot.frame_error_rate() * 100.0),
        pump_exits = snapshot.pump_exits,
        negotiation_attempts = snapshot.negotiation_attempts,
        negotiation_accepted = snapshot.negotiation_accepted,
        reconcile_passes = snapshot.reconcile_passes,
        active_slots = snapshot.active_slots,
        frame_interval_avg_ms = frame_avg_ms,
        frame_interval_max_ms = frame_max_ms,
        "Capture metrics window"
    );

    if !snapshot.per_device.is_empty() {
        let breakdown = snapshot
            .per_device
            .iter()
            .map(|d| format!("{}: {} frames / {} err", d.device, d.frames, d.errors))
            .collect::<Vec<_>>()
            .join(", ");
        info!(target: "uvclink::metrics", breakdown, "Per-device metrics");
    }
}

fn store_snapshot(snapshot: &Snapshot) {
    let lock = LAST_SNAPSHOT.get_or_init(|| Mutex::new(None));
    if let Ok(mut guard) = lock.lock() {
        *guard = Some(snapshot.clone());
    }
}

fn latest_snapshot() -> Option<Snapshot> {
    let lock = LAST_SNAPSHOT.get_or_init(|| Mutex::new(None));
    match lock.lock() {
        Ok(guard) => (*guard).clone(),
        Err(_) => None,
    }
}

async fn run_http_listener(listener: TcpListener, format: MetricsFormat) -> Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(target: "uvclink::metrics", error = %err, "metrics accept failed");
                time::sleep(Duration::from_millis(250)).await;
                continue;
            }
        };

        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, format).await {
                tracing::debug!(target: "uvclink::metrics", peer = %peer, error = %err, "metrics connection closed");
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, format: MetricsFormat) -> Result<()> {
    let mut buffer = [0u8; 1024];
    let _ = stream.read(&mut buffer).await.map_err(Error::Io)?;

    // Prefer the live window; fall back to the last closed one
    let snapshot = METRICS
        .get()
        .map(|inner| inner.snapshot_current())
        .or_else(latest_snapshot);

    let (status_line, content_type, body) = match snapshot {
        Some(snapshot) => match format {
            MetricsFormat::Json => {
                let body = serde_json::to_vec(&snapshot_to_http(&snapshot))?;
                ("HTTP/1.1 200 OK\r\n", Some("application/json"), body)
            }
            MetricsFormat::Prometheus => (
                "HTTP/1.1 200 OK\r\n",
                Some("text/plain; version=0.0.4"),
                render_prometheus(&snapshot).into_bytes(),
            ),
        },
        None => ("HTTP/1.1 204 No Content\r\n", None, Vec::new()),
    };

    let mut response = Vec::with_capacity(128 + body.len());
    response.extend_from_slice(status_line.as_bytes());
    response.extend_from_slice(b"Connection: close\r\n");
    response.extend_from_slice(b"Cache-Control: no-store\r\n");
    if let Some(content_type) = content_type {
        response.extend_from_slice(b"Content-Type: ");
        response.extend_from_slice(content_type.as_bytes());
        response.extend_from_slice(b"\r\n");
    }
    let length_header = format!("Content-Length: {}\r\n\r\n", body.len());
    response.extend_from_slice(length_header.as_bytes());
    response.extend_from_slice(&body);

    stream.write_all(&response).await.map_err(Error::Io)?;
    stream.shutdown().await.map_err(Error::Io)?;

    Ok(())
}

#[derive(Serialize)]
struct HttpMetrics {
    window_secs: u64,
    frames_committed: u64,
    frame_errors: u64,
    frame_error_rate: f64,
    fps: f64,
    pump_exits: u64,
    negotiation: NegotiationMetrics,
    reconcile: ReconcileMetrics,
    active_slots: u64,
    frame_intervals: Option<FrameIntervalMetrics>,
    per_device: Vec<DeviceSnapshot>,
}

#[derive(Serialize)]
struct NegotiationMetrics {
    attempts: u64,
    accepted: u64,
}

#[derive(Serialize)]
struct ReconcileMetrics {
    passes: u64,
    cleaned: u64,
    reconnected: u64,
}

#[derive(Serialize)]
struct FrameIntervalMetrics {
    avg_ms: f64,
    max_ms: f64,
}

fn snapshot_to_http(snapshot: &Snapshot) -> HttpMetrics {
    HttpMetrics {
        window_secs: snapshot.elapsed.as_secs(),
        frames_committed: snapshot.frames_committed,
        frame_errors: snapshot.frame_errors,
        frame_error_rate: snapshot.frame_error_rate(),
        fps: snapshot.fps(),
        pump_exits: snapshot.pump_exits,
        negotiation: NegotiationMetrics {
            attempts: snapshot.negotiation_attempts,
            accepted: snapshot.negotiation_accepted,
        },
        reconcile: ReconcileMetrics {
            passes: snapshot.reconcile_passes,
            cleaned: snapshot.devices_cleaned,
            reconnected: snapshot.devices_reconnected,
        },
        active_slots: snapshot.active_slots,
        frame_intervals: snapshot.frame_interval_avg.map(|avg| FrameIntervalMetrics {
            avg_ms: avg.as_secs_f64() * 1_000.0,
            max_ms: snapshot.frame_interval_max.unwrap_or(avg).as_secs_f64() * 1_000.0,
        }),
        per_device: snapshot.per_device.clone(),
    }
}

fn write_metric(output: &mut String, name: &str, kind: &str, help: &str, value: impl std::fmt::Display) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {kind}");
    let _ = writeln!(output, "{name} {value}");
}

fn render_prometheus(snapshot: &Snapshot) -> String {
    let mut output = String::new();

    write_metric(
        &mut output,
        "uvclink_window_seconds",
        "gauge",
        "Duration of the aggregation window in seconds",
        snapshot.elapsed.as_secs(),
    );
    write_metric(
        &mut output,
        "uvclink_frames_total",
        "counter",
        "Frames committed during the window",
        snapshot.frames_committed,
    );
    write_metric(
        &mut output,
        "uvclink_frame_errors_total",
        "counter",
        "Failed frame iterations during the window",
        snapshot.frame_errors,
    );
    write_metric(
        &mut output,
        "uvclink_pump_exits_total",
        "counter",
        "Frame pumps stopped by their error ceiling",
        snapshot.pump_exits,
    );
    write_metric(
        &mut output,
        "uvclink_negotiation_attempts_total",
        "counter",
        "Start requests issued during negotiation",
        snapshot.negotiation_attempts,
    );
    write_metric(
        &mut output,
        "uvclink_negotiation_accepted_total",
        "counter",
        "Start requests accepted by the driver",
        snapshot.negotiation_accepted,
    );
    write_metric(
        &mut output,
        "uvclink_reconcile_passes_total",
        "counter",
        "Fill and reconcile passes completed",
        snapshot.reconcile_passes,
    );
    write_metric(
        &mut output,
        "uvclink_active_slots",
        "gauge",
        "Slots currently streaming",
        snapshot.active_slots,
    );

    if let Some(avg) = snapshot.frame_interval_avg {
        let _ = writeln!(
            &mut output,
            "# HELP uvclink_frame_interval_seconds Frame interval statistics"
        );
        let _ = writeln!(&mut output, "# TYPE uvclink_frame_interval_seconds gauge");
        let _ = writeln!(
            &mut output,
            "uvclink_frame_interval_seconds{{stat=\"avg\"}} {:.6}",
            avg.as_secs_f64()
        );
        if let Some(max) = snapshot.frame_interval_max {
            let _ = writeln!(
                &mut output,
                "uvclink_frame_interval_seconds{{stat=\"max\"}} {:.6}",
                max.as_secs_f64()
            );
        }
    }

    if !snapshot.per_device.is_empty() {
        let _ = writeln!(
            &mut output,
            "# HELP uvclink_device_frames_total Frame iterations by device and result"
        );
        let _ = writeln!(&mut output, "# TYPE uvclink_device_frames_total counter");
        for entry in &snapshot.per_device {
            let label = escape_label(&entry.device);
            let _ = writeln!(
                &mut output,
                "uvclink_device_frames_total{{device=\"{}\",result=\"committed\"}} {}",
                label, entry.frames
            );
            let _ = writeln!(
                &mut output,
                "uvclink_device_frames_total{{device=\"{}\",result=\"error\"}} {}",
                label, entry.errors
            );
        }
    }

    output
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('"', "\\\"")
}
