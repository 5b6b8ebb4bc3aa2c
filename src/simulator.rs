//! In-memory camera plugin for dry runs and tests
//!
//! [`SimulatedPlugin`] behaves like a small USB bus: devices can be attached
//! and detached at runtime, each with scripted permission, open, start and
//! frame behaviour. Every call is counted per device so callers can assert
//! on exactly what reached the "native" layer.

use crate::device::DeviceRef;
use crate::error::PluginError;
use crate::plugin::{CameraPlugin, PluginResult, START_OK, StartRequest};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Status code returned when a simulated device refuses a mode
pub const SIM_REJECT_STATUS: i32 = -51;

/// How a simulated device answers permission queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionBehavior {
    /// Already authorised
    Granted,
    /// Authorised on the n-th `has_permission` call
    AfterPolls(u32),
    /// Authorised once `obtain_permission` has been called n times
    AfterRequests(u32),
    /// Never authorised
    Never,
    /// Every query fails at the transport level
    QueryFails,
}

/// Outcome of one simulated frame fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStep {
    /// Full RGB24 frame at the negotiated size
    Frame,
    /// Zero-length payload
    Empty,
    /// The call fails
    Error,
    /// Payload shorter than the negotiated frame
    Short,
}

/// Scripted behaviour of one simulated camera
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    name: DeviceRef,
    info: String,
    descriptors: Vec<String>,
    permission: PermissionBehavior,
    open_failures: u32,
    rejected: Vec<(u32, u32)>,
    frames: VecDeque<FrameStep>,
    after_script: FrameStep,
}

impl SimulatedDevice {
    /// A well-behaved MJPEG camera
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            info: format!("Simulated UVC camera {name}"),
            name: DeviceRef::new(name),
            descriptors: vec![
                "4,640,480,30".to_string(),
                "6,1280,720,30".to_string(),
                "6,640,480,30".to_string(),
                "6,320,240,30".to_string(),
            ],
            permission: PermissionBehavior::Granted,
            open_failures: 0,
            rejected: Vec::new(),
            frames: VecDeque::new(),
            after_script: FrameStep::Frame,
        }
    }

    /// Replace the advertised format descriptors
    pub fn with_descriptors<I, S>(mut self, descriptors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.descriptors = descriptors.into_iter().map(Into::into).collect();
        self
    }

    /// Set the permission behaviour
    pub fn with_permission(mut self, permission: PermissionBehavior) -> Self {
        self.permission = permission;
        self
    }

    /// Fail the first `count` open calls
    pub fn with_open_failures(mut self, count: u32) -> Self {
        self.open_failures = count;
        self
    }

    /// Refuse start requests at this resolution
    pub fn rejecting(mut self, width: u32, height: u32) -> Self {
        self.rejected.push((width, height));
        self
    }

    /// Script the next frame fetches, then continue with `after`
    pub fn with_frames<I>(mut self, script: I, after: FrameStep) -> Self
    where
        I: IntoIterator<Item = FrameStep>,
    {
        self.frames = script.into_iter().collect();
        self.after_script = after;
        self
    }

    /// Device name
    pub fn name(&self) -> &DeviceRef {
        &self.name
    }
}

/// Per-device (or bus-wide) call counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimCalls {
    /// `init` calls
    pub init: u32,
    /// `list_usb_devices` calls
    pub list_usb_devices: u32,
    /// `obtain_permission` calls
    pub obtain_permission: u32,
    /// `has_permission` calls
    pub has_permission: u32,
    /// `device_info` calls
    pub device_info: u32,
    /// `open` calls
    pub open: u32,
    /// `start` calls
    pub start: u32,
    /// `frame_data` calls
    pub frame_data: u32,
    /// `stop` calls
    pub stop: u32,
    /// `close` calls
    pub close: u32,
}

struct DeviceState {
    script: SimulatedDevice,
    attached: bool,
    opened: bool,
    streaming: Option<StartRequest>,
    frame_number: i64,
    starts: Vec<StartRequest>,
    calls: SimCalls,
}

#[derive(Default)]
struct SimState {
    devices: Vec<DeviceState>,
    enumeration_fails: bool,
    totals: SimCalls,
}

impl SimState {
    fn device_mut(&mut self, device: &DeviceRef) -> PluginResult<&mut DeviceState> {
        self.devices
            .iter_mut()
            .find(|d| d.attached && d.script.name == *device)
            .ok_or_else(|| PluginError::NoSuchDevice(device.to_string()))
    }

    fn any_device_mut(&mut self, device: &DeviceRef) -> Option<&mut DeviceState> {
        self.devices.iter_mut().find(|d| d.script.name == *device)
    }
}

/// Scriptable in-memory implementation of [`CameraPlugin`]
#[derive(Default)]
pub struct SimulatedPlugin {
    state: Mutex<SimState>,
}

impl SimulatedPlugin {
    /// An empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus with `count` well-behaved cameras named `sim-0`, `sim-1`, ...
    pub fn with_cameras(count: usize) -> Self {
        let plugin = Self::new();
        for index in 0..count {
            plugin.attach(SimulatedDevice::new(format!("sim-{index}")));
        }
        plugin
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().expect("simulator mutex poisoned")
    }

    /// Plug a device in; an already known name is re-attached with the new script
    pub fn attach(&self, device: SimulatedDevice) {
        let mut state = self.lock();
        if let Some(existing) = state
            .devices
            .iter_mut()
            .find(|d| !d.attached && d.script.name == device.name)
        {
            existing.script = device;
            existing.attached = true;
            existing.opened = false;
            existing.streaming = None;
            return;
        }
        state.devices.push(DeviceState {
            script: device,
            attached: true,
            opened: false,
            streaming: None,
            frame_number: 0,
            starts: Vec::new(),
            calls: SimCalls::default(),
        });
    }

    /// Unplug a device; later calls for it fail with [`PluginError::NoSuchDevice`]
    pub fn detach(&self, name: &str) {
        let mut state = self.lock();
        for device in state.devices.iter_mut().filter(|d| d.script.name.name() == name) {
            device.attached = false;
            device.opened = false;
            device.streaming = None;
        }
    }

    /// Make enumeration fail until switched off again
    pub fn fail_enumeration(&self, fail: bool) {
        self.lock().enumeration_fails = fail;
    }

    /// Bus-wide call counters
    pub fn calls(&self) -> SimCalls {
        self.lock().totals.clone()
    }

    /// Call counters of one device
    pub fn device_calls(&self, name: &str) -> SimCalls {
        self.lock()
            .devices
            .iter()
            .filter(|d| d.script.name.name() == name)
            .map(|d| d.calls.clone())
            .next()
            .unwrap_or_default()
    }

    /// Every start request a device has received, in order
    pub fn start_requests(&self, name: &str) -> Vec<StartRequest> {
        self.lock()
            .devices
            .iter()
            .filter(|d| d.script.name.name() == name)
            .flat_map(|d| d.starts.clone())
            .collect()
    }

    /// Whether a device currently holds an open native handle
    pub fn is_open(&self, name: &str) -> bool {
        self.lock()
            .devices
            .iter()
            .any(|d| d.script.name.name() == name && d.opened)
    }
}

fn frame_bytes(request: &StartRequest, frame_number: i64, short: bool) -> Bytes {
    let len = request.width as usize * request.height as usize * 3;
    let len = if short { len / 2 } else { len };
    let shade = (frame_number % 256) as u8;
    Bytes::from(vec![shade; len])
}

#[async_trait]
impl CameraPlugin for SimulatedPlugin {
    async fn init(&self) -> PluginResult<()> {
        self.lock().totals.init += 1;
        Ok(())
    }

    async fn list_usb_devices(&self) -> PluginResult<Vec<DeviceRef>> {
        let mut state = self.lock();
        state.totals.list_usb_devices += 1;
        if state.enumeration_fails {
            return Err(PluginError::call("USB enumeration unavailable"));
        }
        Ok(state
            .devices
            .iter()
            .filter(|d| d.attached)
            .map(|d| d.script.name.clone())
            .collect())
    }

    async fn obtain_permission(&self, device: &DeviceRef) -> PluginResult<()> {
        let mut state = self.lock();
        state.totals.obtain_permission += 1;
        let dev = state.device_mut(device)?;
        dev.calls.obtain_permission += 1;
        Ok(())
    }

    async fn has_permission(&self, device: &DeviceRef) -> PluginResult<bool> {
        let mut state = self.lock();
        state.totals.has_permission += 1;
        let dev = state.device_mut(device)?;
        dev.calls.has_permission += 1;
        match dev.script.permission {
            PermissionBehavior::Granted => Ok(true),
            PermissionBehavior::AfterPolls(n) => Ok(dev.calls.has_permission >= n),
            PermissionBehavior::AfterRequests(n) => Ok(dev.calls.obtain_permission >= n),
            PermissionBehavior::Never => Ok(false),
            PermissionBehavior::QueryFails => Err(PluginError::call("permission service unavailable")),
        }
    }

    async fn device_info(&self, device: &DeviceRef) -> PluginResult<String> {
        let mut state = self.lock();
        state.totals.device_info += 1;
        let dev = state.device_mut(device)?;
        dev.calls.device_info += 1;
        Ok(dev.script.info.clone())
    }

    async fn open(&self, device: &DeviceRef) -> PluginResult<Vec<String>> {
        let mut state = self.lock();
        state.totals.open += 1;
        let dev = state.device_mut(device)?;
        dev.calls.open += 1;
        if dev.script.open_failures > 0 {
            dev.script.open_failures -= 1;
            return Err(PluginError::call("device busy"));
        }
        dev.opened = true;
        Ok(dev.script.descriptors.clone())
    }

    async fn start(&self, device: &DeviceRef, request: &StartRequest) -> PluginResult<i32> {
        let mut state = self.lock();
        state.totals.start += 1;
        let dev = state.device_mut(device)?;
        dev.calls.start += 1;
        dev.starts.push(*request);
        if !dev.opened {
            return Err(PluginError::call("start before open"));
        }
        if dev
            .script
            .rejected
            .iter()
            .any(|&(w, h)| w == request.width && h == request.height)
        {
            return Ok(SIM_REJECT_STATUS);
        }
        dev.streaming = Some(*request);
        Ok(START_OK)
    }

    async fn frame_data(&self, device: &DeviceRef) -> PluginResult<Bytes> {
        let pace = {
            let mut state = self.lock();
            state.totals.frame_data += 1;
            let dev = state.device_mut(device)?;
            dev.calls.frame_data += 1;
            dev.streaming
                .map(|req| Duration::from_secs_f64(1.0 / f64::from(req.fps.max(1))))
                .unwrap_or(Duration::from_millis(10))
        };

        // Stand in for the camera's own frame cadence.
        tokio::time::sleep(pace).await;

        let mut state = self.lock();
        let dev = state.device_mut(device)?;
        let request = dev
            .streaming
            .ok_or_else(|| PluginError::call("device not streaming"))?;
        let step = dev.script.frames.pop_front().unwrap_or(dev.script.after_script);
        match step {
            FrameStep::Frame | FrameStep::Short => {
                dev.frame_number += 1;
                Ok(frame_bytes(&request, dev.frame_number, step == FrameStep::Short))
            }
            FrameStep::Empty => Ok(Bytes::new()),
            FrameStep::Error => Err(PluginError::call("frame grab failed")),
        }
    }

    async fn frame_number(&self, device: &DeviceRef) -> PluginResult<i64> {
        let mut state = self.lock();
        let dev = state.device_mut(device)?;
        Ok(dev.frame_number)
    }

    async fn stop(&self, device: &DeviceRef) -> PluginResult<()> {
        let mut state = self.lock();
        state.totals.stop += 1;
        let dev = state
            .any_device_mut(device)
            .ok_or_else(|| PluginError::NoSuchDevice(device.to_string()))?;
        dev.calls.stop += 1;
        dev.streaming = None;
        Ok(())
    }

    async fn close(&self, device: &DeviceRef) -> PluginResult<()> {
        let mut state = self.lock();
        state.totals.close += 1;
        let dev = state
            .any_device_mut(device)
            .ok_or_else(|| PluginError::NoSuchDevice(device.to_string()))?;
        dev.calls.close += 1;
        dev.opened = false;
        dev.streaming = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::StartFlags;

    fn request(width: u32, height: u32) -> StartRequest {
        StartRequest {
            width,
            height,
            fps: 30,
            format_selector: 8,
            bandwidth: 0.15,
            flags: StartFlags::default(),
        }
    }

    #[tokio::test]
    async fn test_detached_device_is_gone() {
        let plugin = SimulatedPlugin::with_cameras(2);
        plugin.detach("sim-0");

        let devices = plugin.list_usb_devices().await.unwrap();
        assert_eq!(devices, vec![DeviceRef::from("sim-1")]);

        let err = plugin.open(&DeviceRef::from("sim-0")).await.unwrap_err();
        assert!(matches!(err, PluginError::NoSuchDevice(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_follow_script() {
        let plugin = SimulatedPlugin::new();
        plugin.attach(
            SimulatedDevice::new("cam")
                .with_frames([FrameStep::Empty, FrameStep::Error, FrameStep::Short], FrameStep::Frame),
        );
        let cam = DeviceRef::from("cam");
        plugin.open(&cam).await.unwrap();
        assert_eq!(plugin.start(&cam, &request(4, 2)).await.unwrap(), START_OK);

        assert!(plugin.frame_data(&cam).await.unwrap().is_empty());
        assert!(plugin.frame_data(&cam).await.is_err());
        assert_eq!(plugin.frame_data(&cam).await.unwrap().len(), 12);
        assert_eq!(plugin.frame_data(&cam).await.unwrap().len(), 24);
        assert_eq!(plugin.frame_number(&cam).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_rejected_resolution_returns_status() {
        let plugin = SimulatedPlugin::new();
        plugin.attach(SimulatedDevice::new("cam").rejecting(640, 480));
        let cam = DeviceRef::from("cam");
        plugin.open(&cam).await.unwrap();

        assert_eq!(plugin.start(&cam, &request(640, 480)).await.unwrap(), SIM_REJECT_STATUS);
        assert_eq!(plugin.start(&cam, &request(320, 240)).await.unwrap(), START_OK);
        assert_eq!(plugin.start_requests("cam").len(), 2);
    }
}
