//! Native camera plugin capability surface
//!
//! Everything uvclink knows about the hardware goes through [`CameraPlugin`].
//! A single instance is shared by every session as a [`SharedPlugin`]; calls
//! for one device are issued sequentially by the session that owns it.

use crate::device::DeviceRef;
use crate::error::PluginError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Result of a plugin call
pub type PluginResult<T> = std::result::Result<T, PluginError>;

/// Shared handle to the plugin binding used by all sessions
pub type SharedPlugin = Arc<dyn CameraPlugin>;

/// Status code returned by [`CameraPlugin::start`] when the driver accepted the mode
pub const START_OK: i32 = 0;

/// Opaque pass-through flags of the native start call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartFlags {
    /// First native flag
    pub flag_a: bool,
    /// Second native flag
    pub flag_b: bool,
}

impl Default for StartFlags {
    fn default() -> Self {
        Self {
            flag_a: true,
            flag_b: false,
        }
    }
}

/// Full argument tuple of one native start request
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StartRequest {
    /// Requested width in pixels
    pub width: u32,
    /// Requested height in pixels
    pub height: u32,
    /// Requested frames per second
    pub fps: u32,
    /// Driver format selector
    pub format_selector: u32,
    /// Share of isochronous USB bandwidth, in (0, 1]
    pub bandwidth: f32,
    /// Pass-through flags
    pub flags: StartFlags,
}

/// Capabilities consumed from the native USB/UVC layer
///
/// Every call may fail; callers decide whether a failure is transient.
#[async_trait]
pub trait CameraPlugin: Send + Sync {
    /// Bind the plugin to its host context. Called once before anything else.
    async fn init(&self) -> PluginResult<()>;

    /// Enumerate attached USB cameras
    async fn list_usb_devices(&self) -> PluginResult<Vec<DeviceRef>>;

    /// Ask the host to authorise access to a device
    async fn obtain_permission(&self, device: &DeviceRef) -> PluginResult<()>;

    /// Whether access to a device is currently authorised
    async fn has_permission(&self, device: &DeviceRef) -> PluginResult<bool>;

    /// Human-readable device description
    async fn device_info(&self, device: &DeviceRef) -> PluginResult<String>;

    /// Open a device and return its raw format descriptors
    async fn open(&self, device: &DeviceRef) -> PluginResult<Vec<String>>;

    /// Start streaming; returns [`START_OK`] on success or a driver status code
    async fn start(&self, device: &DeviceRef, request: &StartRequest) -> PluginResult<i32>;

    /// Latest RGB24 frame; an empty buffer means no frame was available
    async fn frame_data(&self, device: &DeviceRef) -> PluginResult<Bytes>;

    /// Native frame counter of a streaming device
    async fn frame_number(&self, device: &DeviceRef) -> PluginResult<i64>;

    /// Stop streaming
    async fn stop(&self, device: &DeviceRef) -> PluginResult<()>;

    /// Release the native handle
    async fn close(&self, device: &DeviceRef) -> PluginResult<()>;
}
