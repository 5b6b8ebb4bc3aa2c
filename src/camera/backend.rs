//! [`CameraPlugin`] over Video4Linux2 with MJPEG decoding

use crate::camera::{list_capture_nodes, node_index};
use crate::device::DeviceRef;
use crate::error::PluginError;
use crate::format::MJPEG_TYPE_CODE;
use crate::plugin::{CameraPlugin, PluginResult, START_OK, StartRequest};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::mem;
use std::sync::{Arc, Mutex};
use v4l::FourCC;
use v4l::buffer::Type;
use v4l::frameinterval::FrameIntervalEnum;
use v4l::framesize::FrameSizeEnum;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;

/// Start status when the driver settled on a different size than requested
pub const V4L_SIZE_MISMATCH: i32 = -2;

const YUYV_TYPE_CODE: u32 = 4;
const OTHER_TYPE_CODE: u32 = 0;
const MMAP_BUFFERS: u32 = 4;

fn mjpeg() -> FourCC {
    FourCC::new(b"MJPG")
}

/// Memory-mapped stream together with the device it borrows from
struct StreamInner {
    stream: MmapStream<'static>,
    /// Dropped after `stream`, which borrows it
    _device: Box<Device>,
}

// SAFETY: the stream and its device move together and are only touched
// under the surrounding mutex.
unsafe impl Send for StreamInner {}

struct OpenNode {
    index: usize,
    device: Option<Box<Device>>,
    stream: Option<Arc<Mutex<StreamInner>>>,
    size: (u32, u32),
    frame_number: i64,
}

/// Video4Linux2 implementation of [`CameraPlugin`]
///
/// Access control is the device node's file permissions: a device is
/// authorised when the current user can open it read-write.
#[derive(Default)]
pub struct V4lPlugin {
    nodes: Mutex<HashMap<DeviceRef, OpenNode>>,
}

impl V4lPlugin {
    /// Create a backend with no open devices
    pub fn new() -> Self {
        Self::default()
    }

    fn nodes(&self) -> std::sync::MutexGuard<'_, HashMap<DeviceRef, OpenNode>> {
        self.nodes.lock().expect("v4l node mutex poisoned")
    }
}

fn index_of(device: &DeviceRef) -> PluginResult<usize> {
    node_index(device.name()).ok_or_else(|| PluginError::NoSuchDevice(device.to_string()))
}

fn open_device(device: &DeviceRef) -> PluginResult<Device> {
    let index = index_of(device)?;
    Device::new(index).map_err(|e| PluginError::call(format!("open {device}: {e}")))
}

fn type_code(fourcc: &FourCC) -> u32 {
    match &fourcc.repr {
        b"MJPG" => MJPEG_TYPE_CODE,
        b"YUYV" => YUYV_TYPE_CODE,
        _ => OTHER_TYPE_CODE,
    }
}

/// Capability list in `code,width,height,fps` form
fn descriptors(dev: &Device) -> PluginResult<Vec<String>> {
    let formats = dev
        .enum_formats()
        .map_err(|e| PluginError::call(format!("enumerate formats: {e}")))?;

    let mut out = Vec::new();
    for format in formats {
        let code = type_code(&format.fourcc);
        let Ok(sizes) = dev.enum_framesizes(format.fourcc) else {
            continue;
        };
        for size in sizes {
            let FrameSizeEnum::Discrete(discrete) = size.size else {
                continue;
            };
            let fps = dev
                .enum_frameintervals(format.fourcc, discrete.width, discrete.height)
                .ok()
                .and_then(|intervals| {
                    intervals.into_iter().find_map(|i| match i.interval {
                        FrameIntervalEnum::Discrete(f) if f.numerator > 0 => {
                            Some(f.denominator / f.numerator)
                        }
                        _ => None,
                    })
                })
                .unwrap_or(30);
            out.push(format!("{code},{},{},{fps}", discrete.width, discrete.height));
        }
    }
    Ok(out)
}

fn decode_mjpeg(buf: &[u8]) -> PluginResult<Bytes> {
    let img = image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)
        .map_err(|e| PluginError::call(format!("MJPEG decode failed: {e}")))?;
    Ok(Bytes::from(img.to_rgb8().into_raw()))
}

#[async_trait]
impl CameraPlugin for V4lPlugin {
    async fn init(&self) -> PluginResult<()> {
        tracing::info!(nodes = list_capture_nodes().len(), "V4L2 backend ready");
        Ok(())
    }

    async fn list_usb_devices(&self) -> PluginResult<Vec<DeviceRef>> {
        Ok(list_capture_nodes()
            .into_iter()
            .map(|node| DeviceRef::new(node.path))
            .collect())
    }

    async fn obtain_permission(&self, device: &DeviceRef) -> PluginResult<()> {
        // Node permissions come from udev rules or group membership
        tracing::debug!(%device, "Access to V4L2 nodes is granted by file permissions");
        Ok(())
    }

    async fn has_permission(&self, device: &DeviceRef) -> PluginResult<bool> {
        match std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(device.name())
        {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => Ok(false),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(PluginError::NoSuchDevice(device.to_string()))
            }
            Err(e) => Err(PluginError::call(e.to_string())),
        }
    }

    async fn device_info(&self, device: &DeviceRef) -> PluginResult<String> {
        let caps = open_device(device)?
            .query_caps()
            .map_err(|e| PluginError::call(e.to_string()))?;
        Ok(format!("{} ({}, {})", caps.card, caps.driver, caps.bus))
    }

    async fn open(&self, device: &DeviceRef) -> PluginResult<Vec<String>> {
        let dev = open_device(device)?;
        let list = descriptors(&dev)?;
        self.nodes().insert(
            device.clone(),
            OpenNode {
                index: index_of(device)?,
                device: Some(Box::new(dev)),
                stream: None,
                size: (0, 0),
                frame_number: 0,
            },
        );
        Ok(list)
    }

    async fn start(&self, device: &DeviceRef, request: &StartRequest) -> PluginResult<i32> {
        let mut nodes = self.nodes();
        let node = nodes
            .get_mut(device)
            .ok_or_else(|| PluginError::call("start before open"))?;

        let dev = match node.device.take() {
            Some(dev) => dev,
            None => Box::new(
                Device::new(node.index).map_err(|e| PluginError::call(e.to_string()))?,
            ),
        };

        let mut fmt = dev.format().map_err(|e| PluginError::call(e.to_string()))?;
        fmt.width = request.width;
        fmt.height = request.height;
        fmt.fourcc = mjpeg();
        let applied = match dev.set_format(&fmt) {
            Ok(applied) => applied,
            Err(e) => {
                node.device = Some(dev);
                return Err(PluginError::call(format!("set format: {e}")));
            }
        };
        if applied.width != request.width || applied.height != request.height {
            tracing::debug!(
                %device,
                requested = format_args!("{}x{}", request.width, request.height),
                applied = format_args!("{}x{}", applied.width, applied.height),
                "Driver adjusted the frame size"
            );
            node.device = Some(dev);
            return Ok(V4L_SIZE_MISMATCH);
        }

        if let Ok(mut params) = dev.params() {
            params.interval = v4l::Fraction::new(1, request.fps.max(1));
            if let Err(e) = dev.set_params(&params) {
                tracing::debug!(%device, error = %e, "Frame interval not applied");
            }
        }
        tracing::debug!(%device, bandwidth = request.bandwidth, "UVC picks bandwidth from the format");

        // SAFETY: the boxed device is stored next to the stream in StreamInner
        // and dropped after it.
        let static_device: &'static Device =
            unsafe { mem::transmute::<&Device, &'static Device>(dev.as_ref()) };
        let stream = MmapStream::with_buffers(static_device, Type::VideoCapture, MMAP_BUFFERS)
            .map_err(|e| PluginError::call(format!("create stream: {e}")))?;

        node.stream = Some(Arc::new(Mutex::new(StreamInner {
            stream,
            _device: dev,
        })));
        node.size = (request.width, request.height);
        Ok(START_OK)
    }

    async fn frame_data(&self, device: &DeviceRef) -> PluginResult<Bytes> {
        let stream = {
            let nodes = self.nodes();
            let node = nodes
                .get(device)
                .ok_or_else(|| PluginError::NoSuchDevice(device.to_string()))?;
            node.stream
                .clone()
                .ok_or_else(|| PluginError::call("device not streaming"))?
        };

        // Dequeueing blocks until the camera delivers
        let frame = tokio::task::spawn_blocking(move || {
            let mut inner = stream.lock().expect("v4l stream mutex poisoned");
            let (buf, _meta) = inner
                .stream
                .next()
                .map_err(|e| PluginError::call(format!("dequeue: {e}")))?;
            if buf.is_empty() {
                return Ok(Bytes::new());
            }
            decode_mjpeg(buf)
        })
        .await
        .map_err(|e| PluginError::call(format!("capture task: {e}")))??;

        if !frame.is_empty() {
            if let Some(node) = self.nodes().get_mut(device) {
                node.frame_number += 1;
            }
        }
        Ok(frame)
    }

    async fn frame_number(&self, device: &DeviceRef) -> PluginResult<i64> {
        self.nodes()
            .get(device)
            .map(|node| node.frame_number)
            .ok_or_else(|| PluginError::NoSuchDevice(device.to_string()))
    }

    /// Drops this node's reference to the stream
    ///
    /// A dequeue still blocked in `frame_data` holds its own reference, so
    /// the mmap buffers are unmapped once that `next()` returns.
    async fn stop(&self, device: &DeviceRef) -> PluginResult<()> {
        if let Some(node) = self.nodes().get_mut(device) {
            node.stream = None;
            tracing::debug!(%device, size = ?node.size, "Stream stopped");
        }
        Ok(())
    }

    async fn close(&self, device: &DeviceRef) -> PluginResult<()> {
        self.nodes().remove(device);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_codes() {
        assert_eq!(type_code(&mjpeg()), MJPEG_TYPE_CODE);
        assert_eq!(type_code(&FourCC::new(b"YUYV")), YUYV_TYPE_CODE);
        assert_eq!(type_code(&FourCC::new(b"NV12")), OTHER_TYPE_CODE);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_mjpeg(&[0u8; 16]).is_err());
    }

    #[tokio::test]
    async fn test_unknown_node_name() {
        let plugin = V4lPlugin::new();
        let err = plugin.open(&DeviceRef::from("not-a-node")).await.unwrap_err();
        assert_eq!(err, PluginError::NoSuchDevice("not-a-node".to_string()));
    }
}
