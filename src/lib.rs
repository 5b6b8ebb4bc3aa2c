//! uvclink - multi-slot USB camera session manager
//!
//! Keeps a fixed number of capture slots filled with attached UVC cameras:
//! discovers devices, walks each through an authorization handshake, opens
//! it, picks an MJPEG format, negotiates a capture mode the driver accepts
//! and pumps decoded RGB frames to subscribers. Cameras can come and go at
//! runtime; [`SlotManager::reconcile`] tears down ghosts and brings new
//! devices up.
//!
//! # Features
//!
//! - **Pluggable native layer**: everything hardware-facing sits behind the
//!   async [`CameraPlugin`] trait
//! - **Simulator**: [`SimulatedPlugin`] scripts devices for dry runs and tests
//! - **V4L2 backend**: `V4lPlugin` behind the `camera` feature
//! - **Async-first**: built on Tokio; frame pumps are spawned tasks
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use uvclink::{ManagerConfig, SimulatedPlugin, SlotManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let plugin = Arc::new(SimulatedPlugin::with_cameras(2));
//!     let manager = SlotManager::new(plugin, ManagerConfig::default());
//!
//!     manager.init().await?;
//!     manager.initial_fill().await?;
//!
//!     let mut frames = manager.subscribe(0)?;
//!     frames.changed().await?;
//!     if let Some(frame) = frames.borrow().as_ref() {
//!         println!("frame {} is {}x{}", frame.sequence, frame.width, frame.height);
//!     }
//!
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs, rust_2024_compatibility)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod device;
pub mod error;
pub mod format;
pub mod logging;
pub mod metrics;
pub mod permission;
pub mod plugin;
pub mod pump;
pub mod session;
pub mod simulator;
pub mod slots;

#[cfg(feature = "camera")]
#[cfg_attr(docsrs, doc(cfg(feature = "camera")))]
pub mod camera;

// Re-exports for convenience
pub use error::{Error, PluginError, Result};

#[cfg(feature = "camera")]
pub use camera::V4lPlugin;

pub use config::{LogRotation, LoggingOptions, MetricsFormat, UvclinkConfig};
pub use device::{DeviceDirectory, DeviceRef};
pub use format::{FormatCatalog, FormatDescriptor, FormatKind, NegotiationPolicy, ResolutionCandidate};
pub use permission::{PermissionGate, PermissionPolicy, PermissionState};
pub use plugin::{CameraPlugin, SharedPlugin, StartFlags, StartRequest};
pub use pump::{Frame, FramePump, PumpPolicy};
pub use session::{CaptureSession, FailureReason, SessionPolicy, SessionStatus};
pub use simulator::{SimulatedDevice, SimulatedPlugin};
pub use slots::{FillReport, ManagerConfig, ReconcileReport, SlotManager, SlotSnapshot, SlotState};
