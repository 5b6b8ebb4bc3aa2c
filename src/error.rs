//! Error types for uvclink operations

use thiserror::Error;

/// Result type alias using uvclink's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for uvclink operations
///
/// Every per-device variant is local to the slot it happened on; the slot
/// manager records it as that slot's last error and carries on.
#[derive(Error, Debug)]
pub enum Error {
    /// Device enumeration failed; treated as "no devices this round"
    #[error("Device enumeration failed: {0}")]
    Enumeration(String),

    /// Permission status query failed; treated as "not yet granted"
    #[error("Permission query failed for {device}: {reason}")]
    PermissionQuery {
        /// Device the query was issued for
        device: String,
        /// Underlying plugin failure
        reason: String,
    },

    /// Permission was not granted within the polling budget
    #[error("Camera {0} is not authorized")]
    NotAuthorized(String),

    /// Opening the native device failed after all retries
    #[error("Failed to open {device} after {attempts} attempt(s): {reason}")]
    Open {
        /// Device that could not be opened
        device: String,
        /// Number of attempts made
        attempts: u32,
        /// Last failure observed
        reason: String,
    },

    /// No MJPEG descriptor was advertised by the device
    #[error("No eligible MJPEG format among {0} descriptor(s)")]
    NoEligibleFormat(usize),

    /// The driver rejected one negotiation candidate
    #[error("Start rejected for {width}x{height}@{fps} (status {status})")]
    CandidateRejected {
        /// Requested width
        width: u32,
        /// Requested height
        height: u32,
        /// Requested frame rate
        fps: u32,
        /// Native status code returned by start
        status: i32,
    },

    /// Every negotiation candidate was rejected
    #[error("All {0} negotiation candidate(s) rejected")]
    AllCandidatesRejected(usize),

    /// Fetching a frame from the native layer failed
    #[error("Frame fetch failed: {0}")]
    FrameFetch(String),

    /// Loading a fetched frame into the frame buffer failed
    #[error("Frame decode failed: {0}")]
    FrameDecode(String),

    /// The frame pump hit its consecutive error ceiling
    #[error("Frame pump stopped after {0} consecutive errors")]
    FrameBudgetExceeded(u32),

    /// A slot setup was dropped before it finished
    #[error("Setup of {0} was interrupted")]
    SetupInterrupted(String),

    /// A fill or reconcile pass is already running
    #[error("A reconcile pass is already in progress")]
    ReconcileInProgress,

    /// Slot index outside the configured table
    #[error("Slot {index} out of range (table holds {len})")]
    SlotOutOfRange {
        /// Requested slot index
        index: usize,
        /// Number of slots in the table
        len: usize,
    },

    /// Native plugin failure outside the categories above
    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Failure reported by a [`CameraPlugin`](crate::plugin::CameraPlugin) call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    /// The named device is not attached
    #[error("device {0} not attached")]
    NoSuchDevice(String),

    /// The native call threw or returned an error
    #[error("{0}")]
    Call(String),
}

impl PluginError {
    /// Shorthand for [`PluginError::Call`]
    pub fn call(message: impl Into<String>) -> Self {
        PluginError::Call(message.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Other(format!("JSON error: {}", e))
    }
}
