use crate::format::FormatDescriptor;
use std::io;
use thiserror::Error;

/// Why a device could not be turned into a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFailure {
    NotFound,
    NotCapture,
    NoStreaming,
}

impl std::fmt::Display for OpenFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            OpenFailure::NotFound => "device not found",
            OpenFailure::NotCapture => "device cannot capture video",
            OpenFailure::NoStreaming => "device does not support streaming I/O",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Error)]
pub enum CameraError {
    #[error("Failed to open {device}: {reason}")]
    DeviceOpenFailed { device: String, reason: OpenFailure },

    #[error("Format {requested} rejected: {source}")]
    FormatRejected {
        requested: FormatDescriptor,
        #[source]
        source: io::Error,
    },

    #[error("Buffer allocation failed ({requested} buffers): {reason}")]
    BufferAllocFailed { requested: u32, reason: String },

    #[error("Failed to map buffer {index}: {source}")]
    MapFailed {
        index: u32,
        #[source]
        source: io::Error,
    },

    #[error("Device would block")]
    WouldBlock,

    #[error("Fatal device I/O during {op}: {source}")]
    FatalDeviceIo {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Frame decode failed: {0}")]
    DecodeFailed(String),

    #[error("Control {0:#010x} not supported by device")]
    ControlUnsupported(u32),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Session is closed")]
    SessionClosed,

    #[error("Invalid parameter {key}: {reason}")]
    InvalidParameter { key: String, reason: String },

    #[error("{op} failed: {source}")]
    Device {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, CameraError>;

impl CameraError {
    /// Classify a failed device call. `EIO` and `ENODEV` mean the hardware is
    /// gone and the session must be torn down.
    pub fn from_io(op: &'static str, source: io::Error) -> Self {
        match source.raw_os_error() {
            Some(libc::EIO) | Some(libc::ENODEV) => CameraError::FatalDeviceIo { op, source },
            Some(libc::EAGAIN) => CameraError::WouldBlock,
            _ => CameraError::Device { op, source },
        }
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        CameraError::InvalidState(msg.into())
    }

    pub fn invalid_parameter(key: impl Into<String>, reason: impl Into<String>) -> Self {
        CameraError::InvalidParameter {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Errors after which no further dequeue/requeue is valid.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CameraError::FatalDeviceIo { .. } | CameraError::SessionClosed
        )
    }
}
