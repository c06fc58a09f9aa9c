pub mod adapter;
pub mod config;
pub mod controls;
pub mod convert;
pub mod device;
pub mod error;
pub mod exif;
pub mod format;
pub mod frame;
pub mod manager;
pub mod metrics;
pub mod notify;
pub mod pacing;
pub mod parameters;
pub mod pool;
pub mod preview;
pub mod recovery;
pub mod sequencer;
pub mod session;
pub mod streaming;

pub use adapter::{CaptureAdapter, KernelCapture, VirtualCapture};
pub use config::AdapterConfig;
pub use error::{CameraError, Result};
pub use format::{FormatDescriptor, PixelFormat, Resolution};
pub use frame::{FrameDescriptor, FrameLease, FrameRoles};
pub use manager::SessionManager;
pub use notify::{Callbacks, CameraListener, FrameSubscriber};
