//! Ownership of one open capture device.

use crate::controls::ControlRegulator;
use crate::device::{CaptureDevice, DeviceCaps, KernelDevice};
use crate::error::{CameraError, OpenFailure, Result};
use crate::format::{FormatDescriptor, MemoryKind, PixelFormat, Resolution};
use common::retry::retry_while;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

const OPEN_ATTEMPTS: u32 = 3;
const OPEN_BACKOFF_MS: u64 = 50;

/// An open device with its capabilities and controls.
///
/// `close` drops the device handle; every later call that needs the device
/// fails with [`CameraError::SessionClosed`].
pub struct DeviceSession {
    name: String,
    device: RwLock<Option<Arc<dyn CaptureDevice>>>,
    caps: DeviceCaps,
    memory: MemoryKind,
    formats: Vec<PixelFormat>,
    format: Mutex<Option<FormatDescriptor>>,
    streaming: AtomicBool,
    regulator: Arc<ControlRegulator>,
}

impl DeviceSession {
    /// Opens a V4L2 node, retrying transient failures such as `EBUSY`.
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let device = retry_while(
            || KernelDevice::open(path),
            |e| !matches!(e, CameraError::DeviceOpenFailed { .. }),
            OPEN_ATTEMPTS,
            OPEN_BACKOFF_MS,
            "Camera open",
        )?;
        Self::from_device(Arc::new(device))
    }

    pub fn open_index(index: u32) -> Result<Self> {
        Self::open_path(format!("/dev/video{index}"))
    }

    /// Wraps an already opened device after checking it can stream video.
    pub fn from_device(device: Arc<dyn CaptureDevice>) -> Result<Self> {
        let name = device.name().to_string();
        let caps = device.caps().map_err(|e| CameraError::from_io("VIDIOC_QUERYCAP", e))?;
        if !caps.video_capture {
            return Err(CameraError::DeviceOpenFailed {
                device: name,
                reason: OpenFailure::NotCapture,
            });
        }
        if !caps.streaming {
            return Err(CameraError::DeviceOpenFailed {
                device: name,
                reason: OpenFailure::NoStreaming,
            });
        }

        let formats = device.enum_formats().unwrap_or_else(|e| {
            tracing::warn!(device = %name, error = %e, "Format enumeration failed");
            Vec::new()
        });
        let memory = caps.preferred_memory();
        let regulator = Arc::new(ControlRegulator::probe(device.clone()));

        tracing::info!(
            device = %name,
            driver = %caps.driver,
            card = %caps.card,
            ?memory,
            formats = ?formats,
            "Camera session opened"
        );
        Ok(Self {
            name,
            device: RwLock::new(Some(device)),
            caps,
            memory,
            formats,
            format: Mutex::new(None),
            streaming: AtomicBool::new(false),
            regulator,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> Result<Arc<dyn CaptureDevice>> {
        self.device
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or(CameraError::SessionClosed)
    }

    pub fn is_open(&self) -> bool {
        self.device.read().unwrap_or_else(|p| p.into_inner()).is_some()
    }

    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    pub fn memory_kind(&self) -> MemoryKind {
        self.memory
    }

    pub fn formats(&self) -> &[PixelFormat] {
        &self.formats
    }

    pub fn supports(&self, format: PixelFormat) -> bool {
        self.formats.contains(&format)
    }

    pub fn regulator(&self) -> &Arc<ControlRegulator> {
        &self.regulator
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    pub(crate) fn set_streaming(&self, streaming: bool) {
        self.streaming.store(streaming, Ordering::Release);
    }

    /// Last negotiated format.
    pub fn format(&self) -> Option<FormatDescriptor> {
        *self.format.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// `VIDIOC_S_FMT`. The device reply is authoritative.
    pub fn negotiate_format(&self, candidate: &FormatDescriptor) -> Result<FormatDescriptor> {
        if self.is_streaming() {
            return Err(CameraError::invalid_state("format change while streaming"));
        }
        let device = self.device()?;
        let applied = device
            .set_format(candidate)
            .map_err(|source| match CameraError::from_io("VIDIOC_S_FMT", source) {
                CameraError::Device { source, .. } => CameraError::FormatRejected {
                    requested: *candidate,
                    source,
                },
                other => other,
            })?;
        if applied.resolution() != candidate.resolution()
            || applied.pixel_format != candidate.pixel_format
        {
            tracing::info!(requested = %candidate, applied = %applied, "Device adjusted format");
        }
        *self.format.lock().unwrap_or_else(|p| p.into_inner()) = Some(applied);
        Ok(applied)
    }

    /// `VIDIOC_TRY_FMT`: what the device would apply, without applying it.
    pub fn try_format(&self, candidate: &FormatDescriptor) -> Result<FormatDescriptor> {
        let device = self.device()?;
        device
            .try_format(candidate)
            .map_err(|source| CameraError::FormatRejected {
                requested: *candidate,
                source,
            })
    }

    /// `VIDIOC_G_FMT`.
    pub fn current_format(&self) -> Result<FormatDescriptor> {
        self.device()?
            .format()
            .map_err(|e| CameraError::from_io("VIDIOC_G_FMT", e))
    }

    pub fn frame_sizes(&self, format: PixelFormat) -> Vec<Resolution> {
        self.device()
            .and_then(|d| d.frame_sizes(format).map_err(|e| CameraError::from_io("VIDIOC_ENUM_FRAMESIZES", e)))
            .unwrap_or_default()
    }

    pub fn frame_intervals(&self, format: PixelFormat, size: Resolution) -> Vec<Duration> {
        self.device()
            .and_then(|d| {
                d.frame_intervals(format, size)
                    .map_err(|e| CameraError::from_io("VIDIOC_ENUM_FRAMEINTERVALS", e))
            })
            .unwrap_or_default()
    }

    /// Highest frame rate the device offers at `size`, if it reports any.
    pub fn max_fps(&self, format: PixelFormat, size: Resolution) -> Option<u32> {
        self.frame_intervals(format, size)
            .into_iter()
            .filter(|d| !d.is_zero())
            .map(|d| (1.0 / d.as_secs_f64()).round() as u32)
            .max()
    }

    /// Picks the sensor format for delivering `consumer` frames at `size`.
    ///
    /// A device that produces the consumer format directly is used as is.
    /// Otherwise MJPEG is used when allowed, enumerated, and accepted by
    /// `VIDIOC_TRY_FMT` at exactly that size; YUYV is the fallback.
    pub fn sensor_format(&self, consumer: PixelFormat, size: Resolution, allow_mjpeg: bool) -> PixelFormat {
        if consumer != PixelFormat::Mjpeg && self.supports(consumer) {
            return consumer;
        }
        if allow_mjpeg && self.supports(PixelFormat::Mjpeg) {
            let candidate = FormatDescriptor::new(size.width, size.height, PixelFormat::Mjpeg);
            match self.try_format(&candidate) {
                Ok(reply) if reply.pixel_format == PixelFormat::Mjpeg && reply.resolution() == size => {
                    return PixelFormat::Mjpeg;
                }
                Ok(reply) => {
                    tracing::debug!(requested = %candidate, reply = %reply, "MJPEG probe adjusted, using YUYV");
                }
                Err(e) => tracing::debug!(error = %e, "MJPEG probe failed, using YUYV"),
            }
        }
        PixelFormat::Yuyv
    }

    /// Drops the device. Idempotent.
    pub fn close(&self) {
        let previous = self.device.write().unwrap_or_else(|p| p.into_inner()).take();
        self.set_streaming(false);
        if previous.is_some() {
            tracing::info!(device = %self.name, "Camera session closed");
        }
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("name", &self.name)
            .field("open", &self.is_open())
            .field("memory", &self.memory)
            .field("format", &self.format())
            .finish()
    }
}
