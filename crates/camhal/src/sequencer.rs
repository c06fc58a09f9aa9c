//! One-shot still capture on the preview device.
//!
//! The sequencer pauses preview, reconfigures the stream for a single
//! full-resolution buffer, takes one frame, and puts the preview
//! configuration back before the snapshot is delivered. Teardown and restore
//! run on every path once the preview has been paused.

use crate::controls::CapabilitySet;
use crate::convert::FrameConverter;
use crate::error::{CameraError, Result};
use crate::exif::{self, ExifInput, GpsFix};
use crate::format::{FormatDescriptor, PixelFormat, Resolution};
use crate::frame::{FrameDescriptor, FrameLease, FrameRoles};
use crate::notify::SharedCallbacks;
use crate::pacing::StopSignal;
use crate::pool::DequeuedSlot;
use crate::streaming::{StreamConfig, StreamingController};
use chrono::Local;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Short YUYV frames tolerated before one is used anyway.
const SHORT_FRAME_RETRIES: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// Hooks into whoever owns the preview thread.
pub trait PreviewHost: Send + Sync {
    /// Stops the producer and waits for it. Returns whether it was running.
    fn pause_preview(&self) -> bool;

    /// Starts streaming and a fresh producer on the current configuration.
    fn resume_preview(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    pub size: Resolution,
    /// Picture rotation in degrees.
    pub rotation: u32,
    pub allow_mjpeg: bool,
    pub make: String,
    pub model: String,
    pub focal_length: Option<f64>,
    pub gps: Option<GpsFix>,
    pub gps_method: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct CaptureSettings {
    pub dequeue_timeout: Duration,
    pub dequeue_attempts: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            dequeue_timeout: Duration::from_millis(500),
            dequeue_attempts: 10,
        }
    }
}

/// Handle to a running capture thread.
pub struct CaptureSequencer {
    cancel: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureSequencer {
    pub fn spawn(
        controller: Arc<StreamingController>,
        callbacks: Arc<SharedCallbacks>,
        host: Arc<dyn PreviewHost>,
        request: CaptureRequest,
        settings: CaptureSettings,
    ) -> Result<Self> {
        let cancel = Arc::new(StopSignal::new());
        let signal = cancel.clone();
        let handle = thread::Builder::new()
            .name("camhal-capture".to_string())
            .spawn(move || {
                Sequence {
                    controller,
                    callbacks,
                    host,
                    request,
                    settings,
                    cancel: signal,
                }
                .run();
            })
            .map_err(|source| CameraError::Device {
                op: "spawn capture thread",
                source,
            })?;
        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }

    /// Asks the sequence to stop at the next step. Preview is still restored.
    pub fn cancel(&self) {
        self.cancel.stop();
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Waits for the sequence, including preview restore.
    pub fn join(mut self) {
        self.wait();
    }

    fn wait(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Capture thread panicked");
            }
        }
    }
}

impl Drop for CaptureSequencer {
    fn drop(&mut self) {
        self.wait();
    }
}

struct Sequence {
    controller: Arc<StreamingController>,
    callbacks: Arc<SharedCallbacks>,
    host: Arc<dyn PreviewHost>,
    request: CaptureRequest,
    settings: CaptureSettings,
    cancel: Arc<StopSignal>,
}

impl Sequence {
    fn run(self) {
        let span = tracing::info_span!(
            "still_capture",
            size = %self.request.size,
            rotation = self.request.rotation
        );
        let _enter = span.enter();
        let started = Instant::now();

        let regulator = self.controller.session().regulator().clone();
        regulator.fire_flash(true);
        let was_previewing = self.host.pause_preview();
        let previous = self.controller.config();

        let listener = self.callbacks.listener();
        let outcome = self.capture();
        if let Err(e) = &outcome {
            self.report(e);
        }

        self.teardown();
        regulator.fire_flash(false);
        if regulator.capabilities().contains(CapabilitySet::ROTATE) {
            if let Err(e) = regulator.set_rotation(0) {
                tracing::warn!(error = %e, "Rotation reset failed");
            }
        }
        if let Err(e) = self.restore(previous, was_previewing) {
            self.report(&e);
        }

        let success = match outcome {
            Ok(Some(frame)) => {
                tracing::info!(
                    width = frame.width,
                    height = frame.height,
                    format = %frame.pixel_format,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Still captured"
                );
                self.callbacks.frames().on_frame(FrameLease::detached(frame));
                true
            }
            Ok(None) => {
                tracing::info!("Still capture cancelled");
                false
            }
            Err(_) => false,
        };
        listener.on_capture_end(success);
    }

    fn report(&self, error: &CameraError) {
        if error.is_fatal() {
            self.controller.fail_fatal(error);
            self.callbacks.listener().on_error(error);
        } else {
            tracing::error!(error = %error, "Still capture failed");
        }
    }

    /// Returns `None` when cancelled.
    fn capture(&self) -> Result<Option<FrameDescriptor>> {
        self.controller.stop()?;
        if self.cancel.is_stopped() {
            return Ok(None);
        }

        let session = self.controller.session();
        let regulator = session.regulator();
        let rotate = regulator.capabilities().contains(CapabilitySet::ROTATE);
        let size = if rotate && matches!(self.request.rotation % 360, 90 | 270) {
            self.request.size.swapped()
        } else {
            self.request.size
        };
        let sensor = session.sensor_format(PixelFormat::Rgb24, size, self.request.allow_mjpeg);
        let layout = self
            .controller
            .configure(&FormatDescriptor::new(size.width, size.height, sensor), 1, &[])?;
        if rotate {
            regulator.set_rotation(self.request.rotation)?;
        }
        self.controller.start()?;

        let Some(slot) = self.dequeue_still(&layout)? else {
            return Ok(None);
        };
        self.callbacks.listener().on_shutter();

        let target = if FrameConverter::supports(layout.pixel_format, PixelFormat::Rgb24) {
            PixelFormat::Rgb24
        } else {
            layout.pixel_format
        };
        let converted = FrameConverter::new().and_then(|mut converter| {
            let bytes = slot.memory.bytes();
            converter.convert(&bytes, slot.bytes_used as usize, &layout, target)
        });
        if let Err(e) = self.controller.pool().requeue(slot.index) {
            if e.is_fatal() {
                return Err(e);
            }
            tracing::debug!(error = %e, "Still slot requeue skipped");
        }
        let data = converted?;

        let exif = exif::build(&ExifInput {
            make: self.request.make.clone(),
            model: self.request.model.clone(),
            rotation: self.request.rotation,
            rotated_by_device: rotate,
            width: self.request.size.width,
            height: self.request.size.height,
            focal_length: self.request.focal_length,
            gps: self.request.gps,
            gps_method: self.request.gps_method.clone(),
            taken_at: Local::now(),
        });

        Ok(Some(FrameDescriptor {
            index: slot.index,
            key: slot.key,
            canvas: slot.canvas,
            timestamp: slot.timestamp,
            sequence: slot.sequence,
            bytes_used: slot.bytes_used,
            pixel_format: target,
            width: layout.width,
            height: layout.height,
            roles: FrameRoles::SNAPSHOT,
            exif: Some(exif),
            data,
        }))
    }

    fn dequeue_still(&self, layout: &FormatDescriptor) -> Result<Option<DequeuedSlot>> {
        let pool = self.controller.pool();
        let mut short = 0;
        for attempt in 1..=self.settings.dequeue_attempts {
            if self.cancel.is_stopped() {
                return Ok(None);
            }
            let Some(slot) = pool.dequeue(self.settings.dequeue_timeout)? else {
                tracing::debug!(attempt, "Still frame not ready");
                if self.cancel.wait(RETRY_BACKOFF) {
                    return Ok(None);
                }
                continue;
            };
            if layout.pixel_format == PixelFormat::Yuyv && slot.is_short() && short < SHORT_FRAME_RETRIES {
                short += 1;
                tracing::debug!(
                    bytes_used = slot.bytes_used,
                    length = slot.length,
                    short,
                    "Short still frame, retrying"
                );
                pool.requeue(slot.index)?;
                continue;
            }
            return Ok(Some(slot));
        }
        Err(CameraError::WouldBlock)
    }

    /// Stops the still stream. The device may already be gone.
    fn teardown(&self) {
        if let Err(e) = self.controller.stop() {
            tracing::warn!(error = %e, "Still stream stop failed");
        }
    }

    /// Nothing to restore once the session has been torn down.
    fn restore(&self, previous: Option<StreamConfig>, resume: bool) -> Result<()> {
        if self.controller.pool().is_closed() {
            return Ok(());
        }
        let Some(previous) = previous else {
            return self.controller.close();
        };
        self.controller
            .configure(&previous.format, previous.buffer_count, &previous.buffers)?;
        if resume {
            self.host.resume_preview()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Fault, VirtualDevice};
    use crate::notify::{CameraListener, Callbacks};
    use crate::session::DeviceSession;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::mpsc::{self, Receiver};

    #[derive(Default)]
    struct Events(Mutex<Vec<&'static str>>);

    impl CameraListener for Events {
        fn on_shutter(&self) {
            self.0.lock().unwrap().push("shutter");
        }

        fn on_capture_end(&self, success: bool) {
            self.0.lock().unwrap().push(if success { "end" } else { "failed" });
        }
    }

    /// Restarts the stream without a producer thread.
    struct StreamHost {
        controller: Arc<StreamingController>,
        pauses: AtomicU32,
    }

    impl PreviewHost for StreamHost {
        fn pause_preview(&self) -> bool {
            self.pauses.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn resume_preview(&self) -> Result<()> {
            self.controller.start()
        }
    }

    struct Fixture {
        device: Arc<VirtualDevice>,
        controller: Arc<StreamingController>,
        callbacks: Arc<SharedCallbacks>,
        events: Arc<Events>,
        frames: Receiver<FrameLease>,
    }

    fn fixture(device: Arc<VirtualDevice>) -> Fixture {
        let session = Arc::new(DeviceSession::from_device(device.clone()).unwrap());
        let controller = Arc::new(StreamingController::new(session).unwrap());
        controller
            .configure(&FormatDescriptor::new(640, 480, PixelFormat::Nv21), 6, &[])
            .unwrap();
        controller.start().unwrap();

        let (tx, frames) = mpsc::channel();
        let tx = Mutex::new(tx);
        let events = Arc::new(Events::default());
        let callbacks = Arc::new(SharedCallbacks::default());
        callbacks.set(Callbacks::new(
            Arc::new(move |lease: FrameLease| {
                let _ = tx.lock().unwrap().send(lease);
            }),
            events.clone(),
        ));
        Fixture {
            device,
            controller,
            callbacks,
            events,
            frames,
        }
    }

    fn request(size: Resolution, rotation: u32) -> CaptureRequest {
        CaptureRequest {
            size,
            rotation,
            allow_mjpeg: true,
            make: "camhal".into(),
            model: "virtual".into(),
            focal_length: Some(4.31),
            gps: None,
            gps_method: None,
        }
    }

    fn run(f: &Fixture, request: CaptureRequest) {
        let host = Arc::new(StreamHost {
            controller: f.controller.clone(),
            pauses: AtomicU32::new(0),
        });
        CaptureSequencer::spawn(
            f.controller.clone(),
            f.callbacks.clone(),
            host,
            request,
            CaptureSettings::default(),
        )
        .unwrap()
        .join();
    }

    #[test]
    fn test_still_then_preview_restored() {
        let f = fixture(VirtualDevice::builder().fps(100).build());
        run(&f, request(Resolution::new(1920, 1080), 0));

        let lease = f.frames.try_recv().unwrap();
        assert_eq!(lease.roles, FrameRoles::SNAPSHOT);
        assert_eq!((lease.width, lease.height), (1920, 1080));
        assert_eq!(lease.pixel_format, PixelFormat::Rgb24);
        assert_eq!(lease.data.len(), 1920 * 1080 * 3);
        let exif = lease.exif.as_ref().unwrap();
        assert_eq!(exif.get("ImageWidth"), Some("1920"));
        assert_eq!(exif.get("FocalLength"), Some("4310/1000"));

        assert_eq!(*f.events.0.lock().unwrap(), vec!["shutter", "end"]);
        let format = f.controller.format().unwrap();
        assert_eq!((format.width, format.height), (640, 480));
        assert_eq!(f.controller.pool().len(), 6);
        assert!(f.controller.is_streaming());
        assert_eq!(f.device.stats().request_buffers, vec![6, 0, 1, 0, 6]);
    }

    #[test]
    fn test_yuyv_still_without_mjpeg() {
        let f = fixture(VirtualDevice::builder().fps(100).build());
        let mut req = request(Resolution::new(1280, 720), 0);
        req.allow_mjpeg = false;
        run(&f, req);
        let lease = f.frames.try_recv().unwrap();
        assert_eq!(lease.pixel_format, PixelFormat::Rgb24);
        assert_eq!(lease.data.len(), 1280 * 720 * 3);
    }

    #[test]
    fn test_rotation_swaps_size_when_sensor_rotates() {
        let device = VirtualDevice::builder()
            .fps(100)
            .sizes(&[Resolution::new(640, 480), Resolution::new(480, 640)])
            .with_sensor_controls()
            .build();
        let f = fixture(device);
        run(&f, request(Resolution::new(640, 480), 90));
        let lease = f.frames.try_recv().unwrap();
        assert_eq!((lease.width, lease.height), (480, 640));
        let exif = lease.exif.as_ref().unwrap();
        assert_eq!(exif.get("Orientation"), Some("1"));
        assert_eq!(exif.get("ImageWidth"), Some("480"));
        // Rotation written for the still and reset afterwards.
        assert_eq!(f.device.stats().writes(crate::controls::cid::ROTATE), 2);
    }

    #[test]
    fn test_short_yuyv_frames_retried() {
        let device = VirtualDevice::builder()
            .fps(100)
            .formats(&[PixelFormat::Nv21, PixelFormat::Yuyv])
            .build();
        let f = fixture(device);
        f.device.inject(Fault::ShortFrames(2));
        let mut req = request(Resolution::new(640, 480), 0);
        req.allow_mjpeg = false;
        run(&f, req);
        let lease = f.frames.try_recv().unwrap();
        assert!(lease.sequence >= 2);
    }

    #[test]
    fn test_cancel_still_restores_preview() {
        let f = fixture(VirtualDevice::builder().fps(100).build());
        f.device.inject(Fault::Stall);
        let host = Arc::new(StreamHost {
            controller: f.controller.clone(),
            pauses: AtomicU32::new(0),
        });
        let sequencer = CaptureSequencer::spawn(
            f.controller.clone(),
            f.callbacks.clone(),
            host.clone(),
            request(Resolution::new(1920, 1080), 0),
            CaptureSettings {
                dequeue_timeout: Duration::from_millis(20),
                dequeue_attempts: 1000,
            },
        )
        .unwrap();
        thread::sleep(Duration::from_millis(50));
        sequencer.cancel();
        sequencer.join();

        assert!(f.frames.try_recv().is_err());
        assert_eq!(*f.events.0.lock().unwrap(), vec!["failed"]);
        assert_eq!(host.pauses.load(Ordering::SeqCst), 1);
        assert_eq!(f.controller.format().unwrap().width, 640);
        assert!(f.controller.is_streaming());
    }

    #[test]
    fn test_lost_device_during_still_closes_session() {
        let f = fixture(VirtualDevice::builder().fps(100).build());
        f.device.inject(Fault::DeviceLost);
        run(&f, request(Resolution::new(1920, 1080), 0));
        assert!(f.frames.try_recv().is_err());
        assert!(!f.controller.session().is_open());
        assert_eq!(*f.events.0.lock().unwrap(), vec!["failed"]);
    }
}
