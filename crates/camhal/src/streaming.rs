//! Configure / start / stop / close state machine over one session and pool.
//!
//! ```text
//! Closed --configure--> Configured --start--> Streaming
//!   ^                      ^  |                  |
//!   |                      |  +---configure------+ (refused)
//!   +------close-----------+  <------stop--------+ (via Stopping)
//! ```
//!
//! Pool accounting follows every transition even when the device call
//! fails, so a retried `start` or `stop` converges.

use crate::error::{CameraError, Result};
use crate::format::FormatDescriptor;
use crate::pool::{BufferPool, ExternalBuffer};
use crate::session::DeviceSession;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Configured,
    Streaming,
    Stopping,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Closed => "closed",
            SessionState::Configured => "configured",
            SessionState::Streaming => "streaming",
            SessionState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// What `configure` was last asked for, kept so a forced reset or a still
/// capture can restore it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub format: FormatDescriptor,
    pub buffer_count: u32,
    pub buffers: Vec<ExternalBuffer>,
}

struct ControllerState {
    state: SessionState,
    config: Option<StreamConfig>,
    /// Device reply to the last `configure`.
    applied: Option<FormatDescriptor>,
}

pub struct StreamingController {
    session: Arc<DeviceSession>,
    pool: Arc<BufferPool>,
    inner: Mutex<ControllerState>,
}

impl StreamingController {
    pub fn new(session: Arc<DeviceSession>) -> Result<Self> {
        let pool = Arc::new(BufferPool::new(session.device()?));
        Ok(Self {
            session,
            pool,
            inner: Mutex::new(ControllerState {
                state: SessionState::Closed,
                config: None,
                applied: None,
            }),
        })
    }

    fn inner(&self) -> MutexGuard<'_, ControllerState> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn session(&self) -> &Arc<DeviceSession> {
        &self.session
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn state(&self) -> SessionState {
        self.inner().state
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == SessionState::Streaming
    }

    /// Negotiated format of the current configuration.
    pub fn format(&self) -> Option<FormatDescriptor> {
        self.inner().applied
    }

    pub fn config(&self) -> Option<StreamConfig> {
        self.inner().config.clone()
    }

    /// Negotiates `format`, allocates `buffer_count` slots and maps them,
    /// pairing slot `i` with `buffers[i]`. Any previous configuration is
    /// released first and put back if the new one is refused.
    pub fn configure(
        &self,
        format: &FormatDescriptor,
        buffer_count: u32,
        buffers: &[ExternalBuffer],
    ) -> Result<FormatDescriptor> {
        let mut inner = self.inner();
        match inner.state {
            SessionState::Closed | SessionState::Configured => {}
            state => {
                return Err(CameraError::invalid_state(format!("cannot configure while {state}")));
            }
        }
        if self.pool.is_closed() {
            return Err(CameraError::SessionClosed);
        }

        // The driver refuses S_FMT while buffers exist.
        let previous = if inner.state == SessionState::Configured {
            self.pool.release()?;
            inner.state = SessionState::Closed;
            inner.applied = None;
            inner.config.clone()
        } else {
            None
        };

        let applied = match self.apply(format, buffer_count, buffers) {
            Ok(applied) => applied,
            Err(e) => {
                if let Some(previous) = previous.filter(|_| !e.is_fatal()) {
                    match self.apply(&previous.format, previous.buffer_count, &previous.buffers) {
                        Ok(restored) => {
                            inner.state = SessionState::Configured;
                            inner.applied = Some(restored);
                            tracing::warn!(error = %e, format = %restored, "Configuration refused, previous restored");
                        }
                        Err(lost) => {
                            tracing::error!(error = %e, restore = %lost, "Configuration refused, previous lost");
                        }
                    }
                }
                return Err(e);
            }
        };

        inner.state = SessionState::Configured;
        inner.applied = Some(applied);
        inner.config = Some(StreamConfig {
            format: *format,
            buffer_count,
            buffers: buffers.to_vec(),
        });
        tracing::info!(
            format = %applied,
            buffers = self.pool.len(),
            memory = ?self.pool.memory_kind(),
            "Stream configured"
        );
        Ok(applied)
    }

    /// S_FMT, REQBUFS and mapping for one configuration. Leaves no buffers
    /// behind on failure.
    fn apply(&self, format: &FormatDescriptor, buffer_count: u32, buffers: &[ExternalBuffer]) -> Result<FormatDescriptor> {
        let applied = self.session.negotiate_format(format)?;
        self.pool.allocate(buffer_count, self.session.memory_kind())?;
        if let Err(e) = self.pool.map_all(buffers) {
            if let Err(release) = self.pool.release() {
                tracing::warn!(error = %release, "Buffer release after map failure failed");
            }
            return Err(e);
        }
        Ok(applied)
    }

    /// Queues every slot without an outstanding lease and turns the stream on.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner();
        match inner.state {
            SessionState::Streaming => return Ok(()),
            SessionState::Configured => {}
            state => return Err(CameraError::invalid_state(format!("cannot start while {state}"))),
        }
        let device = self.session.device()?;

        self.pool.remap()?;
        let queued = self.pool.queue_idle()?;
        if let Err(e) = device.stream_on() {
            // Stream-off flushes the driver queue so the next start can requeue.
            if let Err(off) = device.stream_off() {
                tracing::debug!(error = %off, "Stream off after failed stream on");
            }
            self.pool.unmap_all();
            return Err(CameraError::from_io("VIDIOC_STREAMON", e));
        }

        inner.state = SessionState::Streaming;
        self.session.set_streaming(true);
        tracing::info!(queued, generation = self.pool.generation(), "Stream on");
        Ok(())
    }

    /// Turns the stream off and unmaps every slot. Lent slots stay lent.
    pub fn stop(&self) -> Result<()> {
        let mut inner = self.inner();
        if inner.state != SessionState::Streaming {
            return Ok(());
        }
        inner.state = SessionState::Stopping;

        let result = self
            .session
            .device()
            .and_then(|d| d.stream_off().map_err(|e| CameraError::from_io("VIDIOC_STREAMOFF", e)));
        let counts = self.pool.counts();
        self.pool.unmap_all();
        self.session.set_streaming(false);
        inner.state = SessionState::Configured;

        tracing::info!(
            dequeued = counts.dequeued,
            requeued = counts.requeued,
            lent = counts.lent,
            "Stream off"
        );
        result
    }

    /// Stops and frees the buffer table. The session itself stays open.
    pub fn close(&self) -> Result<()> {
        let stopped = self.stop();
        let mut inner = self.inner();
        let released = if self.pool.is_closed() {
            Ok(())
        } else {
            self.pool.release()
        };
        inner.state = SessionState::Closed;
        inner.applied = None;
        stopped.and(released)
    }

    /// Stream off and on again with the same configuration.
    pub fn force_reset(&self) -> Result<()> {
        tracing::warn!("Forcing stream reset");
        if let Err(e) = self.stop() {
            if e.is_fatal() {
                return Err(e);
            }
            tracing::warn!(error = %e, "Stream off failed during reset");
        }
        self.start()
    }

    /// Tears everything down after an unrecoverable device error. Buffer
    /// traffic fails with `SessionClosed` from here on.
    pub fn fail_fatal(&self, error: &CameraError) {
        tracing::error!(error = %error, device = self.session.name(), "Fatal device error, closing session");
        let mut inner = self.inner();
        self.pool.close();
        self.session.close();
        inner.state = SessionState::Closed;
        inner.applied = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::VirtualDevice;
    use crate::format::PixelFormat;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_millis(500);

    fn controller() -> (Arc<VirtualDevice>, StreamingController) {
        let device = VirtualDevice::builder().fps(200).build();
        let session = Arc::new(DeviceSession::from_device(device.clone()).unwrap());
        (device, StreamingController::new(session).unwrap())
    }

    fn vga() -> FormatDescriptor {
        FormatDescriptor::new(640, 480, PixelFormat::Nv21)
    }

    #[test]
    fn test_lifecycle() {
        let (device, ctl) = controller();
        assert_eq!(ctl.state(), SessionState::Closed);
        assert!(matches!(ctl.start(), Err(CameraError::InvalidState(_))));

        ctl.configure(&vga(), 4, &[]).unwrap();
        assert_eq!(ctl.state(), SessionState::Configured);
        ctl.start().unwrap();
        ctl.start().unwrap();
        assert_eq!(device.stats().stream_on, 1);
        assert_eq!(ctl.pool().counts().queued, 4);

        ctl.stop().unwrap();
        assert_eq!(ctl.state(), SessionState::Configured);
        assert!(!device.is_streaming());
        let c = ctl.pool().counts();
        assert_eq!((c.queued, c.held, c.dequeued), (0, 4, 0));

        ctl.close().unwrap();
        assert_eq!(ctl.state(), SessionState::Closed);
        assert_eq!(device.buffer_count(), 0);
    }

    #[test]
    fn test_configure_refused_while_streaming() {
        let (_device, ctl) = controller();
        ctl.configure(&vga(), 2, &[]).unwrap();
        ctl.start().unwrap();
        let err = ctl.configure(&vga(), 2, &[]).unwrap_err();
        assert!(matches!(err, CameraError::InvalidState(_)));
        assert_eq!(ctl.state(), SessionState::Streaming);
    }

    #[test]
    fn test_stop_start_reproduces_queued_set() {
        let (_device, ctl) = controller();
        ctl.configure(&vga(), 5, &[]).unwrap();
        ctl.start().unwrap();
        let before = ctl.pool().counts();
        for _ in 0..3 {
            let slot = ctl.pool().dequeue(WAIT).unwrap().unwrap();
            ctl.pool().requeue(slot.index).unwrap();
        }
        ctl.stop().unwrap();
        ctl.start().unwrap();
        let after = ctl.pool().counts();
        assert_eq!((before.queued, before.held), (after.queued, after.held));
    }

    #[test]
    fn test_failed_stream_on_leaves_configured() {
        let (device, ctl) = controller();
        ctl.configure(&vga(), 3, &[]).unwrap();
        device.fail_next_stream_on();
        assert!(ctl.start().is_err());
        assert_eq!(ctl.state(), SessionState::Configured);
        let c = ctl.pool().counts();
        assert_eq!(c.queued + c.held, 3);
        assert_eq!(device.queued_count(), 0);

        ctl.start().unwrap();
        assert_eq!(ctl.pool().counts().queued, 3);
    }

    #[test]
    fn test_reconfigure_replaces_buffers() {
        let (device, ctl) = controller();
        ctl.configure(&vga(), 6, &[]).unwrap();
        let generation = ctl.pool().generation();
        let applied = ctl
            .configure(&FormatDescriptor::new(1920, 1080, PixelFormat::Nv21), 1, &[])
            .unwrap();
        assert_eq!(applied.width, 1920);
        assert_eq!(ctl.pool().len(), 1);
        assert!(ctl.pool().generation() > generation);
        assert_eq!(device.stats().request_buffers, vec![6, 0, 1]);
    }

    #[test]
    fn test_refused_reconfigure_keeps_previous() {
        let (device, ctl) = controller();
        ctl.configure(&vga(), 4, &[]).unwrap();
        device.reject_next_format();
        let err = ctl
            .configure(&FormatDescriptor::new(1280, 720, PixelFormat::Nv21), 2, &[])
            .unwrap_err();
        assert!(matches!(err, CameraError::FormatRejected { .. }));
        assert_eq!(ctl.state(), SessionState::Configured);
        assert_eq!(ctl.pool().len(), 4);
        assert_eq!(ctl.format().unwrap().width, 640);
        assert_eq!(ctl.config().unwrap().buffer_count, 4);

        ctl.start().unwrap();
        assert_eq!(ctl.pool().counts().queued, 4);
    }

    #[test]
    fn test_fatal_error_closes_everything() {
        let (_device, ctl) = controller();
        ctl.configure(&vga(), 2, &[]).unwrap();
        ctl.start().unwrap();
        ctl.fail_fatal(&CameraError::SessionClosed);
        assert_eq!(ctl.state(), SessionState::Closed);
        assert!(!ctl.session().is_open());
        assert!(matches!(ctl.pool().dequeue(WAIT), Err(CameraError::SessionClosed)));
        assert!(matches!(ctl.configure(&vga(), 2, &[]), Err(CameraError::SessionClosed)));
    }
}
