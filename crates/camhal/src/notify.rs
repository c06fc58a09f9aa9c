//! Host-facing callbacks.

use crate::controls::FocusMove;
use crate::error::CameraError;
use crate::frame::FrameLease;
use std::sync::{Arc, RwLock};

/// Receives delivered frames. Dropping the lease returns the slot.
pub trait FrameSubscriber: Send + Sync {
    fn on_frame(&self, frame: FrameLease);
}

impl<F> FrameSubscriber for F
where
    F: Fn(FrameLease) + Send + Sync,
{
    fn on_frame(&self, frame: FrameLease) {
        self(frame)
    }
}

/// Asynchronous camera events. Every method defaults to a no-op.
pub trait CameraListener: Send + Sync {
    /// The session hit an unrecoverable error and was closed.
    fn on_error(&self, _error: &CameraError) {}

    fn on_shutter(&self) {}

    /// A still capture finished; the frame, if any, went to the subscriber.
    fn on_capture_end(&self, _success: bool) {}

    fn on_focus(&self, _reached: bool) {}

    fn on_focus_move(&self, _movement: FocusMove) {}

    fn on_zoom(&self, _level: u32) {}
}

/// Listener that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullListener;

impl CameraListener for NullListener {}

/// Frame sink that drops every lease straight away.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardFrames;

impl FrameSubscriber for DiscardFrames {
    fn on_frame(&self, frame: FrameLease) {
        drop(frame);
    }
}

/// Subscriber and listener installed by `set_callbacks`.
#[derive(Clone)]
pub struct Callbacks {
    pub frames: Arc<dyn FrameSubscriber>,
    pub listener: Arc<dyn CameraListener>,
}

impl Callbacks {
    pub fn new(frames: Arc<dyn FrameSubscriber>, listener: Arc<dyn CameraListener>) -> Self {
        Self { frames, listener }
    }
}

impl Default for Callbacks {
    fn default() -> Self {
        Self {
            frames: Arc::new(DiscardFrames),
            listener: Arc::new(NullListener),
        }
    }
}

/// Callbacks that can be swapped while producer threads are running.
#[derive(Default)]
pub struct SharedCallbacks(RwLock<Callbacks>);

impl SharedCallbacks {
    pub fn get(&self) -> Callbacks {
        self.0.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn set(&self, callbacks: Callbacks) {
        *self.0.write().unwrap_or_else(|p| p.into_inner()) = callbacks;
    }

    pub fn listener(&self) -> Arc<dyn CameraListener> {
        self.0.read().unwrap_or_else(|p| p.into_inner()).listener.clone()
    }

    pub fn frames(&self) -> Arc<dyn FrameSubscriber> {
        self.0.read().unwrap_or_else(|p| p.into_inner()).frames.clone()
    }
}
