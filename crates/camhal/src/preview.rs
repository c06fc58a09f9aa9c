//! Preview producer thread.
//!
//! Each iteration waits out the poll interval, dequeues, drops short raw
//! frames, lets the pacer decide between delivering, caching and replaying,
//! converts the chosen frame into the consumer format and hands it to the
//! subscriber as a [`FrameLease`]. Every dequeued slot leaves an iteration
//! either lent, cached, or requeued.

use crate::convert::FrameConverter;
use crate::error::{CameraError, Result};
use crate::format::{FormatDescriptor, PixelFormat};
use crate::frame::{FrameDescriptor, FrameLease, FrameRoles};
use crate::metrics::PipelineMetrics;
use crate::notify::SharedCallbacks;
use crate::pacing::{FpsMeter, FramePacer, PacingDecision, PacingPolicy, PreviewStats, StopSignal};
use crate::pool::DequeuedSlot;
use crate::recovery::{ErrorRecovery, RecoveryAction, RecoveryPolicy};
use crate::streaming::StreamingController;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct PreviewSettings {
    /// Layout the subscriber receives.
    pub consumer_format: PixelFormat,
    pub fps: u32,
    /// Rate cap for sizes listed in the limited-rate table.
    pub limited_fps: Option<u32>,
    pub pacing: PacingPolicy,
    pub recovery: RecoveryPolicy,
    /// Longest single wait inside `dequeue`.
    pub dequeue_timeout: Duration,
    /// How long `stop` waits for the thread before giving up on it.
    pub join_timeout: Duration,
}

impl Default for PreviewSettings {
    fn default() -> Self {
        Self {
            consumer_format: PixelFormat::Nv21,
            fps: 15,
            limited_fps: None,
            pacing: PacingPolicy::default(),
            recovery: RecoveryPolicy::default(),
            dequeue_timeout: Duration::from_millis(100),
            join_timeout: Duration::from_secs(2),
        }
    }
}

/// State the producer publishes and the control thread adjusts.
#[derive(Default)]
pub struct PreviewShared {
    recording: AtomicBool,
    stats: Mutex<PreviewStats>,
}

impl PreviewShared {
    pub fn set_recording(&self, on: bool) {
        self.recording.store(on, Ordering::Release);
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PreviewStats {
        *self.stats.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn publish(&self, stats: PreviewStats) {
        *self.stats.lock().unwrap_or_else(|p| p.into_inner()) = stats;
    }
}

/// Handle to a running producer thread.
pub struct PreviewProducer {
    stop: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
    exited: mpsc::Receiver<()>,
    join_timeout: Duration,
}

impl PreviewProducer {
    /// Spawns the producer. The stream must already be on.
    pub fn spawn(
        controller: Arc<StreamingController>,
        callbacks: Arc<SharedCallbacks>,
        shared: Arc<PreviewShared>,
        metrics: PipelineMetrics,
        settings: PreviewSettings,
    ) -> Result<Self> {
        let stop = Arc::new(StopSignal::new());
        let (exit_tx, exited) = mpsc::channel::<()>();

        let signal = stop.clone();
        let handle = thread::Builder::new()
            .name("camhal-preview".to_string())
            .spawn(move || {
                let _exit = exit_tx;
                // The decompressor is created on the thread that uses it.
                let converter = match FrameConverter::new() {
                    Ok(converter) => converter,
                    Err(e) => {
                        tracing::error!(error = %e, "Preview converter unavailable");
                        callbacks.listener().on_error(&e);
                        return;
                    }
                };
                PreviewLoop {
                    converter,
                    pacer: FramePacer::new(settings.fps, settings.limited_fps, settings.pacing),
                    recovery: ErrorRecovery::new(settings.recovery),
                    meter: FpsMeter::new(),
                    cached: None,
                    controller,
                    callbacks,
                    shared,
                    metrics,
                    settings,
                    stop: signal,
                    delivered: 0,
                    dropped: 0,
                }
                .run();
            })
            .map_err(|source| CameraError::Device {
                op: "spawn preview thread",
                source,
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
            exited,
            join_timeout: settings.join_timeout,
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signals the thread and waits for it, at most the join timeout.
    /// Returns `false` when the thread had to be abandoned.
    pub fn stop(mut self) -> bool {
        self.shutdown()
    }

    fn shutdown(&mut self) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };
        self.stop.stop();
        match self.exited.recv_timeout(self.join_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    tracing::error!("Preview thread panicked");
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::error!(
                    timeout_ms = self.join_timeout.as_millis() as u64,
                    "Preview thread did not stop in time, detaching"
                );
                false
            }
        }
    }
}

impl Drop for PreviewProducer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct PreviewLoop {
    controller: Arc<StreamingController>,
    callbacks: Arc<SharedCallbacks>,
    shared: Arc<PreviewShared>,
    metrics: PipelineMetrics,
    settings: PreviewSettings,
    stop: Arc<StopSignal>,
    converter: FrameConverter,
    pacer: FramePacer,
    recovery: ErrorRecovery,
    meter: FpsMeter,
    /// The single frame parked ahead of its delivery slot.
    cached: Option<DequeuedSlot>,
    delivered: u64,
    dropped: u64,
}

impl PreviewLoop {
    fn run(mut self) {
        tracing::info!(
            device = self.controller.session().name(),
            format = %self.settings.consumer_format,
            fps = self.settings.fps,
            limited_fps = ?self.settings.limited_fps,
            "Preview started"
        );
        self.controller.session().regulator().on_preview_start();

        while !self.stop.is_stopped() {
            let delay = self.poll_delay();
            if !delay.is_zero() && self.stop.wait(delay) {
                break;
            }
            match self.iterate() {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    self.drop_cached();
                    self.controller.fail_fatal(&e);
                    self.callbacks.listener().on_error(&e);
                    break;
                }
                Err(e) => tracing::warn!(error = %e, "Preview iteration failed"),
            }
            self.poll_focus();
        }

        self.drop_cached();
        self.controller.session().regulator().on_preview_stop();
        tracing::info!(
            delivered = self.delivered,
            dropped = self.dropped,
            resets = self.recovery.resets(),
            fps = self.meter.stats().fps,
            "Preview stopped"
        );
    }

    /// MJPEG at VGA and above runs unthrottled while healthy; everything
    /// else polls at the policy interval.
    fn poll_delay(&self) -> Duration {
        let fast = self.controller.format().is_some_and(|f| {
            f.pixel_format == PixelFormat::Mjpeg && !(f.width < 640 && f.height < 480)
        });
        if fast && !self.recovery.has_recent_failures() {
            Duration::ZERO
        } else {
            self.settings.pacing.poll_interval
        }
    }

    fn iterate(&mut self) -> Result<()> {
        let Some(layout) = self.controller.format() else {
            return Ok(());
        };
        let now = Instant::now();
        let slot = self.next_slot(&layout, now)?;
        if slot.is_some() {
            self.recovery.on_frame();
        }

        match self.pacer.observe(now, slot.is_some(), self.cached.is_some()) {
            PacingDecision::Deliver => {
                self.drop_cached();
                if let Some(slot) = slot {
                    self.deliver(slot, &layout, now)?;
                }
            }
            PacingDecision::DeliverCached => {
                if let Some(cached) = self.cached.take() {
                    self.deliver(cached, &layout, now)?;
                }
            }
            PacingDecision::Cache => {
                if let Some(slot) = slot {
                    if let Some(previous) = self.cached.replace(slot) {
                        self.discard(previous.index)?;
                    }
                }
            }
            PacingDecision::Skip => {
                if let Some(slot) = slot {
                    self.discard(slot.index)?;
                }
            }
        }
        Ok(())
    }

    /// Dequeues one slot. Would-block, an empty queue and short raw frames
    /// all count as no frame.
    fn next_slot(&mut self, layout: &FormatDescriptor, now: Instant) -> Result<Option<DequeuedSlot>> {
        let pool = self.controller.pool().clone();
        let slot = match pool.dequeue(self.settings.dequeue_timeout) {
            Ok(Some(slot)) => slot,
            Ok(None) | Err(CameraError::InvalidState(_)) => {
                self.metrics.would_block.add(1, &self.metrics.attrs());
                if self.recovery.on_would_block(now) == RecoveryAction::ForceReset {
                    self.reset()?;
                }
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if !layout.pixel_format.is_compressed() && slot.is_short() {
            tracing::debug!(
                index = slot.index,
                bytes_used = slot.bytes_used,
                length = slot.length,
                "Short frame dropped"
            );
            self.discard(slot.index)?;
            return Ok(None);
        }
        Ok(Some(slot))
    }

    fn deliver(&mut self, slot: DequeuedSlot, layout: &FormatDescriptor, now: Instant) -> Result<()> {
        let span = tracing::info_span!("preview_frame", sequence = slot.sequence, index = slot.index);
        let _enter = span.enter();

        let started = Instant::now();
        let converted = {
            let bytes = slot.memory.bytes();
            self.converter.convert(
                &bytes,
                slot.bytes_used as usize,
                layout,
                self.settings.consumer_format,
            )
        };
        let data = match converted {
            Ok(data) => data,
            Err(CameraError::DecodeFailed(reason)) => {
                self.metrics.decode_failures.add(1, &self.metrics.attrs());
                tracing::debug!(%reason, sequence = slot.sequence, "Frame decode failed");
                self.discard(slot.index)?;
                if self.recovery.on_decode_failure(now) == RecoveryAction::ForceReset {
                    self.reset()?;
                }
                return Ok(());
            }
            Err(e) => {
                self.discard(slot.index)?;
                return Err(e);
            }
        };
        if layout.pixel_format.is_compressed() {
            self.recovery.on_decoded();
        }
        self.metrics
            .convert_duration
            .record(started.elapsed().as_secs_f64(), &self.metrics.attrs());

        let mut roles = FrameRoles::PREVIEW;
        if self.shared.is_recording() {
            roles |= FrameRoles::VIDEO;
        }
        let frame = FrameDescriptor {
            index: slot.index,
            key: slot.key,
            canvas: slot.canvas,
            timestamp: slot.timestamp,
            sequence: slot.sequence,
            bytes_used: slot.bytes_used,
            pixel_format: self.settings.consumer_format,
            width: layout.width,
            height: layout.height,
            roles,
            exif: None,
            data,
        };

        let pool = self.controller.pool().clone();
        let Some(ticket) = pool.lend(&slot) else {
            // Reclaimed by key or by a release before delivery.
            self.dropped += 1;
            self.metrics.frames_dropped.add(1, &self.metrics.attrs());
            return match pool.requeue_dequeued(&slot) {
                Err(e) if e.is_fatal() => Err(e),
                Err(e) => {
                    tracing::debug!(index = slot.index, error = %e, "Undelivered slot not requeued");
                    Ok(())
                }
                Ok(()) => Ok(()),
            };
        };
        let lease = FrameLease::new(pool, ticket, frame);

        let stats = self.meter.tick(Instant::now());
        self.shared.publish(stats);
        self.delivered += 1;
        self.metrics.frames_delivered.add(1, &self.metrics.attrs());
        if self.delivered.is_multiple_of(30) {
            tracing::debug!(
                delivered = self.delivered,
                dropped = self.dropped,
                fps = stats.fps,
                "Preview status"
            );
        }

        self.callbacks.frames().on_frame(lease);
        Ok(())
    }

    fn discard(&mut self, index: u32) -> Result<()> {
        self.dropped += 1;
        self.metrics.frames_dropped.add(1, &self.metrics.attrs());
        match self.controller.pool().requeue(index) {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::debug!(index, error = %e, "Requeue skipped");
                Ok(())
            }
        }
    }

    fn drop_cached(&mut self) {
        if let Some(cached) = self.cached.take() {
            if let Err(e) = self.discard(cached.index) {
                tracing::debug!(error = %e, "Cached frame not requeued");
            }
        }
    }

    fn reset(&mut self) -> Result<()> {
        self.metrics.forced_resets.add(1, &self.metrics.attrs());
        self.drop_cached();
        self.pacer.reset();
        self.controller.force_reset()
    }

    fn poll_focus(&self) {
        if let Some(movement) = self.controller.session().regulator().poll_focus_move() {
            tracing::debug!(?movement, "Focus move");
            self.callbacks.listener().on_focus_move(movement);
        }
    }
}
