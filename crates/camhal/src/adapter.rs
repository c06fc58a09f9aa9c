//! Host-facing camera adapter.
//!
//! [`CaptureAdapter`] is what the camera service drives. [`KernelCapture`]
//! runs it on a V4L2 node, [`VirtualCapture`] on the software camera; both
//! share the same session, preview and capture plumbing and differ only in
//! how the device is opened.

use crate::config::{AdapterConfig, Facing};
use crate::controls::{
    CapabilitySet, ControlOutcome, ControlRegulator, FlashMode, FocusMode, banding_values, effect_values,
    white_balance_values,
};
use crate::device::VirtualDevice;
use crate::error::{CameraError, Result};
use crate::format::{FormatDescriptor, PixelFormat, Resolution};
use crate::metrics::PipelineMetrics;
use crate::notify::{Callbacks, SharedCallbacks};
use crate::pacing::{PreviewStats, StopSignal};
use crate::parameters::{self, CameraParameters, keys};
use crate::pool::{BufferKey, PoolCounts};
use crate::preview::{PreviewProducer, PreviewSettings, PreviewShared};
use crate::sequencer::{CaptureRequest, CaptureSequencer, CaptureSettings, PreviewHost};
use crate::session::DeviceSession;
use crate::streaming::{SessionState, StreamingController};
use std::cmp::Reverse;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};

/// Lowest preview rate advertised in the fps range, in frames per second.
const MIN_PREVIEW_FPS: u32 = 5;

pub trait CaptureAdapter: Send + Sync {
    fn camera_id(&self) -> u32;

    /// Opens the device. A session lost to a fatal error is replaced.
    fn open(&self) -> Result<()>;

    fn is_open(&self) -> bool;

    fn set_callbacks(&self, callbacks: Callbacks);

    /// Applies a `key=value;...` string. Everything valid is applied even
    /// when some entry is rejected; the first rejection is returned.
    fn set_parameters(&self, flat: &str) -> Result<()>;

    fn parameters(&self) -> String;

    fn start_preview(&self) -> Result<()>;

    /// Also cancels a still capture in progress.
    fn stop_preview(&self) -> Result<()>;

    fn is_previewing(&self) -> bool;

    /// Preview frames also carry the video role while recording.
    fn start_recording(&self) -> Result<()>;

    fn stop_recording(&self);

    fn is_recording(&self) -> bool;

    /// Starts a still capture in the background. Completion is reported
    /// through the listener's `on_capture_end`.
    fn take_picture(&self) -> Result<()>;

    /// Cancels a pending capture and waits for preview to be restored.
    fn cancel_picture(&self) -> Result<()>;

    fn auto_focus(&self) -> Result<()>;

    fn cancel_auto_focus(&self) -> Result<()>;

    /// Returns a delivered frame to the driver by its buffer key.
    fn release_frame(&self, key: BufferKey) -> Result<()>;

    fn preview_stats(&self) -> PreviewStats;

    /// Slot accounting of the current buffer pool; empty when closed.
    fn buffer_counts(&self) -> PoolCounts;

    fn state(&self) -> SessionState;

    /// Stops everything and closes the device.
    fn release(&self);
}

/// How an adapter obtains its device.
pub trait DeviceSource: Send + Sync + 'static {
    fn open_session(&self, config: &AdapterConfig) -> Result<DeviceSession>;
}

/// Opens `config.device_path()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelSource;

impl DeviceSource for KernelSource {
    fn open_session(&self, config: &AdapterConfig) -> Result<DeviceSession> {
        DeviceSession::open_path(config.device_path())
    }
}

pub struct VirtualSource(Arc<VirtualDevice>);

impl DeviceSource for VirtualSource {
    fn open_session(&self, _config: &AdapterConfig) -> Result<DeviceSession> {
        DeviceSession::from_device(self.0.clone())
    }
}

pub struct CameraAdapter<S: DeviceSource> {
    source: S,
    core: Arc<Core>,
}

pub type KernelCapture = CameraAdapter<KernelSource>;
pub type VirtualCapture = CameraAdapter<VirtualSource>;

impl KernelCapture {
    pub fn new(config: AdapterConfig) -> Self {
        Self {
            source: KernelSource,
            core: Arc::new(Core::new(config)),
        }
    }
}

impl VirtualCapture {
    pub fn new(config: AdapterConfig, device: Arc<VirtualDevice>) -> Self {
        Self {
            source: VirtualSource(device),
            core: Arc::new(Core::new(config)),
        }
    }

    pub fn device(&self) -> &Arc<VirtualDevice> {
        &self.source.0
    }
}

/// Builds the adapter the configuration asks for.
pub fn create(config: AdapterConfig) -> Arc<dyn CaptureAdapter> {
    if config.use_virtual {
        let device = VirtualDevice::builder()
            .name(&format!("virtual{}", config.device_id))
            .with_sensor_controls()
            .build();
        Arc::new(VirtualCapture::new(config, device))
    } else {
        Arc::new(KernelCapture::new(config))
    }
}

struct FocusTask {
    stop: Arc<StopSignal>,
    handle: JoinHandle<()>,
}

impl FocusTask {
    fn finish(self) {
        self.stop.stop();
        if self.handle.join().is_err() {
            tracing::error!("Autofocus thread panicked");
        }
    }
}

struct Core {
    config: AdapterConfig,
    callbacks: Arc<SharedCallbacks>,
    shared: Arc<PreviewShared>,
    metrics: PipelineMetrics,
    params: Mutex<CameraParameters>,
    controller: RwLock<Option<Arc<StreamingController>>>,
    preview: Mutex<Option<PreviewProducer>>,
    capture: Mutex<Option<CaptureSequencer>>,
    focus: Mutex<Option<FocusTask>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

impl Core {
    fn new(config: AdapterConfig) -> Self {
        Self {
            metrics: PipelineMetrics::new(config.device_id),
            config,
            callbacks: Arc::new(SharedCallbacks::default()),
            shared: Arc::new(PreviewShared::default()),
            params: Mutex::new(CameraParameters::new()),
            controller: RwLock::new(None),
            preview: Mutex::new(None),
            capture: Mutex::new(None),
            focus: Mutex::new(None),
        }
    }

    fn controller(&self) -> Result<Arc<StreamingController>> {
        self.controller
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or(CameraError::SessionClosed)
    }

    fn params(&self) -> CameraParameters {
        lock(&self.params).clone()
    }

    fn is_capturing(&self) -> bool {
        lock(&self.capture).as_ref().is_some_and(CaptureSequencer::is_running)
    }

    fn preview_settings(&self, params: &CameraParameters, size: Resolution) -> PreviewSettings {
        PreviewSettings {
            consumer_format: params.preview_format().unwrap_or(self.config.preview_format),
            fps: params
                .get_parsed::<u32>(keys::PREVIEW_FRAME_RATE)
                .filter(|fps| *fps > 0)
                .unwrap_or(self.config.preview_fps),
            limited_fps: self.config.limited_rates.lookup(size),
            pacing: self.config.pacing,
            recovery: self.config.recovery,
            ..PreviewSettings::default()
        }
    }

    /// Lowers the preview rate to what the device offers for this mode.
    fn cap_rate(&self, mut settings: PreviewSettings, session: &DeviceSession, sensor: &FormatDescriptor) -> PreviewSettings {
        if let Some(max) = session.max_fps(sensor.pixel_format, sensor.resolution()) {
            if settings.fps > max {
                tracing::info!(requested = settings.fps, max, "Preview rate capped by device");
                settings.fps = max;
            }
        }
        settings
    }

    fn spawn_producer(
        &self,
        controller: Arc<StreamingController>,
        settings: PreviewSettings,
    ) -> Result<PreviewProducer> {
        PreviewProducer::spawn(
            controller,
            self.callbacks.clone(),
            self.shared.clone(),
            self.metrics.clone(),
            settings,
        )
    }

    fn capture_request(&self, session: &DeviceSession) -> CaptureRequest {
        let params = self.params();
        CaptureRequest {
            size: params
                .get_size(keys::PICTURE_SIZE)
                .unwrap_or(self.config.preview_size),
            rotation: params
                .get_int(keys::ROTATION)
                .map(|r| r.rem_euclid(360) as u32)
                .unwrap_or(0),
            allow_mjpeg: self.config.mjpeg_allowed(),
            make: "camhal".to_string(),
            model: session.caps().card.clone(),
            focal_length: params.get_float(keys::FOCAL_LENGTH),
            gps: params.gps(),
            gps_method: params.get(keys::GPS_PROCESSING_METHOD).map(str::to_string),
        }
    }

    fn stop_focus(&self) {
        if let Some(task) = lock(&self.focus).take() {
            task.finish();
        }
    }

    /// Writes the controls named in `params`. Rejected entries are removed
    /// from `params` and recorded in `violations`.
    fn apply_controls(
        &self,
        regulator: &ControlRegulator,
        params: &mut CameraParameters,
        violations: &mut Vec<CameraError>,
    ) -> Result<()> {
        let caps = regulator.capabilities();

        if let Some(zoom) = params.get_int(keys::ZOOM) {
            let before = regulator.snapshot().zoom;
            if note(params, violations, keys::ZOOM, regulator.set_zoom(zoom))? {
                let after = regulator.snapshot().zoom;
                if after != before {
                    self.callbacks.listener().on_zoom(after);
                }
            }
        }
        if caps.contains(CapabilitySet::EXPOSURE) {
            if let Some(level) = params.get_int(keys::EXPOSURE_COMPENSATION) {
                let half = regulator.exposure_range().half_span();
                let result = if (-half..=half).contains(&level) {
                    regulator.set_exposure(level)
                } else {
                    Err(CameraError::invalid_parameter(
                        keys::EXPOSURE_COMPENSATION,
                        format!("{level} outside -{half}..={half}"),
                    ))
                };
                note(params, violations, keys::EXPOSURE_COMPENSATION, result)?;
            }
        }
        if caps.contains(CapabilitySet::WHITE_BALANCE) {
            if let Some(name) = params.get(keys::WHITE_BALANCE).map(str::to_string) {
                note(params, violations, keys::WHITE_BALANCE, regulator.set_white_balance(&name))?;
            }
        }
        if caps.contains(CapabilitySet::EFFECT) {
            if let Some(name) = params.get(keys::EFFECT).map(str::to_string) {
                note(params, violations, keys::EFFECT, regulator.set_effect(&name))?;
            }
        }
        if caps.contains(CapabilitySet::BANDING) {
            if let Some(name) = params.get(keys::ANTIBANDING).map(str::to_string) {
                note(params, violations, keys::ANTIBANDING, regulator.set_banding(&name))?;
            }
        }
        if caps.contains(CapabilitySet::FLASH) {
            if let Some(name) = params.get(keys::FLASH_MODE).map(str::to_string) {
                let result = FlashMode::from_param(&name)
                    .ok_or_else(|| CameraError::invalid_parameter(keys::FLASH_MODE, format!("unknown mode {name:?}")))
                    .and_then(|mode| regulator.set_flash_mode(mode));
                note(params, violations, keys::FLASH_MODE, result)?;
            }
        }
        if let Some(name) = params.get(keys::FOCUS_MODE).map(str::to_string) {
            let result = regulator
                .set_focus_mode(FocusMode::from_param(&name))
                .map(|()| ControlOutcome::Applied);
            note(params, violations, keys::FOCUS_MODE, result)?;
        }
        Ok(())
    }
}

/// Records a rejected control write. Fatal errors propagate. Returns whether
/// the write went through.
fn note(
    params: &mut CameraParameters,
    violations: &mut Vec<CameraError>,
    key: &str,
    result: Result<ControlOutcome>,
) -> Result<bool> {
    match result {
        Ok(_) => Ok(true),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            tracing::warn!(key, error = %e, "Parameter rejected");
            params.remove(key);
            violations.push(e);
            Ok(false)
        }
    }
}

impl PreviewHost for Core {
    fn pause_preview(&self) -> bool {
        let producer = lock(&self.preview).take();
        match producer {
            Some(producer) => {
                let running = producer.is_running();
                producer.stop();
                running
            }
            None => false,
        }
    }

    fn resume_preview(&self) -> Result<()> {
        let controller = self.controller()?;
        let mut preview = lock(&self.preview);
        let format = controller
            .format()
            .ok_or_else(|| CameraError::invalid_state("no preview configuration to resume"))?;
        let settings = self.preview_settings(&self.params(), format.resolution());
        let settings = self.cap_rate(settings, controller.session(), &format);
        controller.start()?;
        *preview = Some(self.spawn_producer(controller, settings)?);
        Ok(())
    }
}

fn join_sizes(sizes: &[Resolution]) -> String {
    sizes.iter().map(Resolution::to_string).collect::<Vec<_>>().join(",")
}

/// Parameter set advertised right after open.
fn default_parameters(session: &DeviceSession, config: &AdapterConfig) -> CameraParameters {
    let regulator = session.regulator();
    let caps = regulator.capabilities();

    let mut sizes: Vec<Resolution> = session
        .formats()
        .iter()
        .flat_map(|format| session.frame_sizes(*format))
        .collect();
    sizes.sort_by_key(|s| (Reverse(s.area()), Reverse(s.width), s.height));
    sizes.dedup();
    let preview_sizes: Vec<Resolution> = sizes
        .iter()
        .copied()
        .filter(|s| {
            config
                .preview_max_size
                .is_none_or(|max| s.width <= max.width && s.height <= max.height)
        })
        .collect();

    let mut params = CameraParameters::new();
    params.set_size(keys::PREVIEW_SIZE, config.preview_size);
    params.set(keys::PREVIEW_SIZE_VALUES, join_sizes(&preview_sizes));
    params.set(keys::PREVIEW_FORMAT, config.preview_format.preview_key());
    params.set(
        keys::PREVIEW_FORMAT_VALUES,
        [PixelFormat::Nv21, PixelFormat::Yv12, PixelFormat::Yuyv]
            .map(PixelFormat::preview_key)
            .join(","),
    );
    params.set(keys::PREVIEW_FRAME_RATE, config.preview_fps);
    params.set(
        keys::PREVIEW_FPS_RANGE,
        format!("{},{}", MIN_PREVIEW_FPS.min(config.preview_fps) * 1000, config.preview_fps * 1000),
    );
    params.set_size(
        keys::PICTURE_SIZE,
        sizes.first().copied().unwrap_or(config.preview_size),
    );
    params.set(keys::PICTURE_SIZE_VALUES, join_sizes(&sizes));
    params.set(keys::PICTURE_FORMAT, "jpeg");
    params.set(keys::ROTATION, 0);

    params.set(keys::ZOOM, 0);
    params.set(keys::ZOOM_SUPPORTED, caps.contains(CapabilitySet::ZOOM));
    params.set(keys::MAX_ZOOM, regulator.max_zoom());
    params.set(
        keys::ZOOM_RATIOS,
        regulator
            .zoom_ratios()
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(","),
    );

    let half = regulator.exposure_range().half_span();
    params.set(keys::EXPOSURE_COMPENSATION, 0);
    params.set(keys::MAX_EXPOSURE_COMPENSATION, half);
    params.set(keys::MIN_EXPOSURE_COMPENSATION, -half);

    params.set(keys::WHITE_BALANCE, "auto");
    params.set(keys::EFFECT, "none");
    params.set(keys::ANTIBANDING, "auto");
    if caps.contains(CapabilitySet::WHITE_BALANCE) {
        params.set(keys::WHITE_BALANCE_VALUES, white_balance_values().collect::<Vec<_>>().join(","));
    }
    if caps.contains(CapabilitySet::EFFECT) {
        params.set(keys::EFFECT_VALUES, effect_values().collect::<Vec<_>>().join(","));
    }
    if caps.contains(CapabilitySet::BANDING) {
        params.set(keys::ANTIBANDING_VALUES, banding_values().collect::<Vec<_>>().join(","));
    }

    params.set(keys::FLASH_MODE, FlashMode::Off.as_param());
    if caps.contains(CapabilitySet::FLASH) {
        params.set(
            keys::FLASH_MODE_VALUES,
            [FlashMode::Off, FlashMode::On, FlashMode::Torch]
                .map(FlashMode::as_param)
                .join(","),
        );
    }

    let mut focus_modes = vec![FocusMode::Fixed];
    if caps.contains(CapabilitySet::FOCUS) {
        focus_modes.push(FocusMode::Auto);
    }
    if regulator.continuous_focus_supported() {
        focus_modes.extend([
            FocusMode::Infinity,
            FocusMode::ContinuousVideo,
            FocusMode::ContinuousPicture,
        ]);
    }
    params.set(keys::FOCUS_MODE, FocusMode::Fixed.as_param());
    params.set(
        keys::FOCUS_MODE_VALUES,
        focus_modes.iter().map(|m| m.as_param()).collect::<Vec<_>>().join(","),
    );
    params
}

impl<S: DeviceSource> CaptureAdapter for CameraAdapter<S> {
    fn camera_id(&self) -> u32 {
        self.core.config.device_id
    }

    fn open(&self) -> Result<()> {
        let core = &self.core;
        let mut slot = core.controller.write().unwrap_or_else(|p| p.into_inner());
        if slot.as_ref().is_some_and(|c| c.session().is_open()) {
            return Ok(());
        }

        if let Some(stale) = lock(&core.preview).take() {
            stale.stop();
        }
        let session = Arc::new(self.source.open_session(&core.config)?);
        if core.config.facing == Facing::Front {
            if let Err(e) = session.regulator().set_mirror(true) {
                tracing::warn!(error = %e, "Front camera mirror not applied");
            }
        }
        let controller = Arc::new(StreamingController::new(session.clone())?);
        *lock(&core.params) = default_parameters(&session, &core.config);
        *slot = Some(controller);

        tracing::info!(
            camera = core.config.device_id,
            device = session.name(),
            card = %session.caps().card,
            memory = ?session.memory_kind(),
            "Camera opened"
        );
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.core
            .controller()
            .is_ok_and(|c| c.session().is_open())
    }

    fn set_callbacks(&self, callbacks: Callbacks) {
        self.core.callbacks.set(callbacks);
    }

    fn set_parameters(&self, flat: &str) -> Result<()> {
        let core = &self.core;
        let controller = core.controller()?;
        let regulator = controller.session().regulator();

        let checked = parameters::validate(CameraParameters::unflatten(flat), regulator.max_zoom());
        let mut params = checked.params;
        let mut violations = checked.violations;

        if let (Some(size), Some(max)) = (params.get_size(keys::PREVIEW_SIZE), core.config.preview_max_size) {
            if size.width > max.width || size.height > max.height {
                violations.push(CameraError::invalid_parameter(
                    keys::PREVIEW_SIZE,
                    format!("{size} exceeds the {max} preview ceiling"),
                ));
                params.remove(keys::PREVIEW_SIZE);
            }
        }

        core.apply_controls(regulator, &mut params, &mut violations)?;
        lock(&core.params).merge(&params);

        match violations.into_iter().next() {
            Some(first) => Err(first),
            None => Ok(()),
        }
    }

    fn parameters(&self) -> String {
        self.core.params().flatten()
    }

    fn start_preview(&self) -> Result<()> {
        let core = &self.core;
        let controller = core.controller()?;
        if !controller.session().is_open() {
            return Err(CameraError::SessionClosed);
        }
        if core.is_capturing() {
            return Err(CameraError::invalid_state("still capture in progress"));
        }
        let mut preview = lock(&core.preview);
        if preview.as_ref().is_some_and(PreviewProducer::is_running) {
            return Ok(());
        }
        if let Some(finished) = preview.take() {
            finished.stop();
        }

        let params = core.params();
        let size = params.get_size(keys::PREVIEW_SIZE).unwrap_or(core.config.preview_size);
        let settings = core.preview_settings(&params, size);
        let sensor = controller
            .session()
            .sensor_format(settings.consumer_format, size, core.config.mjpeg_allowed());

        controller.stop()?;
        let applied = controller.configure(
            &FormatDescriptor::new(size.width, size.height, sensor),
            core.config.preview_buffers,
            &[],
        )?;
        let settings = core.cap_rate(settings, controller.session(), &applied);
        controller.start()?;
        *preview = Some(core.spawn_producer(controller, settings)?);

        tracing::info!(
            sensor = %applied,
            consumer = %settings.consumer_format,
            fps = settings.fps,
            "Preview running"
        );
        Ok(())
    }

    fn stop_preview(&self) -> Result<()> {
        let core = &self.core;
        // A running still sequence would restart preview on its way out.
        self.cancel_picture()?;
        let producer = lock(&core.preview).take();
        if let Some(producer) = producer {
            producer.stop();
        }
        match core.controller() {
            Ok(controller) => controller.stop(),
            Err(CameraError::SessionClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn is_previewing(&self) -> bool {
        lock(&self.core.preview)
            .as_ref()
            .is_some_and(PreviewProducer::is_running)
    }

    fn start_recording(&self) -> Result<()> {
        if !self.is_previewing() {
            return Err(CameraError::invalid_state("recording needs a running preview"));
        }
        self.core.shared.set_recording(true);
        tracing::info!("Recording started");
        Ok(())
    }

    fn stop_recording(&self) {
        if self.core.shared.is_recording() {
            self.core.shared.set_recording(false);
            tracing::info!("Recording stopped");
        }
    }

    fn is_recording(&self) -> bool {
        self.core.shared.is_recording()
    }

    fn take_picture(&self) -> Result<()> {
        let core = &self.core;
        let controller = core.controller()?;
        let mut capture = lock(&core.capture);
        if capture.as_ref().is_some_and(CaptureSequencer::is_running) {
            return Err(CameraError::invalid_state("still capture already running"));
        }
        if let Some(done) = capture.take() {
            done.join();
        }

        let request = core.capture_request(controller.session());
        let host: Arc<dyn PreviewHost> = core.clone();
        *capture = Some(CaptureSequencer::spawn(
            controller,
            core.callbacks.clone(),
            host,
            request,
            CaptureSettings::default(),
        )?);
        Ok(())
    }

    fn cancel_picture(&self) -> Result<()> {
        let pending = lock(&self.core.capture).take();
        if let Some(sequencer) = pending {
            sequencer.cancel();
            sequencer.join();
        }
        Ok(())
    }

    fn auto_focus(&self) -> Result<()> {
        let core = &self.core;
        let controller = core.controller()?;
        let mut focus = lock(&core.focus);
        if focus.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return Ok(());
        }
        if let Some(done) = focus.take() {
            done.finish();
        }

        let stop = Arc::new(StopSignal::new());
        let signal = stop.clone();
        let regulator = controller.session().regulator().clone();
        let callbacks = core.callbacks.clone();
        let handle = thread::Builder::new()
            .name("camhal-focus".to_string())
            .spawn(move || {
                let reached = regulator.run_auto_focus(&signal);
                if !signal.is_stopped() {
                    callbacks.listener().on_focus(reached);
                }
            })
            .map_err(|source| CameraError::Device {
                op: "spawn autofocus thread",
                source,
            })?;
        *focus = Some(FocusTask { stop, handle });
        Ok(())
    }

    fn cancel_auto_focus(&self) -> Result<()> {
        self.core.stop_focus();
        self.core.controller()?.session().regulator().cancel_auto_focus()
    }

    fn release_frame(&self, key: BufferKey) -> Result<()> {
        self.core.controller()?.pool().requeue_handle(key)
    }

    fn preview_stats(&self) -> PreviewStats {
        self.core.shared.stats()
    }

    fn buffer_counts(&self) -> PoolCounts {
        self.core
            .controller()
            .map(|c| c.pool().counts())
            .unwrap_or_default()
    }

    fn state(&self) -> SessionState {
        self.core
            .controller()
            .map(|c| c.state())
            .unwrap_or(SessionState::Closed)
    }

    fn release(&self) {
        let core = &self.core;
        if let Err(e) = self.cancel_picture() {
            tracing::warn!(error = %e, "Capture cancel failed during release");
        }
        core.stop_focus();
        core.shared.set_recording(false);
        if let Err(e) = self.stop_preview() {
            tracing::warn!(error = %e, "Preview stop failed during release");
        }

        let controller = core
            .controller
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(controller) = controller {
            if let Err(e) = controller.close() {
                tracing::warn!(error = %e, "Stream close failed during release");
            }
            controller.session().close();
        }
        tracing::info!(camera = core.config.device_id, "Camera released");
    }
}

impl<S: DeviceSource> Drop for CameraAdapter<S> {
    fn drop(&mut self) {
        if self.is_open() {
            self.release();
        } else {
            // The capture thread holds the core; it must not outlive us.
            let _ = self.cancel_picture();
            self.core.stop_focus();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera(config: AdapterConfig) -> VirtualCapture {
        let device = VirtualDevice::builder().with_sensor_controls().build();
        let camera = VirtualCapture::new(config, device);
        camera.open().unwrap();
        camera
    }

    #[test]
    fn test_default_parameters_advertise_device() {
        let camera = camera(AdapterConfig::default());
        let params = CameraParameters::unflatten(&camera.parameters());
        assert_eq!(params.get(keys::PREVIEW_SIZE), Some("640x480"));
        assert_eq!(params.get(keys::PICTURE_SIZE), Some("1920x1080"));
        assert_eq!(
            params.get(keys::PICTURE_SIZE_VALUES),
            Some("1920x1080,1280x720,640x480,320x240")
        );
        assert_eq!(params.get(keys::PREVIEW_FORMAT), Some("yuv420sp"));
        assert_eq!(params.get_int(keys::MAX_ZOOM), Some(8));
        assert_eq!(params.get(keys::ZOOM_SUPPORTED), Some("true"));
        assert_eq!(params.get_int(keys::MAX_EXPOSURE_COMPENSATION), Some(4));
        assert_eq!(params.get(keys::FLASH_MODE_VALUES), Some("off,on,torch"));
        assert!(params.get(keys::FOCUS_MODE_VALUES).unwrap().contains("continuous-video"));
    }

    #[test]
    fn test_preview_ceiling_enforced() {
        let camera = camera(AdapterConfig {
            preview_max_size: Some(Resolution::new(1280, 720)),
            ..AdapterConfig::default()
        });
        let params = CameraParameters::unflatten(&camera.parameters());
        assert!(!params.get(keys::PREVIEW_SIZE_VALUES).unwrap().contains("1920x1080"));

        let err = camera.set_parameters("preview-size=1920x1080").unwrap_err();
        assert!(matches!(err, CameraError::InvalidParameter { ref key, .. } if key == keys::PREVIEW_SIZE));
        assert_eq!(
            CameraParameters::unflatten(&camera.parameters()).get(keys::PREVIEW_SIZE),
            Some("640x480")
        );
    }

    #[test]
    fn test_unknown_menu_value_keeps_previous() {
        let camera = camera(AdapterConfig::default());
        camera.set_parameters("whitebalance=daylight").unwrap();
        assert!(camera.set_parameters("whitebalance=sunset").is_err());
        let params = CameraParameters::unflatten(&camera.parameters());
        assert_eq!(params.get(keys::WHITE_BALANCE), Some("daylight"));
    }

    #[test]
    fn test_exposure_outside_range_rejected() {
        let camera = camera(AdapterConfig::default());
        camera.set_parameters("exposure-compensation=-4").unwrap();
        assert!(camera.set_parameters("exposure-compensation=9").is_err());
        let params = CameraParameters::unflatten(&camera.parameters());
        assert_eq!(params.get_int(keys::EXPOSURE_COMPENSATION), Some(-4));
    }

    #[test]
    fn test_front_camera_mirrors() {
        let device = VirtualDevice::builder().with_sensor_controls().build();
        let camera = VirtualCapture::new(
            AdapterConfig {
                facing: Facing::Front,
                ..AdapterConfig::default()
            },
            device.clone(),
        );
        camera.open().unwrap();
        assert_eq!(device.stats().writes(crate::controls::cid::HFLIP), 1);
    }

    #[test]
    fn test_release_closes_device() {
        let camera = camera(AdapterConfig::default());
        camera.start_preview().unwrap();
        camera.release();
        assert!(!camera.is_open());
        assert_eq!(camera.device().buffer_count(), 0);
        assert!(!camera.device().is_streaming());
    }
}
