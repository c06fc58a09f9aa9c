use anyhow::Context;
use camhal::notify::{Callbacks, CameraListener};
use camhal::{AdapterConfig, CameraError, FrameLease, SessionManager};
use common::{TelemetryGuard, setup_logging};
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    flag,
};
use std::env;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const STATUS_INTERVAL: Duration = Duration::from_secs(5);

struct LogListener;

impl CameraListener for LogListener {
    fn on_error(&self, error: &CameraError) {
        tracing::error!(error = %error, "Camera error");
    }

    fn on_shutter(&self) {
        tracing::info!("Shutter");
    }

    fn on_capture_end(&self, success: bool) {
        tracing::info!(success, "Capture finished");
    }

    fn on_focus(&self, reached: bool) {
        tracing::info!(reached, "Focus finished");
    }

    fn on_zoom(&self, level: u32) {
        tracing::info!(level, "Zoom changed");
    }
}

fn main() -> anyhow::Result<()> {
    let config = AdapterConfig::from_env()?;

    // TelemetryGuard requires a Tokio runtime for async OTLP exporters.
    let _telemetry = match env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok() {
        Some(endpoint) => {
            let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
            let guard = rt.block_on(async { TelemetryGuard::init("camhal", &endpoint, config.environment) })?;
            Some((rt, guard))
        }
        None => {
            setup_logging(config.environment);
            None
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    flag::register(SIGTERM, Arc::clone(&shutdown))?;
    flag::register(SIGINT, Arc::clone(&shutdown))?;
    tracing::info!("Signal handlers registered (SIGTERM, SIGINT)");

    let manager = SessionManager::discover(&config)?;
    let camera = manager
        .open(config.device_id)
        .context("Failed to open camera - check V4L2 device availability")?;

    let frames = Arc::new(AtomicU64::new(0));
    let counter = frames.clone();
    camera.set_callbacks(Callbacks::new(
        Arc::new(move |lease: FrameLease| {
            counter.fetch_add(1, Ordering::Relaxed);
            drop(lease);
        }),
        Arc::new(LogListener),
    ));
    tracing::info!(parameters = %camera.parameters(), "Camera parameters");

    camera.start_preview().context("Failed to start preview")?;
    if env::var("CAMHAL_SNAPSHOT").is_ok_and(|v| common::config::parse_flag(&v) == Some(true)) {
        camera.take_picture().context("Failed to start still capture")?;
    }

    let mut last_status = Instant::now();
    while !shutdown.load(Ordering::Relaxed) && camera.is_open() {
        std::thread::sleep(POLL_INTERVAL);
        if last_status.elapsed() < STATUS_INTERVAL {
            continue;
        }
        last_status = Instant::now();
        let stats = camera.preview_stats();
        tracing::info!(
            delivered = frames.load(Ordering::Relaxed),
            fps = stats.fps,
            state = %camera.state(),
            "Preview status"
        );
    }

    manager.release_all();
    tracing::info!("Camera stopped gracefully");
    Ok(())
}
