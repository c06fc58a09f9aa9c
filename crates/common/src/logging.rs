use crate::config::Environment;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber: pretty output in development, JSON in
/// production, filtered through `RUST_LOG` (default `info`).
///
/// An OpenTelemetry layer is always attached; it only exports when a global
/// tracer provider was registered (see [`crate::TelemetryGuard`]).
///
/// Calling this twice is harmless: the second install is ignored.
pub fn setup_logging(environment: Environment) {
    let otel_layer = tracing_opentelemetry::layer();

    let registry = tracing_subscriber::registry()
        .with(env_filter())
        .with(otel_layer);

    let installed = match environment {
        Environment::Production => registry
            .with(tracing_subscriber::fmt::layer().json().with_level(true))
            .try_init(),
        Environment::Development => registry
            .with(tracing_subscriber::fmt::layer().pretty().with_ansi(true))
            .try_init(),
    };

    if installed.is_err() {
        tracing::debug!("Global subscriber already installed, keeping it");
    }
}

/// Compact stderr logging for tests and one-shot tools.
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_test_writer()
        .try_init();
}
