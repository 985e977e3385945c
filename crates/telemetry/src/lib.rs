//! Telemetry integration: structured logging setup and the observer bridge
//! publishing repository counters.

#![deny(unsafe_code)]

pub mod repo_observer;

use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// Errors from telemetry initialization.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// OpenTelemetry pipeline setup failed.
    #[error("otel setup failed: {0}")]
    Otel(String),
}

/// Initialize structured logging (JSON) with env filter.
/// Set RUST_LOG, e.g., "info,repository=debug".
pub fn init_json_logging() {
    let fmt_layer = fmt::layer().json().with_current_span(true).with_span_list(true);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).ok();
}

/// Initialize an OpenTelemetry OTLP metrics provider from the environment
/// (behind the `otel` feature).
#[cfg(feature = "otel")]
pub fn init_otel_metrics() -> Result<(), TelemetryError> {
    use opentelemetry::global;

    let provider = opentelemetry_otlp::new_pipeline()
        .metrics(opentelemetry_sdk::runtime::Tokio)
        .with_exporter(opentelemetry_otlp::new_exporter().http())
        .build()
        .map_err(|e| TelemetryError::Otel(e.to_string()))?;
    global::set_meter_provider(provider);
    Ok(())
}
