mod metrics;

pub use metrics::{names, HistogramSummary, MetricSample, MetricType, MetricsRecorder};

use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "tweetstream_upstream" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Filter directive built from the configured levels.
    pub fn filter_directive(&self) -> String {
        let mut filter_str = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter_str
    }
}

/// Handle to the process-wide telemetry state.
pub struct TelemetryGuard {
    metrics: Arc<MetricsRecorder>,
}

impl TelemetryGuard {
    /// Shared metrics recorder for the relay.
    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        Arc::clone(&self.metrics)
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .init();

    TelemetryGuard {
        metrics: Arc::new(MetricsRecorder::new()),
    }
}
