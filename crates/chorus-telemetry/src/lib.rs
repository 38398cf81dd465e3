mod metrics;

pub use metrics::{names, HistogramSummary, MetricPoint, MetricsRecorder, MetricsSnapshot};

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
    /// Per-module level overrides (e.g. "chorus_llm" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines instead of human-readable output.
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
    /// Build from textual levels, skipping any module entry that does not parse.
    pub fn from_levels<'a>(
        level: &str,
        modules: impl IntoIterator<Item = (&'a str, &'a str)>,
        json: bool,
    ) -> Self {
        let log_level = level.parse().unwrap_or(Level::INFO);
        let module_levels = modules
            .into_iter()
            .filter_map(|(m, l)| l.parse().ok().map(|l| (m.to_string(), l)))
            .collect();
        Self {
            log_level,
            module_levels,
            json,
        }
    }

    /// The filter directive string, e.g. `info,chorus_llm=debug`.
    pub fn filter_directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Handle returned by [`init_telemetry`]. Owns the process metrics recorder.
#[derive(Debug)]
pub struct TelemetryGuard {
    metrics: Arc<MetricsRecorder>,
}

impl TelemetryGuard {
    /// Shared metrics recorder for the server and relay.
    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        self.metrics.clone()
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
///
/// A second call leaves the existing subscriber in place and only builds a
/// fresh recorder, so tests may call it freely.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    if tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .try_init()
        .is_err()
    {
        tracing::debug!("tracing subscriber already installed");
    }

    TelemetryGuard {
        metrics: Arc::new(MetricsRecorder::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_directives_include_modules() {
        let config = TelemetryConfig::from_levels(
            "warn",
            [("chorus_llm", "debug"), ("chorus_server", "nonsense")],
            false,
        );
        assert_eq!(config.filter_directives(), "warn,chorus_llm=debug");
    }

    #[test]
    fn unknown_level_falls_back_to_info() {
        let config = TelemetryConfig::from_levels("loud", [], true);
        assert_eq!(config.log_level, Level::INFO);
        assert!(config.json);
    }

    #[test]
    fn init_twice_is_harmless() {
        let a = init_telemetry(TelemetryConfig::default());
        let b = init_telemetry(TelemetryConfig::default());
        a.metrics().counter_inc("x", &[], 1);
        assert_eq!(b.metrics().counter_get("x", &[]), 0);
    }
}
