use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Installs the global subscriber: `RUST_LOG` directives over the configured
/// level, span traces for errors, and JSON or compact output. Fails if a
/// subscriber is already installed.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetricKind {
    Counter,
    Histogram,
}

/// Every metric the crate emits, with its unit and description.
const METRICS: [(&str, MetricKind, Unit, &str); 7] = [
    ("tagcache_hit_total", MetricKind::Counter, Unit::Count, "Calls answered from the cache store."),
    ("tagcache_miss_total", MetricKind::Counter, Unit::Count, "Calls that computed and stored a fresh value."),
    ("tagcache_bypass_total", MetricKind::Counter, Unit::Count, "Calls made with caching bypassed."),
    (
        "tagcache_fail_open_total",
        MetricKind::Counter,
        Unit::Count,
        "Calls computed directly because the store or lock servers were unreachable.",
    ),
    ("tagcache_invalidated_total", MetricKind::Counter, Unit::Count, "Metadata rows removed by invalidation sweeps."),
    ("tagcache_reaped_total", MetricKind::Counter, Unit::Count, "Expired metadata rows removed by the reaper."),
    ("tagcache_lock_wait_ms", MetricKind::Histogram, Unit::Milliseconds, "Time spent acquiring a population lock."),
];

/// Registers descriptions with the installed recorder. Runs once per process.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        for (name, kind, unit, description) in METRICS {
            match kind {
                MetricKind::Counter => describe_counter!(name, unit, description),
                MetricKind::Histogram => describe_histogram!(name, unit, description),
            }
        }
    });
}
