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

/// Install a global tracing subscriber using the provided logging settings.
///
/// Log output goes to stderr so that command output on stdout stays parseable.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed(),
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

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "cache_triage_outcome_total",
            Unit::Count,
            "Triage decisions by outcome."
        );
        describe_histogram!(
            "cache_triage_triage_ms",
            Unit::Milliseconds,
            "Time spent triaging a single request in milliseconds."
        );
        describe_counter!(
            "cache_triage_memory_hit_total",
            Unit::Count,
            "Total number of in-memory cache hits."
        );
        describe_counter!(
            "cache_triage_memory_miss_total",
            Unit::Count,
            "Total number of in-memory cache misses."
        );
        describe_counter!(
            "cache_triage_memory_evict_total",
            Unit::Count,
            "Total number of in-memory cache evictions due to capacity."
        );
    });
}
