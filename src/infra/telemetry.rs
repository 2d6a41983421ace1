use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::{
    METRIC_CACHE_FALLBACK, METRIC_CACHE_HIT, METRIC_CACHE_MISS, METRIC_CACHE_PASSTHROUGH,
    METRIC_CACHE_REFRESH, METRIC_CACHE_WARM_MS, METRIC_CACHE_WRITE, METRIC_NETWORK_FAILURE,
};
use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
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

/// Register descriptions for every metric the cache emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_CACHE_HIT,
            Unit::Count,
            "Requests answered from the active cache."
        );
        describe_counter!(
            METRIC_CACHE_MISS,
            Unit::Count,
            "Requests not found in the active cache."
        );
        describe_counter!(
            METRIC_CACHE_PASSTHROUGH,
            Unit::Count,
            "Network responses returned without caching (non-200 or cross-origin)."
        );
        describe_counter!(
            METRIC_CACHE_FALLBACK,
            Unit::Count,
            "Document loads answered with the offline fallback."
        );
        describe_counter!(
            METRIC_NETWORK_FAILURE,
            Unit::Count,
            "Requests that neither the cache nor the network could answer directly."
        );
        describe_counter!(
            METRIC_CACHE_WRITE,
            Unit::Count,
            "Background cache writes, labelled by result."
        );
        describe_counter!(
            METRIC_CACHE_REFRESH,
            Unit::Count,
            "Per-entry background refresh outcomes."
        );
        describe_histogram!(
            METRIC_CACHE_WARM_MS,
            Unit::Milliseconds,
            "Install-time cache warm latency in milliseconds."
        );
    });
}
