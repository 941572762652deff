//! Telemetry bootstrap for Pylon.
//!
//! Logging and metric naming share one home so every broker process agrees
//! on both. The codec and repositories never log; the gRPC handlers and
//! background runners wrap their work in the span constructors below, and
//! the metric constants are the broker's stable metric contract (the
//! `metrics` facade is recorder-agnostic, so deployments pick the exporter).

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Counter of status CloudEvents delivered to subscribers.
///
/// Labels: `source`, `cluster`, `type`.
pub const METRIC_EVENTS_SENT: &str = "pylon_cloudevents_sent_total";

/// Counter of consumer status resyncs triggered by ring ownership
/// transfers.
///
/// Labels: `consumer`.
pub const METRIC_STATUS_RESYNCS: &str = "pylon_status_resync_total";

/// Telemetry settings for a broker process.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Emit JSON log lines instead of human-readable ones.
    pub json: bool,
    /// Filter directives applied when `RUST_LOG` is unset.
    pub default_directives: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            json: false,
            default_directives: "info,pylon_broker=info,pylon_core=info".to_string(),
        }
    }
}

impl TelemetryConfig {
    /// JSON output with the default filter, the shape production log
    /// pipelines ingest.
    #[must_use]
    pub fn json() -> Self {
        Self {
            json: true,
            ..Self::default()
        }
    }
}

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Installs the global tracing subscriber for this process.
///
/// The first call wins; later calls are no-ops returning `false`, so tests
/// and embedding processes can call this unconditionally. Returns `false`
/// as well when another subscriber was already installed out-of-band.
///
/// # Environment Variables
///
/// - `RUST_LOG`: overrides `default_directives`
///   (e.g. `pylon_broker::dispatcher=debug`)
///
/// # Example
///
/// ```rust
/// use pylon_core::observability::{init_telemetry, TelemetryConfig};
///
/// init_telemetry(&TelemetryConfig::default());
/// ```
pub fn init_telemetry(config: &TelemetryConfig) -> bool {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return false;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_directives));

    if config.json {
        // Flattened events keep `source`/`consumer` queryable as top-level
        // fields in log pipelines.
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().flatten_event(true))
            .try_init()
            .is_ok()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact().with_target(false))
            .try_init()
            .is_ok()
    }
}

/// Span covering one publish pipeline run.
///
/// Everything the handler and the resync coordinator log while routing the
/// event inherits these fields.
#[must_use]
pub fn publish_span(event_type: &str, source: &str) -> Span {
    tracing::info_span!("publish", event_type, source)
}

/// Span following one subscription registration.
///
/// Entered at registration and attached to the stream's error monitor, so
/// a send failure logs with the originating topic.
#[must_use]
pub fn subscription_span(client_id: &str, topic: &str) -> Span {
    tracing::info_span!("subscribe", client = client_id, topic)
}

/// Span covering one consumer status resync sweep.
#[must_use]
pub fn resync_span(consumer_id: &str) -> Span {
    tracing::info_span!("resync", consumer = consumer_id)
}
