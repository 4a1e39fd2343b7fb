//! Log subscriber setup and the counters every service records.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Once;

use metrics::describe_counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

// ---------------------------------------------------------------------------
// Metric names
// ---------------------------------------------------------------------------

pub const BOOKING_ENQUEUED: &str = "booking_enqueued_total";
pub const BOOKING_ENQUEUE_FAILED: &str = "booking_enqueue_failed_total";
pub const BOOKING_FINALIZED: &str = "booking_finalized_total";
pub const BOOKING_FINALIZE_FAILED: &str = "booking_finalize_failed_total";
pub const CONSUMER_DROPPED: &str = "booking_consumer_dropped_total";
pub const PROXY_REQUESTS: &str = "proxy_requests_total";
pub const PROXY_NO_TARGET: &str = "proxy_no_target_total";

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line.
    Json,
    /// Human-readable, for local runs.
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(format!("unknown log format `{other}` (expected json or pretty)")),
        }
    }
}

/// Installs the global subscriber. Later calls are no-ops.
///
/// Levels come from `RUST_LOG`, defaulting to `info`. With `otel` set,
/// `tracing` spans are also recorded as OpenTelemetry spans on that tracer.
pub fn init_logging(format: LogFormat, otel: Option<opentelemetry_sdk::trace::Tracer>) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let otel = otel.map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(otel)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(otel)
                    .with(fmt::layer())
                    .init();
            }
        }
    });
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Starts a Prometheus scrape endpoint on `addr` and registers the counter
/// descriptions. Must run inside a tokio runtime.
///
/// # Errors
///
/// Returns an error if the recorder is already installed or the listener
/// cannot be started.
pub fn install_prometheus(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    describe_counter!(BOOKING_ENQUEUED, "Work items published to the queue");
    describe_counter!(
        BOOKING_ENQUEUE_FAILED,
        "Enqueue requests rejected or failed, labelled by reason"
    );
    describe_counter!(BOOKING_FINALIZED, "Bookings finalized by the consumer");
    describe_counter!(
        BOOKING_FINALIZE_FAILED,
        "Finalize calls that failed in the consumer"
    );
    describe_counter!(CONSUMER_DROPPED, "Queue messages dropped as malformed");
    describe_counter!(PROXY_REQUESTS, "Requests forwarded by the proxy, by target");
    describe_counter!(PROXY_NO_TARGET, "Requests no route rule matched");

    tracing::info!(%addr, "prometheus exporter listening");
    Ok(())
}
