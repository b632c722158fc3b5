//! Observability: metrics handle and tracing/OTLP wiring.
//!
//! `prometheus` counters/histograms threaded by `Arc`, not retrieved
//! through a global `Stats::GetGlobalStats()` singleton — every
//! collaborator that wants to record a metric is handed a `Stats` (or a
//! clone of its `Arc`) at construction time instead of reaching for one.
//!
//! The tracing/OTLP wiring mirrors the pack's own
//! `tracing_subscriber::registry().with(...).with(tracing_opentelemetry::
//! layer())` pattern: a process hosting this core calls
//! [`init_tracing`] once at startup, before building any [`Replica`](crate::Replica).

use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{self as sdktrace, RandomIdGenerator, Sampler};
use opentelemetry_sdk::Resource;
use parking_lot::Mutex;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::{ConsensusError, Result};

/// Where (and whether) to export traces via OTLP, alongside the local
/// `tracing-subscriber` formatted log.
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// OTLP collector endpoint. `None` disables OTLP export entirely —
    /// only the local formatted log layer runs.
    pub otlp_endpoint: Option<String>,
    /// Reported as the `service.name` resource attribute.
    pub service_name: String,
    /// Export timeout for the OTLP batch span processor.
    pub export_timeout: Duration,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            service_name: "resilientdb-core".to_string(),
            export_timeout: Duration::from_secs(10),
        }
    }
}

/// Install the global `tracing` subscriber: an `EnvFilter`-gated fmt
/// layer, plus (if `config.otlp_endpoint` is set) a `tracing-opentelemetry`
/// layer exporting spans via OTLP/tonic. Safe to call at most once per
/// process; a second call is a no-op (errors from `try_init` are
/// swallowed, matching the pack's own initialization helpers).
pub fn init_tracing(config: &ObservabilityConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer();

    let registry = tracing_subscriber::registry().with(filter).with(fmt_layer);

    if let Some(endpoint) = &config.otlp_endpoint {
        match build_otlp_tracer(config, endpoint) {
            Ok(tracer) => {
                let _ = registry.with(tracing_opentelemetry::layer().with_tracer(tracer)).try_init();
                return;
            }
            Err(e) => {
                // fmt-only log is not up yet; this one line has to go to stderr directly.
                eprintln!("OTLP tracer init failed, continuing with local logging only: {e}");
            }
        }
    }
    let _ = registry.try_init();
}

fn build_otlp_tracer(config: &ObservabilityConfig, endpoint: &str) -> Result<sdktrace::Tracer> {
    let resource = Resource::new(vec![
        KeyValue::new("service.name", config.service_name.clone()),
        KeyValue::new("service.version", crate::VERSION),
    ]);
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .with_timeout(config.export_timeout);
    let provider = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(
            sdktrace::config()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(resource),
        )
        .install_batch(opentelemetry_sdk::runtime::Tokio)
        .map_err(|e| ConsensusError::ConfigError(format!("otlp exporter: {e}")))?;
    Ok(provider.tracer("resilientdb-core"))
}

/// Flush any buffered spans and tear down the global tracer provider.
/// Call once at shutdown, after every `Replica` has stopped.
pub fn shutdown_tracing() {
    opentelemetry::global::shutdown_tracer_provider();
}

/// Metrics handle for one replica process.
///
/// Every counter/histogram is registered against its own private
/// `Registry` rather than the `prometheus` crate's default global one, so
/// two `Stats` instances (e.g. in a multi-replica test process) never
/// collide on metric names.
pub struct Stats {
    registry: Registry,
    /// Total batches committed.
    pub commits_total: IntCounter,
    /// Total view-changes/re-elections observed.
    pub view_changes_total: IntCounter,
    /// Total inbound messages dropped (stale, malformed, Byzantine).
    pub dropped_messages_total: IntCounter,
    /// Total Byzantine faults recorded by [`crate::byzantine`].
    pub byzantine_detections_total: IntCounter,
    /// Commit latency, proposal to decide, in milliseconds.
    pub commit_latency_ms: Histogram,
    /// Requests currently in flight (submitted, not yet acked).
    pub in_flight_requests: IntGauge,
    last_commit_at: Mutex<Option<DateTime<Utc>>>,
}

impl Stats {
    /// Build a fresh metrics handle with its own private registry.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let commits_total = IntCounter::with_opts(Opts::new("resilientdb_commits_total", "Total batches committed"))
            .map_err(registration_error)?;
        let view_changes_total = IntCounter::with_opts(Opts::new(
            "resilientdb_view_changes_total",
            "Total view-changes or leader re-elections observed",
        ))
        .map_err(registration_error)?;
        let dropped_messages_total = IntCounter::with_opts(Opts::new(
            "resilientdb_dropped_messages_total",
            "Total inbound messages dropped (stale, malformed, or Byzantine)",
        ))
        .map_err(registration_error)?;
        let byzantine_detections_total = IntCounter::with_opts(Opts::new(
            "resilientdb_byzantine_detections_total",
            "Total Byzantine faults recorded",
        ))
        .map_err(registration_error)?;
        let commit_latency_ms = Histogram::with_opts(HistogramOpts::new(
            "resilientdb_commit_latency_ms",
            "Latency from proposal to decide, in milliseconds",
        ))
        .map_err(registration_error)?;
        let in_flight_requests = IntGauge::with_opts(Opts::new(
            "resilientdb_in_flight_requests",
            "Client requests submitted but not yet acknowledged",
        ))
        .map_err(registration_error)?;

        registry.register(Box::new(commits_total.clone())).map_err(registration_error)?;
        registry.register(Box::new(view_changes_total.clone())).map_err(registration_error)?;
        registry.register(Box::new(dropped_messages_total.clone())).map_err(registration_error)?;
        registry.register(Box::new(byzantine_detections_total.clone())).map_err(registration_error)?;
        registry.register(Box::new(commit_latency_ms.clone())).map_err(registration_error)?;
        registry.register(Box::new(in_flight_requests.clone())).map_err(registration_error)?;

        Ok(Self {
            registry,
            commits_total,
            view_changes_total,
            dropped_messages_total,
            byzantine_detections_total,
            commit_latency_ms,
            in_flight_requests,
            last_commit_at: Mutex::new(None),
        })
    }

    /// Record a commit and its latency.
    pub fn record_commit(&self, latency_ms: f64) {
        self.commits_total.inc();
        self.commit_latency_ms.observe(latency_ms);
        *self.last_commit_at.lock() = Some(Utc::now());
    }

    /// Record a view-change or leader re-election.
    pub fn record_view_change(&self) {
        self.view_changes_total.inc();
    }

    /// Record a dropped inbound message.
    pub fn record_dropped_message(&self) {
        self.dropped_messages_total.inc();
    }

    /// Record a newly-detected Byzantine fault.
    pub fn record_byzantine_detection(&self) {
        self.byzantine_detections_total.inc();
    }

    /// Set the current in-flight request count.
    pub fn set_in_flight(&self, n: i64) {
        self.in_flight_requests.set(n);
    }

    /// Timestamp of the most recent recorded commit, if any.
    pub fn last_commit_at(&self) -> Option<DateTime<Utc>> {
        *self.last_commit_at.lock()
    }

    /// Render the current metrics in Prometheus text exposition format,
    /// for a `/metrics` endpoint hosted by the embedder.
    pub fn gather(&self) -> Result<String> {
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&metric_families, &mut buf)
            .map_err(|e| ConsensusError::ExecutorError(format!("metrics encode: {e}")))?;
        String::from_utf8(buf).map_err(|e| ConsensusError::ExecutorError(format!("metrics utf8: {e}")))
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new().expect("metric registration with fixed, valid names never fails")
    }
}

fn registration_error(e: prometheus::Error) -> ConsensusError {
    ConsensusError::ConfigError(format!("metrics registration: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_stats_has_no_commits_and_no_last_commit_time() {
        let stats = Stats::new().unwrap();
        assert_eq!(stats.commits_total.get(), 0);
        assert!(stats.last_commit_at().is_none());
    }

    #[test]
    fn record_commit_increments_counter_and_stamps_time() {
        let stats = Stats::new().unwrap();
        stats.record_commit(12.5);
        assert_eq!(stats.commits_total.get(), 1);
        assert!(stats.last_commit_at().is_some());
    }

    #[test]
    fn gather_renders_registered_metric_names() {
        let stats = Stats::new().unwrap();
        stats.record_dropped_message();
        let rendered = stats.gather().unwrap();
        assert!(rendered.contains("resilientdb_dropped_messages_total"));
    }

    #[test]
    fn two_independent_stats_handles_do_not_share_counts() {
        let a = Stats::new().unwrap();
        let b = Stats::new().unwrap();
        a.record_commit(1.0);
        assert_eq!(a.commits_total.get(), 1);
        assert_eq!(b.commits_total.get(), 0);
    }
}
