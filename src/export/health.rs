use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts,
    Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "aggregoor";

/// Prometheus metrics for engine health.
///
/// All metrics use the "aggregoor" namespace and are registered on a
/// private registry, so several engines can coexist in one process.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Ingestion ===
    /// Records accepted by a local worker queue, by role.
    pub records_received: CounterVec,
    /// Records dropped before aggregation, by role and reason.
    pub records_dropped: CounterVec,
    /// Records forwarded to the owning node, by role.
    pub records_forwarded: CounterVec,
    /// `tell` calls for a role with no registered route.
    pub routing_errors: Counter,
    /// Records whose merge failed, by role and stage (buffer/persist).
    pub merge_errors: CounterVec,
    /// Current inbound queue length by role and worker index.
    pub worker_queue_length: GaugeVec,

    // === Persistence ===
    /// Completed persistence ticks.
    pub persistence_ticks: Counter,
    /// Workers skipped because their previous buffer was still held.
    pub flush_skipped: CounterVec,
    /// Persistence failures by stage (get/prepare/submit).
    pub persistence_errors: CounterVec,
    /// Write requests built, by kind (insert/update).
    pub persistence_requests: CounterVec,
    /// Time to drain buffers and build requests for one tick.
    pub persistence_prepare_duration: Histogram,
    /// Time spent in the batch sink for one tick.
    pub persistence_execute_duration: Histogram,
    /// Total tick duration.
    pub persistence_tick_duration: Histogram,
    /// Requests submitted per tick.
    pub persistence_batch_size: Histogram,

    // === Storage ===
    /// Whether the storage backend answered its last check (1=yes, 0=no).
    pub storage_connected: GaugeVec,
    /// Batch errors by backend and error type.
    pub storage_batch_errors: CounterVec,
    /// Storage call duration by backend and operation.
    pub storage_duration: HistogramVec,

    // === Cluster ===
    /// Remote frames received and dispatched locally.
    pub remote_frames_received: Counter,
    /// Remote frames that failed to decode.
    pub remote_decode_errors: Counter,
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(NAMESPACE)
}

fn histogram_opts(name: &str, help: &str, buckets: Vec<f64>) -> HistogramOpts {
    HistogramOpts::new(name, help)
        .namespace(NAMESPACE)
        .buckets(buckets)
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let records_received = CounterVec::new(
            opts(
                "records_received_total",
                "Records accepted by a local worker queue.",
            ),
            &["role"],
        )?;
        let records_dropped = CounterVec::new(
            opts(
                "records_dropped_total",
                "Records dropped before aggregation by role and reason.",
            ),
            &["role", "reason"],
        )?;
        let records_forwarded = CounterVec::new(
            opts(
                "records_forwarded_total",
                "Records forwarded to the owning node.",
            ),
            &["role"],
        )?;
        let routing_errors = Counter::with_opts(opts(
            "routing_errors_total",
            "Records sent to a role with no registered route.",
        ))?;
        let merge_errors = CounterVec::new(
            opts(
                "merge_errors_total",
                "Records whose merge failed by role and stage.",
            ),
            &["role", "stage"],
        )?;
        let worker_queue_length = GaugeVec::new(
            opts("worker_queue_length", "Current inbound queue length."),
            &["role", "worker"],
        )?;

        let persistence_ticks = Counter::with_opts(opts(
            "persistence_ticks_total",
            "Completed persistence ticks.",
        ))?;
        let flush_skipped = CounterVec::new(
            opts(
                "flush_skipped_total",
                "Worker flushes skipped because the previous buffer was still held.",
            ),
            &["role"],
        )?;
        let persistence_errors = CounterVec::new(
            opts(
                "persistence_errors_total",
                "Persistence failures by stage.",
            ),
            &["stage"],
        )?;
        let persistence_requests = CounterVec::new(
            opts(
                "persistence_requests_total",
                "Write requests built by kind.",
            ),
            &["kind"],
        )?;
        let persistence_prepare_duration = Histogram::with_opts(histogram_opts(
            "persistence_prepare_duration_seconds",
            "Time to drain buffers and build write requests per tick.",
            vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0],
        ))?;
        let persistence_execute_duration = Histogram::with_opts(histogram_opts(
            "persistence_execute_duration_seconds",
            "Time spent submitting the batch per tick.",
            vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0],
        ))?;
        let persistence_tick_duration = Histogram::with_opts(histogram_opts(
            "persistence_tick_duration_seconds",
            "Total persistence tick duration.",
            vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0],
        ))?;
        let persistence_batch_size = Histogram::with_opts(histogram_opts(
            "persistence_batch_size",
            "Write requests submitted per tick.",
            vec![1.0, 10.0, 100.0, 1000.0, 10000.0, 50000.0],
        ))?;

        let storage_connected = GaugeVec::new(
            opts(
                "storage_connected",
                "Whether the storage backend answered its last check (1=yes, 0=no).",
            ),
            &["backend"],
        )?;
        let storage_batch_errors = CounterVec::new(
            opts(
                "storage_batch_errors_total",
                "Storage batch errors by backend and error type.",
            ),
            &["backend", "error_type"],
        )?;
        let storage_duration = HistogramVec::new(
            histogram_opts(
                "storage_duration_seconds",
                "Storage call duration by backend and operation.",
                vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0],
            ),
            &["backend", "operation"],
        )?;

        let remote_frames_received = Counter::with_opts(opts(
            "remote_frames_received_total",
            "Remote frames received and dispatched locally.",
        ))?;
        let remote_decode_errors = Counter::with_opts(opts(
            "remote_decode_errors_total",
            "Remote frames that failed to decode.",
        ))?;

        registry.register(Box::new(records_received.clone()))?;
        registry.register(Box::new(records_dropped.clone()))?;
        registry.register(Box::new(records_forwarded.clone()))?;
        registry.register(Box::new(routing_errors.clone()))?;
        registry.register(Box::new(merge_errors.clone()))?;
        registry.register(Box::new(worker_queue_length.clone()))?;
        registry.register(Box::new(persistence_ticks.clone()))?;
        registry.register(Box::new(flush_skipped.clone()))?;
        registry.register(Box::new(persistence_errors.clone()))?;
        registry.register(Box::new(persistence_requests.clone()))?;
        registry.register(Box::new(persistence_prepare_duration.clone()))?;
        registry.register(Box::new(persistence_execute_duration.clone()))?;
        registry.register(Box::new(persistence_tick_duration.clone()))?;
        registry.register(Box::new(persistence_batch_size.clone()))?;
        registry.register(Box::new(storage_connected.clone()))?;
        registry.register(Box::new(storage_batch_errors.clone()))?;
        registry.register(Box::new(storage_duration.clone()))?;
        registry.register(Box::new(remote_frames_received.clone()))?;
        registry.register(Box::new(remote_decode_errors.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            records_received,
            records_dropped,
            records_forwarded,
            routing_errors,
            merge_errors,
            worker_queue_length,
            persistence_ticks,
            flush_skipped,
            persistence_errors,
            persistence_requests,
            persistence_prepare_duration,
            persistence_execute_duration,
            persistence_tick_duration,
            persistence_batch_size,
            storage_connected,
            storage_batch_errors,
            storage_duration,
            remote_frames_received,
            remote_decode_errors,
        })
    }

    /// Returns the underlying registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
