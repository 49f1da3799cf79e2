//! Prometheus metrics for the arena server
//!
//! ```rust,ignore
//! let metrics = ServerMetrics::new()?;
//! metrics.connections_active.inc();
//! let text = metrics.gather()?;
//! ```

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use log::{error, info};
use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Label values for `arena_inputs_dropped_total`
pub const DROP_STALE: &str = "stale";
pub const DROP_UNKNOWN_PLAYER: &str = "unknown_player";
pub const DROP_MALFORMED: &str = "malformed";
pub const DROP_REFUSED: &str = "refused";
pub const DROP_OVERFLOW: &str = "overflow";

#[derive(Clone)]
pub struct ServerMetrics {
    registry: Registry,

    // Connections
    /// Open WebSocket connections
    pub connections_active: IntGauge,
    /// Connections that completed the handshake
    pub connections_total: IntCounter,
    /// Connections closed right after accept because the server was full
    pub connections_rejected_total: IntCounter,

    // Sessions
    pub sessions_active: IntGauge,
    pub inputs_applied_total: IntCounter,
    /// Inputs that changed nothing, by reason
    pub inputs_dropped_total: IntCounterVec,

    // Tick loop
    pub ticks_total: IntCounter,
    /// Measured duration of the most recent tick
    pub tick_delta_seconds: Gauge,
    pub broadcast_frames_lagged_total: IntCounter,

    pub storage_failures_total: IntCounter,
}

impl ServerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let connections_active =
            IntGauge::new("arena_connections_active", "Open WebSocket connections")?;
        registry.register(Box::new(connections_active.clone()))?;

        let connections_total = IntCounter::new(
            "arena_connections_total",
            "Connections that completed the WebSocket handshake",
        )?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_rejected_total = IntCounter::new(
            "arena_connections_rejected_total",
            "Connections refused because the server was full",
        )?;
        registry.register(Box::new(connections_rejected_total.clone()))?;

        let sessions_active = IntGauge::new("arena_sessions_active", "Registered player sessions")?;
        registry.register(Box::new(sessions_active.clone()))?;

        let inputs_applied_total =
            IntCounter::new("arena_inputs_applied_total", "Input frames applied")?;
        registry.register(Box::new(inputs_applied_total.clone()))?;

        let inputs_dropped_total = IntCounterVec::new(
            Opts::new("arena_inputs_dropped_total", "Input frames dropped"),
            &["reason"],
        )?;
        registry.register(Box::new(inputs_dropped_total.clone()))?;

        let ticks_total = IntCounter::new("arena_ticks_total", "Scheduler ticks emitted")?;
        registry.register(Box::new(ticks_total.clone()))?;

        let tick_delta_seconds =
            Gauge::new("arena_tick_delta_seconds", "Measured length of the last tick")?;
        registry.register(Box::new(tick_delta_seconds.clone()))?;

        let broadcast_frames_lagged_total = IntCounter::new(
            "arena_broadcast_frames_lagged_total",
            "State broadcasts skipped by slow connections",
        )?;
        registry.register(Box::new(broadcast_frames_lagged_total.clone()))?;

        let storage_failures_total = IntCounter::new(
            "arena_storage_failures_total",
            "Session events that could not be persisted",
        )?;
        registry.register(Box::new(storage_failures_total.clone()))?;

        Ok(Self {
            registry,
            connections_active,
            connections_total,
            connections_rejected_total,
            sessions_active,
            inputs_applied_total,
            inputs_dropped_total,
            ticks_total,
            tick_delta_seconds,
            broadcast_frames_lagged_total,
            storage_failures_total,
        })
    }

    /// Counts one dropped input under `reason`
    pub fn input_dropped(&self, reason: &str) {
        self.inputs_dropped_total.with_label_values(&[reason]).inc();
    }

    /// Renders every registered metric in the Prometheus text format
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

async fn render_metrics(State(metrics): State<Arc<ServerMetrics>>) -> impl IntoResponse {
    match metrics.gather() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        ),
        Err(e) => {
            error!("Failed to render metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain")],
                e.to_string(),
            )
        }
    }
}

/// Serves `GET /metrics` on `listener` until `shutdown` resolves
pub async fn serve_metrics<F>(
    listener: TcpListener,
    metrics: Arc<ServerMetrics>,
    shutdown: F,
) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Metrics available at http://{}/metrics", addr);
    }
    let app = Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(metrics);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}
