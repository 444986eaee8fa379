//! Sync metrics fed from coordinator events, served over HTTP
//!
//!   GET /metrics   Prometheus text format
//!   GET /healthz   liveness, 200 while the process runs
//!   GET /readyz    readiness, 200 while online and authenticated

use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use offsync_sync::{
    ChannelState, NetworkEvent, NetworkMonitor, SyncCoordinator, SyncEvent,
};
use prometheus_client::{
    encoding::text::encode,
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::Registry,
};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

type Labels = Vec<(String, String)>;

fn labels(pairs: &[(&str, &str)]) -> Labels {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

// ── Metrics ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct SyncMetrics {
    rounds: Family<Labels, Counter>,
    round_duration: Family<Labels, Histogram>,
    items_acknowledged: Counter,
    items_retried: Counter,
    items_dropped: Family<Labels, Counter>,
    conflicts_resolved: Family<Labels, Counter>,
    remote_applied: Counter,
    remote_rejected: Counter,
    queue_depth: Gauge,
    online: Gauge,
    realtime_connected: Gauge,
    auth_paused: Gauge,
}

impl SyncMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            rounds: Family::default(),
            round_duration: Family::<Labels, Histogram>::new_with_constructor(|| {
                Histogram::new([0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0].into_iter())
            }),
            items_acknowledged: Counter::default(),
            items_retried: Counter::default(),
            items_dropped: Family::default(),
            conflicts_resolved: Family::default(),
            remote_applied: Counter::default(),
            remote_rejected: Counter::default(),
            queue_depth: Gauge::default(),
            online: Gauge::default(),
            realtime_connected: Gauge::default(),
            auth_paused: Gauge::default(),
        };

        registry.register(
            "offsync_sync_rounds",
            "Sync rounds by mode and outcome",
            metrics.rounds.clone(),
        );
        registry.register(
            "offsync_sync_round_duration_seconds",
            "Duration of completed sync rounds",
            metrics.round_duration.clone(),
        );
        registry.register(
            "offsync_items_acknowledged",
            "Queued items acknowledged by the server",
            metrics.items_acknowledged.clone(),
        );
        registry.register(
            "offsync_items_retried",
            "Queued items scheduled for another attempt",
            metrics.items_retried.clone(),
        );
        registry.register(
            "offsync_items_dropped",
            "Queued items dropped, by reason",
            metrics.items_dropped.clone(),
        );
        registry.register(
            "offsync_conflicts_resolved",
            "Conflicts resolved, by strategy and winner",
            metrics.conflicts_resolved.clone(),
        );
        registry.register(
            "offsync_remote_applied",
            "Remote mutations applied without conflict",
            metrics.remote_applied.clone(),
        );
        registry.register(
            "offsync_remote_rejected",
            "Remote mutations that failed decryption or checksum verification",
            metrics.remote_rejected.clone(),
        );
        registry.register(
            "offsync_queue_depth",
            "Items waiting in the sync queue",
            metrics.queue_depth.clone(),
        );
        registry.register(
            "offsync_network_online",
            "1 while the network is considered reachable",
            metrics.online.clone(),
        );
        registry.register(
            "offsync_realtime_connected",
            "1 while the realtime channel is authenticated",
            metrics.realtime_connected.clone(),
        );
        registry.register(
            "offsync_auth_paused",
            "1 while sync waits for fresh credentials",
            metrics.auth_paused.clone(),
        );
        metrics
    }

    pub fn observe(&self, event: &SyncEvent) {
        match event {
            SyncEvent::SyncStarted { .. } => {}
            SyncEvent::SyncCompleted { report } => {
                let outcome = if report.interrupted {
                    "interrupted"
                } else {
                    "ok"
                };
                self.rounds
                    .get_or_create(&labels(&[("mode", report.mode.as_str()), ("outcome", outcome)]))
                    .inc();
                self.round_duration
                    .get_or_create(&labels(&[("mode", report.mode.as_str())]))
                    .observe(report.duration_ms as f64 / 1000.0);
            }
            SyncEvent::SyncFailed { mode, .. } => {
                self.rounds
                    .get_or_create(&labels(&[("mode", mode.as_str()), ("outcome", "failed")]))
                    .inc();
            }
            SyncEvent::ItemAcknowledged { .. } => {
                self.items_acknowledged.inc();
            }
            SyncEvent::ItemRetryScheduled { .. } => {
                self.items_retried.inc();
            }
            SyncEvent::ItemDropped { reason, .. } => {
                self.items_dropped
                    .get_or_create(&labels(&[("reason", reason.as_str())]))
                    .inc();
            }
            SyncEvent::ConflictResolved {
                strategy, winner, ..
            } => {
                self.conflicts_resolved
                    .get_or_create(&labels(&[("strategy", *strategy), ("winner", winner.as_str())]))
                    .inc();
            }
            SyncEvent::RemoteApplied { .. } => {
                self.remote_applied.inc();
            }
            SyncEvent::RemoteRejected { .. } => {
                self.remote_rejected.inc();
            }
            SyncEvent::LocalStoreFailed { .. } | SyncEvent::ServerSyncComplete { .. } => {}
            SyncEvent::AuthRequired { .. } => {
                self.auth_paused.set(1);
            }
            SyncEvent::Network(event) => {
                self.online.set(i64::from(*event == NetworkEvent::Online));
            }
            SyncEvent::Realtime(state) => {
                self.realtime_connected
                    .set(i64::from(*state == ChannelState::Authenticated));
            }
        }
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }

    pub fn set_auth_paused(&self, paused: bool) {
        self.auth_paused.set(i64::from(paused));
    }
}

/// Feed coordinator events into `metrics` until cancelled.
pub fn spawn_recorder(
    metrics: SyncMetrics,
    coordinator: Arc<SyncCoordinator>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut events = coordinator.subscribe();
    tokio::spawn(async move {
        metrics.set_queue_depth(coordinator.queue().size());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => metrics.observe(&event),
                    Err(RecvError::Lagged(missed)) => debug!(missed, "metrics recorder lagged"),
                    Err(RecvError::Closed) => break,
                },
            }
            metrics.set_queue_depth(coordinator.queue().size());
            metrics.set_auth_paused(coordinator.is_auth_paused());
        }
    })
}

// ── HTTP endpoints ────────────────────────────────────────────────────────────

/// Shared health state read by the handlers
#[derive(Clone)]
pub struct HealthState {
    pub registry: Arc<Registry>,
    pub coordinator: Arc<SyncCoordinator>,
    pub network: Arc<NetworkMonitor>,
}

/// Serve Prometheus metrics and health endpoints on `addr` (e.g. "127.0.0.1:9310")
pub async fn serve(addr: String, state: HealthState) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("metrics bind {addr}"))?;

    info!(addr = %addr, "metrics: listening on /metrics, /healthz, /readyz");

    axum::serve(listener, app)
        .await
        .context("metrics server")
}

async fn metrics_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let mut body = String::new();
    match encode(&mut body, &state.registry) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            error!("metrics encode failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                e.to_string(),
            )
        }
    }
}

/// Liveness probe: returns 200 if the process is running.
async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

fn readiness(online: bool, auth_paused: bool) -> (StatusCode, &'static str) {
    match (online, auth_paused) {
        (_, true) => (StatusCode::SERVICE_UNAVAILABLE, "waiting for re-authentication"),
        (false, _) => (StatusCode::SERVICE_UNAVAILABLE, "offline"),
        (true, false) => (StatusCode::OK, "ready"),
    }
}

/// Readiness probe: 503 while offline or paused for re-authentication.
async fn readyz_handler(State(state): State<HealthState>) -> impl IntoResponse {
    readiness(state.network.is_online(), state.coordinator.is_auth_paused())
}
