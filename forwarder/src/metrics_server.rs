//! Metrics and health endpoint for the forwarder
//!
//! `/metrics` serves the Prometheus registry. `/health` reports whether the
//! forwarder loop is still cycling, based on a [`Liveness`] handle the
//! forwarder updates after every cycle:
//!
//! | status     | HTTP | meaning                                       |
//! |------------|------|-----------------------------------------------|
//! | `starting` | 200  | no cycle finished yet, still within the grace |
//! | `alive`    | 200  | a cycle finished within `stale_after`         |
//! | `stalled`  | 503  | no cycle finished within `stale_after`        |
//! | `stopped`  | 503  | the run loop has exited                       |
//!
//! A penalized remote or a failing cycle still counts as alive; the loop is
//! turning and will retry. Delivery problems show up in the metrics instead.
//!
//! # Example
//!
//! ```ignore
//! let liveness = Arc::new(Liveness::new(Duration::from_secs(90)));
//! let metrics_handle = MetricsServer::start("0.0.0.0:9090".parse()?, Arc::clone(&liveness));
//! let forwarder = Forwarder::new(source, transport, offsets, encoder).liveness(liveness);
//! ```

use axum::{
    Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{error, info};

const NO_CYCLE: u64 = u64::MAX;

/// Progress markers shared between the forwarder and `/health`
#[derive(Debug)]
pub struct Liveness {
    started: Instant,
    /// Millis after `started` when the last cycle finished
    last_cycle_ms: AtomicU64,
    cycles: AtomicU64,
    stopped: AtomicBool,
    stale_after: Duration,
}

/// Health as reported on `/health`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Starting,
    Alive,
    Stalled,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub cycles: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cycle_ms_ago: Option<u64>,
}

impl Liveness {
    /// `stale_after` should cover a tick plus the longest a cycle may take
    pub fn new(stale_after: Duration) -> Self {
        Self {
            started: Instant::now(),
            last_cycle_ms: AtomicU64::new(NO_CYCLE),
            cycles: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            stale_after,
        }
    }

    /// Mark a finished cycle, whatever its outcome
    pub fn beat(&self) {
        self.last_cycle_ms
            .store(self.elapsed_ms(), Ordering::Relaxed);
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark the run loop as exited
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    pub fn report(&self) -> HealthReport {
        let now = self.elapsed_ms();
        let last = self.last_cycle_ms.load(Ordering::Relaxed);
        let last_cycle_ms_ago = (last != NO_CYCLE).then(|| now.saturating_sub(last));
        let stale_ms = self.stale_after.as_millis() as u64;

        let status = if self.stopped.load(Ordering::Relaxed) {
            HealthStatus::Stopped
        } else {
            match last_cycle_ms_ago {
                Some(ago) if ago <= stale_ms => HealthStatus::Alive,
                None if now <= stale_ms => HealthStatus::Starting,
                _ => HealthStatus::Stalled,
            }
        };

        HealthReport {
            status,
            cycles: self.cycles.load(Ordering::Relaxed),
            last_cycle_ms_ago,
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Metrics HTTP server
pub struct MetricsServer;

impl MetricsServer {
    /// Start the server on the given address
    ///
    /// Returns a JoinHandle that can be used to abort the server.
    /// A bind failure is logged and ends the task; forwarding carries on.
    pub fn start(addr: SocketAddr, liveness: Arc<Liveness>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(e) => {
                    error!(error = %e, addr = %addr, "Failed to bind metrics server");
                    return;
                }
            };

            info!(addr = %addr, "Metrics server listening");

            if let Err(e) = axum::serve(listener, router(liveness)).await {
                error!(error = %e, "Metrics server error");
            }
        })
    }
}

fn router(liveness: Arc<Liveness>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(liveness)
}

async fn metrics_handler() -> impl IntoResponse {
    let body = crate::metrics::gather();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

async fn health_handler(State(liveness): State<Arc<Liveness>>) -> impl IntoResponse {
    let report = liveness.report();
    let status = match report.status {
        HealthStatus::Starting | HealthStatus::Alive => StatusCode::OK,
        HealthStatus::Stalled | HealthStatus::Stopped => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(report))
}
