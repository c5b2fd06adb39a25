//! Health check HTTP server
//!
//! Liveness and readiness probes for process supervision, plus a JSON view of
//! every feed's cycle state and the in-process counters.

use crate::domain::{CycleState, SubmissionResult};
use crate::services::metrics::{Metrics, MetricsSnapshot};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Health status for a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Per-feed health as reported by its runner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedHealth {
    pub name: String,
    pub status: HealthStatus,
    pub state: String,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
struct FeedRecord {
    state: CycleState,
    consecutive_failures: u32,
    last_success: Option<DateTime<Utc>>,
    last_tx_hash: Option<String>,
    last_error: Option<String>,
}

impl FeedRecord {
    fn new() -> Self {
        Self {
            state: CycleState::Idle,
            consecutive_failures: 0,
            last_success: None,
            last_tx_hash: None,
            last_error: None,
        }
    }

    fn status(&self) -> HealthStatus {
        if self.state == CycleState::Halted {
            HealthStatus::Unhealthy
        } else if self.consecutive_failures > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Overall system health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub feeds: Vec<FeedHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsSnapshot>,
}

/// Shared state for health server
pub struct HealthState {
    pub started_at: DateTime<Utc>,
    feeds: DashMap<String, FeedRecord>,
    metrics: Option<Arc<Metrics>>,
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            feeds: DashMap::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, m: Arc<Metrics>) -> Self {
        self.metrics = Some(m);
        self
    }

    pub fn register_feed(&self, name: &str) {
        self.feeds
            .entry(name.to_string())
            .or_insert_with(FeedRecord::new);
    }

    pub fn set_feed_state(&self, name: &str, state: CycleState) {
        self.feeds
            .entry(name.to_string())
            .or_insert_with(FeedRecord::new)
            .state = state;
    }

    /// Record a cycle that ended without error, pushed or not
    pub fn record_success(&self, name: &str, result: Option<&SubmissionResult>) {
        let mut record = self
            .feeds
            .entry(name.to_string())
            .or_insert_with(FeedRecord::new);
        record.consecutive_failures = 0;
        record.last_success = Some(Utc::now());
        record.last_error = None;
        if let Some(r) = result {
            record.last_tx_hash = Some(r.tx_hash.clone());
        }
    }

    pub fn record_failure(&self, name: &str, error: &str) {
        let mut record = self
            .feeds
            .entry(name.to_string())
            .or_insert_with(FeedRecord::new);
        record.consecutive_failures += 1;
        record.last_error = Some(error.to_string());
    }

    pub fn feed_state(&self, name: &str) -> Option<CycleState> {
        self.feeds.get(name).map(|r| r.state)
    }

    /// Overall status: unhealthy when no feed can make progress
    pub fn get_health(&self) -> HealthResponse {
        let mut feeds: Vec<FeedHealth> = self
            .feeds
            .iter()
            .map(|entry| {
                let r = entry.value();
                FeedHealth {
                    name: entry.key().clone(),
                    status: r.status(),
                    state: r.state.to_string(),
                    consecutive_failures: r.consecutive_failures,
                    last_success: r.last_success,
                    last_tx_hash: r.last_tx_hash.clone(),
                    last_error: r.last_error.clone(),
                }
            })
            .collect();
        feeds.sort_by(|a, b| a.name.cmp(&b.name));

        let status = if feeds.is_empty()
            || feeds.iter().all(|f| f.status == HealthStatus::Unhealthy)
        {
            HealthStatus::Unhealthy
        } else if feeds.iter().all(|f| f.status.is_healthy()) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        HealthResponse {
            status,
            timestamp: Utc::now(),
            uptime_seconds: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
            feeds,
            metrics: self.metrics.as_ref().map(|m| m.snapshot()),
        }
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

/// Routes: `/health` (full JSON), `/healthz` (liveness), `/readyz` (readiness)
pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .with_state(state)
}

/// Health check server
pub struct HealthServer {
    state: Arc<HealthState>,
    port: u16,
}

impl HealthServer {
    pub fn new(state: Arc<HealthState>, port: u16) -> Self {
        Self { state, port }
    }

    pub async fn run(&self) -> crate::Result<()> {
        let app = router(Arc::clone(&self.state));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!(%addr, "Starting health server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .await
            .map_err(|e| crate::PythoraError::Internal(format!("Health server error: {}", e)))?;

        Ok(())
    }

    pub fn state(&self) -> Arc<HealthState> {
        Arc::clone(&self.state)
    }
}

async fn health_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let health = state.get_health();
    let status_code = match health.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(health))
}

async fn liveness_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn readiness_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    match state.get_health().status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    }
}
