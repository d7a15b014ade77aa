//! Health endpoint.
//!
//! Serves `/health` (full report, 503 when degraded) and `/livez`. The report
//! itself comes from a [`HealthCheck`] implementation, normally the runner.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Source of health reports.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check_health(&self) -> HealthReport;
}

/// Health report.
#[derive(Debug, Clone, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthReport {
    /// "ok" or "degraded".
    pub status: String,
    pub service: String,
    pub version: String,
    /// Current timestamp (ISO 8601).
    pub timestamp: String,
    pub roles: Vec<RoleHealth>,
}

/// Health of one managed container.
#[derive(Debug, Clone, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct RoleHealth {
    pub role: String,
    /// Whether this role is expected to run in this deployment.
    pub expected: bool,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

impl HealthReport {
    /// Build a report; healthy when every expected role is running.
    pub fn from_roles(roles: Vec<RoleHealth>) -> Self {
        let healthy = roles.iter().all(|r| !r.expected || r.running);
        Self {
            status: if healthy { "ok" } else { "degraded" }.to_string(),
            service: "node-runner".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now().to_rfc3339(),
            roles,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == "ok"
    }
}

/// Health routes.
pub fn router(check: Arc<dyn HealthCheck>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/livez", get(livez))
        .with_state(check)
}

/// Bind `addr` and serve health routes in the background until shutdown.
///
/// Bind and serve errors are passed to `on_error`; they never stop the caller.
pub fn start_server<E>(
    mut shutdown: watch::Receiver<bool>,
    addr: SocketAddr,
    on_error: E,
    check: Arc<dyn HealthCheck>,
) -> JoinHandle<()>
where
    E: Fn(anyhow::Error) + Send + 'static,
{
    tokio::spawn(async move {
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                on_error(anyhow::Error::new(e).context(format!("failed to bind {addr}")));
                return;
            }
        };
        info!(%addr, "Health server listening");

        let shutdown_signal = async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        };

        if let Err(e) = axum::serve(listener, router(check))
            .with_graceful_shutdown(shutdown_signal)
            .await
        {
            on_error(e.into());
        }
    })
}

/// Default error handler: log and carry on.
pub fn log_server_error(err: anyhow::Error) {
    error!(error = %err, "Health server error");
}

async fn health(State(check): State<Arc<dyn HealthCheck>>) -> impl IntoResponse {
    let report = check.check_health().await;
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

async fn livez() -> impl IntoResponse {
    StatusCode::OK
}
