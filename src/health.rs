use std::path::{Path, PathBuf};

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tracing::error;

use crate::metrics::MetricsRegistry;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub repos: CheckResult,
    pub authorized_keys: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct HealthState {
    pub repos_root: PathBuf,
    pub authorized_keys: PathBuf,
    pub metrics: MetricsRegistry,
}

/// Build the router serving `/healthz` and `/metrics`.
pub fn create_router(state: HealthState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_repos(root: &Path) -> CheckResult {
    match tokio::fs::read_dir(root).await {
        Ok(_) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("cannot read {}: {e}", root.display())),
    }
}

async fn check_authorized_keys(path: &Path) -> CheckResult {
    match tokio::fs::File::open(path).await {
        Ok(_) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("cannot read {}: {e}", path.display())),
    }
}

// ---------------------------------------------------------------------------
// Axum handlers
// ---------------------------------------------------------------------------

/// `GET /healthz`.  Returns 200 when every check passes, 503 otherwise.
pub async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let (repos, authorized_keys) = tokio::join!(
        check_repos(&state.repos_root),
        check_authorized_keys(&state.authorized_keys),
    );

    let status = if repos.ok && authorized_keys.ok {
        HealthStatus::Ok
    } else {
        HealthStatus::Unhealthy
    };
    let body = HealthResponse {
        status,
        checks: HealthChecks {
            repos,
            authorized_keys,
        },
    };

    let http_status = match status {
        HealthStatus::Ok => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (http_status, Json(body))
}

/// `GET /metrics`
pub async fn metrics_handler(State(state): State<HealthState>) -> Response {
    match state.metrics.encode() {
        Ok(buf) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            buf,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
