//! Operational HTTP surface shared by the Message Router and the
//! Change-Stream Projector: a health endpoint and a Prometheus metrics
//! endpoint, nothing else. Both binaries wire their own component(s) into
//! `AppState`, leaving the other `None` -- there is no admin, auth, or
//! CRUD surface here by design.

use axum::{extract::State, routing::get, Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use fc_common::{ConsumerHealth, HealthReport, PoolStats, WatcherStatus};
use fc_router::{HealthService, QueueManager};

/// `queue_manager` is `None` in the projector binary, which has no pools --
/// its watcher statuses still flow through `health_service`, fed by its own
/// periodic reporting loop the same way the router feeds consumer health.
#[derive(Clone)]
pub struct AppState {
    pub queue_manager: Option<Arc<QueueManager>>,
    pub health_service: Arc<HealthService>,
    pub metrics_handle: Option<PrometheusHandle>,
}

impl AppState {
    pub fn router_only(queue_manager: Arc<QueueManager>, health_service: Arc<HealthService>, metrics_handle: PrometheusHandle) -> Self {
        Self { queue_manager: Some(queue_manager), health_service, metrics_handle: Some(metrics_handle) }
    }

    pub fn projector_only(health_service: Arc<HealthService>, metrics_handle: PrometheusHandle) -> Self {
        Self { queue_manager: None, health_service, metrics_handle: Some(metrics_handle) }
    }
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "FlowCatalyst Operational API",
        version = "0.1.0",
        description = "Health and metrics surface for the message router and change-stream projector",
        license(name = "MIT"),
    ),
    paths(health_handler, liveness_probe, readiness_probe),
    components(schemas(HealthResponse, ProbeResponse)),
    tags((name = "health", description = "Health and readiness endpoints")),
)]
pub struct ApiDoc;

#[derive(Serialize, ToSchema)]
pub struct ProbeResponse {
    pub status: String,
}

/// Per-component rollup, combining whichever of router/projector this
/// process runs. Matches the operational surface required of both binaries
/// so a single dashboard query works against either.
#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub issues: Vec<String>,
    pub consumers: Vec<ConsumerHealth>,
    pub watchers: Vec<WatcherStatus>,
    pub pool_stats: Vec<PoolStats>,
    pub pipeline_size: Option<usize>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

#[utoipa::path(get, path = "/health", tag = "health", responses((status = 200, body = HealthResponse)))]
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let pool_stats = state.queue_manager.as_ref().map(|m| m.pool_stats()).unwrap_or_default();
    let report: HealthReport = state.health_service.get_health_report(&pool_stats);
    let pipeline_size = state.queue_manager.as_ref().map(|m| m.pipeline_size());

    Json(HealthResponse {
        status: format!("{:?}", report.status).to_uppercase(),
        issues: report.issues,
        consumers: state.health_service.consumer_healths(),
        watchers: state.health_service.watcher_statuses(),
        pool_stats,
        pipeline_size,
    })
}

#[utoipa::path(get, path = "/health/live", tag = "health", responses((status = 200, body = ProbeResponse)))]
async fn liveness_probe() -> Json<ProbeResponse> {
    Json(ProbeResponse { status: "LIVE".to_string() })
}

/// Ready means the process has finished startup wiring (config synced /
/// indexes installed) and isn't Degraded. A Warning status is still Ready:
/// the process is serving, just with something worth an operator's
/// attention.
#[utoipa::path(get, path = "/health/ready", tag = "health", responses((status = 200, body = ProbeResponse), (status = 503, body = ProbeResponse)))]
async fn readiness_probe(State(state): State<AppState>) -> (axum::http::StatusCode, Json<ProbeResponse>) {
    let pool_stats = state.queue_manager.as_ref().map(|m| m.pool_stats()).unwrap_or_default();
    let report = state.health_service.get_health_report(&pool_stats);

    if report.status == fc_common::HealthStatus::Degraded {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, Json(ProbeResponse { status: "NOT_READY".to_string() }))
    } else {
        (axum::http::StatusCode::OK, Json(ProbeResponse { status: "READY".to_string() }))
    }
}

async fn metrics_handler(State(state): State<AppState>) -> String {
    state.metrics_handle.as_ref().map(|h| h.render()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fc_router::HealthServiceConfig;

    #[tokio::test]
    async fn health_endpoint_reports_healthy_with_no_components() {
        let health_service = Arc::new(HealthService::new(HealthServiceConfig::default()));
        let state = AppState { queue_manager: None, health_service, metrics_handle: None };
        let Json(response) = health_handler(State(state)).await;
        assert_eq!(response.status, "HEALTHY");
        assert!(response.consumers.is_empty());
    }
}
