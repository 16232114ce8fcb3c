//! HTTP admin API and Prometheus metrics endpoint.

use crate::model::{Endpoint, Protocol, ServiceRecord, ServiceRegistration, ServiceStatus, ServiceUpdate};
use crate::query::{EndpointQuery, ServiceFilter, SortBy, SortOrder};
use crate::stats::Statistics;
use crate::store::Registry;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
};
use prometheus_client::encoding::text::encode;
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// HTTP server exposing the registry
pub struct ApiServer {
    registry: Arc<Registry>,
    listen_addr: String,
}

impl ApiServer {
    /// Create a new API server
    pub fn new(registry: Arc<Registry>, listen_addr: String) -> Self {
        Self {
            registry,
            listen_addr,
        }
    }

    /// Serve until `shutdown` resolves
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let app = router(self.registry);

        let listener = TcpListener::bind(&self.listen_addr).await?;
        info!(listen_addr = %self.listen_addr, "Admin API listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

/// Routes of the admin API
pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1/services", get(list_services).post(register_service))
        .route(
            "/v1/services/:id",
            get(get_service).patch(update_service).delete(deregister_service),
        )
        .route("/v1/services/:id/heartbeat", put(heartbeat))
        .route("/v1/services/:id/status", put(set_status))
        .route("/v1/endpoints/:name", get(find_endpoints))
        .route("/v1/statistics", get(statistics))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(registry)
}

/// Registry error rendered as a JSON response
#[derive(Debug)]
pub struct ApiError(common::Error);

impl From<common::Error> for ApiError {
    fn from(err: common::Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            common::Error::NotFound(_) => StatusCode::NOT_FOUND,
            common::Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn unknown_service(id: &str) -> ApiError {
    ApiError(common::Error::not_found(id))
}

/// Query string accepted by `GET /v1/services`
#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub name: Option<String>,
    pub version: Option<String>,
    pub status: Option<ServiceStatus>,
    pub tenant_id: Option<String>,
    /// Comma separated
    pub tags: Option<String>,
    pub protocol: Option<Protocol>,
    pub require_healthy: Option<bool>,
    pub sort_by: Option<SortBy>,
    pub sort_order: Option<SortOrder>,
    pub limit: Option<usize>,
    pub include_metadata: Option<bool>,
}

impl From<ListParams> for ServiceFilter {
    fn from(params: ListParams) -> Self {
        let defaults = ServiceFilter::default();
        ServiceFilter {
            name: params.name,
            version: params.version,
            status: params.status,
            tenant_id: params.tenant_id,
            tags: params
                .tags
                .map(|tags| tags.split(',').map(|tag| tag.trim().to_string()).collect())
                .unwrap_or_default(),
            protocol: params.protocol,
            require_healthy: params.require_healthy.unwrap_or(defaults.require_healthy),
            sort_by: params.sort_by,
            sort_order: params.sort_order.unwrap_or(defaults.sort_order),
            limit: params.limit,
            include_metadata: params.include_metadata.unwrap_or(defaults.include_metadata),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: ServiceStatus,
}

async fn health_handler(State(registry): State<Arc<Registry>>) -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "services": registry.len() }))
}

/// Handler for /metrics endpoint
async fn metrics_handler(State(registry): State<Arc<Registry>>) -> Response {
    let Some(metrics) = registry.metrics() else {
        return (StatusCode::NOT_FOUND, "metrics disabled").into_response();
    };
    metrics.refresh_from_statistics(&registry.statistics());

    // Encode metrics to Prometheus text format
    let mut buffer = String::new();
    if let Err(e) = encode(&mut buffer, &metrics.registry) {
        warn!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        buffer,
    )
        .into_response()
}

async fn list_services(
    State(registry): State<Arc<Registry>>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<ServiceRecord>>> {
    let filter = ServiceFilter::from(params);
    Ok(Json(registry.query(&filter)?))
}

async fn register_service(
    State(registry): State<Arc<Registry>>,
    Json(registration): Json<ServiceRegistration>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let id = registry.register(registration)?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

async fn get_service(
    State(registry): State<Arc<Registry>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ServiceRecord>> {
    registry
        .get(&id)
        .map(Json)
        .ok_or_else(|| unknown_service(&id))
}

async fn update_service(
    State(registry): State<Arc<Registry>>,
    Path(id): Path<String>,
    Json(update): Json<ServiceUpdate>,
) -> ApiResult<Json<ServiceRecord>> {
    Ok(Json(registry.update(&id, update)?))
}

async fn deregister_service(
    State(registry): State<Arc<Registry>>,
    Path(id): Path<String>,
) -> Json<serde_json::Value> {
    Json(json!({ "removed": registry.deregister(&id) }))
}

async fn heartbeat(
    State(registry): State<Arc<Registry>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if registry.heartbeat(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(unknown_service(&id))
    }
}

async fn set_status(
    State(registry): State<Arc<Registry>>,
    Path(id): Path<String>,
    Json(body): Json<StatusBody>,
) -> ApiResult<Json<ServiceRecord>> {
    Ok(Json(registry.set_status(&id, body.status)?))
}

async fn find_endpoints(
    State(registry): State<Arc<Registry>>,
    Path(name): Path<String>,
    Query(options): Query<EndpointQuery>,
) -> ApiResult<Json<Vec<Endpoint>>> {
    Ok(Json(registry.find_service_endpoints(&name, &options)?))
}

async fn statistics(State(registry): State<Arc<Registry>>) -> Json<Statistics> {
    Json(registry.statistics())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (common::Error::not_found("x"), StatusCode::NOT_FOUND),
            (common::Error::invalid_input("x"), StatusCode::BAD_REQUEST),
            (common::Error::timer("x"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), expected);
        }
    }

    #[test]
    fn test_list_params_to_filter() {
        let params = ListParams {
            tags: Some("a, b".into()),
            require_healthy: Some(true),
            ..Default::default()
        };
        let filter = ServiceFilter::from(params);
        assert_eq!(filter.tags, ["a", "b"]);
        assert!(filter.require_healthy);
        assert!(filter.include_metadata);
        assert_eq!(filter.sort_order, SortOrder::Asc);
    }
}
