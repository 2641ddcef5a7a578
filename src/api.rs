use crate::{
    broker::{Broker, BrokerError},
    metrics,
    models::{ApiError, PageMeta, Pagination, Platform, PlatformState, Product},
    picture_cache::{CacheError, PictureCache},
    storage::{Storage, StorageError},
};
use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get},
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{error, info, info_span};

pub const MAX_PAGE_SIZE: i64 = 100;
const DEFAULT_PAGE_SIZE: i64 = 10;

#[derive(Clone)]
pub struct AppState {
    pub broker: Broker,
    pub storage: Storage,
    pub cache: Option<PictureCache>,
    pub prometheus: PrometheusHandle,
    pub metrics_key: Option<String>,
}

pub fn router(state: AppState, body_limit: usize) -> Router {
    let products = Router::new()
        .route("/products", get(search_products).post(add_product))
        .route("/products/{id}", delete(delete_product))
        .route("/products/{id}/platforms", get(product_platforms))
        .route("/products/{id}/picture", get(product_picture));

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .nest("/api/v1", products)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    info_span!(
                        "request",
                        method = %request.method(),
                        uri = %request.uri(),
                        request_id = %request_id,
                    )
                }))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(cors)
                .layer(DefaultBodyLimit::max(body_limit)),
        )
}

/// Liveness plus a storage round-trip.
///
/// - Method: `GET`
/// - Path: `/health`
async fn health(State(state): State<AppState>) -> Response {
    match state.storage.ping().await {
        Ok(()) => Json(json!({
            "status": "ok",
            "service": env!("CARGO_PKG_NAME"),
            "platforms": state.broker.platforms(),
        }))
        .into_response(),
        Err(err) => {
            error!(target = "relay.api", error = %err, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "degraded", "service": env!("CARGO_PKG_NAME")})),
            )
                .into_response()
        }
    }
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(secret) = &state.metrics_key {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus.render(),
    )
        .into_response()
}

/// Store a product and queue it for every requested platform.
///
/// - Method: `POST`
/// - Path: `/api/v1/products`
/// - Body: `Product`
/// - Response: `201 {"id": <id>}` once the row is durable
async fn add_product(
    State(state): State<AppState>,
    Json(product): Json<Product>,
) -> Result<Response, AppError> {
    metrics::inc_requests("/api/v1/products:post");
    let id = state.broker.enqueue(product).await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))).into_response())
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    #[serde(default)]
    search: String,
    page: Option<i64>,
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct SearchResponse {
    data: Vec<Product>,
    meta: PageMeta,
}

/// Title search over published products.
///
/// - Method: `GET`
/// - Path: `/api/v1/products?search=<text>&page=1&limit=10`
/// - Response: `{data, meta}`, or `204` when nothing matches
async fn search_products(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Response, AppError> {
    metrics::inc_requests("/api/v1/products:get");
    let query = params.search.trim();
    if query.is_empty() {
        return Err(AppError::BadRequest("search must not be empty".into()));
    }
    let pagination = Pagination {
        page: params.page.unwrap_or(1),
        limit: params.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE),
    };
    if pagination.page < 1 || pagination.limit < 1 {
        return Err(AppError::BadRequest("page and limit must be positive".into()));
    }
    let offset = pagination
        .offset()
        .ok_or_else(|| AppError::BadRequest(format!("page {} is out of range", pagination.page)))?;

    let page = state
        .storage
        .search(query, offset, pagination.limit)
        .await?;
    if page.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    info!(target = "relay.api", query, total = page.total, "search served");
    Ok(Json(SearchResponse {
        meta: PageMeta::new(pagination.limit, offset, page.total),
        data: page.products,
    })
    .into_response())
}

#[derive(Debug, Deserialize)]
struct DeleteParams {
    platform: Option<String>,
}

/// Queue retraction from every platform the product is live on.
///
/// - Method: `DELETE`
/// - Path: `/api/v1/products/{id}?platform=vk`
/// - Response: `202 {"queued": [...]}`
async fn delete_product(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<DeleteParams>,
) -> Result<Response, AppError> {
    metrics::inc_requests("/api/v1/products/{id}:delete");
    let only = match params.platform.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            raw.parse::<Platform>()
                .map_err(|err| AppError::BadRequest(err.to_string()))?,
        ),
    };
    let queued = state.broker.enqueue_delete(id, only).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "id": id, "queued": queued }))).into_response())
}

async fn product_platforms(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<BTreeMap<&'static str, PlatformState>>, AppError> {
    let mut states = BTreeMap::new();
    for platform in Platform::ALL {
        states.insert(platform.as_str(), state.storage.platform_state(id, platform).await?);
    }
    Ok(Json(states))
}

async fn product_picture(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response, AppError> {
    let Some(cache) = &state.cache else {
        return Err(AppError::Cache(CacheError::NotFound(id)));
    };
    let body = cache.load(id).await?;
    Ok(([(header::CONTENT_TYPE, "image/jpeg")], body).into_response())
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Broker(BrokerError),
    Storage(StorageError),
    Cache(CacheError),
}

impl From<BrokerError> for AppError {
    fn from(value: BrokerError) -> Self {
        Self::Broker(value)
    }
}

impl From<StorageError> for AppError {
    fn from(value: StorageError) -> Self {
        Self::Storage(value)
    }
}

impl From<CacheError> for AppError {
    fn from(value: CacheError) -> Self {
        Self::Cache(value)
    }
}

fn storage_status(err: &StorageError) -> (StatusCode, &'static str) {
    match err {
        StorageError::Validation(_) => (StatusCode::BAD_REQUEST, "invalid_product"),
        StorageError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        StorageError::DuplicateMedia(_) | StorageError::DuplicateExternalId { .. } => {
            (StatusCode::CONFLICT, "duplicate")
        }
        StorageError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage"),
    }
}

impl AppError {
    fn status(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            AppError::Broker(err) => match err {
                BrokerError::Validation(_) => (StatusCode::BAD_REQUEST, "invalid_product"),
                BrokerError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                BrokerError::QueueFull(_) => (StatusCode::SERVICE_UNAVAILABLE, "queue_full"),
                BrokerError::QueueClosed(_) | BrokerError::PlatformDisabled(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "platform_unavailable")
                }
                BrokerError::Storage(err) => storage_status(err),
            },
            AppError::Storage(err) => storage_status(err),
            AppError::Cache(CacheError::NotFound(_)) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::Cache(_) => (StatusCode::INTERNAL_SERVER_ERROR, "cache"),
        }
    }

    fn detail(&self) -> String {
        match self {
            AppError::BadRequest(detail) => detail.clone(),
            AppError::Broker(err) => err.to_string(),
            AppError::Storage(err) => err.to_string(),
            AppError::Cache(err) => err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status();
        let detail = if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            error!(target = "relay.api", error = %self.detail(), "request failed");
            None
        } else {
            Some(self.detail())
        };
        let payload = ApiError {
            error: code.to_string(),
            detail,
        };
        (status, Json(payload)).into_response()
    }
}
