mod catalog;
mod config;
mod http;
mod metrics;
mod models;
mod pipeline;
mod screenshots;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    ApiError, AppResolution, ResolveMode, ResolveOptions, ResolveRequest, UrlsRequest,
    ValidateRequest, default_country,
};
use pipeline::{Pipeline, PipelineError, PipelineErrorKind};
use screenshots::{DedupReport, PatternReport, ValidationResult, patterns::FilterDecision};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "argus.api", "server crashed: {err:?}");
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;
    let state = AppState {
        pipeline: Pipeline::from_env(),
        openapi: Arc::new(load_openapi()),
        prometheus_handle,
    };
    let app = build_router(state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "argus.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
    openapi: Arc<serde_json::Value>,
    prometheus_handle: PrometheusHandle,
}

fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let screenshots = Router::new()
        .route("/resolve", post(resolve_screenshots))
        .route("/analyze", post(analyze_screenshots))
        .route("/deduplicate", post(deduplicate_screenshots))
        .route("/filter", post(filter_screenshots))
        .route("/validate", post(validate_screenshots))
        .route("/validation-cache", delete(clear_validation_cache));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .route("/apps/{id}/screenshots", get(app_screenshots))
        .nest("/screenshots", screenshots)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit_from_env()))
}

fn load_openapi() -> serde_json::Value {
    serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
        .unwrap_or_else(|_| json!({"openapi": "3.0.3"}))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
///
/// Returns a small JSON payload with `status` and `service`.
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "argus-api-rs",
    }))
}

async fn openapi_json(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json((*state.openapi).clone())
}

async fn swagger_ui() -> Response {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Argus API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], html).into_response()
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
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
        state.prometheus_handle.render(),
    )
        .into_response()
}

/// Resolve screenshots for a caller-supplied app record.
///
/// - Method: `POST`
/// - Path: `/screenshots/resolve`
/// - Body: `ResolveRequest`
/// - Response: `ExtractionResult` with the attempt transcript
async fn resolve_screenshots(
    State(state): State<AppState>,
    Json(payload): Json<ResolveRequest>,
) -> Result<Json<models::ExtractionResult>, AppError> {
    crate::metrics::inc_requests("/screenshots/resolve");
    let options = payload
        .options
        .unwrap_or_else(|| state.pipeline.default_options());
    let result = state
        .pipeline
        .resolve(&payload.record, &payload.subject_id, &payload.country, options)
        .await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
struct AppScreenshotsQuery {
    #[serde(default = "default_country")]
    country: String,
    #[serde(default)]
    force_refresh: bool,
    #[serde(default)]
    skip_validation: bool,
    max_retries: Option<u32>,
    #[serde(default)]
    mode: ResolveMode,
}

/// Look up an app in the primary source and resolve its screenshots.
///
/// - Method: `GET`
/// - Path: `/apps/{id}/screenshots`
/// - Query: `country`, `force_refresh`, `skip_validation`, `max_retries`,
///   `mode=chain|fill_missing`
async fn app_screenshots(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<AppScreenshotsQuery>,
) -> Result<Json<AppResolution>, AppError> {
    crate::metrics::inc_requests("/apps/{id}/screenshots");
    let defaults = state.pipeline.default_options();
    let options = ResolveOptions {
        force_refresh: query.force_refresh,
        skip_validation: query.skip_validation,
        max_retries: query.max_retries.unwrap_or(defaults.max_retries),
    };
    let resolution = state
        .pipeline
        .resolve_app(&id, &query.country, options, query.mode)
        .await?;
    Ok(Json(resolution))
}

async fn analyze_screenshots(
    State(state): State<AppState>,
    Json(payload): Json<UrlsRequest>,
) -> Result<Json<PatternReport>, AppError> {
    crate::metrics::inc_requests("/screenshots/analyze");
    Ok(Json(state.pipeline.analyze(&payload.urls, &payload.platform)?))
}

async fn deduplicate_screenshots(
    State(state): State<AppState>,
    Json(payload): Json<UrlsRequest>,
) -> Result<Json<DedupReport>, AppError> {
    crate::metrics::inc_requests("/screenshots/deduplicate");
    Ok(Json(
        state.pipeline.deduplicate(&payload.urls, &payload.platform)?,
    ))
}

#[derive(Debug, Serialize)]
struct FilterResponse {
    urls: Vec<String>,
    decision: FilterDecision,
}

async fn filter_screenshots(
    State(state): State<AppState>,
    Json(payload): Json<UrlsRequest>,
) -> Result<Json<FilterResponse>, AppError> {
    crate::metrics::inc_requests("/screenshots/filter");
    let outcome = state.pipeline.filter(&payload.urls, &payload.platform)?;
    Ok(Json(FilterResponse {
        decision: outcome.decision().clone(),
        urls: outcome.urls,
    }))
}

async fn validate_screenshots(
    State(state): State<AppState>,
    Json(payload): Json<ValidateRequest>,
) -> Result<Json<ValidationResult>, AppError> {
    crate::metrics::inc_requests("/screenshots/validate");
    let result = state
        .pipeline
        .validate(&payload.collections, &payload.subject_id, &payload.country)
        .await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
struct CacheKeyQuery {
    subject_id: Option<String>,
    country: Option<String>,
}

#[derive(Debug, Serialize)]
struct CacheClearResponse {
    cleared: usize,
    remaining: usize,
}

async fn clear_validation_cache(
    State(state): State<AppState>,
    Query(query): Query<CacheKeyQuery>,
) -> Result<Json<CacheClearResponse>, AppError> {
    crate::metrics::inc_requests("/screenshots/validation-cache");
    let cleared = match &query.subject_id {
        Some(subject_id) => {
            let country = query.country.clone().unwrap_or_else(default_country);
            state
                .pipeline
                .clear_validation_cache(Some((subject_id.as_str(), country.as_str())))
                .await?
        }
        None => state.pipeline.clear_validation_cache(None).await?,
    };
    Ok(Json(CacheClearResponse {
        cleared,
        remaining: state.pipeline.cached_validations().await,
    }))
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::NotFound => StatusCode::NOT_FOUND,
                    PipelineErrorKind::SourceUnavailable | PipelineErrorKind::ParseFailure => {
                        StatusCode::BAD_GATEWAY
                    }
                    PipelineErrorKind::ValidationFailure => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.detail().to_string()),
                };
                (status, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
