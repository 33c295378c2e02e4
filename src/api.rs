use std::sync::Arc;
use std::time::Instant;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tower_http::LatencyUnit;
use tracing::{error, info, Level};

use crate::collection::api::{
    get_collection, list_collections, list_requests, reindex_collection, update_request,
    upload_collection,
};
use crate::collection::parser::DocumentError;
use crate::collection::service::CollectionService;
use crate::config::{Config, StoreKind};
use crate::health::health;
use crate::persistence::memory::MemoryStore;
use crate::persistence::repo::DynamoRepository;
use crate::persistence::store::Store;
use crate::run::api::{cancel_run, create_run, get_run, list_assertions, list_runs, list_steps};
use crate::run::events::EventBus;
use crate::run::executor::{ExecutionContext, ExecutorSettings, RunExecutor};
use crate::run::service::RunService;
use crate::run::stream::{stream_run, LiveStreamGateway};
use crate::runner::http::HttpCollectionRunner;
use crate::runner::ExecutionAdapter;
use crate::storage::{LocalStorage, ObjectStore};

#[derive(Clone)]
pub struct AppState {
    pub collections: Arc<CollectionService>,
    pub runs: Arc<RunService>,
    pub gateway: Arc<LiveStreamGateway>,
    pub started_at: Instant,
}

pub async fn build_api(config: &Config) -> Router {
    let store: Arc<dyn Store> = match config.store {
        StoreKind::Memory => Arc::new(MemoryStore::new()),
        StoreKind::Dynamodb => Arc::new(DynamoRepository::new().await),
    };
    let storage: Arc<dyn ObjectStore> = Arc::new(LocalStorage::new(&config.upload_dir));
    info!(store = ?config.store, upload_dir = %config.upload_dir.display(), "building api");

    let app_state = build_state(
        store,
        storage,
        Arc::new(HttpCollectionRunner::new()),
        ExecutorSettings {
            p95_sla_ms: config.p95_sla_ms,
        },
    );
    build_router(app_state, config.max_upload_mb * 1024 * 1024)
}

/// Wires the services together and starts the run worker.
pub fn build_state(
    store: Arc<dyn Store>,
    storage: Arc<dyn ObjectStore>,
    adapter: Arc<dyn ExecutionAdapter>,
    settings: ExecutorSettings,
) -> AppState {
    let bus = Arc::new(EventBus::new());
    let executor = RunExecutor::new(ExecutionContext::new(
        store.clone(),
        storage.clone(),
        bus.clone(),
        adapter,
        settings,
    ));
    executor.clone().start();

    AppState {
        collections: Arc::new(CollectionService::new(store.clone(), storage)),
        runs: Arc::new(RunService::new(store.clone(), executor)),
        gateway: Arc::new(LiveStreamGateway::new(bus, store)),
        started_at: Instant::now(),
    }
}

pub fn build_router(app_state: AppState, body_limit: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/collections", get(list_collections).post(upload_collection))
        .route("/api/collections/:id", get(get_collection))
        .route("/api/collections/:id/requests", get(list_requests))
        .route("/api/collections/:id/requests/:request_id", patch(update_request))
        .route("/api/collections/:id/reindex", post(reindex_collection))
        .route("/api/collections/:id/run", post(create_run))
        .route("/api/runs", get(list_runs))
        .route("/api/runs/:id", get(get_run))
        .route("/api/runs/:id/steps", get(list_steps))
        .route("/api/runs/:id/assertions", get(list_assertions))
        .route("/api/runs/:id/cancel", post(cancel_run))
        .route("/api/runs/:id/stream", get(stream_run))
        .layer(cors)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(
                    DefaultOnResponse::new()
                        .level(Level::INFO)
                        .latency_unit(LatencyUnit::Micros),
                ),
        )
        .with_state(app_state)
}

pub struct ApiResponse<T>(pub T);

impl<T> ApiResponse<T> {
    pub fn from(result: Result<T, AppError>) -> Result<ApiResponse<T>, AppError> {
        result.map(ApiResponse)
    }
}

impl<T> IntoResponse for ApiResponse<T>
where
    T: Serialize,
{
    fn into_response(self) -> Response {
        json_response(StatusCode::OK, &self.0)
    }
}

/// Same as [`ApiResponse`] but answers `201 Created`.
pub struct Created<T>(pub T);

impl<T> IntoResponse for Created<T>
where
    T: Serialize,
{
    fn into_response(self) -> Response {
        json_response(StatusCode::CREATED, &self.0)
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response {
    match serde_json::to_vec(body) {
        Ok(json) => (status, [(header::CONTENT_TYPE, "application/json")], json).into_response(),
        Err(err) => {
            error!("failed to serialize response: {}", err);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to serialize response").into_response()
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotCancellable(String),
    #[error("{0}")]
    Processing(String),
    #[error("{0}")]
    Internal(String),
}

impl From<DocumentError> for AppError {
    fn from(err: DocumentError) -> Self {
        AppError::Validation(err.to_string())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ErrorBody {
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            AppError::Validation(message) => (StatusCode::BAD_REQUEST, message),
            AppError::NotCancellable(message) => (StatusCode::CONFLICT, message),
            AppError::Processing(message) => (StatusCode::UNPROCESSABLE_ENTITY, message),
            AppError::Internal(message) => {
                error!("{}", message);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorBody { message })).into_response()
    }
}
