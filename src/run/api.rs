use axum::extract::{Path, Query, State};
use axum::Json;

use crate::api::{ApiResponse, AppError, AppState, Created};
use crate::persistence::model::Page;
use crate::run::model::{CancelledRun, CreateRunRequest, CreatedRun, Run, RunAssertion, RunStep};
use crate::run::service::{ListAssertionsQuery, ListRunsQuery, ListStepsQuery};

pub async fn create_run(
    Path(collection_id): Path<String>,
    State(app_state): State<AppState>,
    Json(request): Json<CreateRunRequest>,
) -> Result<Created<CreatedRun>, AppError> {
    let created = app_state.runs.create(&collection_id, request).await?;
    Ok(Created(created))
}

pub async fn list_runs(
    State(app_state): State<AppState>,
    Query(params): Query<ListRunsQuery>,
) -> Result<ApiResponse<Page<Run>>, AppError> {
    ApiResponse::from(app_state.runs.list(&params).await)
}

pub async fn get_run(
    Path(id): Path<String>,
    State(app_state): State<AppState>,
) -> Result<ApiResponse<Run>, AppError> {
    ApiResponse::from(app_state.runs.get(&id).await)
}

pub async fn list_steps(
    Path(id): Path<String>,
    State(app_state): State<AppState>,
    Query(params): Query<ListStepsQuery>,
) -> Result<ApiResponse<Page<RunStep>>, AppError> {
    ApiResponse::from(app_state.runs.list_steps(&id, &params).await)
}

pub async fn list_assertions(
    Path(id): Path<String>,
    State(app_state): State<AppState>,
    Query(params): Query<ListAssertionsQuery>,
) -> Result<ApiResponse<Page<RunAssertion>>, AppError> {
    ApiResponse::from(app_state.runs.list_assertions(&id, &params).await)
}

pub async fn cancel_run(
    Path(id): Path<String>,
    State(app_state): State<AppState>,
) -> Result<ApiResponse<CancelledRun>, AppError> {
    ApiResponse::from(app_state.runs.cancel(&id).await)
}
