use axum::extract::multipart::Field;
use axum::extract::{Multipart, Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use crate::api::{ApiResponse, AppError, AppState, Created};
use crate::collection::model::{
    Collection, CollectionDetail, CollectionRequest, CreatedCollection, IndexResult,
    UpdateRequest, UploadCollection,
};
use crate::collection::parser::DocumentError;
use crate::collection::service::CollectionsQuery;
use crate::persistence::model::Page;

#[derive(Deserialize, Clone, Debug, Default)]
pub struct ReindexParams {
    pub replace: Option<bool>,
}

/// Multipart upload with a `collection` file and an optional `environment`
/// file, both JSON.
pub async fn upload_collection(
    State(app_state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Created<CreatedCollection>, AppError> {
    let mut collection = None;
    let mut environment = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::Validation(err.body_text()))?
    {
        match field.name() {
            Some("collection") => collection = Some(read_json(field, "collection").await?),
            Some("environment") => environment = Some(read_json(field, "env").await?),
            _ => {}
        }
    }
    let collection = collection
        .ok_or_else(|| AppError::Validation("collection file is required".to_string()))?;
    let created = app_state
        .collections
        .upload(UploadCollection {
            collection,
            environment,
        })
        .await?;
    Ok(Created(created))
}

async fn read_json(field: Field<'_>, document: &'static str) -> Result<Value, AppError> {
    let bytes = field
        .bytes()
        .await
        .map_err(|err| AppError::Validation(err.body_text()))?;
    serde_json::from_slice(&bytes).map_err(|_| DocumentError::InvalidJson(document).into())
}

pub async fn list_collections(
    State(app_state): State<AppState>,
    Query(params): Query<CollectionsQuery>,
) -> Result<ApiResponse<Page<Collection>>, AppError> {
    ApiResponse::from(app_state.collections.list(&params).await)
}

pub async fn get_collection(
    Path(id): Path<String>,
    State(app_state): State<AppState>,
) -> Result<ApiResponse<CollectionDetail>, AppError> {
    ApiResponse::from(app_state.collections.get(&id).await)
}

pub async fn list_requests(
    Path(id): Path<String>,
    State(app_state): State<AppState>,
) -> Result<ApiResponse<Vec<CollectionRequest>>, AppError> {
    ApiResponse::from(app_state.collections.list_requests(&id).await)
}

pub async fn reindex_collection(
    Path(id): Path<String>,
    State(app_state): State<AppState>,
    Query(params): Query<ReindexParams>,
) -> Result<ApiResponse<IndexResult>, AppError> {
    let replace = params.replace.unwrap_or(false);
    ApiResponse::from(app_state.collections.reindex(&id, replace).await)
}

pub async fn update_request(
    Path((id, request_id)): Path<(String, String)>,
    State(app_state): State<AppState>,
    Json(update): Json<UpdateRequest>,
) -> Result<ApiResponse<CollectionRequest>, AppError> {
    ApiResponse::from(
        app_state
            .collections
            .set_critical(&id, &request_id, update.is_critical)
            .await,
    )
}
