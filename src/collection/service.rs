use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

use crate::api::AppError;
use crate::collection::model::{
    Collection, CollectionDetail, CollectionEnv, CollectionRequest, CreatedCollection,
    IndexResult, UploadCollection,
};
use crate::collection::parser::{
    index_requests, parse_collection, parse_collection_bytes, parse_environment, ExecutableItem,
};
use crate::persistence::model::Page;
use crate::persistence::store::Store;
use crate::storage::ObjectStore;

const COLLECTION_BUCKET: &str = "collections";
const ENV_BUCKET: &str = "envs";
const DEFAULT_LIMIT: usize = 20;
const MAX_LIMIT: usize = 100;

#[derive(Deserialize, Clone, Debug, Default)]
pub struct CollectionsQuery {
    pub q: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

pub struct CollectionService {
    store: Arc<dyn Store>,
    storage: Arc<dyn ObjectStore>,
}

impl CollectionService {
    pub fn new(store: Arc<dyn Store>, storage: Arc<dyn ObjectStore>) -> Self {
        CollectionService { store, storage }
    }

    /// Validates and stores the documents, then indexes the requests.
    pub async fn upload(&self, upload: UploadCollection) -> Result<CreatedCollection, AppError> {
        let collection_bytes = serde_json::to_vec(&upload.collection)
            .map_err(|err| AppError::Internal(err.to_string()))?;
        let document = parse_collection(upload.collection)?;
        let environment = match upload.environment {
            Some(value) => {
                let bytes =
                    serde_json::to_vec(&value).map_err(|err| AppError::Internal(err.to_string()))?;
                Some((parse_environment(value)?, bytes))
            }
            None => None,
        };

        let meta = document.meta();
        let collection_id = uuid::Uuid::new_v4().to_string();
        let file_uri = self
            .storage
            .put(
                COLLECTION_BUCKET,
                &format!("{collection_id}.collection.json"),
                collection_bytes,
            )
            .await?;
        let collection = self
            .store
            .create_collection(
                Collection::builder()
                    .id(collection_id.clone())
                    .name(meta.name)
                    .maybe_version(meta.version)
                    .maybe_description(meta.description)
                    .file_uri(file_uri)
                    .build(),
            )
            .await?;

        if let Some((env_document, bytes)) = environment {
            let env_id = uuid::Uuid::new_v4().to_string();
            let file_uri = self
                .storage
                .put(ENV_BUCKET, &format!("{env_id}.env.json"), bytes)
                .await?;
            let is_default = self.store.list_envs(&collection.id).await?.is_empty();
            self.store
                .create_env(
                    CollectionEnv::builder()
                        .id(env_id)
                        .collection_id(collection.id.clone())
                        .name(env_document.name)
                        .file_uri(file_uri)
                        .is_default(is_default)
                        .build(),
                )
                .await?;
        }

        let requests = to_requests(&collection.id, index_requests(&document));
        let indexed = requests.len();
        self.store.replace_requests(&collection.id, requests).await?;
        info!(collection_id = %collection.id, name = %collection.name, indexed, "collection uploaded");
        Ok(CreatedCollection { collection_id })
    }

    pub async fn list(&self, query: &CollectionsQuery) -> Result<Page<Collection>, AppError> {
        let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
        if !(1..=MAX_LIMIT).contains(&limit) {
            return Err(AppError::Validation(format!(
                "limit must be between 1 and {MAX_LIMIT}"
            )));
        }
        let needle = query
            .q
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_lowercase);
        let collections: Vec<Collection> = self
            .store
            .list_collections()
            .await?
            .into_iter()
            .filter(|collection| {
                needle
                    .as_ref()
                    .map_or(true, |needle| collection.name.to_lowercase().contains(needle))
            })
            .collect();
        Ok(Page::from_vec(collections, limit, query.offset.unwrap_or(0)))
    }

    pub async fn get(&self, id: &str) -> Result<CollectionDetail, AppError> {
        let collection = self.require(id).await?;
        let envs = self.store.list_envs(id).await?;
        let request_count = self.store.list_requests(id).await?.len();
        Ok(CollectionDetail {
            collection,
            envs,
            request_count,
        })
    }

    pub async fn list_requests(&self, id: &str) -> Result<Vec<CollectionRequest>, AppError> {
        self.require(id).await?;
        self.store.list_requests(id).await
    }

    /// Re-reads the stored document. `replace` swaps every request for
    /// fresh ones, otherwise only paths not indexed yet are added.
    pub async fn reindex(&self, id: &str, replace: bool) -> Result<IndexResult, AppError> {
        let collection = self.require(id).await?;
        let bytes = self.storage.get(&collection.file_uri).await?;
        let document = parse_collection_bytes(&bytes)
            .map_err(|err| AppError::Processing(format!("stored collection is unreadable: {err}")))?;
        let items = index_requests(&document);

        let indexed = if replace {
            let requests = to_requests(id, items);
            let indexed = requests.len();
            self.store.replace_requests(id, requests).await?;
            indexed
        } else {
            let known: HashSet<String> = self
                .store
                .list_requests(id)
                .await?
                .into_iter()
                .map(|request| request.path)
                .collect();
            let missing: Vec<ExecutableItem> = items
                .into_iter()
                .filter(|item| !known.contains(&item.path))
                .collect();
            let requests = to_requests(id, missing);
            let indexed = requests.len();
            if indexed > 0 {
                self.store.add_requests(requests).await?;
            }
            indexed
        };
        info!(collection_id = id, indexed, replace, "collection reindexed");
        Ok(IndexResult {
            collection_id: id.to_string(),
            indexed,
            replaced: replace,
        })
    }

    pub async fn set_critical(
        &self,
        id: &str,
        request_id: &str,
        is_critical: bool,
    ) -> Result<CollectionRequest, AppError> {
        self.require(id).await?;
        self.store
            .set_request_critical(id, request_id, is_critical)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("request {request_id} not found")))
    }

    async fn require(&self, id: &str) -> Result<Collection, AppError> {
        self.store
            .get_collection(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("collection {id} not found")))
    }
}

fn to_requests(collection_id: &str, items: Vec<ExecutableItem>) -> Vec<CollectionRequest> {
    items
        .into_iter()
        .map(|item| {
            CollectionRequest::builder()
                .collection_id(collection_id.to_string())
                .name(item.name)
                .method(item.method)
                .url(item.url)
                .path(item.path)
                .build()
        })
        .collect()
}
