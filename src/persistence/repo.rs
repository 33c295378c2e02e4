use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::config::http::HttpResponse;
use aws_sdk_dynamodb::error::SdkError;
use aws_sdk_dynamodb::operation::query::builders::QueryFluentBuilder;
use aws_sdk_dynamodb::operation::query::{QueryError, QueryOutput};
use aws_sdk_dynamodb::operation::update_item::builders::UpdateItemFluentBuilder;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_dynamo::aws_sdk_dynamodb_1::{from_item, to_item};

use crate::api::AppError;
use crate::collection::model::{Collection, CollectionEnv, CollectionRequest};
use crate::persistence::collections::CollectionOperations;
use crate::persistence::model::{PageKey, QueryResult, RunFilter};
use crate::persistence::runs::RunOperations;
use crate::persistence::store::Store;
use crate::run::model::{Run, RunAssertion, RunStep};

pub(crate) type Item = HashMap<String, AttributeValue>;

pub(crate) fn internal<E: std::fmt::Display>(err: E) -> AppError {
    AppError::Internal(err.to_string())
}

/// One DynamoDB table holding one entity type. Items are the serde
/// representation of `T` plus the key attributes.
pub(crate) trait Table<T>
where
    T: DeserializeOwned + Serialize + Clone + Send + Sync,
{
    fn table_name() -> &'static str;
    fn partition_key_name() -> &'static str;

    fn sort_key_name() -> Option<&'static str> {
        None
    }

    fn partition_key_from_entity(entity: &T) -> String;

    fn sort_key_from_entity(_entity: &T) -> Option<String> {
        None
    }

    fn unique_key(partition_key: &str, sort_key: Option<&str>) -> Item {
        let mut key = HashMap::from([(
            Self::partition_key_name().to_string(),
            AttributeValue::S(partition_key.to_string()),
        )]);
        if let (Some(name), Some(value)) = (Self::sort_key_name(), sort_key) {
            key.insert(name.to_string(), AttributeValue::S(value.to_string()));
        }
        key
    }

    fn entity_key(entity: &T) -> Item {
        Self::unique_key(
            &Self::partition_key_from_entity(entity),
            Self::sort_key_from_entity(entity).as_deref(),
        )
    }

    fn to_item(entity: &T) -> Result<Item, AppError> {
        let mut item: Item = to_item(entity).map_err(internal)?;
        item.extend(Self::entity_key(entity));
        Ok(item)
    }

    fn from_item(item: Item) -> Result<T, AppError> {
        from_item(item).map_err(internal)
    }

    async fn get_item(
        client: Arc<Client>,
        partition_key: &str,
        sort_key: Option<&str>,
    ) -> Result<Option<T>, AppError> {
        let output = client
            .get_item()
            .table_name(Self::table_name())
            .set_key(Some(Self::unique_key(partition_key, sort_key)))
            .consistent_read(true)
            .send()
            .await
            .map_err(internal)?;
        output.item.map(Self::from_item).transpose()
    }

    async fn put_item(client: Arc<Client>, entity: T) -> Result<T, AppError> {
        client
            .put_item()
            .table_name(Self::table_name())
            .set_item(Some(Self::to_item(&entity)?))
            .send()
            .await
            .map_err(internal)?;
        Ok(entity)
    }

    fn query_builder(client: Arc<Client>) -> QueryFluentBuilder {
        client.query().table_name(Self::table_name())
    }

    fn update_builder(client: Arc<Client>) -> UpdateItemFluentBuilder {
        client.update_item().table_name(Self::table_name())
    }

    fn from_query_result(
        result: Result<QueryOutput, SdkError<QueryError, HttpResponse>>,
    ) -> Result<QueryResult<T>, AppError> {
        let output = result.map_err(internal)?;
        let items = output
            .items
            .unwrap_or_default()
            .into_iter()
            .map(Self::from_item)
            .collect::<Result<Vec<T>, AppError>>()?;
        let next_page_key = output
            .last_evaluated_key
            .map(|last_key| PageKey::from_attribute_values(last_key).to_next_page_key())
            .transpose()?;
        Ok(QueryResult {
            items,
            next_page_key,
        })
    }

    async fn list_items(
        client: Arc<Client>,
        partition_key: &str,
        next_page_key: Option<String>,
    ) -> Result<QueryResult<T>, AppError> {
        let start_key = next_page_key
            .map(|next| PageKey::from_next_page_key(&next).map(|key| key.to_attribute_values()))
            .transpose()?;
        let result = Self::query_builder(client)
            .expression_attribute_names("#pk", Self::partition_key_name())
            .expression_attribute_values(":pk", AttributeValue::S(partition_key.to_string()))
            .key_condition_expression("#pk = :pk")
            .consistent_read(true)
            .set_exclusive_start_key(start_key)
            .send()
            .await;
        Self::from_query_result(result)
    }

    async fn list_all_items(client: Arc<Client>, partition_key: &str) -> Result<Vec<T>, AppError> {
        let mut items: Vec<T> = vec![];
        let mut next_page_key = None;
        loop {
            let page = Self::list_items(client.clone(), partition_key, next_page_key).await?;
            items.extend(page.items);
            match page.next_page_key {
                Some(key) => next_page_key = Some(key),
                None => break,
            }
        }
        Ok(items)
    }

    async fn scan_all_items(client: Arc<Client>) -> Result<Vec<T>, AppError> {
        let mut items: Vec<T> = vec![];
        let mut start_key: Option<Item> = None;
        loop {
            let output = client
                .scan()
                .table_name(Self::table_name())
                .consistent_read(true)
                .set_exclusive_start_key(start_key)
                .send()
                .await
                .map_err(internal)?;
            for item in output.items.unwrap_or_default() {
                items.push(Self::from_item(item)?);
            }
            match output.last_evaluated_key {
                Some(key) if !key.is_empty() => start_key = Some(key),
                _ => break,
            }
        }
        Ok(items)
    }
}

/// DynamoDB-backed [`Store`], one table per entity.
#[derive(Clone)]
pub struct DynamoRepository {
    client: Arc<Client>,
}

impl DynamoRepository {
    pub async fn new() -> Self {
        let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
        let client = Client::new(&config);
        DynamoRepository {
            client: Arc::new(client),
        }
    }

    pub fn collections(&self) -> CollectionOperations {
        CollectionOperations {
            client: Arc::clone(&self.client),
        }
    }

    pub fn runs(&self) -> RunOperations {
        RunOperations {
            client: Arc::clone(&self.client),
        }
    }
}

#[async_trait]
impl Store for DynamoRepository {
    async fn create_collection(&self, collection: Collection) -> Result<Collection, AppError> {
        self.collections().create(collection).await
    }

    async fn get_collection(&self, id: &str) -> Result<Option<Collection>, AppError> {
        self.collections().get(id).await
    }

    async fn list_collections(&self) -> Result<Vec<Collection>, AppError> {
        self.collections().list().await
    }

    async fn create_env(&self, env: CollectionEnv) -> Result<CollectionEnv, AppError> {
        self.collections().create_env(env).await
    }

    async fn get_env(
        &self,
        collection_id: &str,
        id: &str,
    ) -> Result<Option<CollectionEnv>, AppError> {
        self.collections().get_env(collection_id, id).await
    }

    async fn list_envs(&self, collection_id: &str) -> Result<Vec<CollectionEnv>, AppError> {
        self.collections().list_envs(collection_id).await
    }

    async fn replace_requests(
        &self,
        collection_id: &str,
        requests: Vec<CollectionRequest>,
    ) -> Result<(), AppError> {
        self.collections()
            .replace_requests(collection_id, requests)
            .await
    }

    async fn add_requests(&self, requests: Vec<CollectionRequest>) -> Result<(), AppError> {
        self.collections().add_requests(requests).await
    }

    async fn list_requests(&self, collection_id: &str) -> Result<Vec<CollectionRequest>, AppError> {
        self.collections().list_requests(collection_id).await
    }

    async fn set_request_critical(
        &self,
        collection_id: &str,
        request_id: &str,
        is_critical: bool,
    ) -> Result<Option<CollectionRequest>, AppError> {
        self.collections()
            .set_critical(collection_id, request_id, is_critical)
            .await
    }

    async fn put_run(&self, run: Run) -> Result<Run, AppError> {
        self.runs().put(run).await
    }

    async fn get_run(&self, id: &str) -> Result<Option<Run>, AppError> {
        self.runs().get(id).await
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, AppError> {
        self.runs().list(filter).await
    }

    async fn create_step(&self, step: RunStep) -> Result<RunStep, AppError> {
        self.runs().create_step(step).await
    }

    async fn mark_step_failed(&self, run_id: &str, step_id: &str) -> Result<(), AppError> {
        self.runs().mark_step_failed(run_id, step_id).await
    }

    async fn list_steps(&self, run_id: &str) -> Result<Vec<RunStep>, AppError> {
        self.runs().list_steps(run_id).await
    }

    async fn create_assertion(&self, assertion: RunAssertion) -> Result<RunAssertion, AppError> {
        self.runs().create_assertion(assertion).await
    }

    async fn list_assertions(&self, run_id: &str) -> Result<Vec<RunAssertion>, AppError> {
        self.runs().list_assertions(run_id).await
    }
}
