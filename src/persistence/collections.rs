use std::sync::Arc;

use aws_sdk_dynamodb::types::{AttributeValue, Delete, Put, ReturnValue, TransactWriteItem};
use aws_sdk_dynamodb::Client;
use tracing::warn;

use crate::api::AppError;
use crate::collection::model::{Collection, CollectionEnv, CollectionRequest};
use crate::persistence::repo::{internal, Table};

const MAX_TRANSACTION_ITEMS: usize = 100;

pub struct CollectionOperations {
    pub(crate) client: Arc<Client>,
}

struct CollectionTable();

impl Table<Collection> for CollectionTable {
    fn table_name() -> &'static str {
        "runboard_collections"
    }

    fn partition_key_name() -> &'static str {
        "id"
    }

    fn partition_key_from_entity(entity: &Collection) -> String {
        entity.id.clone()
    }
}

struct EnvTable();

impl Table<CollectionEnv> for EnvTable {
    fn table_name() -> &'static str {
        "runboard_envs"
    }

    fn partition_key_name() -> &'static str {
        "collectionId"
    }

    fn sort_key_name() -> Option<&'static str> {
        Some("id")
    }

    fn partition_key_from_entity(entity: &CollectionEnv) -> String {
        entity.collection_id.clone()
    }

    fn sort_key_from_entity(entity: &CollectionEnv) -> Option<String> {
        Some(entity.id.clone())
    }
}

struct RequestTable();

impl Table<CollectionRequest> for RequestTable {
    fn table_name() -> &'static str {
        "runboard_requests"
    }

    fn partition_key_name() -> &'static str {
        "collectionId"
    }

    fn sort_key_name() -> Option<&'static str> {
        Some("id")
    }

    fn partition_key_from_entity(entity: &CollectionRequest) -> String {
        entity.collection_id.clone()
    }

    fn sort_key_from_entity(entity: &CollectionRequest) -> Option<String> {
        Some(entity.id.clone())
    }
}

impl CollectionOperations {
    pub async fn create(&self, collection: Collection) -> Result<Collection, AppError> {
        CollectionTable::put_item(self.client.clone(), collection).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Collection>, AppError> {
        CollectionTable::get_item(self.client.clone(), id, None).await
    }

    pub async fn list(&self) -> Result<Vec<Collection>, AppError> {
        let mut collections = CollectionTable::scan_all_items(self.client.clone()).await?;
        collections.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(collections)
    }

    pub async fn create_env(&self, env: CollectionEnv) -> Result<CollectionEnv, AppError> {
        EnvTable::put_item(self.client.clone(), env).await
    }

    pub async fn get_env(
        &self,
        collection_id: &str,
        id: &str,
    ) -> Result<Option<CollectionEnv>, AppError> {
        EnvTable::get_item(self.client.clone(), collection_id, Some(id)).await
    }

    pub async fn list_envs(&self, collection_id: &str) -> Result<Vec<CollectionEnv>, AppError> {
        let mut envs = EnvTable::list_all_items(self.client.clone(), collection_id).await?;
        envs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(envs)
    }

    pub async fn list_requests(
        &self,
        collection_id: &str,
    ) -> Result<Vec<CollectionRequest>, AppError> {
        let mut requests = RequestTable::list_all_items(self.client.clone(), collection_id).await?;
        requests.sort_by(|a, b| a.path.cmp(&b.path).then_with(|| a.id.cmp(&b.id)));
        Ok(requests)
    }

    pub async fn add_requests(&self, requests: Vec<CollectionRequest>) -> Result<(), AppError> {
        let writes = requests
            .iter()
            .map(put_request)
            .collect::<Result<Vec<_>, AppError>>()?;
        self.transact(writes).await
    }

    /// Deletes the current requests and writes the new ones in one
    /// transaction. DynamoDB caps a transaction at 100 items; larger swaps
    /// are split and lose atomicity across chunks.
    pub async fn replace_requests(
        &self,
        collection_id: &str,
        requests: Vec<CollectionRequest>,
    ) -> Result<(), AppError> {
        let existing = self.list_requests(collection_id).await?;
        let mut writes = Vec::with_capacity(existing.len() + requests.len());
        for request in &existing {
            let delete = Delete::builder()
                .table_name(RequestTable::table_name())
                .set_key(Some(RequestTable::entity_key(request)))
                .build()
                .map_err(internal)?;
            writes.push(TransactWriteItem::builder().delete(delete).build());
        }
        for request in &requests {
            writes.push(put_request(request)?);
        }
        if writes.len() > MAX_TRANSACTION_ITEMS {
            warn!(
                collection_id,
                items = writes.len(),
                "request swap exceeds one transaction, writing in chunks"
            );
        }
        self.transact(writes).await
    }

    pub async fn set_critical(
        &self,
        collection_id: &str,
        request_id: &str,
        is_critical: bool,
    ) -> Result<Option<CollectionRequest>, AppError> {
        let result = RequestTable::update_builder(self.client.clone())
            .set_key(Some(RequestTable::unique_key(collection_id, Some(request_id))))
            .expression_attribute_names("#id", "id")
            .expression_attribute_names("#c", "isCritical")
            .expression_attribute_values(":c", AttributeValue::Bool(is_critical))
            .condition_expression("attribute_exists(#id)")
            .update_expression("SET #c = :c")
            .return_values(ReturnValue::AllNew)
            .send()
            .await;
        match result {
            Ok(output) => output.attributes.map(RequestTable::from_item).transpose(),
            Err(err) => {
                let conditional_failed = err
                    .as_service_error()
                    .map_or(false, |service| service.is_conditional_check_failed_exception());
                if conditional_failed {
                    Ok(None)
                } else {
                    Err(internal(err))
                }
            }
        }
    }

    async fn transact(&self, writes: Vec<TransactWriteItem>) -> Result<(), AppError> {
        for chunk in writes.chunks(MAX_TRANSACTION_ITEMS) {
            self.client
                .transact_write_items()
                .set_transact_items(Some(chunk.to_vec()))
                .send()
                .await
                .map_err(internal)?;
        }
        Ok(())
    }
}

fn put_request(request: &CollectionRequest) -> Result<TransactWriteItem, AppError> {
    let put = Put::builder()
        .table_name(RequestTable::table_name())
        .set_item(Some(RequestTable::to_item(request)?))
        .build()
        .map_err(internal)?;
    Ok(TransactWriteItem::builder().put(put).build())
}
