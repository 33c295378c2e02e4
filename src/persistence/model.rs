use std::collections::HashMap;

use aws_sdk_dynamodb::types::AttributeValue;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::api::AppError;
use crate::run::model::RunStatus;

/// One page of an in-order listing. `total` counts every match before
/// `limit`/`offset` were applied.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

impl<T> Page<T> {
    pub fn from_vec(items: Vec<T>, limit: usize, offset: usize) -> Self {
        let total = items.len();
        let items = items.into_iter().skip(offset).take(limit).collect();
        Page {
            items,
            total,
            limit,
            offset,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RunFilter {
    pub collection_id: Option<String>,
    pub status: Option<RunStatus>,
}

impl RunFilter {
    pub fn matches(&self, collection_id: &str, status: RunStatus) -> bool {
        self.collection_id
            .as_deref()
            .map_or(true, |expected| expected == collection_id)
            && self.status.map_or(true, |expected| expected == status)
    }
}

/// DynamoDB `LastEvaluatedKey` carried between query pages as a JSON string.
pub struct PageKey {
    keys: HashMap<String, String>,
}

impl PageKey {
    pub fn from_attribute_values(values: HashMap<String, AttributeValue>) -> Self {
        let keys = values
            .into_iter()
            .map(|(k, v)| {
                let v = v.as_s().map_or(String::new(), |v| v.to_string());
                (k, v)
            })
            .collect();
        Self { keys }
    }

    pub fn to_attribute_values(&self) -> HashMap<String, AttributeValue> {
        self.keys
            .iter()
            .map(|(k, v)| (k.to_string(), AttributeValue::S(v.to_string())))
            .collect()
    }

    pub fn to_next_page_key(&self) -> Result<String, AppError> {
        serde_json::to_string(&self.keys).map_err(|err| AppError::Internal(err.to_string()))
    }

    pub fn from_next_page_key(keys: &str) -> Result<Self, AppError> {
        serde_json::from_str(keys)
            .map(|keys| Self { keys })
            .map_err(|err| AppError::Internal(format!("invalid page key: {err}")))
    }
}

#[derive(Clone, Serialize, Debug)]
pub struct QueryResult<T>
where
    T: DeserializeOwned + Serialize + Clone,
{
    pub items: Vec<T>,
    pub next_page_key: Option<String>,
}
