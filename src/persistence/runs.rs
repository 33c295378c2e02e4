use std::sync::Arc;

use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client;

use crate::api::AppError;
use crate::persistence::model::RunFilter;
use crate::persistence::repo::{internal, Table};
use crate::persistence::store::{sort_assertions, sort_runs, sort_steps};
use crate::run::model::{Run, RunAssertion, RunStep};

pub struct RunOperations {
    pub(crate) client: Arc<Client>,
}

struct RunTable();

impl Table<Run> for RunTable {
    fn table_name() -> &'static str {
        "runboard_runs"
    }

    fn partition_key_name() -> &'static str {
        "id"
    }

    fn partition_key_from_entity(entity: &Run) -> String {
        entity.id.clone()
    }
}

struct StepTable();

impl Table<RunStep> for StepTable {
    fn table_name() -> &'static str {
        "runboard_steps"
    }

    fn partition_key_name() -> &'static str {
        "runId"
    }

    fn sort_key_name() -> Option<&'static str> {
        Some("id")
    }

    fn partition_key_from_entity(entity: &RunStep) -> String {
        entity.run_id.clone()
    }

    fn sort_key_from_entity(entity: &RunStep) -> Option<String> {
        Some(entity.id.clone())
    }
}

struct AssertionTable();

impl Table<RunAssertion> for AssertionTable {
    fn table_name() -> &'static str {
        "runboard_assertions"
    }

    fn partition_key_name() -> &'static str {
        "runId"
    }

    fn sort_key_name() -> Option<&'static str> {
        Some("id")
    }

    fn partition_key_from_entity(entity: &RunAssertion) -> String {
        entity.run_id.clone()
    }

    fn sort_key_from_entity(entity: &RunAssertion) -> Option<String> {
        Some(entity.id.clone())
    }
}

impl RunOperations {
    pub async fn put(&self, run: Run) -> Result<Run, AppError> {
        RunTable::put_item(self.client.clone(), run).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Run>, AppError> {
        RunTable::get_item(self.client.clone(), id, None).await
    }

    /// Runs have no natural partition to query by, so listing scans and
    /// filters client side.
    pub async fn list(&self, filter: &RunFilter) -> Result<Vec<Run>, AppError> {
        let mut runs: Vec<Run> = RunTable::scan_all_items(self.client.clone())
            .await?
            .into_iter()
            .filter(|run| filter.matches(&run.collection_id, run.status))
            .collect();
        sort_runs(&mut runs);
        Ok(runs)
    }

    pub async fn create_step(&self, step: RunStep) -> Result<RunStep, AppError> {
        StepTable::put_item(self.client.clone(), step).await
    }

    pub async fn mark_step_failed(&self, run_id: &str, step_id: &str) -> Result<(), AppError> {
        StepTable::update_builder(self.client.clone())
            .set_key(Some(StepTable::unique_key(run_id, Some(step_id))))
            .expression_attribute_names("#id", "id")
            .expression_attribute_names("#s", "status")
            .expression_attribute_values(":s", AttributeValue::S("fail".to_string()))
            .condition_expression("attribute_exists(#id)")
            .update_expression("SET #s = :s")
            .send()
            .await
            .map_err(internal)?;
        Ok(())
    }

    pub async fn list_steps(&self, run_id: &str) -> Result<Vec<RunStep>, AppError> {
        let mut steps = StepTable::list_all_items(self.client.clone(), run_id).await?;
        sort_steps(&mut steps);
        Ok(steps)
    }

    pub async fn create_assertion(&self, assertion: RunAssertion) -> Result<RunAssertion, AppError> {
        AssertionTable::put_item(self.client.clone(), assertion).await
    }

    pub async fn list_assertions(&self, run_id: &str) -> Result<Vec<RunAssertion>, AppError> {
        let mut assertions = AssertionTable::list_all_items(self.client.clone(), run_id).await?;
        sort_assertions(&mut assertions);
        Ok(assertions)
    }
}
