use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::api::AppError;
use crate::collection::model::{Collection, CollectionEnv, CollectionRequest};
use crate::persistence::model::RunFilter;
use crate::persistence::store::{sort_assertions, sort_runs, sort_steps, Store};
use crate::run::model::{Run, RunAssertion, RunStep, StepStatus};

#[derive(Default)]
struct Tables {
    collections: HashMap<String, Collection>,
    envs: HashMap<String, CollectionEnv>,
    requests: HashMap<String, CollectionRequest>,
    runs: HashMap<String, Run>,
    steps: HashMap<String, RunStep>,
    assertions: HashMap<String, RunAssertion>,
}

/// Process-local store. Every write takes the single table lock, so
/// `replace_requests` is atomic for readers.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_collection(&self, collection: Collection) -> Result<Collection, AppError> {
        let mut tables = self.tables.write().await;
        tables
            .collections
            .insert(collection.id.clone(), collection.clone());
        Ok(collection)
    }

    async fn get_collection(&self, id: &str) -> Result<Option<Collection>, AppError> {
        Ok(self.tables.read().await.collections.get(id).cloned())
    }

    async fn list_collections(&self) -> Result<Vec<Collection>, AppError> {
        let mut collections: Vec<Collection> =
            self.tables.read().await.collections.values().cloned().collect();
        collections.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(collections)
    }

    async fn create_env(&self, env: CollectionEnv) -> Result<CollectionEnv, AppError> {
        let mut tables = self.tables.write().await;
        tables.envs.insert(env.id.clone(), env.clone());
        Ok(env)
    }

    async fn get_env(
        &self,
        collection_id: &str,
        id: &str,
    ) -> Result<Option<CollectionEnv>, AppError> {
        Ok(self
            .tables
            .read()
            .await
            .envs
            .get(id)
            .filter(|env| env.collection_id == collection_id)
            .cloned())
    }

    async fn list_envs(&self, collection_id: &str) -> Result<Vec<CollectionEnv>, AppError> {
        let mut envs: Vec<CollectionEnv> = self
            .tables
            .read()
            .await
            .envs
            .values()
            .filter(|env| env.collection_id == collection_id)
            .cloned()
            .collect();
        envs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(envs)
    }

    async fn replace_requests(
        &self,
        collection_id: &str,
        requests: Vec<CollectionRequest>,
    ) -> Result<(), AppError> {
        let mut tables = self.tables.write().await;
        tables
            .requests
            .retain(|_, request| request.collection_id != collection_id);
        for request in requests {
            tables.requests.insert(request.id.clone(), request);
        }
        Ok(())
    }

    async fn add_requests(&self, requests: Vec<CollectionRequest>) -> Result<(), AppError> {
        let mut tables = self.tables.write().await;
        for request in requests {
            tables.requests.insert(request.id.clone(), request);
        }
        Ok(())
    }

    async fn list_requests(&self, collection_id: &str) -> Result<Vec<CollectionRequest>, AppError> {
        let mut requests: Vec<CollectionRequest> = self
            .tables
            .read()
            .await
            .requests
            .values()
            .filter(|request| request.collection_id == collection_id)
            .cloned()
            .collect();
        requests.sort_by(|a, b| a.path.cmp(&b.path).then_with(|| a.id.cmp(&b.id)));
        Ok(requests)
    }

    async fn set_request_critical(
        &self,
        collection_id: &str,
        request_id: &str,
        is_critical: bool,
    ) -> Result<Option<CollectionRequest>, AppError> {
        let mut tables = self.tables.write().await;
        Ok(tables
            .requests
            .get_mut(request_id)
            .filter(|request| request.collection_id == collection_id)
            .map(|request| {
                request.is_critical = is_critical;
                request.clone()
            }))
    }

    async fn put_run(&self, run: Run) -> Result<Run, AppError> {
        self.tables
            .write()
            .await
            .runs
            .insert(run.id.clone(), run.clone());
        Ok(run)
    }

    async fn get_run(&self, id: &str) -> Result<Option<Run>, AppError> {
        Ok(self.tables.read().await.runs.get(id).cloned())
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, AppError> {
        let mut runs: Vec<Run> = self
            .tables
            .read()
            .await
            .runs
            .values()
            .filter(|run| filter.matches(&run.collection_id, run.status))
            .cloned()
            .collect();
        sort_runs(&mut runs);
        Ok(runs)
    }

    async fn create_step(&self, step: RunStep) -> Result<RunStep, AppError> {
        self.tables
            .write()
            .await
            .steps
            .insert(step.id.clone(), step.clone());
        Ok(step)
    }

    async fn mark_step_failed(&self, run_id: &str, step_id: &str) -> Result<(), AppError> {
        let mut tables = self.tables.write().await;
        match tables
            .steps
            .get_mut(step_id)
            .filter(|step| step.run_id == run_id)
        {
            Some(step) => {
                step.status = StepStatus::Fail;
                Ok(())
            }
            None => Err(AppError::NotFound(format!("step {step_id} not found"))),
        }
    }

    async fn list_steps(&self, run_id: &str) -> Result<Vec<RunStep>, AppError> {
        let mut steps: Vec<RunStep> = self
            .tables
            .read()
            .await
            .steps
            .values()
            .filter(|step| step.run_id == run_id)
            .cloned()
            .collect();
        sort_steps(&mut steps);
        Ok(steps)
    }

    async fn create_assertion(&self, assertion: RunAssertion) -> Result<RunAssertion, AppError> {
        self.tables
            .write()
            .await
            .assertions
            .insert(assertion.id.clone(), assertion.clone());
        Ok(assertion)
    }

    async fn list_assertions(&self, run_id: &str) -> Result<Vec<RunAssertion>, AppError> {
        let mut assertions: Vec<RunAssertion> = self
            .tables
            .read()
            .await
            .assertions
            .values()
            .filter(|assertion| assertion.run_id == run_id)
            .cloned()
            .collect();
        sort_assertions(&mut assertions);
        Ok(assertions)
    }
}
