use async_trait::async_trait;

use crate::api::AppError;
use crate::collection::model::{Collection, CollectionEnv, CollectionRequest};
use crate::persistence::model::RunFilter;
use crate::run::model::{Run, RunAssertion, RunStep};

/// Typed persistence for collections and runs.
///
/// Listing methods return complete, ordered vectors; callers paginate with
/// [`crate::persistence::model::Page`].
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_collection(&self, collection: Collection) -> Result<Collection, AppError>;

    async fn get_collection(&self, id: &str) -> Result<Option<Collection>, AppError>;

    /// Newest first.
    async fn list_collections(&self) -> Result<Vec<Collection>, AppError>;

    async fn create_env(&self, env: CollectionEnv) -> Result<CollectionEnv, AppError>;

    async fn get_env(&self, collection_id: &str, id: &str)
        -> Result<Option<CollectionEnv>, AppError>;

    async fn list_envs(&self, collection_id: &str) -> Result<Vec<CollectionEnv>, AppError>;

    /// Swaps every indexed request of a collection in one atomic write.
    async fn replace_requests(
        &self,
        collection_id: &str,
        requests: Vec<CollectionRequest>,
    ) -> Result<(), AppError>;

    /// Adds requests next to the existing ones.
    async fn add_requests(&self, requests: Vec<CollectionRequest>) -> Result<(), AppError>;

    /// Ordered by path.
    async fn list_requests(&self, collection_id: &str) -> Result<Vec<CollectionRequest>, AppError>;

    async fn set_request_critical(
        &self,
        collection_id: &str,
        request_id: &str,
        is_critical: bool,
    ) -> Result<Option<CollectionRequest>, AppError>;

    /// Inserts or overwrites a run.
    async fn put_run(&self, run: Run) -> Result<Run, AppError>;

    async fn get_run(&self, id: &str) -> Result<Option<Run>, AppError>;

    /// Newest first.
    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, AppError>;

    async fn create_step(&self, step: RunStep) -> Result<RunStep, AppError>;

    async fn mark_step_failed(&self, run_id: &str, step_id: &str) -> Result<(), AppError>;

    /// Ordered by `order_index`, then id.
    async fn list_steps(&self, run_id: &str) -> Result<Vec<RunStep>, AppError>;

    async fn create_assertion(&self, assertion: RunAssertion) -> Result<RunAssertion, AppError>;

    /// Ordered by `order_index`.
    async fn list_assertions(&self, run_id: &str) -> Result<Vec<RunAssertion>, AppError>;
}

pub(crate) fn sort_runs(runs: &mut [Run]) {
    runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
}

pub(crate) fn sort_steps(steps: &mut [RunStep]) {
    steps.sort_by(|a, b| a.order_index.cmp(&b.order_index).then_with(|| a.id.cmp(&b.id)));
}

pub(crate) fn sort_assertions(assertions: &mut [RunAssertion]) {
    assertions.sort_by(|a, b| a.order_index.cmp(&b.order_index).then_with(|| a.id.cmp(&b.id)));
}
