use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

use crate::api::AppError;
use crate::persistence::model::{Page, RunFilter};
use crate::persistence::store::Store;
use crate::run::executor::RunExecutor;
use crate::run::model::{
    CancelledRun, CreateRunRequest, CreatedRun, Run, RunAssertion, RunStatus, RunStep,
};

const DEFAULT_RUN_LIMIT: usize = 20;
const MAX_RUN_LIMIT: usize = 100;
const DEFAULT_ROW_LIMIT: usize = 50;
const MAX_ROW_LIMIT: usize = 200;

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListRunsQuery {
    pub collection_id: Option<String>,
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListStepsQuery {
    pub request_id: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListAssertionsQuery {
    pub step_id: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Public face of runs: creation, queries and cancellation. Execution
/// itself belongs to the [`RunExecutor`].
pub struct RunService {
    store: Arc<dyn Store>,
    executor: Arc<RunExecutor>,
}

impl RunService {
    pub fn new(store: Arc<dyn Store>, executor: Arc<RunExecutor>) -> Self {
        RunService { store, executor }
    }

    pub async fn create(
        &self,
        collection_id: &str,
        request: CreateRunRequest,
    ) -> Result<CreatedRun, AppError> {
        if request.options.max_duration_ms == Some(0) {
            return Err(AppError::Validation(
                "maxDurationMs must be at least 1".to_string(),
            ));
        }
        if self.store.get_collection(collection_id).await?.is_none() {
            return Err(AppError::NotFound(format!(
                "collection {collection_id} not found"
            )));
        }
        if let Some(environment_id) = &request.environment_id {
            if self
                .store
                .get_env(collection_id, environment_id)
                .await?
                .is_none()
            {
                return Err(AppError::NotFound(format!(
                    "environment {environment_id} not found"
                )));
            }
        }

        let run = self
            .store
            .put_run(
                Run::builder()
                    .collection_id(collection_id.to_string())
                    .maybe_environment_id(request.environment_id)
                    .build(),
            )
            .await?;
        info!(run_id = %run.id, collection_id, "run created");
        self.executor.enqueue(&run, request.options);
        Ok(CreatedRun { run_id: run.id })
    }

    pub async fn get(&self, id: &str) -> Result<Run, AppError> {
        self.store
            .get_run(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("run {id} not found")))
    }

    pub async fn list(&self, query: &ListRunsQuery) -> Result<Page<Run>, AppError> {
        let limit = checked_limit(query.limit, DEFAULT_RUN_LIMIT, MAX_RUN_LIMIT)?;
        let status = query
            .status
            .as_deref()
            .map(str::parse::<RunStatus>)
            .transpose()
            .map_err(AppError::Validation)?;
        let filter = RunFilter {
            collection_id: query.collection_id.clone(),
            status,
        };
        let runs = self.store.list_runs(&filter).await?;
        Ok(Page::from_vec(runs, limit, query.offset.unwrap_or(0)))
    }

    pub async fn list_steps(
        &self,
        run_id: &str,
        query: &ListStepsQuery,
    ) -> Result<Page<RunStep>, AppError> {
        let limit = checked_limit(query.limit, DEFAULT_ROW_LIMIT, MAX_ROW_LIMIT)?;
        self.get(run_id).await?;
        let steps: Vec<RunStep> = self
            .store
            .list_steps(run_id)
            .await?
            .into_iter()
            .filter(|step| {
                query
                    .request_id
                    .as_ref()
                    .map_or(true, |request_id| step.request_id.as_ref() == Some(request_id))
            })
            .collect();
        Ok(Page::from_vec(steps, limit, query.offset.unwrap_or(0)))
    }

    pub async fn list_assertions(
        &self,
        run_id: &str,
        query: &ListAssertionsQuery,
    ) -> Result<Page<RunAssertion>, AppError> {
        let limit = checked_limit(query.limit, DEFAULT_ROW_LIMIT, MAX_ROW_LIMIT)?;
        self.get(run_id).await?;
        let assertions: Vec<RunAssertion> = self
            .store
            .list_assertions(run_id)
            .await?
            .into_iter()
            .filter(|assertion| {
                query
                    .step_id
                    .as_ref()
                    .map_or(true, |step_id| &assertion.run_step_id == step_id)
            })
            .collect();
        Ok(Page::from_vec(assertions, limit, query.offset.unwrap_or(0)))
    }

    pub async fn cancel(&self, id: &str) -> Result<CancelledRun, AppError> {
        let run = self.get(id).await?;
        if run.status.is_terminal() {
            return Err(not_cancellable(&run));
        }
        match self.executor.cancel(id).await? {
            Some(mode) => Ok(CancelledRun {
                run_id: id.to_string(),
                mode,
            }),
            // finished between the read above and the cancel
            None => {
                let run = self.get(id).await?;
                Err(not_cancellable(&run))
            }
        }
    }
}

fn checked_limit(limit: Option<usize>, default: usize, max: usize) -> Result<usize, AppError> {
    let limit = limit.unwrap_or(default);
    if (1..=max).contains(&limit) {
        Ok(limit)
    } else {
        Err(AppError::Validation(format!(
            "limit must be between 1 and {max}"
        )))
    }
}

fn not_cancellable(run: &Run) -> AppError {
    AppError::NotCancellable(format!("run {} is {} and cannot be cancelled", run.id, run.status))
}
