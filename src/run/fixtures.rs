use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use crate::api::AppError;
use crate::collection::model::{Collection, CollectionEnv, CollectionRequest, UploadCollection};
use crate::collection::service::CollectionService;
use crate::persistence::memory::MemoryStore;
use crate::persistence::model::RunFilter;
use crate::persistence::store::Store;
use crate::run::events::EventBus;
use crate::run::executor::{ExecutionContext, ExecutorSettings, RunExecutor};
use crate::run::model::{Run, RunAssertion, RunOptions, RunStatus, RunStep};
use crate::runner::scripted::ScriptedAdapter;
use crate::storage::LocalStorage;

/// Uploaded collection plus the stores a run needs.
pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub storage: Arc<LocalStorage>,
    pub bus: Arc<EventBus>,
    pub collection_id: String,
    pub env_id: String,
    _dir: TempDir,
}

/// Builds a collection whose requests sit at `paths`, with at most one
/// folder level (`Folder/Name`).
pub fn collection_document(paths: &[&str]) -> Value {
    let mut items: Vec<Value> = vec![];
    for path in paths {
        let request = |name: &str| {
            json!({ "name": name, "request": { "method": "GET", "url": format!("{{{{baseUrl}}}}/{name}") } })
        };
        match path.split_once('/') {
            Some((folder, name)) => {
                let existing = items
                    .iter_mut()
                    .find(|item| item["name"] == json!(folder) && item.get("item").is_some());
                match existing {
                    Some(folder_item) => {
                        if let Some(children) = folder_item["item"].as_array_mut() {
                            children.push(request(name));
                        }
                    }
                    None => items.push(json!({ "name": folder, "item": [request(name)] })),
                }
            }
            None => items.push(request(path)),
        }
    }
    json!({
        "info": {
            "name": "Fixture",
            "schema": "https://schema.getpostman.com/json/collection/v2.1.0/collection.json"
        },
        "item": items
    })
}

impl Fixture {
    pub async fn new(paths: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let storage = Arc::new(LocalStorage::new(dir.path()));
        let collections = CollectionService::new(store.clone(), storage.clone());
        let created = collections
            .upload(UploadCollection {
                collection: collection_document(paths),
                environment: Some(json!({
                    "name": "local",
                    "values": [{ "key": "baseUrl", "value": "http://localhost" }]
                })),
            })
            .await
            .unwrap();
        let env_id = store
            .list_envs(&created.collection_id)
            .await
            .unwrap()
            .remove(0)
            .id;
        Fixture {
            store,
            storage,
            bus: Arc::new(EventBus::new()),
            collection_id: created.collection_id,
            env_id,
            _dir: dir,
        }
    }

    pub fn start(&self, adapter: ScriptedAdapter, p95_sla_ms: Option<u64>) -> Arc<RunExecutor> {
        self.start_shared(Arc::new(adapter), p95_sla_ms)
    }

    pub fn start_shared(
        &self,
        adapter: Arc<ScriptedAdapter>,
        p95_sla_ms: Option<u64>,
    ) -> Arc<RunExecutor> {
        self.start_with_store(self.store.clone(), adapter, p95_sla_ms)
    }

    pub fn start_with_store(
        &self,
        store: Arc<dyn Store>,
        adapter: Arc<ScriptedAdapter>,
        p95_sla_ms: Option<u64>,
    ) -> Arc<RunExecutor> {
        let executor = RunExecutor::new(ExecutionContext::new(
            store,
            self.storage.clone(),
            self.bus.clone(),
            adapter,
            ExecutorSettings { p95_sla_ms },
        ));
        executor.clone().start();
        executor
    }

    pub async fn queue(&self, executor: &RunExecutor, options: RunOptions) -> String {
        let run = Run::builder()
            .collection_id(self.collection_id.clone())
            .environment_id(self.env_id.clone())
            .build();
        let run = self.store.put_run(run).await.unwrap();
        executor.enqueue(&run, options);
        run.id
    }

    pub async fn mark_critical(&self, path: &str) {
        let request = self
            .store
            .list_requests(&self.collection_id)
            .await
            .unwrap()
            .into_iter()
            .find(|request| request.path == path)
            .unwrap();
        self.store
            .set_request_critical(&self.collection_id, &request.id, true)
            .await
            .unwrap();
    }

    pub async fn wait_status(&self, run_id: &str, status: RunStatus) -> Run {
        self.wait_for(run_id, |run| run.status == status).await
    }

    pub async fn wait_terminal(&self, run_id: &str) -> Run {
        self.wait_for(run_id, |run| run.status.is_terminal()).await
    }

    async fn wait_for(&self, run_id: &str, done: impl Fn(&Run) -> bool) -> Run {
        for _ in 0..1000 {
            if let Some(run) = self.store.get_run(run_id).await.unwrap() {
                if done(&run) {
                    return run;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("run {run_id} did not reach the expected state");
    }

    /// Store that fails the `fail_at`-th step write (0-based).
    pub fn flaky_store(&self, fail_at: usize) -> Arc<dyn Store> {
        Arc::new(FlakyStore {
            step_fail_at: Some(fail_at),
            ..FlakyStore::over(self.store.clone())
        })
    }

    /// Store whose first `failures` run reads fail.
    pub fn unreadable_runs(&self, failures: usize) -> Arc<dyn Store> {
        Arc::new(FlakyStore {
            run_read_failures: AtomicUsize::new(failures),
            ..FlakyStore::over(self.store.clone())
        })
    }

    /// Store that takes `delay_ms` to answer collection reads.
    pub fn slow_collections(&self, delay_ms: u64) -> Arc<dyn Store> {
        Arc::new(FlakyStore {
            collection_delay: Duration::from_millis(delay_ms),
            ..FlakyStore::over(self.store.clone())
        })
    }
}

struct FlakyStore {
    inner: Arc<MemoryStore>,
    step_writes: AtomicUsize,
    step_fail_at: Option<usize>,
    run_read_failures: AtomicUsize,
    collection_delay: Duration,
}

impl FlakyStore {
    fn over(inner: Arc<MemoryStore>) -> Self {
        FlakyStore {
            inner,
            step_writes: AtomicUsize::new(0),
            step_fail_at: None,
            run_read_failures: AtomicUsize::new(0),
            collection_delay: Duration::ZERO,
        }
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn create_collection(&self, collection: Collection) -> Result<Collection, AppError> {
        self.inner.create_collection(collection).await
    }

    async fn get_collection(&self, id: &str) -> Result<Option<Collection>, AppError> {
        tokio::time::sleep(self.collection_delay).await;
        self.inner.get_collection(id).await
    }

    async fn list_collections(&self) -> Result<Vec<Collection>, AppError> {
        self.inner.list_collections().await
    }

    async fn create_env(&self, env: CollectionEnv) -> Result<CollectionEnv, AppError> {
        self.inner.create_env(env).await
    }

    async fn get_env(
        &self,
        collection_id: &str,
        id: &str,
    ) -> Result<Option<CollectionEnv>, AppError> {
        self.inner.get_env(collection_id, id).await
    }

    async fn list_envs(&self, collection_id: &str) -> Result<Vec<CollectionEnv>, AppError> {
        self.inner.list_envs(collection_id).await
    }

    async fn replace_requests(
        &self,
        collection_id: &str,
        requests: Vec<CollectionRequest>,
    ) -> Result<(), AppError> {
        self.inner.replace_requests(collection_id, requests).await
    }

    async fn add_requests(&self, requests: Vec<CollectionRequest>) -> Result<(), AppError> {
        self.inner.add_requests(requests).await
    }

    async fn list_requests(&self, collection_id: &str) -> Result<Vec<CollectionRequest>, AppError> {
        self.inner.list_requests(collection_id).await
    }

    async fn set_request_critical(
        &self,
        collection_id: &str,
        request_id: &str,
        is_critical: bool,
    ) -> Result<Option<CollectionRequest>, AppError> {
        self.inner
            .set_request_critical(collection_id, request_id, is_critical)
            .await
    }

    async fn put_run(&self, run: Run) -> Result<Run, AppError> {
        self.inner.put_run(run).await
    }

    async fn get_run(&self, id: &str) -> Result<Option<Run>, AppError> {
        let failing = self
            .run_read_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AppError::Internal("read timed out".to_string()));
        }
        self.inner.get_run(id).await
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, AppError> {
        self.inner.list_runs(filter).await
    }

    async fn create_step(&self, step: RunStep) -> Result<RunStep, AppError> {
        if Some(self.step_writes.fetch_add(1, Ordering::SeqCst)) == self.step_fail_at {
            return Err(AppError::Internal("connection reset".to_string()));
        }
        self.inner.create_step(step).await
    }

    async fn mark_step_failed(&self, run_id: &str, step_id: &str) -> Result<(), AppError> {
        self.inner.mark_step_failed(run_id, step_id).await
    }

    async fn list_steps(&self, run_id: &str) -> Result<Vec<RunStep>, AppError> {
        self.inner.list_steps(run_id).await
    }

    async fn create_assertion(&self, assertion: RunAssertion) -> Result<RunAssertion, AppError> {
        self.inner.create_assertion(assertion).await
    }

    async fn list_assertions(&self, run_id: &str) -> Result<Vec<RunAssertion>, AppError> {
        self.inner.list_assertions(run_id).await
    }
}

#[test]
fn fixture_documents_group_requests_by_folder() {
    let document = collection_document(&["Users/List", "Users/Create", "Health"]);
    assert_eq!(document["item"].as_array().unwrap().len(), 2);
    assert_eq!(document["item"][0]["item"].as_array().unwrap().len(), 2);
    assert_eq!(document["item"][1]["name"], json!("Health"));
}
