use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::api::AppError;
use crate::collection::parser::{
    parse_collection_bytes, parse_environment_bytes, CollectionDocument, EnvironmentDocument,
};
use crate::persistence::store::Store;
use crate::run::events::{EventBus, RunEvent};
use crate::run::metrics::{classify_health, percentiles, HealthInput};
use crate::run::model::{
    CancelMode, HealthStatus, Run, RunOptions, RunStatus, RunStep, StepStatus,
};
use crate::run::recorder::StepRecorder;
use crate::runner::{AdapterEvent, ExecutionAdapter, RunDone, RunnerOptions};
use crate::storage::ObjectStore;

const CANCELLED_MESSAGE: &str = "run cancelled";
const TIMED_OUT_MESSAGE: &str = "run timed out";
const REPORT_BUCKET: &str = "reports";
const RUN_READ_ATTEMPTS: u32 = 3;

#[derive(Clone, Debug, Default)]
pub struct ExecutorSettings {
    pub p95_sla_ms: Option<u64>,
}

/// Collaborators a run needs while it executes.
pub struct ExecutionContext {
    store: Arc<dyn Store>,
    storage: Arc<dyn ObjectStore>,
    bus: Arc<EventBus>,
    adapter: Arc<dyn ExecutionAdapter>,
    settings: ExecutorSettings,
}

impl ExecutionContext {
    pub fn new(
        store: Arc<dyn Store>,
        storage: Arc<dyn ObjectStore>,
        bus: Arc<EventBus>,
        adapter: Arc<dyn ExecutionAdapter>,
        settings: ExecutorSettings,
    ) -> Self {
        ExecutionContext {
            store,
            storage,
            bus,
            adapter,
            settings,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum StopReason {
    Cancelled,
    Timeout,
}

#[derive(Debug, PartialEq)]
enum Outcome {
    Completed,
    Stopped(StopReason),
    Failed(String),
}

/// `collection_id` and `environment_id` are kept so the run can still be
/// finalized when its stored record cannot be read.
struct RunJob {
    run_id: String,
    collection_id: String,
    environment_id: Option<String>,
    options: RunOptions,
}

struct ActiveJob {
    run_id: String,
    stop: Option<oneshot::Sender<StopReason>>,
    stop_requested: bool,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<RunJob>,
    active: Option<ActiveJob>,
}

/// FIFO queue executing one run at a time.
pub struct RunExecutor {
    state: Mutex<QueueState>,
    wake: Notify,
    context: Arc<ExecutionContext>,
}

impl RunExecutor {
    pub fn new(context: ExecutionContext) -> Arc<Self> {
        Arc::new(RunExecutor {
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
            context: Arc::new(context),
        })
    }

    /// Spawns the worker loop. Call once.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let (job, stop_rx) = self.next_job().await;
                let run_id = job.run_id.clone();
                info!(run_id = %run_id, "run dequeued");
                let context = self.context.clone();
                let result = tokio::spawn(async move { context.drive(job, stop_rx).await }).await;
                if let Err(err) = result {
                    error!(run_id = %run_id, error = %err, "run task crashed");
                    self.context
                        .finalize_crashed(&run_id, format!("run execution crashed: {err}"))
                        .await;
                }
                self.lock().active = None;
            }
        })
    }

    /// Appends a job. Never waits for the queue.
    pub fn enqueue(&self, run: &Run, options: RunOptions) {
        let depth = {
            let mut state = self.lock();
            state.pending.push_back(RunJob {
                run_id: run.id.clone(),
                collection_id: run.collection_id.clone(),
                environment_id: run.environment_id.clone(),
                options,
            });
            state.pending.len()
        };
        info!(run_id = %run.id, depth, "run enqueued");
        self.wake.notify_one();
    }

    /// Aborts the active run or drops a pending one. `None` means the
    /// executor does not know the run anymore.
    pub async fn cancel(&self, run_id: &str) -> Result<Option<CancelMode>, AppError> {
        let pending = {
            let mut state = self.lock();
            if let Some(active) = state.active.as_mut().filter(|active| active.run_id == run_id) {
                if active.stop_requested {
                    return Ok(Some(CancelMode::Running));
                }
                let sent = active
                    .stop
                    .take()
                    .map(|stop| stop.send(StopReason::Cancelled).is_ok());
                return Ok(match sent {
                    Some(true) => {
                        active.stop_requested = true;
                        info!(run_id, "cancel requested for running run");
                        Some(CancelMode::Running)
                    }
                    _ => None,
                });
            }
            let position = state.pending.iter().position(|job| job.run_id == run_id);
            position.and_then(|position| state.pending.remove(position))
        };
        match pending {
            Some(_) => {
                info!(run_id, "queued run cancelled");
                self.context.finalize_queued_cancel(run_id).await?;
                Ok(Some(CancelMode::Queued))
            }
            None => Ok(None),
        }
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    async fn next_job(&self) -> (RunJob, oneshot::Receiver<StopReason>) {
        loop {
            {
                let mut state = self.lock();
                if let Some(job) = state.pending.pop_front() {
                    let (stop_tx, stop_rx) = oneshot::channel();
                    state.active = Some(ActiveJob {
                        run_id: job.run_id.clone(),
                        stop: Some(stop_tx),
                        stop_requested: false,
                    });
                    return (job, stop_rx);
                }
            }
            self.wake.notified().await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ExecutionContext {
    async fn drive(&self, job: RunJob, mut stop_rx: oneshot::Receiver<StopReason>) {
        let began = Instant::now();
        let run_id = job.run_id.clone();
        let mut run = match self.read_run(&run_id).await {
            Ok(Some(run)) if !run.status.is_terminal() => run,
            Ok(Some(run)) => {
                warn!(run_id = %run_id, status = %run.status, "dequeued run is already finished");
                return;
            }
            Ok(None) => {
                warn!(run_id = %run_id, "dequeued run does not exist");
                return;
            }
            Err(err) => {
                error!(run_id = %run_id, error = %err, "could not load dequeued run");
                let run = Run::builder()
                    .id(job.run_id)
                    .collection_id(job.collection_id)
                    .maybe_environment_id(job.environment_id)
                    .build();
                let message = format!("could not load run: {err}");
                self.finalize(run, Outcome::Failed(message), Value::Null).await;
                return;
            }
        };

        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        if let Err(err) = self.store.put_run(run.clone()).await {
            error!(run_id = %run_id, error = %err, "could not mark run as running");
            let message = format!("could not start run: {err}");
            self.finalize(run, Outcome::Failed(message), Value::Null).await;
            return;
        }
        self.bus.publish(&RunEvent::RunStarted {
            run_id: run_id.clone(),
        });

        let deadline = job
            .options
            .max_duration_ms
            .map(|ms| began + Duration::from_millis(ms));
        let (outcome, summary) = self.execute(&run, &job.options, deadline, &mut stop_rx).await;
        self.finalize(run, outcome, summary).await;
    }

    /// Reads the run, retrying a failing store a few times.
    async fn read_run(&self, run_id: &str) -> Result<Option<Run>, AppError> {
        let mut attempt = 1;
        loop {
            match self.store.get_run(run_id).await {
                Ok(run) => return Ok(run),
                Err(err) if attempt < RUN_READ_ATTEMPTS => {
                    warn!(run_id, attempt, error = %err, "run read failed, retrying");
                    tokio::time::sleep(Duration::from_millis(20 * u64::from(attempt))).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn execute(
        &self,
        run: &Run,
        options: &RunOptions,
        deadline: Option<Instant>,
        stop_rx: &mut oneshot::Receiver<StopReason>,
    ) -> (Outcome, Value) {
        let (collection, environment) = match self.load_documents(run).await {
            Ok(documents) => documents,
            Err(message) => return (Outcome::Failed(message), Value::Null),
        };
        let requests = self
            .store
            .list_requests(&run.collection_id)
            .await
            .unwrap_or_else(|err| {
                warn!(run_id = %run.id, error = %err, "could not load indexed requests, steps stay unresolved");
                vec![]
            });
        let mut recorder = StepRecorder::new(&run.id, self.store.clone(), self.bus.clone(), requests);

        let mut handle = match self
            .adapter
            .start(collection, environment, RunnerOptions::from(options))
        {
            Ok(handle) => handle,
            Err(err) => {
                warn!(run_id = %run.id, error = %err, "execution adapter failed to start");
                return (Outcome::Failed(err.to_string()), Value::Null);
            }
        };
        info!(run_id = %run.id, "execution started");

        let mut requested: Option<StopReason> = None;
        let mut stop_closed = false;
        loop {
            tokio::select! {
                event = handle.next_event() => match event {
                    Some(AdapterEvent::RequestCompleted(completed)) => {
                        recorder.request_completed(completed).await;
                    }
                    Some(AdapterEvent::AssertionEvaluated(evaluated)) => {
                        recorder.assertion_evaluated(evaluated).await;
                    }
                    Some(AdapterEvent::Done(done)) => {
                        let summary = done.summary.clone();
                        return (resolve_done(done, requested), summary);
                    }
                    None => {
                        return (
                            Outcome::Failed(
                                "execution adapter closed its event stream without completing"
                                    .to_string(),
                            ),
                            Value::Null,
                        );
                    }
                },
                reason = &mut *stop_rx, if requested.is_none() && !stop_closed => match reason {
                    Ok(reason) => {
                        info!(run_id = %run.id, ?reason, "aborting execution");
                        requested = Some(reason);
                        handle.abort();
                    }
                    Err(_) => stop_closed = true,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() && requested.is_none() => {
                    warn!(run_id = %run.id, "run exceeded its max duration");
                    requested = Some(StopReason::Timeout);
                    handle.abort();
                }
            }
        }
    }

    async fn load_documents(
        &self,
        run: &Run,
    ) -> Result<(CollectionDocument, Option<EnvironmentDocument>), String> {
        let collection = self
            .store
            .get_collection(&run.collection_id)
            .await
            .map_err(|err| err.to_string())?
            .ok_or_else(|| format!("collection {} not found", run.collection_id))?;
        let bytes = self
            .storage
            .get(&collection.file_uri)
            .await
            .map_err(|err| err.to_string())?;
        let document = parse_collection_bytes(&bytes).map_err(|err| err.to_string())?;

        let environment = match &run.environment_id {
            None => None,
            Some(environment_id) => {
                let env = self
                    .store
                    .get_env(&run.collection_id, environment_id)
                    .await
                    .map_err(|err| err.to_string())?
                    .ok_or_else(|| format!("environment {environment_id} not found"))?;
                let bytes = self
                    .storage
                    .get(&env.file_uri)
                    .await
                    .map_err(|err| err.to_string())?;
                Some(parse_environment_bytes(&bytes).map_err(|err| err.to_string())?)
            }
        };
        Ok((document, environment))
    }

    /// Aggregates everything from persisted rows so that polling clients
    /// see exactly what the final event carries.
    async fn finalize(&self, mut run: Run, outcome: Outcome, summary: Value) {
        let steps = self.store.list_steps(&run.id).await.unwrap_or_else(|err| {
            warn!(run_id = %run.id, error = %err, "could not load steps for aggregation");
            vec![]
        });
        let failed_ids: Vec<&str> = steps
            .iter()
            .filter(|step| step.status == StepStatus::Fail)
            .filter_map(|step| step.request_id.as_deref())
            .collect();
        let critical_failures = if failed_ids.is_empty() {
            0
        } else {
            let critical: HashSet<String> = self
                .store
                .list_requests(&run.collection_id)
                .await
                .unwrap_or_else(|err| {
                    warn!(run_id = %run.id, error = %err, "could not load critical flags");
                    vec![]
                })
                .into_iter()
                .filter(|request| request.is_critical)
                .map(|request| request.id)
                .collect();
            failed_ids.iter().filter(|id| critical.contains(**id)).count() as u32
        };

        let total = steps.len() as u32;
        let failed = steps
            .iter()
            .filter(|step| step.status == StepStatus::Fail)
            .count() as u32;
        let latencies: Vec<u64> = steps.iter().filter_map(|step| step.latency_ms).collect();
        let latency = percentiles(&latencies);

        let (status, error_msg) = match &outcome {
            Outcome::Completed if failed > 0 => (RunStatus::Partial, None),
            Outcome::Completed => (RunStatus::Success, None),
            Outcome::Stopped(StopReason::Cancelled) => {
                (RunStatus::Cancelled, Some(CANCELLED_MESSAGE.to_string()))
            }
            Outcome::Stopped(StopReason::Timeout) => {
                (RunStatus::Timeout, Some(TIMED_OUT_MESSAGE.to_string()))
            }
            Outcome::Failed(message) => (RunStatus::Error, Some(message.clone())),
        };
        let health = classify_health(&HealthInput {
            status,
            executed_steps: total,
            failed_steps: failed,
            critical_failures,
            p95_ms: latency.p95,
            p95_sla_ms: self.settings.p95_sla_ms,
        });

        let ended_at = Utc::now();
        let started_at = run.started_at.unwrap_or(ended_at);
        run.status = status;
        run.health = Some(health);
        run.ended_at = Some(ended_at);
        run.duration_ms = Some((ended_at - started_at).num_milliseconds().max(1) as u64);
        run.total_requests = total;
        run.success_requests = total - failed;
        run.failed_requests = failed;
        run.p50_ms = Some(latency.p50);
        run.p95_ms = Some(latency.p95);
        run.p99_ms = Some(latency.p99);
        run.error_msg = error_msg;
        run.report_uri = self.store_report(&run, &steps, summary).await;

        self.complete(run).await;
    }

    async fn store_report(
        &self,
        run: &Run,
        steps: &[RunStep],
        summary: Value,
    ) -> Option<String> {
        let assertions = self.store.list_assertions(&run.id).await.unwrap_or_default();
        let report = json!({
            "run": run,
            "steps": steps,
            "assertions": assertions,
            "execution": summary,
        });
        let bytes = match serde_json::to_vec_pretty(&report) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(run_id = %run.id, error = %err, "could not serialize run report");
                return None;
            }
        };
        match self
            .storage
            .put(REPORT_BUCKET, &format!("{}.summary.json", run.id), bytes)
            .await
        {
            Ok(uri) => Some(uri),
            Err(err) => {
                warn!(run_id = %run.id, error = %err, "could not store run report");
                None
            }
        }
    }

    async fn finalize_queued_cancel(&self, run_id: &str) -> Result<(), AppError> {
        let Some(mut run) = self.store.get_run(run_id).await? else {
            return Err(AppError::NotFound(format!("run {run_id} not found")));
        };
        run.status = RunStatus::Cancelled;
        run.health = Some(HealthStatus::Unknown);
        run.ended_at = Some(Utc::now());
        run.total_requests = 0;
        run.success_requests = 0;
        run.failed_requests = 0;
        run.error_msg = Some(CANCELLED_MESSAGE.to_string());
        let run = self.store.put_run(run).await?;
        self.publish_finished(run);
        Ok(())
    }

    async fn finalize_crashed(&self, run_id: &str, message: String) {
        match self.store.get_run(run_id).await {
            Ok(Some(run)) if !run.status.is_terminal() => {
                self.finalize(run, Outcome::Failed(message), Value::Null).await;
            }
            Ok(_) => {}
            Err(err) => error!(run_id, error = %err, "could not load crashed run"),
        }
    }

    async fn complete(&self, run: Run) {
        info!(
            run_id = %run.id,
            status = %run.status,
            total = run.total_requests,
            failed = run.failed_requests,
            "run finished"
        );
        match self.store.put_run(run.clone()).await {
            Ok(run) => self.publish_finished(run),
            Err(err) => {
                error!(run_id = %run.id, error = %err, "could not persist finished run");
                self.publish_finished(run);
            }
        }
    }

    fn publish_finished(&self, run: Run) {
        self.bus.publish(&RunEvent::RunFinished {
            run_id: run.id.clone(),
            summary: run,
        });
    }
}

/// A stop only counts if the adapter confirms it cut the run short.
fn resolve_done(done: RunDone, requested: Option<StopReason>) -> Outcome {
    match (requested, done.aborted, done.error) {
        (Some(reason), true, _) => Outcome::Stopped(reason),
        (_, _, Some(error)) => Outcome::Failed(error),
        _ => Outcome::Completed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::fixtures::Fixture;
    use crate::run::model::AssertionStatus;
    use crate::runner::scripted::{ScriptedAdapter, ScriptedStep};
    use std::sync::Mutex as StdMutex;

    const PATHS: [&str; 3] = ["Users/List Users", "Users/Create User", "Health"];

    fn three_steps() -> Vec<ScriptedStep> {
        PATHS.iter().map(|path| ScriptedStep::ok(path)).collect()
    }

    #[test]
    fn stop_counts_only_when_the_adapter_aborted() {
        let done = |aborted: bool, error: Option<&str>| RunDone {
            error: error.map(str::to_string),
            aborted,
            summary: Value::Null,
        };
        assert_eq!(
            resolve_done(done(true, None), Some(StopReason::Timeout)),
            Outcome::Stopped(StopReason::Timeout)
        );
        assert_eq!(
            resolve_done(done(false, None), Some(StopReason::Cancelled)),
            Outcome::Completed
        );
        assert_eq!(
            resolve_done(done(false, Some("bad")), None),
            Outcome::Failed("bad".to_string())
        );
    }

    #[tokio::test]
    async fn clean_run_is_successful_and_healthy() {
        let fixture = Fixture::new(&PATHS).await;
        let executor = fixture.start(ScriptedAdapter::new(three_steps()), None);

        let run_id = fixture.queue(&executor, RunOptions::default()).await;
        let run = fixture.wait_terminal(&run_id).await;

        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.health, Some(HealthStatus::Healthy));
        assert_eq!((run.total_requests, run.failed_requests), (3, 0));
        assert_eq!(run.success_requests, 3);
        assert!(run.duration_ms.unwrap() >= 1);
        assert!(run.report_uri.as_deref().unwrap().ends_with(&format!("{run_id}.summary.json")));

        let steps = fixture.store.list_steps(&run_id).await.unwrap();
        let indexes: Vec<u32> = steps.iter().map(|step| step.order_index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
        assert!(steps.iter().all(|step| step.request_id.is_some()));
    }

    #[tokio::test]
    async fn non_critical_failure_is_partial_and_degraded() {
        let fixture = Fixture::new(&PATHS).await;
        let steps = vec![
            ScriptedStep::ok(PATHS[0]),
            ScriptedStep::ok(PATHS[1]).failing("status is 201"),
            ScriptedStep::ok(PATHS[2]),
        ];
        let executor = fixture.start(ScriptedAdapter::new(steps), None);

        let run_id = fixture.queue(&executor, RunOptions::default()).await;
        let run = fixture.wait_terminal(&run_id).await;

        assert_eq!(run.status, RunStatus::Partial);
        assert_eq!(run.health, Some(HealthStatus::Degraded));
        assert_eq!((run.total_requests, run.success_requests, run.failed_requests), (3, 2, 1));
        let assertions = fixture.store.list_assertions(&run_id).await.unwrap();
        assert_eq!(
            assertions.iter().filter(|a| a.status == AssertionStatus::Fail).count(),
            1
        );
    }

    #[tokio::test]
    async fn critical_failure_is_partial_and_unhealthy() {
        let fixture = Fixture::new(&PATHS).await;
        fixture.mark_critical(PATHS[1]).await;
        let steps = vec![
            ScriptedStep::ok(PATHS[0]),
            ScriptedStep::ok(PATHS[1]).failing("status is 201"),
            ScriptedStep::ok(PATHS[2]),
        ];
        let executor = fixture.start(ScriptedAdapter::new(steps), None);

        let run_id = fixture.queue(&executor, RunOptions::default()).await;
        let run = fixture.wait_terminal(&run_id).await;

        assert_eq!(run.status, RunStatus::Partial);
        assert_eq!(run.health, Some(HealthStatus::Unhealthy));
    }

    #[tokio::test]
    async fn max_duration_times_the_run_out() {
        let fixture = Fixture::new(&PATHS).await;
        let steps = PATHS
            .iter()
            .map(|path| ScriptedStep::ok(path).delayed(100))
            .collect();
        let executor = fixture.start(ScriptedAdapter::new(steps), None);

        let options = RunOptions {
            max_duration_ms: Some(50),
            ..RunOptions::default()
        };
        let run_id = fixture.queue(&executor, options).await;
        let run = fixture.wait_terminal(&run_id).await;

        assert_eq!(run.status, RunStatus::Timeout);
        assert_eq!(run.health, Some(HealthStatus::Unhealthy));
        assert_eq!(run.error_msg.as_deref(), Some("run timed out"));
        assert_eq!(run.total_requests, 0);
    }

    #[tokio::test]
    async fn cancelling_the_active_run() {
        let fixture = Fixture::new(&PATHS).await;
        let steps = PATHS
            .iter()
            .map(|path| ScriptedStep::ok(path).delayed(100))
            .collect();
        let executor = fixture.start(ScriptedAdapter::new(steps), None);

        let run_id = fixture.queue(&executor, RunOptions::default()).await;
        fixture.wait_status(&run_id, RunStatus::Running).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mode = executor.cancel(&run_id).await.unwrap();
        let run = fixture.wait_terminal(&run_id).await;

        assert_eq!(mode, Some(CancelMode::Running));
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.health, Some(HealthStatus::Unknown));
        assert_eq!(run.error_msg.as_deref(), Some("run cancelled"));
        assert_eq!(run.total_requests, run.success_requests + run.failed_requests);
    }

    #[tokio::test]
    async fn cancelling_a_queued_run_is_immediate_and_skips_the_adapter() {
        let fixture = Fixture::new(&PATHS).await;
        let adapter = Arc::new(ScriptedAdapter::new(vec![ScriptedStep::ok(PATHS[0]).delayed(200)]));
        let executor = fixture.start_shared(adapter.clone(), None);

        let first = fixture.queue(&executor, RunOptions::default()).await;
        let second = fixture.queue(&executor, RunOptions::default()).await;
        fixture.wait_status(&first, RunStatus::Running).await;

        let mode = executor.cancel(&second).await.unwrap();
        let run = fixture.store.get_run(&second).await.unwrap().unwrap();

        assert_eq!(mode, Some(CancelMode::Queued));
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.health, Some(HealthStatus::Unknown));
        assert_eq!((run.total_requests, run.success_requests, run.failed_requests), (0, 0, 0));
        assert!(run.ended_at.is_some());

        fixture.wait_terminal(&first).await;
        assert_eq!(adapter.starts(), 1);
        assert_eq!(executor.pending(), 0);
    }

    #[tokio::test]
    async fn unknown_runs_are_not_cancelled() {
        let fixture = Fixture::new(&PATHS).await;
        let executor = fixture.start(ScriptedAdapter::new(vec![]), None);
        assert_eq!(executor.cancel("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn adapter_start_failure_ends_in_error() {
        let fixture = Fixture::new(&PATHS).await;
        let executor = fixture.start(ScriptedAdapter::failing_to_start("engine missing"), None);

        let run_id = fixture.queue(&executor, RunOptions::default()).await;
        let run = fixture.wait_terminal(&run_id).await;

        assert_eq!(run.status, RunStatus::Error);
        assert_eq!(run.error_msg.as_deref(), Some("engine missing"));
        assert_eq!(run.health, Some(HealthStatus::Unknown));
    }

    #[tokio::test]
    async fn adapter_error_in_done_ends_in_error_with_counted_steps() {
        let fixture = Fixture::new(&PATHS).await;
        let adapter = ScriptedAdapter::new(vec![ScriptedStep::ok(PATHS[0])])
            .finishing_with_error("malformed collection");
        let executor = fixture.start(adapter, None);

        let run_id = fixture.queue(&executor, RunOptions::default()).await;
        let run = fixture.wait_terminal(&run_id).await;

        assert_eq!(run.status, RunStatus::Error);
        assert_eq!(run.error_msg.as_deref(), Some("malformed collection"));
        assert_eq!(run.total_requests, 1);
        assert_eq!(run.health, Some(HealthStatus::Healthy));
    }

    #[tokio::test]
    async fn slow_p95_degrades_an_otherwise_clean_run() {
        let fixture = Fixture::new(&PATHS).await;
        let steps = PATHS
            .iter()
            .map(|path| ScriptedStep::ok(path).latency(300))
            .collect();
        let executor = fixture.start(ScriptedAdapter::new(steps), Some(200));

        let run_id = fixture.queue(&executor, RunOptions::default()).await;
        let run = fixture.wait_terminal(&run_id).await;

        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.health, Some(HealthStatus::Degraded));
        assert_eq!(run.p95_ms, Some(300));
    }

    #[tokio::test]
    async fn runs_execute_one_at_a_time_in_order() {
        let fixture = Fixture::new(&PATHS).await;
        let executor = fixture.start(
            ScriptedAdapter::new(vec![ScriptedStep::ok(PATHS[0]).delayed(30)]),
            None,
        );
        let order = Arc::new(StdMutex::new(Vec::new()));
        let _subscription = {
            let order = order.clone();
            fixture.bus.subscribe(move |event| {
                if matches!(event, RunEvent::RunStarted { .. } | RunEvent::RunFinished { .. }) {
                    order
                        .lock()
                        .unwrap()
                        .push(format!("{}:{}", event.kind(), event.run_id()));
                }
            })
        };

        let first = fixture.queue(&executor, RunOptions::default()).await;
        let second = fixture.queue(&executor, RunOptions::default()).await;
        fixture.wait_terminal(&second).await;

        assert_eq!(
            *order.lock().unwrap(),
            vec![
                format!("run_started:{first}"),
                format!("run_finished:{first}"),
                format!("run_started:{second}"),
                format!("run_finished:{second}"),
            ]
        );
    }

    #[tokio::test]
    async fn step_events_precede_their_assertions_and_finish_is_last() {
        let fixture = Fixture::new(&PATHS).await;
        let steps = vec![ScriptedStep::ok(PATHS[0]).failing("status is 201"), ScriptedStep::ok(PATHS[1])];
        let executor = fixture.start(ScriptedAdapter::new(steps), None);
        let events = Arc::new(StdMutex::new(Vec::<RunEvent>::new()));
        let _subscription = {
            let events = events.clone();
            fixture
                .bus
                .subscribe(move |event| events.lock().unwrap().push(event.clone()))
        };

        let run_id = fixture.queue(&executor, RunOptions::default()).await;
        let run = fixture.wait_terminal(&run_id).await;

        let events = events.lock().unwrap().clone();
        assert!(matches!(events.first(), Some(RunEvent::RunStarted { .. })));
        let Some(RunEvent::RunFinished { summary, .. }) = events.last() else {
            panic!("last event must be run_finished");
        };
        assert_eq!(summary, &run);
        let mut seen_steps = HashSet::new();
        for event in &events {
            match event {
                RunEvent::StepProgress { step, .. } => {
                    seen_steps.insert(step.id.clone());
                }
                RunEvent::AssertionResult { step_id, .. } => {
                    assert!(seen_steps.contains(step_id));
                }
                _ => {}
            }
        }
        assert_eq!(seen_steps.len(), 2);
    }

    #[tokio::test]
    async fn persistence_hiccups_undercount_but_do_not_abort() {
        let fixture = Fixture::new(&PATHS).await;
        let flaky = fixture.flaky_store(1);
        let executor = fixture.start_with_store(
            flaky,
            Arc::new(ScriptedAdapter::new(three_steps())),
            None,
        );

        let run_id = fixture.queue(&executor, RunOptions::default()).await;
        let run = fixture.wait_terminal(&run_id).await;

        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.total_requests, 2);
        let steps = fixture.store.list_steps(&run_id).await.unwrap();
        let indexes: Vec<u32> = steps.iter().map(|step| step.order_index).collect();
        assert_eq!(indexes, vec![0, 1]);
    }

    #[tokio::test]
    async fn terminal_runs_read_back_identically() {
        let fixture = Fixture::new(&PATHS).await;
        let executor = fixture.start(ScriptedAdapter::new(three_steps()), None);
        let run_id = fixture.queue(&executor, RunOptions::default()).await;
        let run = fixture.wait_terminal(&run_id).await;

        for _ in 0..3 {
            let again = fixture.store.get_run(&run_id).await.unwrap().unwrap();
            assert_eq!(serde_json::to_vec(&again).unwrap(), serde_json::to_vec(&run).unwrap());
        }
    }
    #[tokio::test]
    async fn a_second_cancel_of_a_running_run_is_still_accepted() {
        let fixture = Fixture::new(&PATHS).await;
        let executor = fixture.start(
            ScriptedAdapter::new(vec![ScriptedStep::ok(PATHS[0]).delayed(300)]),
            None,
        );

        let run_id = fixture.queue(&executor, RunOptions::default()).await;
        fixture.wait_status(&run_id, RunStatus::Running).await;
        let first = executor.cancel(&run_id).await.unwrap();
        let second = executor.cancel(&run_id).await.unwrap();
        let run = fixture.wait_terminal(&run_id).await;

        assert_eq!(first, Some(CancelMode::Running));
        assert_eq!(second, Some(CancelMode::Running));
        assert_eq!(run.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn a_briefly_failing_run_read_is_retried() {
        let fixture = Fixture::new(&PATHS).await;
        let adapter = Arc::new(ScriptedAdapter::new(three_steps()));
        let executor = fixture.start_with_store(fixture.unreadable_runs(1), adapter, None);

        let run_id = fixture.queue(&executor, RunOptions::default()).await;
        let run = fixture.wait_terminal(&run_id).await;

        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.total_requests, 3);
    }

    #[tokio::test]
    async fn an_unreadable_run_still_ends_in_error() {
        let fixture = Fixture::new(&PATHS).await;
        let adapter = Arc::new(ScriptedAdapter::new(three_steps()));
        let executor =
            fixture.start_with_store(fixture.unreadable_runs(usize::MAX), adapter.clone(), None);

        let run_id = fixture.queue(&executor, RunOptions::default()).await;
        let run = fixture.wait_terminal(&run_id).await;

        assert_eq!(run.status, RunStatus::Error);
        assert_eq!(run.health, Some(HealthStatus::Unknown));
        assert!(run
            .error_msg
            .as_deref()
            .unwrap()
            .starts_with("could not load run"));
        assert_eq!(run.environment_id.as_deref(), Some(fixture.env_id.as_str()));
        assert_eq!(adapter.starts(), 0);
    }

    #[tokio::test]
    async fn max_duration_counts_from_dequeue() {
        let fixture = Fixture::new(&PATHS).await;
        let adapter = Arc::new(ScriptedAdapter::new(vec![ScriptedStep::ok(PATHS[0]).delayed(30)]));
        let executor = fixture.start_with_store(fixture.slow_collections(150), adapter, None);

        let options = RunOptions {
            max_duration_ms: Some(100),
            ..RunOptions::default()
        };
        let run_id = fixture.queue(&executor, options).await;
        let run = fixture.wait_terminal(&run_id).await;

        assert_eq!(run.status, RunStatus::Timeout);
        assert_eq!(run.total_requests, 0);
    }

    #[tokio::test]
    async fn steps_without_a_path_resolve_by_name() {
        let fixture = Fixture::new(&PATHS).await;
        fixture.mark_critical(PATHS[1]).await;
        let steps = vec![
            ScriptedStep::ok(PATHS[0]),
            ScriptedStep::ok(PATHS[1]).without_path().failing("status is 201"),
            ScriptedStep::ok(PATHS[2]),
        ];
        let executor = fixture.start(ScriptedAdapter::new(steps), None);

        let run_id = fixture.queue(&executor, RunOptions::default()).await;
        let run = fixture.wait_terminal(&run_id).await;

        let critical = fixture
            .store
            .list_requests(&fixture.collection_id)
            .await
            .unwrap()
            .into_iter()
            .find(|request| request.path == PATHS[1])
            .unwrap();
        let recorded = fixture.store.list_steps(&run_id).await.unwrap();
        assert_eq!(recorded[1].request_id.as_deref(), Some(critical.id.as_str()));
        assert_eq!(recorded[1].status, StepStatus::Fail);
        assert_eq!(run.status, RunStatus::Partial);
        assert_eq!(run.health, Some(HealthStatus::Unhealthy));
    }
}
