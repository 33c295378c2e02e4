use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use crate::collection::parser::{CollectionDocument, EnvironmentDocument};
use crate::runner::{
    AdapterError, AdapterEvent, AssertionEvaluated, ExecutedItem, ExecutionAdapter,
    ExecutionHandle, RequestCompleted, RunDone, RunnerOptions,
};

/// One canned request outcome.
#[derive(Clone, Debug)]
pub struct ScriptedStep {
    pub name: String,
    pub path: Option<String>,
    pub http_status: u16,
    pub delay_ms: u64,
    pub latency_ms: u64,
    pub assertions: Vec<(String, bool)>,
}

impl ScriptedStep {
    pub fn ok(path: &str) -> Self {
        ScriptedStep {
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            path: Some(path.to_string()),
            http_status: 200,
            delay_ms: 0,
            latency_ms: 10,
            assertions: vec![("status is 200".to_string(), true)],
        }
    }

    pub fn failing(mut self, assertion: &str) -> Self {
        self.http_status = 404;
        self.assertions.push((assertion.to_string(), false));
        self
    }

    pub fn delayed(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn without_path(mut self) -> Self {
        self.path = None;
        self
    }
}

/// Adapter replaying canned steps, each after its own delay.
#[derive(Default)]
pub struct ScriptedAdapter {
    steps: Vec<ScriptedStep>,
    start_error: Option<String>,
    done_error: Option<String>,
    starts: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        ScriptedAdapter {
            steps,
            ..Default::default()
        }
    }

    pub fn failing_to_start(message: &str) -> Self {
        ScriptedAdapter {
            start_error: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub fn finishing_with_error(mut self, message: &str) -> Self {
        self.done_error = Some(message.to_string());
        self
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

impl ExecutionAdapter for ScriptedAdapter {
    fn start(
        &self,
        _collection: CollectionDocument,
        _environment: Option<EnvironmentDocument>,
        _options: RunnerOptions,
    ) -> Result<ExecutionHandle, AdapterError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.start_error {
            return Err(AdapterError::Start(message.clone()));
        }
        let steps = self.steps.clone();
        let done_error = self.done_error.clone();
        let (handle, mut sink) = ExecutionHandle::pair();
        tokio::spawn(async move {
            for step in steps {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(step.delay_ms)) => {}
                    _ = sink.aborted() => {
                        sink.emit(AdapterEvent::Done(RunDone {
                            error: None,
                            aborted: true,
                            summary: json!({}),
                        }))
                        .await;
                        return;
                    }
                }
                let now = Utc::now();
                sink.emit(AdapterEvent::RequestCompleted(RequestCompleted {
                    item: ExecutedItem {
                        name: step.name.clone(),
                        path: step.path.clone(),
                    },
                    http_status: step.http_status,
                    status_text: None,
                    latency_ms: step.latency_ms,
                    response_size: 2,
                    headers: vec![],
                    body: b"{}".to_vec(),
                    started_at: now,
                    ended_at: now,
                }))
                .await;
                for (name, passed) in step.assertions {
                    sink.emit(AdapterEvent::AssertionEvaluated(AssertionEvaluated {
                        error: (!passed).then(|| format!("{name} failed")),
                        name,
                        passed,
                    }))
                    .await;
                }
            }
            sink.emit(AdapterEvent::Done(RunDone {
                error: done_error,
                aborted: false,
                summary: json!({}),
            }))
            .await;
        });
        Ok(handle)
    }
}
