use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::{debug, warn};

use crate::collection::model::CollectionRequest;
use crate::persistence::store::Store;
use crate::run::events::{EventBus, RunEvent};
use crate::run::model::{
    AssertionStatus, BodyEncoding, HeaderEntry, ResponseMeta, RunAssertion, RunStep, StepStatus,
};
use crate::runner::{AssertionEvaluated, ExecutedItem, RequestCompleted};

const PREVIEW_LIMIT: usize = 4 * 1024;

/// Maps executed items onto indexed requests, by path first and by name
/// when the path is unknown.
pub struct RequestIndex {
    by_path: HashMap<String, CollectionRequest>,
    by_name: HashMap<String, CollectionRequest>,
}

impl RequestIndex {
    pub fn new(requests: Vec<CollectionRequest>) -> Self {
        let mut by_path = HashMap::new();
        let mut by_name = HashMap::new();
        for request in requests {
            by_name
                .entry(request.name.clone())
                .or_insert_with(|| request.clone());
            by_path.entry(request.path.clone()).or_insert(request);
        }
        RequestIndex { by_path, by_name }
    }

    pub fn resolve(&self, item: &ExecutedItem) -> Option<&CollectionRequest> {
        item.path
            .as_ref()
            .and_then(|path| self.by_path.get(path))
            .or_else(|| self.by_name.get(&item.name))
    }
}

struct CurrentStep {
    step: RunStep,
    downgraded: bool,
}

/// Persists adapter events of one run as steps and assertions and
/// publishes them once written.
///
/// Callers feed events one at a time and await each call, so an
/// assertion always sees the step written before it. Write failures are
/// logged and only cost the affected row.
pub struct StepRecorder {
    run_id: String,
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    index: RequestIndex,
    next_step_index: u32,
    next_assertion_index: u32,
    current: Option<CurrentStep>,
}

impl StepRecorder {
    pub fn new(
        run_id: &str,
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        requests: Vec<CollectionRequest>,
    ) -> Self {
        StepRecorder {
            run_id: run_id.to_string(),
            store,
            bus,
            index: RequestIndex::new(requests),
            next_step_index: 0,
            next_assertion_index: 0,
            current: None,
        }
    }

    pub async fn request_completed(&mut self, completed: RequestCompleted) {
        self.current = None;
        let resolved = self.index.resolve(&completed.item);
        let response = (completed.http_status > 0).then(|| {
            response_meta(completed.status_text.clone(), completed.headers, &completed.body)
        });
        let step = RunStep::builder()
            .run_id(self.run_id.clone())
            .maybe_request_id(resolved.map(|request| request.id.clone()))
            .maybe_request_path(
                resolved
                    .map(|request| request.path.clone())
                    .or(completed.item.path),
            )
            .name(completed.item.name)
            .order_index(self.next_step_index)
            .maybe_http_status((completed.http_status > 0).then_some(completed.http_status))
            .latency_ms(completed.latency_ms)
            .response_size(completed.response_size)
            .maybe_response(response)
            .started_at(completed.started_at)
            .ended_at(completed.ended_at)
            .build();

        match self.store.create_step(step).await {
            Ok(step) => {
                self.next_step_index += 1;
                debug!(run_id = %self.run_id, step_id = %step.id, order_index = step.order_index, "step recorded");
                self.publish_step(&step);
                self.current = Some(CurrentStep {
                    step,
                    downgraded: false,
                });
            }
            Err(err) => {
                warn!(run_id = %self.run_id, error = %err, "could not persist step, skipping it");
            }
        }
    }

    pub async fn assertion_evaluated(&mut self, evaluated: AssertionEvaluated) {
        let Some(current) = self.current.as_mut() else {
            warn!(run_id = %self.run_id, name = %evaluated.name, "assertion without a recorded step, dropping it");
            return;
        };

        if !evaluated.passed && !current.downgraded {
            current.downgraded = true;
            match self
                .store
                .mark_step_failed(&self.run_id, &current.step.id)
                .await
            {
                Ok(()) => {
                    current.step.status = StepStatus::Fail;
                    let step = current.step.clone();
                    self.publish_step(&step);
                }
                Err(err) => {
                    warn!(run_id = %self.run_id, step_id = %current.step.id, error = %err, "could not downgrade step");
                }
            }
        }

        let Some(current) = self.current.as_ref() else {
            return;
        };
        let assertion = RunAssertion::builder()
            .run_id(self.run_id.clone())
            .run_step_id(current.step.id.clone())
            .order_index(self.next_assertion_index)
            .name(evaluated.name)
            .status(if evaluated.passed {
                AssertionStatus::Pass
            } else {
                AssertionStatus::Fail
            })
            .maybe_error_msg(evaluated.error)
            .build();
        match self.store.create_assertion(assertion).await {
            Ok(assertion) => {
                self.next_assertion_index += 1;
                self.bus.publish(&RunEvent::AssertionResult {
                    run_id: self.run_id.clone(),
                    step_id: assertion.run_step_id.clone(),
                    assertion,
                });
            }
            Err(err) => {
                warn!(run_id = %self.run_id, error = %err, "could not persist assertion, skipping it");
            }
        }
    }

    fn publish_step(&self, step: &RunStep) {
        self.bus.publish(&RunEvent::StepProgress {
            run_id: self.run_id.clone(),
            step: step.clone(),
        });
    }
}

/// Keeps at most 4 KiB of the body: text when it is UTF-8, base64
/// otherwise.
pub fn response_meta(
    status_text: Option<String>,
    headers: Vec<HeaderEntry>,
    body: &[u8],
) -> ResponseMeta {
    let truncated = body.len() > PREVIEW_LIMIT;
    let preview = &body[..body.len().min(PREVIEW_LIMIT)];
    let (body_preview, body_encoding) = if preview.is_empty() {
        (None, None)
    } else {
        match std::str::from_utf8(preview) {
            Ok(text) => (Some(text.to_string()), Some(BodyEncoding::Utf8)),
            // cut inside a multi-byte character at the limit
            Err(err) if truncated && err.error_len().is_none() => {
                let text = String::from_utf8_lossy(&preview[..err.valid_up_to()]).into_owned();
                (Some(text), Some(BodyEncoding::Utf8))
            }
            Err(_) => (Some(STANDARD.encode(preview)), Some(BodyEncoding::Base64)),
        }
    };
    ResponseMeta {
        status_text,
        headers,
        body_preview,
        body_encoding,
        truncated,
    }
}
