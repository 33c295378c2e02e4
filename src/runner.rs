pub mod http;
#[cfg(test)]
pub mod scripted;
pub mod script;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::collection::parser::{CollectionDocument, EnvironmentDocument};
use crate::run::model::{HeaderEntry, RunOptions};

const EVENT_BUFFER: usize = 64;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// The adapter's own message, stored as the run's `errorMsg`.
    #[error("{0}")]
    Start(String),
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RunnerOptions {
    pub timeout_request_ms: Option<u64>,
    pub delay_request_ms: Option<u64>,
    pub bail: bool,
    pub insecure: bool,
}

impl From<&RunOptions> for RunnerOptions {
    fn from(options: &RunOptions) -> Self {
        RunnerOptions {
            timeout_request_ms: options.timeout_request_ms,
            delay_request_ms: options.delay_request_ms,
            bail: options.bail,
            insecure: options.insecure,
        }
    }
}

/// Identity of the collection item an event refers to. `path` is the
/// folder-qualified path when the adapter knows it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecutedItem {
    pub name: String,
    pub path: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RequestCompleted {
    pub item: ExecutedItem,
    /// `0` when no response was received.
    pub http_status: u16,
    pub status_text: Option<String>,
    pub latency_ms: u64,
    pub response_size: u64,
    pub headers: Vec<HeaderEntry>,
    pub body: Vec<u8>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssertionEvaluated {
    pub name: String,
    pub passed: bool,
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunDone {
    pub error: Option<String>,
    /// True only if an abort actually stopped work that was still pending.
    pub aborted: bool,
    pub summary: Value,
}

/// Low-level events of one execution. Assertions belong to the most recent
/// `RequestCompleted`; `Done` is always last.
#[derive(Clone, Debug, PartialEq)]
pub enum AdapterEvent {
    RequestCompleted(RequestCompleted),
    AssertionEvaluated(AssertionEvaluated),
    Done(RunDone),
}

/// Consumer side of a started execution.
pub struct ExecutionHandle {
    events: mpsc::Receiver<AdapterEvent>,
    abort: watch::Sender<bool>,
}

impl ExecutionHandle {
    pub fn pair() -> (ExecutionHandle, AdapterSink) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (abort_tx, abort_rx) = watch::channel(false);
        (
            ExecutionHandle {
                events: events_rx,
                abort: abort_tx,
            },
            AdapterSink {
                events: events_tx,
                abort: abort_rx,
            },
        )
    }

    /// `None` once the adapter dropped its sink.
    pub async fn next_event(&mut self) -> Option<AdapterEvent> {
        self.events.recv().await
    }

    pub fn abort(&self) {
        self.abort.send_replace(true);
    }
}

/// Producer side handed to the task doing the work.
pub struct AdapterSink {
    events: mpsc::Sender<AdapterEvent>,
    abort: watch::Receiver<bool>,
}

impl AdapterSink {
    /// Returns false when nobody listens anymore.
    pub async fn emit(&self, event: AdapterEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    pub fn is_aborted(&self) -> bool {
        *self.abort.borrow()
    }

    /// Resolves once abort was requested or the handle is gone.
    pub async fn aborted(&mut self) {
        loop {
            if *self.abort.borrow_and_update() {
                return;
            }
            if self.abort.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Boundary to whatever actually executes a collection.
pub trait ExecutionAdapter: Send + Sync {
    fn start(
        &self,
        collection: CollectionDocument,
        environment: Option<EnvironmentDocument>,
        options: RunnerOptions,
    ) -> Result<ExecutionHandle, AdapterError>;
}
