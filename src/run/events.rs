use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde::Serialize;

use crate::run::model::{Run, RunAssertion, RunStep};

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    #[serde(rename_all = "camelCase")]
    RunStarted { run_id: String },
    #[serde(rename_all = "camelCase")]
    StepProgress { run_id: String, step: RunStep },
    #[serde(rename_all = "camelCase")]
    AssertionResult {
        run_id: String,
        step_id: String,
        assertion: RunAssertion,
    },
    #[serde(rename_all = "camelCase")]
    RunFinished { run_id: String, summary: Run },
}

impl RunEvent {
    pub fn run_id(&self) -> &str {
        match self {
            RunEvent::RunStarted { run_id }
            | RunEvent::StepProgress { run_id, .. }
            | RunEvent::AssertionResult { run_id, .. }
            | RunEvent::RunFinished { run_id, .. } => run_id,
        }
    }

    /// Event name used on the live stream.
    pub fn kind(&self) -> &'static str {
        match self {
            RunEvent::RunStarted { .. } => "run_started",
            RunEvent::StepProgress { .. } => "step_progress",
            RunEvent::AssertionResult { .. } => "assertion_result",
            RunEvent::RunFinished { .. } => "run_finished",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunEvent::RunFinished { .. })
    }
}

type Handler = Arc<dyn Fn(&RunEvent) + Send + Sync>;

/// In-process broadcast of run lifecycle events. Nothing is buffered, a
/// subscriber only sees events published while it is registered.
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(u64, Handler)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls every registered handler in subscription order on the caller's
    /// thread.
    pub fn publish(&self, event: &RunEvent) {
        let handlers: Vec<Handler> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(event);
        }
    }

    pub fn subscribe<F>(self: &Arc<Self>, handler: F) -> Subscription
    where
        F: Fn(&RunEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(handler)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn remove(&self, id: u64) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(subscriber_id, _)| *subscriber_id != id);
    }
}

/// Registration handle; dropping it unsubscribes.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: u64,
}

impl Subscription {
    #[cfg(test)]
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}
