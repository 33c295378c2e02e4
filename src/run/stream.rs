use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::api::{AppError, AppState};
use crate::persistence::store::Store;
use crate::run::events::{EventBus, RunEvent, Subscription};

/// Opens per-run event streams on top of the [`EventBus`].
pub struct LiveStreamGateway {
    bus: Arc<EventBus>,
    store: Arc<dyn Store>,
}

impl LiveStreamGateway {
    pub fn new(bus: Arc<EventBus>, store: Arc<dyn Store>) -> Self {
        LiveStreamGateway { bus, store }
    }

    /// Subscribes before reading the run, so nothing published after the
    /// read can be missed. A run that already finished yields a single
    /// `run_finished` built from its stored state.
    pub async fn open(&self, run_id: &str) -> Result<RunEventStream, AppError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let wanted = run_id.to_string();
        let subscription = self.bus.subscribe(move |event| {
            if event.run_id() == wanted {
                let _ = sender.send(event.clone());
            }
        });

        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("run {run_id} not found")))?;

        if run.status.is_terminal() {
            drop(subscription);
            let (sender, receiver) = mpsc::unbounded_channel();
            let _ = sender.send(RunEvent::RunFinished {
                run_id: run.id.clone(),
                summary: run,
            });
            return Ok(RunEventStream::new(run_id, receiver, None));
        }
        debug!(run_id, "live stream opened");
        Ok(RunEventStream::new(run_id, receiver, Some(subscription)))
    }
}

/// Events of one run in publish order. Ends after `run_finished`.
pub struct RunEventStream {
    run_id: String,
    receiver: mpsc::UnboundedReceiver<RunEvent>,
    subscription: Option<Subscription>,
    finished: bool,
}

impl RunEventStream {
    fn new(
        run_id: &str,
        receiver: mpsc::UnboundedReceiver<RunEvent>,
        subscription: Option<Subscription>,
    ) -> Self {
        RunEventStream {
            run_id: run_id.to_string(),
            receiver,
            subscription,
            finished: false,
        }
    }
}

impl Stream for RunEventStream {
    type Item = RunEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<RunEvent>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.receiver.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_terminal() {
                    self.finished = true;
                    self.subscription.take();
                }
                Poll::Ready(Some(event))
            }
            other => other,
        }
    }
}

impl Drop for RunEventStream {
    fn drop(&mut self) {
        debug!(run_id = %self.run_id, finished = self.finished, "live stream closed");
    }
}

pub async fn stream_run(
    Path(id): Path<String>,
    State(app_state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let events = app_state.gateway.open(&id).await?;
    let stream = events.map(|event| {
        let frame = Event::default().event(event.kind());
        Ok::<_, Infallible>(frame.json_data(&event).unwrap_or_else(|err| {
            warn!(run_id = event.run_id(), error = %err, "could not serialize run event");
            Event::default().event(event.kind())
        }))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
