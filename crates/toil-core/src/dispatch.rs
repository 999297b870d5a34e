//! Pub/sub dispatcher: turns lifecycle events into local work.
//!
//! One dispatcher runs per processing `Queue` instance. It owns the
//! subscription to the three lifecycle channels and routes by channel
//! identity:
//! - `job:create` → try the pending→active claim; the winner loads the job
//!   and runs the handler on its own task
//! - `job:complete` / `job:fail` → resolve the local handle registry entry,
//!   a no-op when this process did not originate the job
//!
//! Duplicate or out-of-order `create` deliveries are harmless: the claim is
//! conditional, and losing it means taking no further action. Malformed
//! payloads are reported on the queue's error channel and dropped; pub/sub
//! has no redelivery, so there is nothing to retry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::domain::events::EventKind;
use crate::domain::{Job, JobEvent, JobId, JobOutcome, JobState};
use crate::error::ToilError;
use crate::ports::{PubSubMessage, Subscription};
use crate::queue::Inner;

/// How often the handle registry is swept for expired entries.
const SWEEP_PERIOD: Duration = Duration::from_secs(30);

/// The processing function of a queue. At most one is registered per `Queue`
/// instance; the returned error becomes the `job:fail` event's description.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

pub(crate) struct Dispatcher {
    inner: Arc<Inner>,
    handler: Arc<dyn JobHandler>,
    created_channel: String,
    completed_channel: String,
    failed_channel: String,
}

impl Dispatcher {
    pub(crate) fn new(inner: Arc<Inner>, handler: Arc<dyn JobHandler>) -> Self {
        let created_channel = inner.keys.channel(EventKind::Created);
        let completed_channel = inner.keys.channel(EventKind::Completed);
        let failed_channel = inner.keys.channel(EventKind::Failed);
        Self {
            inner,
            handler,
            created_channel,
            completed_channel,
            failed_channel,
        }
    }

    fn classify(&self, channel: &str) -> Option<EventKind> {
        if channel == self.created_channel {
            Some(EventKind::Created)
        } else if channel == self.completed_channel {
            Some(EventKind::Completed)
        } else if channel == self.failed_channel {
            Some(EventKind::Failed)
        } else {
            None
        }
    }

    pub(crate) async fn run(
        self,
        mut subscription: Subscription,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut sweep = tokio::time::interval(SWEEP_PERIOD);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = sweep.tick() => {
                    self.inner.registry.sweep().await;
                }
                message = subscription.next() => {
                    match message {
                        Some(message) => self.dispatch(message).await,
                        None => {
                            // The feeding side went away underneath us; only
                            // worth reporting if nobody asked us to stop.
                            if !*shutdown_rx.borrow() {
                                self.inner.report(None, "pub/sub subscription closed");
                            }
                            break;
                        }
                    }
                }
            }
        }
        debug!(queue = %self.inner.keys.name(), "dispatcher stopped");
    }

    async fn dispatch(&self, message: PubSubMessage) {
        let Some(kind) = self.classify(&message.channel) else {
            warn!(channel = %message.channel, "message on unexpected channel");
            return;
        };
        let event = match JobEvent::decode(kind, &message.payload) {
            Ok(event) => event,
            Err(err) => {
                self.inner.report(
                    None,
                    ToilError::MalformedEvent {
                        channel: message.channel,
                        detail: err.to_string(),
                    }
                    .to_string(),
                );
                return;
            }
        };
        match event {
            JobEvent::Created { id } => {
                // Claim and execute off the dispatch loop; jobs run
                // concurrently, the engine imposes no per-process limit.
                let inner = Arc::clone(&self.inner);
                let handler = Arc::clone(&self.handler);
                tokio::spawn(async move {
                    execute(inner, handler, id).await;
                });
            }
            JobEvent::Completed { id } => {
                self.inner.registry.resolve(id, JobOutcome::Completed).await;
            }
            JobEvent::Failed { id, error } => {
                self.inner
                    .registry
                    .resolve(id, JobOutcome::Failed { error })
                    .await;
            }
        }
    }
}

/// Claim one announced job and, on winning, run it to a terminal state.
async fn execute(inner: Arc<Inner>, handler: Arc<dyn JobHandler>, id: JobId) {
    match inner.store.claim(id).await {
        // Someone else is handling this: the normal losing outcome.
        Ok(false) => return,
        Ok(true) => {}
        Err(err) => {
            inner.report(Some(id), format!("claim failed: {err}"));
            return;
        }
    }

    // Secondary guard around the handler invocation itself.
    match inner.lock.claim("job", id).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(job = %id, "claim won but execution lock is held elsewhere");
            return;
        }
        Err(err) => {
            inner.report(Some(id), format!("lock claim failed: {err}"));
            return;
        }
    }

    run_to_terminal(&inner, &handler, id).await;

    if let Err(err) = inner.lock.release("job", id).await {
        inner.report(Some(id), format!("lock release failed: {err}"));
    }
}

async fn run_to_terminal(inner: &Arc<Inner>, handler: &Arc<dyn JobHandler>, id: JobId) {
    let job = match Job::load(id, inner.backend.as_ref(), &inner.keys, inner.codec.as_ref()).await
    {
        Ok(job) => job,
        Err(err) => {
            // Claimed but unloadable (missing or corrupt record): fail it so
            // the id does not sit in `active` forever.
            inner.report(Some(id), format!("loading claimed job failed: {err}"));
            finish(inner, id, JobState::Failed).await;
            publish(
                inner,
                JobEvent::Failed {
                    id,
                    error: err.to_string(),
                },
            )
            .await;
            return;
        }
    };

    match handler.handle(&job).await {
        Ok(()) => {
            finish(inner, id, JobState::Complete).await;
            publish(inner, JobEvent::Completed { id }).await;
            info!(job = %id, queue = %inner.keys.name(), "job completed");
        }
        Err(err) => {
            finish(inner, id, JobState::Failed).await;
            publish(
                inner,
                JobEvent::Failed {
                    id,
                    error: err.to_string(),
                },
            )
            .await;
            info!(job = %id, queue = %inner.keys.name(), error = %err, "job failed");
        }
    }
}

async fn finish(inner: &Arc<Inner>, id: JobId, outcome: JobState) {
    match inner.store.finish(id, outcome).await {
        Ok(true) => {}
        Ok(false) => warn!(job = %id, "finished job was not in the active collection"),
        Err(err) => inner.report(Some(id), format!("terminal transition failed: {err}")),
    }
}

async fn publish(inner: &Arc<Inner>, event: JobEvent) {
    let id = event.id();
    if let Err(err) = inner.publish_event(&event).await {
        inner.report(Some(id), format!("publishing terminal event failed: {err}"));
    }
}
