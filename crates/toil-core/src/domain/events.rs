//! Lifecycle events carried over the backend's pub/sub channels.
//!
//! Three channels per queue: `job:create`, `job:complete`, `job:fail`. The
//! channel identity says what happened; the payload is a small JSON body.
//! A `create` event carries only the job id; the job record itself lives
//! under its own key and is loaded by whichever process wins the claim.

use serde::{Deserialize, Serialize};

use super::ids::JobId;

/// Which lifecycle channel an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Completed,
    Failed,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [EventKind::Created, EventKind::Completed, EventKind::Failed];

    /// Key parts of the channel under the queue namespace.
    pub fn channel_parts(self) -> [&'static str; 2] {
        match self {
            EventKind::Created => ["job", "create"],
            EventKind::Completed => ["job", "complete"],
            EventKind::Failed => ["job", "fail"],
        }
    }
}

/// A decoded lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Created { id: JobId },
    Completed { id: JobId },
    Failed { id: JobId, error: String },
}

#[derive(Serialize, Deserialize)]
struct IdBody {
    id: JobId,
}

#[derive(Serialize, Deserialize)]
struct FailBody {
    id: JobId,
    error: String,
}

impl JobEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            JobEvent::Created { .. } => EventKind::Created,
            JobEvent::Completed { .. } => EventKind::Completed,
            JobEvent::Failed { .. } => EventKind::Failed,
        }
    }

    pub fn id(&self) -> JobId {
        match self {
            JobEvent::Created { id } | JobEvent::Completed { id } | JobEvent::Failed { id, .. } => {
                *id
            }
        }
    }

    /// Wire form of the event body.
    pub fn encode(&self) -> String {
        let body = match self {
            JobEvent::Created { id } | JobEvent::Completed { id } => {
                serde_json::json!({ "id": id })
            }
            JobEvent::Failed { id, error } => serde_json::json!({ "id": id, "error": error }),
        };
        body.to_string()
    }

    /// Decode an inbound body for the channel it arrived on.
    pub fn decode(kind: EventKind, payload: &str) -> Result<Self, serde_json::Error> {
        match kind {
            EventKind::Created => {
                let body: IdBody = serde_json::from_str(payload)?;
                Ok(JobEvent::Created { id: body.id })
            }
            EventKind::Completed => {
                let body: IdBody = serde_json::from_str(payload)?;
                Ok(JobEvent::Completed { id: body.id })
            }
            EventKind::Failed => {
                let body: FailBody = serde_json::from_str(payload)?;
                Ok(JobEvent::Failed {
                    id: body.id,
                    error: body.error,
                })
            }
        }
    }
}

/// Terminal outcome of a job, resolved onto the local `JobHandle` that was
/// returned by `add`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed { error: String },
}
