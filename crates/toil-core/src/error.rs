use thiserror::Error;

use crate::domain::JobId;
use crate::ports::{BackendError, CodecError};

/// Crate-level error type.
///
/// Configuration errors (`EmptyName`, `HandlerAlreadyRegistered`) are returned
/// synchronously at call time. Backend and codec errors are returned from the
/// call that hit them, or reported on the queue's error channel when they
/// happen inside the dispatcher.
#[derive(Debug, Error)]
pub enum ToilError {
    #[error("missing or empty name for queue")]
    EmptyName,

    #[error("queue already has a processing handler")]
    HandlerAlreadyRegistered,

    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("queue is closed")]
    Closed,

    /// The local handle registry evicted this job before a terminal event
    /// arrived (capacity or TTL). The job itself is unaffected.
    #[error("job handle evicted before a terminal event arrived")]
    HandleEvicted,

    #[error("malformed event on {channel}: {detail}")]
    MalformedEvent { channel: String, detail: String },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}
