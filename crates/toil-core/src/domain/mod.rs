//! Domain model (ids, job entity, lifecycle states, wire events).

pub mod events;
pub mod ids;
pub mod job;
pub mod state;

pub use events::{EventKind, JobEvent, JobOutcome};
pub use ids::{InstanceId, JobId};
pub use job::{Job, JobSource};
pub use state::{JobState, QueueStatus};
