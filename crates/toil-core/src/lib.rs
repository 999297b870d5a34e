//! toil-core
//!
//! Core building blocks for the Toil distributed job queue.
//!
//! Many independent processes share one key-value backend (with pub/sub) and
//! coordinate through it: any process can enqueue a job, and exactly one
//! process executes it. There is no central broker; the backend's atomic
//! primitives carry all cross-process coordination.
//!
//! # Module map
//! - **domain**: job entity, ids, lifecycle state machine, wire events
//! - **ports**: abstraction layer (Backend, PayloadCodec, Clock, IdGenerator)
//! - **backend**: port implementations (InMemoryBackend for dev/test, RedisBackend)
//! - **keys**: deterministic key/channel namespace for a named queue
//! - **lock**: exclusive claim markers around job execution
//! - **store**: the five status collections and the atomic transitions between them
//! - **dispatch**: pub/sub subscriber that turns `job:create` events into handler runs
//! - **queue**: the `Queue` facade (add, process, count, pause, resume, ...)

pub mod backend;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod keys;
pub mod lock;
pub mod ports;
pub mod queue;
pub mod store;

pub use backend::{InMemoryBackend, RedisBackend};
pub use dispatch::JobHandler;
pub use domain::{InstanceId, Job, JobId, JobOutcome, JobSource, JobState, QueueStatus};
pub use error::ToilError;
pub use keys::KeySpace;
pub use ports::{Backend, BackendError, CodecError, JsonCodec, PayloadCodec};
pub use queue::{ErrorReport, JobHandle, Queue, QueueBuilder};
