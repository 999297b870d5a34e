//! Ports: the abstraction layer between the engine and its collaborators.
//!
//! Each trait hides one external dependency so implementations can be swapped
//! (and tests can run without infrastructure):
//! - `Backend`: the shared key-value store with pub/sub
//! - `PayloadCodec`: serialized job records
//! - `Clock` / `InstanceIdGenerator`: time and process identity

pub mod backend;
pub mod clock;
pub mod codec;
pub mod id_generator;

pub use self::backend::{Backend, BackendError, PubSubMessage, Subscription};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::codec::{CodecError, JsonCodec, PayloadCodec};
pub use self::id_generator::{InstanceIdGenerator, UlidGenerator};
