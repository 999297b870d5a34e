//! Instance id generation.
//!
//! Instance ids identify one running `Queue` object for its process lifetime.
//! They are minted locally (no backend round trip), unlike job ids, which
//! always come from the backend's atomic counter.

use ulid::Ulid;

use crate::domain::InstanceId;
use crate::ports::Clock;

/// Generates process-lifetime instance ids.
pub trait InstanceIdGenerator: Send + Sync {
    fn generate(&self) -> InstanceId;
}

/// ULID-based generator: timestamp from the injected clock, entropy from the
/// thread-local RNG. Sortable by creation time, collision-free across nodes
/// without coordination.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> InstanceIdGenerator for UlidGenerator<C> {
    fn generate(&self) -> InstanceId {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        InstanceId::from_ulid(Ulid::from_parts(timestamp_ms, rand::random()))
    }
}
