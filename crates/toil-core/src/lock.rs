//! Exclusive claim markers around job execution.
//!
//! A lock is a marker key whose existence is the lock and whose value is the
//! claiming instance id. The primary exactly-once guarantee comes from the
//! state store's pending→active move; this is a second, narrower guard
//! around the handler invocation itself.
//!
//! There is no renewal heartbeat. An optional TTL bounds how long a crashed
//! claimant can keep a job's lock wedged; without one, a lock lost to a
//! crash stays held until released by hand.

use std::sync::Arc;
use std::time::Duration;

use crate::domain::JobId;
use crate::error::ToilError;
use crate::keys::KeySpace;
use crate::ports::Backend;

pub struct LockManager {
    backend: Arc<dyn Backend>,
    keys: KeySpace,
    ttl: Option<Duration>,
}

impl LockManager {
    pub fn new(backend: Arc<dyn Backend>, keys: KeySpace, ttl: Option<Duration>) -> Self {
        Self { backend, keys, ttl }
    }

    /// Atomically take the marker for `kind`/`id`. Returns whether this
    /// instance now owns it; `false` means another claimant holds it.
    pub async fn claim(&self, kind: &str, id: JobId) -> Result<bool, ToilError> {
        let owner = self.keys.instance().to_string();
        let claimed = self
            .backend
            .set_if_absent(&self.keys.lock_key(kind, id), &owner, self.ttl)
            .await?;
        Ok(claimed)
    }

    /// Drop the marker unconditionally. Must run exactly once per successful
    /// claim, on the failure path too, or the job stays locked for good
    /// (TTL aside).
    pub async fn release(&self, kind: &str, id: JobId) -> Result<(), ToilError> {
        self.backend.delete(&self.keys.lock_key(kind, id)).await?;
        Ok(())
    }
}
