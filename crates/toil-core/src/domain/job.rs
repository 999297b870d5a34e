//! Job entity: identity, payload, provenance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ToilError;
use crate::keys::KeySpace;
use crate::ports::{Backend, PayloadCodec};

use super::ids::{InstanceId, JobId};

/// Snapshot of the creating queue's public identity, persisted with the job
/// for diagnostics. It records who enqueued the job; it does not imply live
/// ownership; any process may end up executing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSource {
    pub queue: String,
    pub instance: InstanceId,
}

impl JobSource {
    pub fn new(queue: impl Into<String>, instance: InstanceId) -> Self {
        Self {
            queue: queue.into(),
            instance,
        }
    }
}

/// A unit of work.
///
/// Value-like: jobs cross process boundaries only through their serialized
/// record `{id, payload, source, created_at}`. The payload is opaque to the
/// engine and round-trips through the codec with nested structure intact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub payload: Value,
    pub source: JobSource,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: JobId, payload: Value, source: JobSource, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            payload,
            source,
            created_at,
        }
    }

    /// Write the serialized record at the key derived from the job id.
    /// Idempotent: saving twice overwrites with the same bytes.
    pub async fn save(
        &self,
        backend: &dyn Backend,
        keys: &KeySpace,
        codec: &dyn PayloadCodec,
    ) -> Result<(), ToilError> {
        let raw = codec.encode(self)?;
        backend.set(&keys.job_key(self.id), &raw).await?;
        Ok(())
    }

    /// Fetch and decode a persisted job.
    ///
    /// An absent key is `JobNotFound`; an undecodable record surfaces as a
    /// codec error.
    pub async fn load(
        id: JobId,
        backend: &dyn Backend,
        keys: &KeySpace,
        codec: &dyn PayloadCodec,
    ) -> Result<Self, ToilError> {
        let raw = backend
            .get(&keys.job_key(id))
            .await?
            .ok_or(ToilError::JobNotFound(id))?;
        Ok(codec.decode(&raw)?)
    }
}
