//! Backend port: the shared key-value store with pub/sub.
//!
//! Everything the engine needs from its backend, and nothing more: scalar
//! get/set, an atomic counter, set membership with atomic moves, batched
//! cardinality reads, a handful of compound conditional operations, and
//! publish/subscribe. A Redis implementation does the compound operations
//! with Lua scripts; the in-memory implementation does them under one lock.
//!
//! Subscribing and issuing ordinary commands must be separable: many backends
//! forbid mixing subscription-mode and command-mode traffic on a single
//! connection, so `subscribe` hands back an independent message stream and
//! implementations keep a dedicated connection for publishing.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Backend-level failure. Deliberately coarse: the engine treats every
/// backend error the same way (propagate or report), so implementations fold
/// their client errors into these two shapes.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend connection error: {0}")]
    Connection(String),

    #[error("backend command failed: {0}")]
    Command(String),
}

/// One message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: String,
}

/// A live subscription: an independent stream of messages for the channels it
/// was opened with. Dropping it tears down the underlying connection.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<PubSubMessage>,
    forwarder: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Subscription fed directly by the backend (in-memory case).
    pub fn from_receiver(rx: mpsc::UnboundedReceiver<PubSubMessage>) -> Self {
        Self {
            rx,
            forwarder: None,
        }
    }

    /// Subscription fed by a spawned forwarder task that owns the dedicated
    /// subscriber connection; the task is aborted when the subscription is
    /// dropped.
    pub fn with_forwarder(rx: mpsc::UnboundedReceiver<PubSubMessage>, task: JoinHandle<()>) -> Self {
        Self {
            rx,
            forwarder: Some(task),
        }
    }

    /// Next message, or `None` once the feeding side is gone.
    pub async fn next(&mut self) -> Option<PubSubMessage> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.forwarder.take() {
            task.abort();
        }
    }
}

/// The shared key-value store with pub/sub.
///
/// Every method is atomic with respect to concurrent callers on the same
/// backend; that atomicity is what the engine builds its exactly-once
/// claim on. No method blocks the caller beyond its own round trip.
#[async_trait]
pub trait Backend: Send + Sync {
    // Scalars.

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), BackendError>;

    /// Set only if the key is absent; `ttl` additionally arms expiry.
    /// Returns whether the caller performed the write.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, BackendError>;

    /// Delete a key; returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, BackendError>;

    /// Atomic increment, returning the new value. A missing key counts from
    /// zero, so the first call returns 1.
    async fn incr(&self, key: &str) -> Result<u64, BackendError>;

    // Sets.

    /// Insert into a set; returns whether the member was new.
    async fn add_member(&self, key: &str, member: &str) -> Result<bool, BackendError>;

    /// Compound conditional insert: read `flag`, compare against `expected`,
    /// and insert `member` into `if_match` on equality, `otherwise` on
    /// anything else (including an absent flag), all as one atomic step.
    /// Returns whether the flag matched.
    async fn add_member_by_flag(
        &self,
        flag: &str,
        expected: &str,
        if_match: &str,
        otherwise: &str,
        member: &str,
    ) -> Result<bool, BackendError>;

    /// Conditional move of one member between sets. Returns `false` without
    /// side effects when the member is not in `from`; not an error.
    async fn move_member(
        &self,
        from: &str,
        to: &str,
        member: &str,
    ) -> Result<bool, BackendError>;

    /// Bulk move: union all members of `from` into `to` and delete `from`,
    /// as one atomic step. A missing source is success with nothing moved.
    /// Returns the moved members.
    async fn move_all(&self, from: &str, to: &str) -> Result<Vec<String>, BackendError>;

    async fn members(&self, key: &str) -> Result<Vec<String>, BackendError>;

    /// Cardinalities of several sets from one batched read, so the counts
    /// are a consistent snapshot. Missing sets count zero.
    async fn cardinalities(&self, keys: &[String]) -> Result<Vec<u64>, BackendError>;

    /// Atomically delete a set and, for each member, the scalar key
    /// `value_key_prefix + member`. Returns how many members were dropped.
    async fn drain_set(&self, key: &str, value_key_prefix: &str) -> Result<u64, BackendError>;

    // Pub/sub.

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BackendError>;

    async fn subscribe(&self, channels: &[String]) -> Result<Subscription, BackendError>;
}
