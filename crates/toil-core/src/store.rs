//! State store: the five status collections and the transitions between them.
//!
//! Every transition is one atomic backend operation, so concurrent callers on
//! the same backend can never observe (or create) a job in two collections.
//! The pending→active move is the exactly-once seam: losing it means another
//! process owns the job, which is a normal outcome.

use std::sync::Arc;

use tracing::warn;

use crate::domain::{JobId, JobState, QueueStatus};
use crate::error::ToilError;
use crate::keys::KeySpace;
use crate::ports::Backend;

pub struct StateStore {
    backend: Arc<dyn Backend>,
    keys: KeySpace,
}

impl StateStore {
    pub fn new(backend: Arc<dyn Backend>, keys: KeySpace) -> Self {
        Self { backend, keys }
    }

    /// Place a freshly created job id into `paused` or `pending`, chosen by
    /// the persisted status flag inside the same atomic step, so a pause
    /// toggling between check and insert cannot strand the id.
    pub async fn place_new(&self, id: JobId) -> Result<JobState, ToilError> {
        let paused = self
            .backend
            .add_member_by_flag(
                &self.keys.status_key(),
                QueueStatus::Paused.as_str(),
                &self.keys.state_set(JobState::Paused),
                &self.keys.state_set(JobState::Pending),
                &id.to_string(),
            )
            .await?;
        Ok(if paused {
            JobState::Paused
        } else {
            JobState::Pending
        })
    }

    /// Try to claim a job for execution: conditional move pending→active.
    /// `false` means the id was no longer pending (someone else claimed it,
    /// or it never existed); take no further action.
    pub async fn claim(&self, id: JobId) -> Result<bool, ToilError> {
        let moved = self
            .backend
            .move_member(
                &self.keys.state_set(JobState::Pending),
                &self.keys.state_set(JobState::Active),
                &id.to_string(),
            )
            .await?;
        Ok(moved)
    }

    /// Move a claimed job to its terminal collection. Only the process that
    /// won the claim performs this.
    pub async fn finish(&self, id: JobId, outcome: JobState) -> Result<bool, ToilError> {
        debug_assert!(outcome.is_terminal());
        let moved = self
            .backend
            .move_member(
                &self.keys.state_set(JobState::Active),
                &self.keys.state_set(outcome),
                &id.to_string(),
            )
            .await?;
        Ok(moved)
    }

    /// Bulk-park every pending id. Missing source (no jobs yet) is success
    /// with nothing moved. Returns the parked ids.
    pub async fn pause_all(&self) -> Result<Vec<JobId>, ToilError> {
        let moved = self
            .backend
            .move_all(
                &self.keys.state_set(JobState::Pending),
                &self.keys.state_set(JobState::Paused),
            )
            .await?;
        Ok(parse_ids(&moved, "paused"))
    }

    /// Bulk-release every parked id back to pending. Returns the moved ids
    /// so the caller can re-announce them.
    pub async fn resume_all(&self) -> Result<Vec<JobId>, ToilError> {
        let moved = self
            .backend
            .move_all(
                &self.keys.state_set(JobState::Paused),
                &self.keys.state_set(JobState::Pending),
            )
            .await?;
        Ok(parse_ids(&moved, "pending"))
    }

    /// Summed cardinality of the given collections, read as one consistent
    /// batch.
    pub async fn count(&self, states: &[JobState]) -> Result<u64, ToilError> {
        let keys: Vec<String> = states.iter().map(|s| self.keys.state_set(*s)).collect();
        let counts = self.backend.cardinalities(&keys).await?;
        Ok(counts.iter().sum())
    }

    /// Ids currently pending: the input of the stale-pending rescan.
    pub async fn pending_ids(&self) -> Result<Vec<JobId>, ToilError> {
        let members = self
            .backend
            .members(&self.keys.state_set(JobState::Pending))
            .await?;
        Ok(parse_ids(&members, "pending"))
    }

    /// Drop every pending id and its persisted record as one atomic batch.
    /// Best-effort against concurrent `add`: a job placed after this batch
    /// is untouched.
    pub async fn drain_pending(&self) -> Result<u64, ToilError> {
        let drained = self
            .backend
            .drain_set(
                &self.keys.state_set(JobState::Pending),
                &self.keys.job_key_prefix(),
            )
            .await?;
        Ok(drained)
    }

    /// Read the persisted status flag. Absent means the queue was never
    /// paused: active.
    pub async fn status(&self) -> Result<QueueStatus, ToilError> {
        let raw = self.backend.get(&self.keys.status_key()).await?;
        Ok(QueueStatus::from_flag(raw.as_deref()))
    }

    pub async fn set_status(&self, status: QueueStatus) -> Result<(), ToilError> {
        self.backend
            .set(&self.keys.status_key(), status.as_str())
            .await?;
        Ok(())
    }
}

/// Set members are job ids in decimal. A member that does not parse is
/// corrupt backend state: it is skipped and logged, never silently executed.
fn parse_ids(members: &[String], collection: &'static str) -> Vec<JobId> {
    members
        .iter()
        .filter_map(|member| match member.parse::<JobId>() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!(%member, collection, "skipping unparsable job id in status collection");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use ulid::Ulid;

    use crate::backend::InMemoryBackend;
    use crate::domain::InstanceId;

    use super::*;

    fn store(backend: &InMemoryBackend) -> StateStore {
        let keys = KeySpace::new("queue:", "mail", InstanceId::from_ulid(Ulid::new())).unwrap();
        StateStore::new(Arc::new(backend.clone()), keys)
    }

    #[tokio::test]
    async fn new_jobs_land_in_pending_by_default() {
        let backend = InMemoryBackend::new();
        let store = store(&backend);

        assert_eq!(store.place_new(JobId::new(1)).await.unwrap(), JobState::Pending);
        assert_eq!(store.count(&[JobState::Pending]).await.unwrap(), 1);
        assert_eq!(store.count(&[JobState::Paused]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn new_jobs_land_in_paused_while_the_flag_is_set() {
        let backend = InMemoryBackend::new();
        let store = store(&backend);
        store.set_status(QueueStatus::Paused).await.unwrap();

        assert_eq!(store.place_new(JobId::new(1)).await.unwrap(), JobState::Paused);
        // Never transits through pending.
        assert_eq!(store.count(&[JobState::Pending]).await.unwrap(), 0);
        assert_eq!(store.count(&[JobState::Paused]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn claim_wins_once_and_only_once() {
        let backend = InMemoryBackend::new();
        let store = store(&backend);
        store.place_new(JobId::new(1)).await.unwrap();

        assert!(store.claim(JobId::new(1)).await.unwrap());
        assert!(!store.claim(JobId::new(1)).await.unwrap());
        assert_eq!(store.count(&[JobState::Active]).await.unwrap(), 1);
        assert_eq!(store.count(&[JobState::Pending]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_claims_have_exactly_one_winner() {
        let backend = InMemoryBackend::new();
        let ours = store(&backend);
        let theirs = store(&backend);
        ours.place_new(JobId::new(1)).await.unwrap();

        let (a, b) = tokio::join!(ours.claim(JobId::new(1)), theirs.claim(JobId::new(1)));
        assert!(a.unwrap() ^ b.unwrap());
        assert_eq!(ours.count(&[JobState::Active]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn finish_moves_to_the_terminal_collection() {
        let backend = InMemoryBackend::new();
        let store = store(&backend);
        store.place_new(JobId::new(1)).await.unwrap();
        store.claim(JobId::new(1)).await.unwrap();

        assert!(store.finish(JobId::new(1), JobState::Failed).await.unwrap());
        assert_eq!(store.count(&[JobState::Failed]).await.unwrap(), 1);
        assert_eq!(store.count(&[JobState::Active]).await.unwrap(), 0);
        assert_eq!(store.count(&[JobState::Complete]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pause_and_resume_move_whole_collections() {
        let backend = InMemoryBackend::new();
        let store = store(&backend);
        for n in 1..=3 {
            store.place_new(JobId::new(n)).await.unwrap();
        }

        let parked = store.pause_all().await.unwrap();
        assert_eq!(parked.len(), 3);
        assert_eq!(store.count(&[JobState::Pending]).await.unwrap(), 0);
        assert_eq!(store.count(&[JobState::Paused]).await.unwrap(), 3);

        let released = store.resume_all().await.unwrap();
        assert_eq!(released.len(), 3);
        assert_eq!(store.count(&[JobState::Pending]).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn bulk_moves_tolerate_an_empty_queue() {
        let backend = InMemoryBackend::new();
        let store = store(&backend);
        assert!(store.pause_all().await.unwrap().is_empty());
        assert!(store.resume_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn drain_pending_leaves_other_collections_untouched() {
        let backend = InMemoryBackend::new();
        let store = store(&backend);
        for n in 1..=2 {
            store.place_new(JobId::new(n)).await.unwrap();
            backend
                .set(&format!("queue:mail:job:{n}"), "record")
                .await
                .unwrap();
        }
        store.place_new(JobId::new(3)).await.unwrap();
        store.claim(JobId::new(3)).await.unwrap();

        assert_eq!(store.drain_pending().await.unwrap(), 2);
        assert_eq!(store.count(&[JobState::Pending]).await.unwrap(), 0);
        assert_eq!(store.count(&[JobState::Active]).await.unwrap(), 1);
        assert_eq!(backend.get("queue:mail:job:1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn default_count_reads_a_consistent_batch() {
        let backend = InMemoryBackend::new();
        let store = store(&backend);
        store.place_new(JobId::new(1)).await.unwrap();
        store.place_new(JobId::new(2)).await.unwrap();
        store.claim(JobId::new(2)).await.unwrap();

        let total = store
            .count(&[JobState::Pending, JobState::Active])
            .await
            .unwrap();
        assert_eq!(total, 2);
    }
}
