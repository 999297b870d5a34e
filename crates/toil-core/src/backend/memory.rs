//! In-memory backend implementation.
//!
//! Single-process stand-in for the real backend, used by tests and the demo
//! binary. All state lives behind one async mutex, so every trait method
//! (including the compound ones) is trivially atomic. Pub/sub is a fan-out
//! of per-subscriber unbounded channels.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;

use crate::ports::{Backend, BackendError, PubSubMessage, Subscription};

#[derive(Default)]
struct Shared {
    strings: HashMap<String, String>,
    /// Expiry instants for string keys armed with a TTL (lock markers).
    expiries: HashMap<String, Instant>,
    sets: HashMap<String, HashSet<String>>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<PubSubMessage>>>,
}

impl Shared {
    /// Drop a string key whose TTL has lapsed. Expiry is checked lazily, on
    /// the next touch of the key.
    fn purge_expired(&mut self, key: &str) {
        let expired = self
            .expiries
            .get(key)
            .is_some_and(|at| *at <= Instant::now());
        if expired {
            self.expiries.remove(key);
            self.strings.remove(key);
        }
    }

    fn set_members(&mut self, key: &str) -> &mut HashSet<String> {
        self.sets.entry(key.to_string()).or_default()
    }
}

/// In-memory `Backend`. Cloning shares the same state, so several `Queue`
/// instances in one process can coordinate through one `InMemoryBackend`
/// exactly as separate processes would through a shared server.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    state: Arc<Mutex<Shared>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let mut state = self.state.lock().await;
        state.purge_expired(key);
        Ok(state.strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        state.expiries.remove(key);
        state.strings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, BackendError> {
        let mut state = self.state.lock().await;
        state.purge_expired(key);
        if state.strings.contains_key(key) {
            return Ok(false);
        }
        state.strings.insert(key.to_string(), value.to_string());
        if let Some(ttl) = ttl {
            state.expiries.insert(key.to_string(), Instant::now() + ttl);
        }
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        let mut state = self.state.lock().await;
        state.purge_expired(key);
        state.expiries.remove(key);
        let existed = state.strings.remove(key).is_some() | state.sets.remove(key).is_some();
        Ok(existed)
    }

    async fn incr(&self, key: &str) -> Result<u64, BackendError> {
        let mut state = self.state.lock().await;
        state.purge_expired(key);
        let current = match state.strings.get(key) {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|_| BackendError::Command(format!("{key} is not an integer")))?,
            None => 0,
        };
        let next = current + 1;
        state.strings.insert(key.to_string(), next.to_string());
        Ok(next)
    }

    async fn add_member(&self, key: &str, member: &str) -> Result<bool, BackendError> {
        let mut state = self.state.lock().await;
        Ok(state.set_members(key).insert(member.to_string()))
    }

    async fn add_member_by_flag(
        &self,
        flag: &str,
        expected: &str,
        if_match: &str,
        otherwise: &str,
        member: &str,
    ) -> Result<bool, BackendError> {
        let mut state = self.state.lock().await;
        state.purge_expired(flag);
        let matched = state.strings.get(flag).is_some_and(|raw| raw == expected);
        let target = if matched { if_match } else { otherwise };
        state.set_members(target).insert(member.to_string());
        Ok(matched)
    }

    async fn move_member(
        &self,
        from: &str,
        to: &str,
        member: &str,
    ) -> Result<bool, BackendError> {
        let mut state = self.state.lock().await;
        let removed = state
            .sets
            .get_mut(from)
            .is_some_and(|set| set.remove(member));
        if removed {
            state.set_members(to).insert(member.to_string());
        }
        Ok(removed)
    }

    async fn move_all(&self, from: &str, to: &str) -> Result<Vec<String>, BackendError> {
        let mut state = self.state.lock().await;
        let Some(members) = state.sets.remove(from) else {
            return Ok(Vec::new());
        };
        let moved: Vec<String> = members.into_iter().collect();
        state.set_members(to).extend(moved.iter().cloned());
        Ok(moved)
    }

    async fn members(&self, key: &str) -> Result<Vec<String>, BackendError> {
        let state = self.state.lock().await;
        Ok(state
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn cardinalities(&self, keys: &[String]) -> Result<Vec<u64>, BackendError> {
        // One lock acquisition = one consistent snapshot across all keys.
        let state = self.state.lock().await;
        Ok(keys
            .iter()
            .map(|key| state.sets.get(key).map(|set| set.len() as u64).unwrap_or(0))
            .collect())
    }

    async fn drain_set(&self, key: &str, value_key_prefix: &str) -> Result<u64, BackendError> {
        let mut state = self.state.lock().await;
        let Some(members) = state.sets.remove(key) else {
            return Ok(0);
        };
        for member in &members {
            state.strings.remove(&format!("{value_key_prefix}{member}"));
        }
        Ok(members.len() as u64)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        if let Some(senders) = state.subscribers.get_mut(channel) {
            let message = PubSubMessage {
                channel: channel.to_string(),
                payload: payload.to_string(),
            };
            // Dropped subscribers are pruned as a side effect of delivery.
            senders.retain(|tx| tx.send(message.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Subscription, BackendError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().await;
        for channel in channels {
            state
                .subscribers
                .entry(channel.clone())
                .or_default()
                .push(tx.clone());
        }
        Ok(Subscription::from_receiver(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn incr_counts_from_one() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.incr("n").await.unwrap(), 1);
        assert_eq!(backend.incr("n").await.unwrap(), 2);
        assert_eq!(backend.incr("n").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn set_if_absent_is_first_writer_wins() {
        let backend = InMemoryBackend::new();
        assert!(backend.set_if_absent("k", "a", None).await.unwrap());
        assert!(!backend.set_if_absent("k", "b", None).await.unwrap());
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_keys_free_the_slot() {
        let backend = InMemoryBackend::new();
        let ttl = Some(Duration::from_secs(5));
        assert!(backend.set_if_absent("k", "a", ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(backend.get("k").await.unwrap(), None);
        assert!(backend.set_if_absent("k", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn move_member_is_conditional() {
        let backend = InMemoryBackend::new();
        backend.add_member("from", "7").await.unwrap();

        assert!(backend.move_member("from", "to", "7").await.unwrap());
        // Already moved: zero effect, not an error.
        assert!(!backend.move_member("from", "to", "7").await.unwrap());
        assert_eq!(backend.members("to").await.unwrap(), vec!["7"]);
    }

    #[tokio::test]
    async fn concurrent_moves_have_exactly_one_winner() {
        let backend = InMemoryBackend::new();
        backend.add_member("from", "7").await.unwrap();

        let (a, b) = tokio::join!(
            backend.move_member("from", "to", "7"),
            backend.move_member("from", "to", "7"),
        );
        assert!(a.unwrap() ^ b.unwrap());
        assert_eq!(backend.cardinalities(&["to".into()]).await.unwrap(), [1]);
    }

    #[tokio::test]
    async fn move_all_merges_and_tolerates_missing_source() {
        let backend = InMemoryBackend::new();
        backend.add_member("to", "9").await.unwrap();
        backend.add_member("from", "1").await.unwrap();
        backend.add_member("from", "2").await.unwrap();

        let mut moved = backend.move_all("from", "to").await.unwrap();
        moved.sort();
        assert_eq!(moved, vec!["1", "2"]);

        let mut members = backend.members("to").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["1", "2", "9"]);
        assert!(backend.members("from").await.unwrap().is_empty());

        // No source set: success with nothing moved.
        assert!(backend.move_all("from", "to").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn drain_set_removes_members_and_their_records() {
        let backend = InMemoryBackend::new();
        backend.add_member("ids", "1").await.unwrap();
        backend.add_member("ids", "2").await.unwrap();
        backend.set("rec:1", "one").await.unwrap();
        backend.set("rec:2", "two").await.unwrap();
        backend.set("rec:3", "kept").await.unwrap();

        assert_eq!(backend.drain_set("ids", "rec:").await.unwrap(), 2);
        assert!(backend.members("ids").await.unwrap().is_empty());
        assert_eq!(backend.get("rec:1").await.unwrap(), None);
        assert_eq!(backend.get("rec:2").await.unwrap(), None);
        assert_eq!(backend.get("rec:3").await.unwrap().as_deref(), Some("kept"));
    }

    #[tokio::test]
    async fn publish_fans_out_to_every_subscriber() {
        let backend = InMemoryBackend::new();
        let mut first = backend.subscribe(&["ch".into()]).await.unwrap();
        let mut second = backend.subscribe(&["ch".into()]).await.unwrap();

        backend.publish("ch", "hello").await.unwrap();

        for sub in [&mut first, &mut second] {
            let msg = sub.next().await.unwrap();
            assert_eq!(msg.channel, "ch");
            assert_eq!(msg.payload, "hello");
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fire_and_forget() {
        let backend = InMemoryBackend::new();
        backend.publish("nobody", "hello").await.unwrap();
    }
}
