//! Deterministic key and channel naming for a named queue.
//!
//! Two queue instances with the same prefix and name produce identical shared
//! keys; that rendezvous is the whole coordination mechanism, so `key` must
//! stay a pure function of (prefix, name, parts). Instance-scoped keys
//! additionally interpose the instance id after the name.
//!
//! The separator `:` is not escaped. Callers must keep it out of names and
//! parts; this is a documented constraint, not an enforced one.

use crate::domain::{InstanceId, JobId, JobState};
use crate::domain::events::EventKind;
use crate::error::ToilError;

/// Key namespace of one queue instance.
///
/// The prefix already ends with the separator (default `"queue:"`), so a key
/// is `prefix + [name, parts...].join(":")`.
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
    name: String,
    instance: InstanceId,
}

impl KeySpace {
    /// Build a namespace. Fails on an empty name, before any backend call
    /// can be attempted with broken keys.
    pub fn new(
        prefix: impl Into<String>,
        name: impl Into<String>,
        instance: InstanceId,
    ) -> Result<Self, ToilError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ToilError::EmptyName);
        }
        Ok(Self {
            prefix: prefix.into(),
            name,
            instance,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Shared key: `prefix + name(:part)*`.
    pub fn key(&self, parts: &[&str]) -> String {
        let mut out = String::with_capacity(
            self.prefix.len() + self.name.len() + parts.iter().map(|p| p.len() + 1).sum::<usize>(),
        );
        out.push_str(&self.prefix);
        out.push_str(&self.name);
        for part in parts {
            out.push(':');
            out.push_str(part);
        }
        out
    }

    /// Process-scoped key: `prefix + name:instance(:part)*`.
    pub fn instance_key(&self, parts: &[&str]) -> String {
        let instance = self.instance.to_string();
        let mut all = Vec::with_capacity(parts.len() + 1);
        all.push(instance.as_str());
        all.extend_from_slice(parts);
        self.key(&all)
    }

    /// Counter seeding job ids.
    pub fn counter_key(&self) -> String {
        self.key(&["job", "id"])
    }

    /// Serialized record of one job.
    pub fn job_key(&self, id: JobId) -> String {
        self.key(&["job", &id.to_string()])
    }

    /// Prefix shared by all job record keys; `job_key(id)` is this plus the
    /// bare id, which is what set-plus-records operations rely on.
    pub fn job_key_prefix(&self) -> String {
        let mut prefix = self.key(&["job"]);
        prefix.push(':');
        prefix
    }

    /// Status collection for a lifecycle state.
    pub fn state_set(&self, state: JobState) -> String {
        self.key(&["jobs", state.as_str()])
    }

    /// Queue-level pause flag.
    pub fn status_key(&self) -> String {
        self.key(&["status"])
    }

    /// Claim marker for `kind`/`id` (e.g. `lock:job:7`).
    pub fn lock_key(&self, kind: &str, id: JobId) -> String {
        self.key(&["lock", kind, &id.to_string()])
    }

    /// Pub/sub channel for a lifecycle event.
    pub fn channel(&self, kind: EventKind) -> String {
        self.key(&kind.channel_parts())
    }
}

#[cfg(test)]
mod tests {
    use ulid::Ulid;

    use super::*;

    fn keyspace() -> KeySpace {
        KeySpace::new("queue:", "mail", InstanceId::from_ulid(Ulid::new())).unwrap()
    }

    #[test]
    fn key_is_prefix_name_and_parts_joined() {
        let keys = keyspace();
        assert_eq!(keys.key(&[]), "queue:mail");
        assert_eq!(keys.key(&["a", "b", "c"]), "queue:mail:a:b:c");
    }

    #[test]
    fn instance_key_interposes_the_instance_id() {
        let keys = keyspace();
        let expected = format!("queue:mail:{}:a:b", keys.instance());
        assert_eq!(keys.instance_key(&["a", "b"]), expected);
    }

    #[test]
    fn two_instances_with_same_name_share_keys() {
        let a = KeySpace::new("queue:", "mail", InstanceId::from_ulid(Ulid::new())).unwrap();
        let b = KeySpace::new("queue:", "mail", InstanceId::from_ulid(Ulid::new())).unwrap();
        assert_eq!(a.key(&["jobs", "pending"]), b.key(&["jobs", "pending"]));
        // ...while their process-scoped keys stay distinct.
        assert_ne!(a.instance_key(&["x"]), b.instance_key(&["x"]));
    }

    #[test]
    fn empty_name_is_rejected() {
        let err = KeySpace::new("queue:", "", InstanceId::from_ulid(Ulid::new())).unwrap_err();
        assert!(matches!(err, ToilError::EmptyName));
    }

    #[test]
    fn layout_matches_the_documented_namespace() {
        let keys = keyspace();
        assert_eq!(keys.counter_key(), "queue:mail:job:id");
        assert_eq!(keys.job_key(JobId::new(4)), "queue:mail:job:4");
        assert_eq!(keys.job_key_prefix(), "queue:mail:job:");
        assert_eq!(keys.state_set(JobState::Pending), "queue:mail:jobs:pending");
        assert_eq!(keys.status_key(), "queue:mail:status");
        assert_eq!(keys.lock_key("job", JobId::new(4)), "queue:mail:lock:job:4");
        assert_eq!(keys.channel(EventKind::Created), "queue:mail:job:create");
        assert_eq!(keys.channel(EventKind::Failed), "queue:mail:job:fail");
    }
}
