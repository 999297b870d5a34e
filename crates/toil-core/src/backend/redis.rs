//! Redis backend implementation.
//!
//! Maps the port onto Redis primitives: sets are SADD/SMOVE/SCARD, the
//! counter is INCR, batched reads are an atomic pipeline, and the compound
//! conditional operations are small Lua scripts (EVAL), which Redis runs
//! atomically.
//!
//! Connection discipline: one `ConnectionManager` for ordinary commands, a
//! second one only for PUBLISH, and a dedicated pub/sub connection per
//! subscription: Redis rejects ordinary commands on a subscribed
//! connection, and a connection blocked in subscribe mode cannot publish.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tokio::sync::mpsc;
use tracing::warn;

use crate::ports::{Backend, BackendError, PubSubMessage, Subscription};

/// Conditional insert: compare the flag, SADD into the matching set.
const ADD_BY_FLAG: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('SADD', KEYS[2], ARGV[2])
  return 1
else
  redis.call('SADD', KEYS[3], ARGV[2])
  return 0
end
"#;

/// Bulk move: union the source into the destination, drop the source.
/// Merging instead of RENAME keeps members inserted into the destination
/// concurrently.
const MOVE_ALL: &str = r#"
local members = redis.call('SMEMBERS', KEYS[1])
if #members > 0 then
  redis.call('SADD', KEYS[2], unpack(members))
  redis.call('DEL', KEYS[1])
end
return members
"#;

/// Drop a set and the record key of every member, as one step.
const DRAIN_SET: &str = r#"
local members = redis.call('SMEMBERS', KEYS[1])
for _, member in ipairs(members) do
  redis.call('DEL', ARGV[1] .. member)
end
redis.call('DEL', KEYS[1])
return #members
"#;

/// Redis-backed `Backend`.
pub struct RedisBackend {
    client: redis::Client,
    data: ConnectionManager,
    publisher: ConnectionManager,
}

impl RedisBackend {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`), establishing the
    /// data and publish connections eagerly so configuration problems fail
    /// here rather than on first use.
    pub async fn connect(url: &str) -> Result<Self, BackendError> {
        let client =
            redis::Client::open(url).map_err(|e| BackendError::Connection(e.to_string()))?;
        let data = client
            .get_connection_manager()
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;
        let publisher = client
            .get_connection_manager()
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            data,
            publisher,
        })
    }
}

impl From<redis::RedisError> for BackendError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
            BackendError::Connection(err.to_string())
        } else {
            BackendError::Command(err.to_string())
        }
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let mut con = self.data.clone();
        let value: Option<String> = con.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), BackendError> {
        let mut con = self.data.clone();
        let _: () = con.set(key, value).await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, BackendError> {
        let mut con = self.data.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        // SET .. NX replies OK on write, Nil when the key already exists.
        let reply: Option<String> = cmd.query_async(&mut con).await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        let mut con = self.data.clone();
        let removed: u64 = con.del(key).await?;
        Ok(removed > 0)
    }

    async fn incr(&self, key: &str) -> Result<u64, BackendError> {
        let mut con = self.data.clone();
        let value: u64 = con.incr(key, 1u64).await?;
        Ok(value)
    }

    async fn add_member(&self, key: &str, member: &str) -> Result<bool, BackendError> {
        let mut con = self.data.clone();
        let added: u64 = con.sadd(key, member).await?;
        Ok(added == 1)
    }

    async fn add_member_by_flag(
        &self,
        flag: &str,
        expected: &str,
        if_match: &str,
        otherwise: &str,
        member: &str,
    ) -> Result<bool, BackendError> {
        let mut con = self.data.clone();
        let matched: i64 = Script::new(ADD_BY_FLAG)
            .key(flag)
            .key(if_match)
            .key(otherwise)
            .arg(expected)
            .arg(member)
            .invoke_async(&mut con)
            .await?;
        Ok(matched == 1)
    }

    async fn move_member(
        &self,
        from: &str,
        to: &str,
        member: &str,
    ) -> Result<bool, BackendError> {
        let mut con = self.data.clone();
        let moved: bool = con.smove(from, to, member).await?;
        Ok(moved)
    }

    async fn move_all(&self, from: &str, to: &str) -> Result<Vec<String>, BackendError> {
        let mut con = self.data.clone();
        let moved: Vec<String> = Script::new(MOVE_ALL)
            .key(from)
            .key(to)
            .invoke_async(&mut con)
            .await?;
        Ok(moved)
    }

    async fn members(&self, key: &str) -> Result<Vec<String>, BackendError> {
        let mut con = self.data.clone();
        let members: Vec<String> = con.smembers(key).await?;
        Ok(members)
    }

    async fn cardinalities(&self, keys: &[String]) -> Result<Vec<u64>, BackendError> {
        let mut con = self.data.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for key in keys {
            pipe.scard(key);
        }
        let counts: Vec<u64> = pipe.query_async(&mut con).await?;
        Ok(counts)
    }

    async fn drain_set(&self, key: &str, value_key_prefix: &str) -> Result<u64, BackendError> {
        let mut con = self.data.clone();
        let drained: u64 = Script::new(DRAIN_SET)
            .key(key)
            .arg(value_key_prefix)
            .invoke_async(&mut con)
            .await?;
        Ok(drained)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BackendError> {
        let mut con = self.publisher.clone();
        let _: () = con.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Subscription, BackendError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;
        for channel in channels {
            pubsub.subscribe(channel).await?;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(%channel, error = %err, "dropping undecodable pub/sub payload");
                        continue;
                    }
                };
                if tx.send(PubSubMessage { channel, payload }).is_err() {
                    // Subscription dropped; stop forwarding.
                    break;
                }
            }
        });
        Ok(Subscription::with_forwarder(rx, task))
    }
}
