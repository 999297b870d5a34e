//! Backend implementations.
//!
//! - `InMemoryBackend`: single-process, for development and tests. Atomicity
//!   comes from holding one lock across each compound operation.
//! - `RedisBackend`: the production backend. Compound operations are Lua
//!   scripts, subscriptions get their own connection.

mod memory;
mod redis;

pub use self::memory::InMemoryBackend;
pub use self::redis::RedisBackend;
