//! Shared coordination store.
//!
//! Every cross-process invariant of the fleet is built from the handful of primitives on
//! [`CoordinationStore`]: atomic increment, conditional set with TTL, list push/pop and
//! plain key get/set/delete/expire. [`Coordinator`] is the typed client the rest of the
//! crate uses; it owns every key name so nothing else touches raw keys.

mod client;
pub mod keys;
mod memory;
mod redis_store;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use client::{AggregateStats, Coordinator, LockKind, PauseState};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

#[derive(Error, Debug)]
pub enum CoordError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Key {key} holds the wrong kind of value")]
    WrongType { key: String },

    #[error("Key {key} holds an unparsable value: {value}")]
    Corrupt { key: String, value: String },

    #[error("Coordination store unavailable: {0}")]
    Unavailable(String),
}

/// Primitive operations of the shared store.
///
/// Implementations must make each call atomic on its own; no call sequence is assumed to
/// be atomic. Absent and expired keys behave identically.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CoordError>;

    /// Unconditional set, optionally with a TTL. Overwrites any previous value.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CoordError>;

    /// Set only if the key does not exist. Returns true when this call created the key.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CoordError>;

    /// Delete `key` only while it still holds `expected`. Returns true when deleted.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, CoordError>;

    /// Delete keys, returning how many existed.
    async fn del(&self, keys: &[&str]) -> Result<u64, CoordError>;

    async fn exists(&self, key: &str) -> Result<bool, CoordError>;

    /// Reset the TTL of an existing key. Returns false when the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CoordError>;

    /// Atomic add; a missing key counts as zero. Returns the new value.
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, CoordError>;

    /// Append to the tail of a list. Returns the new length.
    async fn push_back(&self, key: &str, values: &[String]) -> Result<u64, CoordError>;

    /// Prepend to the head of a list, in argument order. Returns the new length.
    async fn push_front(&self, key: &str, values: &[String]) -> Result<u64, CoordError>;

    /// Remove and return up to `count` items from the head of a list.
    async fn pop_front(&self, key: &str, count: usize) -> Result<Vec<String>, CoordError>;

    async fn list_len(&self, key: &str) -> Result<u64, CoordError>;

    /// Keep only the first `keep` items of a list.
    async fn trim(&self, key: &str, keep: usize) -> Result<(), CoordError>;

    /// Inclusive range of a list from the head, like `LRANGE`.
    async fn range(&self, key: &str, start: usize, stop: usize) -> Result<Vec<String>, CoordError>;

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, CoordError>;
}

/// Open a store from a URL. `memory://` gives an in-process store.
pub async fn connect(url: &str) -> Result<std::sync::Arc<dyn CoordinationStore>, CoordError> {
    if url.starts_with("memory://") {
        tracing::warn!("Using in-process coordination store; workers in other processes will not see it");
        return Ok(std::sync::Arc::new(MemoryStore::new()));
    }
    let store = RedisStore::new(url).await?;
    Ok(std::sync::Arc::new(store))
}
