//! Key-value storage backing the rate limit records.
//!
//! The limiter never keeps state in process. Every decision reads one key and
//! writes one key through [`KeyValueStore`], which makes the store the single
//! synchronization point between concurrent requests and between processes.

mod memory;
mod redis_store;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Errors raised by a key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or rejected the command
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer within the configured bound
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// A record could not be encoded or decoded
    #[error("record codec failure: {0}")]
    Codec(String),

    /// Optimistic updates kept losing to concurrent writers
    #[error("gave up on key {key} after {attempts} conflicting writes")]
    Contention { key: String, attempts: u32 },
}

/// Minimal key-value contract consumed by the limiter.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch the value stored under `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Unconditionally store `value` under `key`, expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Store `value` only if the current value equals `expected`.
    ///
    /// `expected == None` means the key must be absent. Returns `true` when
    /// the write happened and `false` when another writer got there first.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;
}

/// Run a store operation under a deadline.
pub async fn bounded<T, F>(limit: Duration, op: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, op).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}
