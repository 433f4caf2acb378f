//! Contract over the shared transactional key-value store.
//!
//! Lease state lives in an external store so that any number of server
//! replicas can serve the same address pool. The allocator only ever talks
//! to the [`Store`] trait; [`RedisStore`] is the production backend and
//! [`MemoryStore`] backs tests and single-node runs.
//!
//! Mutations go through optimistic transactions: [`Store::watch`] opens a
//! [`StoreTx`] that snapshots the named keys, reads execute immediately,
//! writes are queued, and [`StoreTx::commit`] applies them atomically or
//! reports [`TxOutcome::Conflict`] when another agent touched a watched key
//! first. Callers retry on conflict; nothing is partially applied.

use std::time::Duration;

use async_trait::async_trait;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connection(String),

    #[error("store operation failed: {0}")]
    Backend(String),

    #[error("value at key {0} has the wrong type")]
    WrongType(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result of attempting to commit an optimistic transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Committed,
    Conflict,
}

/// Plain (non-transactional) store operations.
///
/// Absent keys are reported as `None`, never as an error.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Writes `value` under `key`. A `ttl` of `None` means the key never
    /// expires.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()>;

    async fn del(&self, key: &str) -> StoreResult<()>;

    /// Enumerates keys matching a glob pattern. Only used at cold reset.
    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// Members of the sorted set at `key` with score in `(-inf, max]`,
    /// ordered by ascending score.
    async fn zrange_by_score(&self, key: &str, max: i64) -> StoreResult<Vec<String>>;

    /// Opens an optimistic transaction that watches `keys`.
    async fn watch(&self, keys: &[&str]) -> StoreResult<Box<dyn StoreTx>>;
}

/// One watch/commit cycle against the store.
///
/// Reads run against the live store; writes queue until [`commit`] and are
/// then applied atomically, provided no watched key changed in between.
///
/// [`commit`]: StoreTx::commit
#[async_trait]
pub trait StoreTx: Send {
    async fn get(&mut self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Index of the first 0-bit of the byte string at `key`, restricted to
    /// the byte range `[byte_lo, byte_hi]`. Returns `None` when the key is
    /// missing and `Some(-1)` when every bit in the range is set. Bit 0 is
    /// the most significant bit of byte 0.
    async fn bit_scan_zero(&mut self, key: &str, byte_lo: u32, byte_hi: u32)
    -> StoreResult<Option<i64>>;

    fn set(&mut self, key: &str, value: &[u8], ttl: Option<Duration>);

    fn set_bit(&mut self, key: &str, index: u32, value: bool);

    fn del(&mut self, key: &str);

    fn zadd(&mut self, key: &str, score: i64, member: &str);

    fn zrem(&mut self, key: &str, member: &str);

    /// Removes every member with score in `(-inf, max]`.
    fn zrem_range_by_score(&mut self, key: &str, max: i64);

    async fn commit(self: Box<Self>) -> StoreResult<TxOutcome>;
}
