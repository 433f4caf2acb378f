//! Redis-backed store. Optimistic transactions map onto WATCH plus an
//! atomic MULTI/EXEC pipeline on a dedicated connection; a nil EXEC reply
//! means a watched key changed and surfaces as [`TxOutcome::Conflict`].

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{Connection, MultiplexedConnection};

use super::{Store, StoreError, StoreResult, StoreTx, TxOutcome};

impl From<redis::RedisError> for StoreError {
    fn from(error: redis::RedisError) -> Self {
        if error.is_io_error() || error.is_connection_refusal() || error.is_connection_dropped() {
            StoreError::Connection(error.to_string())
        } else {
            StoreError::Backend(error.to_string())
        }
    }
}

pub struct RedisStore {
    client: redis::Client,
    con: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(host: &str, port: u16) -> StoreResult<Self> {
        let client =
            redis::Client::open(format!("redis://{host}:{port}/")).map_err(StoreError::from)?;
        let con = client.get_multiplexed_tokio_connection().await?;
        Ok(Self { client, con })
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut con = self.con.clone();
        Ok(redis::cmd("GET").arg(key).query_async(&mut con).await?)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()> {
        let mut con = self.con.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        cmd.query_async::<_, ()>(&mut con).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        let mut con = self.con.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut con)
            .await?;
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut con = self.con.clone();
        Ok(redis::cmd("KEYS")
            .arg(pattern)
            .query_async(&mut con)
            .await?)
    }

    async fn zrange_by_score(&self, key: &str, max: i64) -> StoreResult<Vec<String>> {
        let mut con = self.con.clone();
        Ok(redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(max)
            .query_async(&mut con)
            .await?)
    }

    async fn watch(&self, keys: &[&str]) -> StoreResult<Box<dyn StoreTx>> {
        // WATCH state is per connection, so every transaction gets its own.
        let mut con = self.client.get_async_connection().await?;
        let mut cmd = redis::cmd("WATCH");
        for key in keys {
            cmd.arg(*key);
        }
        cmd.query_async::<_, ()>(&mut con).await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        Ok(Box::new(RedisTx { con, pipe }))
    }
}

struct RedisTx {
    con: Connection,
    pipe: redis::Pipeline,
}

#[async_trait]
impl StoreTx for RedisTx {
    async fn get(&mut self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(redis::cmd("GET").arg(key).query_async(&mut self.con).await?)
    }

    async fn bit_scan_zero(
        &mut self,
        key: &str,
        byte_lo: u32,
        byte_hi: u32,
    ) -> StoreResult<Option<i64>> {
        // BITPOS reports 0 for a missing key; probe existence first so the
        // caller can tell an uninitialized bitset from a free slot.
        let exists: bool = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut self.con)
            .await?;
        if !exists {
            return Ok(None);
        }
        let position: i64 = redis::cmd("BITPOS")
            .arg(key)
            .arg(0)
            .arg(byte_lo)
            .arg(byte_hi)
            .query_async(&mut self.con)
            .await?;
        Ok(Some(position))
    }

    fn set(&mut self, key: &str, value: &[u8], ttl: Option<Duration>) {
        let cmd = self.pipe.cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        cmd.ignore();
    }

    fn set_bit(&mut self, key: &str, index: u32, value: bool) {
        self.pipe
            .cmd("SETBIT")
            .arg(key)
            .arg(index)
            .arg(u8::from(value))
            .ignore();
    }

    fn del(&mut self, key: &str) {
        self.pipe.cmd("DEL").arg(key).ignore();
    }

    fn zadd(&mut self, key: &str, score: i64, member: &str) {
        self.pipe
            .cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .ignore();
    }

    fn zrem(&mut self, key: &str, member: &str) {
        self.pipe.cmd("ZREM").arg(key).arg(member).ignore();
    }

    fn zrem_range_by_score(&mut self, key: &str, max: i64) {
        self.pipe
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(max)
            .ignore();
    }

    async fn commit(mut self: Box<Self>) -> StoreResult<TxOutcome> {
        // EXEC replies nil when a watched key was modified after WATCH.
        let committed: Option<()> = self.pipe.query_async(&mut self.con).await?;
        Ok(if committed.is_some() {
            TxOutcome::Committed
        } else {
            TxOutcome::Conflict
        })
    }
}
