//! In-process store with the same optimistic-transaction semantics as the
//! Redis backend. Used by the test suite and for single-node runs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{Store, StoreError, StoreResult, StoreTx, TxOutcome};

#[derive(Debug, Clone)]
enum Value {
    Bytes(Vec<u8>),
    Sorted(HashMap<String, i64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Debug, Clone)]
enum WriteOp {
    Set {
        key: String,
        value: Vec<u8>,
        ttl: Option<Duration>,
    },
    Del {
        key: String,
    },
    SetBit {
        key: String,
        index: u32,
        value: bool,
    },
    ZAdd {
        key: String,
        score: i64,
        member: String,
    },
    ZRem {
        key: String,
        member: String,
    },
    ZRemRangeByScore {
        key: String,
        max: i64,
    },
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    // Monotonic per-key counters; watch snapshots them, commit re-validates.
    versions: HashMap<String, u64>,
}

impl Inner {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at.is_some_and(|at| at <= now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.entries.remove(&key);
            self.bump(&key);
        }
    }

    fn bump(&mut self, key: &str) {
        *self.versions.entry(key.to_string()).or_insert(0) += 1;
    }

    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn bytes(&self, key: &str) -> StoreResult<Option<&Vec<u8>>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Bytes(bytes),
                ..
            }) => Ok(Some(bytes)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn sorted(&self, key: &str) -> StoreResult<Option<&HashMap<String, i64>>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Sorted(members),
                ..
            }) => Ok(Some(members)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn apply(&mut self, op: &WriteOp) -> StoreResult<()> {
        match op {
            WriteOp::Set { key, value, ttl } => {
                let expires_at = ttl.map(|ttl| Instant::now() + ttl);
                self.entries.insert(
                    key.clone(),
                    Entry {
                        value: Value::Bytes(value.clone()),
                        expires_at,
                    },
                );
                self.bump(key);
            }
            WriteOp::Del { key } => {
                if self.entries.remove(key).is_some() {
                    self.bump(key);
                }
            }
            WriteOp::SetBit { key, index, value } => {
                let entry = self.entries.entry(key.clone()).or_insert_with(|| Entry {
                    value: Value::Bytes(Vec::new()),
                    expires_at: None,
                });
                let Value::Bytes(bytes) = &mut entry.value else {
                    return Err(StoreError::WrongType(key.clone()));
                };
                let byte = (*index / 8) as usize;
                if bytes.len() <= byte {
                    bytes.resize(byte + 1, 0);
                }
                let mask = 0x80u8 >> (index % 8);
                if *value {
                    bytes[byte] |= mask;
                } else {
                    bytes[byte] &= !mask;
                }
                self.bump(key);
            }
            WriteOp::ZAdd { key, score, member } => {
                let entry = self.entries.entry(key.clone()).or_insert_with(|| Entry {
                    value: Value::Sorted(HashMap::new()),
                    expires_at: None,
                });
                let Value::Sorted(members) = &mut entry.value else {
                    return Err(StoreError::WrongType(key.clone()));
                };
                members.insert(member.clone(), *score);
                self.bump(key);
            }
            WriteOp::ZRem { key, member } => {
                let mut removed = false;
                let mut emptied = false;
                if let Some(Entry {
                    value: Value::Sorted(members),
                    ..
                }) = self.entries.get_mut(key)
                {
                    removed = members.remove(member).is_some();
                    emptied = members.is_empty();
                }
                if emptied {
                    self.entries.remove(key);
                }
                if removed {
                    self.bump(key);
                }
            }
            WriteOp::ZRemRangeByScore { key, max } => {
                let mut removed = false;
                let mut emptied = false;
                if let Some(Entry {
                    value: Value::Sorted(members),
                    ..
                }) = self.entries.get_mut(key)
                {
                    let before = members.len();
                    members.retain(|_, score| *score > *max);
                    removed = members.len() != before;
                    emptied = members.is_empty();
                }
                if emptied {
                    self.entries.remove(key);
                }
                if removed {
                    self.bump(key);
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut inner = self.inner.lock();
        inner.purge_expired();
        Ok(inner.bytes(key)?.cloned())
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.purge_expired();
        inner.apply(&WriteOp::Set {
            key: key.to_string(),
            value: value.to_vec(),
            ttl,
        })
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.purge_expired();
        inner.apply(&WriteOp::Del {
            key: key.to_string(),
        })
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut inner = self.inner.lock();
        inner.purge_expired();
        // Prefix globs are all the allocator uses.
        let matches = if let Some(prefix) = pattern.strip_suffix('*') {
            inner
                .entries
                .keys()
                .filter(|key| key.starts_with(prefix))
                .cloned()
                .collect()
        } else {
            inner
                .entries
                .keys()
                .filter(|key| key.as_str() == pattern)
                .cloned()
                .collect()
        };
        Ok(matches)
    }

    async fn zrange_by_score(&self, key: &str, max: i64) -> StoreResult<Vec<String>> {
        let mut inner = self.inner.lock();
        inner.purge_expired();
        let Some(members) = inner.sorted(key)? else {
            return Ok(Vec::new());
        };
        let mut in_range: Vec<(i64, String)> = members
            .iter()
            .filter(|(_, score)| **score <= max)
            .map(|(member, score)| (*score, member.clone()))
            .collect();
        in_range.sort();
        Ok(in_range.into_iter().map(|(_, member)| member).collect())
    }

    async fn watch(&self, keys: &[&str]) -> StoreResult<Box<dyn StoreTx>> {
        let mut inner = self.inner.lock();
        inner.purge_expired();
        let watched = keys
            .iter()
            .map(|key| (key.to_string(), inner.version(key)))
            .collect();
        Ok(Box::new(MemoryTx {
            inner: Arc::clone(&self.inner),
            watched,
            queued: Vec::new(),
        }))
    }
}

struct MemoryTx {
    inner: Arc<Mutex<Inner>>,
    watched: Vec<(String, u64)>,
    queued: Vec<WriteOp>,
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn get(&mut self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut inner = self.inner.lock();
        inner.purge_expired();
        Ok(inner.bytes(key)?.cloned())
    }

    async fn bit_scan_zero(
        &mut self,
        key: &str,
        byte_lo: u32,
        byte_hi: u32,
    ) -> StoreResult<Option<i64>> {
        let mut inner = self.inner.lock();
        inner.purge_expired();
        let Some(bytes) = inner.bytes(key)? else {
            return Ok(None);
        };
        let lo = byte_lo as usize;
        let hi = (byte_hi as usize).min(bytes.len().saturating_sub(1));
        if bytes.is_empty() || lo > hi {
            return Ok(Some(-1));
        }
        for index in lo..=hi {
            let byte = bytes[index];
            if byte == 0xff {
                continue;
            }
            for bit in 0..8 {
                if byte & (0x80 >> bit) == 0 {
                    return Ok(Some((index * 8 + bit) as i64));
                }
            }
        }
        Ok(Some(-1))
    }

    fn set(&mut self, key: &str, value: &[u8], ttl: Option<Duration>) {
        self.queued.push(WriteOp::Set {
            key: key.to_string(),
            value: value.to_vec(),
            ttl,
        });
    }

    fn set_bit(&mut self, key: &str, index: u32, value: bool) {
        self.queued.push(WriteOp::SetBit {
            key: key.to_string(),
            index,
            value,
        });
    }

    fn del(&mut self, key: &str) {
        self.queued.push(WriteOp::Del {
            key: key.to_string(),
        });
    }

    fn zadd(&mut self, key: &str, score: i64, member: &str) {
        self.queued.push(WriteOp::ZAdd {
            key: key.to_string(),
            score,
            member: member.to_string(),
        });
    }

    fn zrem(&mut self, key: &str, member: &str) {
        self.queued.push(WriteOp::ZRem {
            key: key.to_string(),
            member: member.to_string(),
        });
    }

    fn zrem_range_by_score(&mut self, key: &str, max: i64) {
        self.queued.push(WriteOp::ZRemRangeByScore {
            key: key.to_string(),
            max,
        });
    }

    async fn commit(self: Box<Self>) -> StoreResult<TxOutcome> {
        let mut inner = self.inner.lock();
        inner.purge_expired();
        for (key, version) in &self.watched {
            if inner.version(key) != *version {
                return Ok(TxOutcome::Conflict);
            }
        }
        for op in &self.queued {
            inner.apply(op)?;
        }
        Ok(TxOutcome::Committed)
    }
}
