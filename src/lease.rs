//! Shared lease allocation over the external store.
//!
//! The allocator owns three structures that all replicas see through the
//! [`Store`] contract:
//!
//! - the availability bitset (`leasingRange`): bit `k` is 1 iff `start+k`
//!   is bound to a client
//! - one binding key per address (`ip:<addr>`): textual MAC with a TTL of
//!   one lease duration
//! - the time index (`ipMacMapping`): sorted set of `"<ip>-<mac>"` members
//!   scored by bind time in Unix nanoseconds, consumed by the reaper
//!
//! Every mutation runs inside one optimistic transaction so the three
//! structures never diverge: the transaction watches the keys it touches,
//! retries on conflict up to `max_tx_retry_attempts`, and either commits
//! all writes or none.
//!
//! # Offers are non-binding
//!
//! [`acquire_first_free`] only observes the first clear bit; it does not
//! set it. Two concurrent DISCOVERs may be offered the same address, and
//! the first REQUEST wins: [`bind`] re-scans for the first clear bit inside
//! its own transaction, which is the linearization point for the lease.
//!
//! [`acquire_first_free`]: LeaseAllocator::acquire_first_free
//! [`bind`]: LeaseAllocator::bind

use std::fmt;
use std::future::Future;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::store::{Store, TxOutcome};

/// Store key of the availability bitset.
pub const LEASING_RANGE_KEY: &str = "leasingRange";

/// Store key of the time-indexed binding set.
pub const IP_MAC_INDEX_KEY: &str = "ipMacMapping";

/// Store key holding the binding for one address.
pub fn binding_key(ip: Ipv4Addr) -> String {
    format!("ip:{ip}")
}

/// Current wall-clock time in Unix nanoseconds.
pub fn now_unix_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as i64)
        .unwrap_or(0)
}

/// An Ethernet hardware address in its canonical lowercase text form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Reads a MAC from the leading octets of a DHCP `chaddr` field.
    pub fn from_chaddr(chaddr: &[u8]) -> Option<Self> {
        let octets: [u8; 6] = chaddr.get(..6)?.try_into().ok()?;
        Some(Self(octets))
    }

    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddr {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        let mut octets = [0u8; 6];
        let mut parts = text.split(':');
        for slot in &mut octets {
            let part = parts
                .next()
                .ok_or_else(|| Error::InvalidMac(text.to_string()))?;
            if part.len() != 2 {
                return Err(Error::InvalidMac(text.to_string()));
            }
            *slot = u8::from_str_radix(part, 16).map_err(|_| Error::InvalidMac(text.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(Error::InvalidMac(text.to_string()));
        }
        Ok(Self(octets))
    }
}

/// Number of addresses in the inclusive IPv4 range `[from, to]`, negative
/// when `to < from`. Addresses are compared as big-endian 32-bit integers.
pub fn ip_range(from: Ipv4Addr, to: Ipv4Addr) -> i64 {
    i64::from(u32::from(to)) - i64::from(u32::from(from)) + 1
}

/// The address `offset` places after `ip`.
pub fn ip_add(ip: Ipv4Addr, offset: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip).wrapping_add(offset))
}

/// Concurrency-safe address allocation shared by all server replicas.
///
/// Cheap to clone via `Arc`; holds only immutable configuration and the
/// store handle.
pub struct LeaseAllocator {
    store: Arc<dyn Store>,
    start_ip: Ipv4Addr,
    pool_size: u32,
    max_retries: u8,
    lease_duration: Duration,
    op_deadline: Duration,
}

impl LeaseAllocator {
    pub fn new(store: Arc<dyn Store>, config: &Config) -> Result<Self> {
        if config.pool_size == 0 {
            return Err(Error::InvalidConfig(
                "pool_size must be greater than 0".to_string(),
            ));
        }
        if u32::from(config.start_ip)
            .checked_add(config.pool_size - 1)
            .is_none()
        {
            return Err(Error::InvalidConfig(
                "pool extends past the end of the IPv4 address space".to_string(),
            ));
        }
        Ok(Self {
            store,
            start_ip: config.start_ip,
            pool_size: config.pool_size,
            max_retries: config.max_tx_retry_attempts,
            lease_duration: config.lease_duration(),
            op_deadline: config.op_timeout(),
        })
    }

    pub fn start_ip(&self) -> Ipv4Addr {
        self.start_ip
    }

    pub fn pool_size(&self) -> u32 {
        self.pool_size
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    /// Whether `ip` lies inside the managed pool.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.offset_of(ip).is_some()
    }

    fn offset_of(&self, ip: Ipv4Addr) -> Option<u32> {
        let offset = ip_range(self.start_ip, ip) - 1;
        (0..i64::from(self.pool_size))
            .contains(&offset)
            .then_some(offset as u32)
    }

    fn pool_offset(&self, ip: Ipv4Addr) -> Result<u32> {
        self.offset_of(ip).ok_or(Error::AddressOutOfRange(ip))
    }

    // The scan never crosses into pad bytes, so spare zero-bits past the
    // pool cannot be mistaken for free slots.
    fn last_range_byte(&self) -> u32 {
        (self.pool_size - 1) / 8
    }

    async fn with_deadline<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.op_deadline, operation).await {
            Ok(result) => result,
            Err(_) => Err(Error::Deadline),
        }
    }

    /// Returns the first address whose availability bit is clear, without
    /// claiming it.
    ///
    /// # Errors
    ///
    /// [`Error::BitsetMissing`] when the pool was never initialized,
    /// [`Error::PoolExhausted`] when every address is bound, and
    /// [`Error::RetryExhausted`] after too many optimistic conflicts.
    pub async fn acquire_first_free(&self) -> Result<Ipv4Addr> {
        self.with_deadline(async {
            for _ in 0..self.max_retries {
                let mut tx = self.store.watch(&[LEASING_RANGE_KEY]).await?;
                let position = tx
                    .bit_scan_zero(LEASING_RANGE_KEY, 0, self.last_range_byte())
                    .await?
                    .ok_or(Error::BitsetMissing)?;
                if position < 0 || position >= i64::from(self.pool_size) {
                    return Err(Error::PoolExhausted);
                }
                match tx.commit().await? {
                    TxOutcome::Committed => return Ok(ip_add(self.start_ip, position as u32)),
                    TxOutcome::Conflict => continue,
                }
            }
            Err(Error::RetryExhausted(self.max_retries))
        })
        .await
    }

    /// Atomically claims the first free slot for `mac`, records the binding
    /// under `ip` with `ttl`, and registers it in the time index.
    ///
    /// The fresh bit scan inside the transaction, not the earlier offer, is
    /// what serializes competing claims.
    pub async fn bind(&self, ip: Ipv4Addr, mac: MacAddr, ttl: Duration) -> Result<()> {
        self.pool_offset(ip)?;
        let binding = binding_key(ip);
        let member = format!("{ip}-{mac}");
        let value = mac.to_string();
        self.with_deadline(async {
            for _ in 0..self.max_retries {
                let score = now_unix_ns();
                let mut tx = self
                    .store
                    .watch(&[binding.as_str(), IP_MAC_INDEX_KEY, LEASING_RANGE_KEY])
                    .await?;
                let position = tx
                    .bit_scan_zero(LEASING_RANGE_KEY, 0, self.last_range_byte())
                    .await?
                    .ok_or(Error::BitsetMissing)?;
                if position < 0 || position >= i64::from(self.pool_size) {
                    return Err(Error::PoolExhausted);
                }
                tx.set_bit(LEASING_RANGE_KEY, position as u32, true);
                tx.zadd(IP_MAC_INDEX_KEY, score, &member);
                tx.set(&binding, value.as_bytes(), Some(ttl));
                match tx.commit().await? {
                    TxOutcome::Committed => {
                        debug!(%ip, %mac, "bound lease");
                        return Ok(());
                    }
                    TxOutcome::Conflict => continue,
                }
            }
            Err(Error::RetryExhausted(self.max_retries))
        })
        .await
    }

    /// Looks up the MAC currently bound to `ip`. Absent bindings are
    /// `None`, not an error.
    pub async fn lookup(&self, ip: Ipv4Addr) -> Result<Option<MacAddr>> {
        let key = binding_key(ip);
        let value = self
            .with_deadline(async { Ok(self.store.get(&key).await?) })
            .await?;
        match value {
            None => Ok(None),
            Some(bytes) => {
                let text = String::from_utf8(bytes)
                    .map_err(|_| Error::InvalidMac("non-utf8 binding value".to_string()))?;
                Ok(Some(text.parse()?))
            }
        }
    }

    /// Releases `ip`, removing the binding only while it still belongs to
    /// `mac`.
    ///
    /// Idempotent: releasing an address that was already released, expired,
    /// or re-leased to another client commits without touching the binding.
    /// The availability bit is cleared in every case; the watched bitset
    /// restarts the sequence if that races a concurrent re-lease.
    pub async fn release(&self, ip: Ipv4Addr, mac: MacAddr) -> Result<()> {
        let offset = self.pool_offset(ip)?;
        let binding = binding_key(ip);
        let member = format!("{ip}-{mac}");
        let value = mac.to_string();
        self.with_deadline(async {
            for _ in 0..self.max_retries {
                let mut tx = self
                    .store
                    .watch(&[binding.as_str(), LEASING_RANGE_KEY, IP_MAC_INDEX_KEY])
                    .await?;
                if tx
                    .bit_scan_zero(LEASING_RANGE_KEY, 0, self.last_range_byte())
                    .await?
                    .is_none()
                {
                    return Err(Error::NoMapping);
                }
                tx.set_bit(LEASING_RANGE_KEY, offset, false);
                match tx.get(&binding).await? {
                    Some(stored) if stored == value.as_bytes() => {
                        tx.del(&binding);
                        tx.zrem(IP_MAC_INDEX_KEY, &member);
                    }
                    // Absent: the TTL or another agent already did the work.
                    // Mismatch: the address was re-leased since; not ours.
                    _ => {}
                }
                match tx.commit().await? {
                    TxOutcome::Committed => {
                        debug!(%ip, %mac, "released lease");
                        return Ok(());
                    }
                    TxOutcome::Conflict => continue,
                }
            }
            Err(Error::RetryExhausted(self.max_retries))
        })
        .await
    }

    /// Sweeps the time index for bindings older than `horizon` and releases
    /// each one whose recorded MAC still matches its index entry.
    ///
    /// Per-entry failures are logged and skipped; the sweep itself never
    /// fails once the stale set has been enumerated. Returns the number of
    /// bindings released.
    pub async fn reap_expired(&self, now_ns: i64, horizon: Duration) -> Result<usize> {
        let cutoff = now_ns.saturating_sub(horizon.as_nanos() as i64);
        let stale = self.store.zrange_by_score(IP_MAC_INDEX_KEY, cutoff).await?;
        let mut reaped = 0usize;

        for entry in &stale {
            let Some((ip_text, mac_text)) = entry.split_once('-') else {
                warn!(%entry, "skipping malformed time-index member");
                continue;
            };
            let (Ok(ip), Ok(mac)) = (ip_text.parse::<Ipv4Addr>(), mac_text.parse::<MacAddr>())
            else {
                warn!(%entry, "skipping unparseable time-index member");
                continue;
            };
            let Some(offset) = self.offset_of(ip) else {
                warn!(%ip, "skipping time-index member outside the pool");
                continue;
            };
            match self.reap_one(ip, offset, mac).await {
                Ok(true) => reaped += 1,
                Ok(false) => {}
                Err(error) => warn!(%ip, %error, "failed to reap expired binding"),
            }
        }

        // Drop everything at or below the cutoff in one stroke; entries
        // whose binding was refreshed were skipped above and their newer
        // index member survives.
        let mut trimmed = false;
        for _ in 0..self.max_retries {
            let mut tx = self.store.watch(&[IP_MAC_INDEX_KEY]).await?;
            tx.zrem_range_by_score(IP_MAC_INDEX_KEY, cutoff);
            if tx.commit().await? == TxOutcome::Committed {
                trimmed = true;
                break;
            }
        }
        if !trimmed {
            warn!("time-index trim kept conflicting; leaving stale members for the next sweep");
        }

        Ok(reaped)
    }

    async fn reap_one(&self, ip: Ipv4Addr, offset: u32, mac: MacAddr) -> Result<bool> {
        let binding = binding_key(ip);
        let value = mac.to_string();
        for _ in 0..self.max_retries {
            let mut tx = self
                .store
                .watch(&[binding.as_str(), LEASING_RANGE_KEY])
                .await?;
            let expired = matches!(
                tx.get(&binding).await?,
                Some(stored) if stored == value.as_bytes()
            );
            if expired {
                tx.del(&binding);
                tx.set_bit(LEASING_RANGE_KEY, offset, false);
            }
            match tx.commit().await? {
                TxOutcome::Committed => return Ok(expired),
                TxOutcome::Conflict => continue,
            }
        }
        Err(Error::RetryExhausted(self.max_retries))
    }

    /// Writes a fresh all-zeros availability bitset, one byte per pool
    /// slot, with no TTL. Overwrites any existing pool state.
    pub async fn init_pool(&self) -> Result<()> {
        let zeros = vec![0u8; self.pool_size as usize];
        self.store.set(LEASING_RANGE_KEY, &zeros, None).await?;
        Ok(())
    }

    /// Initializes the bitset only when it is missing, so a cold replica
    /// can start serving without clobbering live state. Returns whether
    /// initialization happened.
    pub async fn ensure_pool(&self) -> Result<bool> {
        if self.store.get(LEASING_RANGE_KEY).await?.is_none() {
            self.init_pool().await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Deletes the bitset, the time index, and every binding key.
    pub async fn reset_all(&self) -> Result<()> {
        self.store.del(LEASING_RANGE_KEY).await?;
        self.store.del(IP_MAC_INDEX_KEY).await?;
        for key in self.store.keys("ip:*").await? {
            self.store.del(&key).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreResult, StoreTx};
    use async_trait::async_trait;

    fn test_config(start_ip: Ipv4Addr, pool_size: u32) -> Config {
        Config {
            start_ip,
            pool_size,
            ..Config::default()
        }
    }

    fn test_allocator(start_ip: Ipv4Addr, pool_size: u32) -> (Arc<MemoryStore>, LeaseAllocator) {
        let store = Arc::new(MemoryStore::new());
        let allocator = LeaseAllocator::new(
            Arc::clone(&store) as Arc<dyn Store>,
            &test_config(start_ip, pool_size),
        )
        .unwrap();
        (store, allocator)
    }

    fn mac(last: u8) -> MacAddr {
        MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, last])
    }

    async fn bit(store: &MemoryStore, index: u32) -> bool {
        let bytes = store.get(LEASING_RANGE_KEY).await.unwrap().unwrap();
        bytes[(index / 8) as usize] & (0x80 >> (index % 8)) != 0
    }

    async fn index_members(store: &MemoryStore) -> Vec<String> {
        store
            .zrange_by_score(IP_MAC_INDEX_KEY, i64::MAX)
            .await
            .unwrap()
    }

    #[test]
    fn mac_addr_text_roundtrip() {
        let mac = MacAddr::new([0xaa, 0x0b, 0xcc, 0x1d, 0xee, 0xff]);
        assert_eq!(mac.to_string(), "aa:0b:cc:1d:ee:ff");
        assert_eq!("aa:0b:cc:1d:ee:ff".parse::<MacAddr>().unwrap(), mac);

        assert!("aa:bb:cc".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:ff:00".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:zz".parse::<MacAddr>().is_err());
        assert!("aabb:cc:dd:ee:f".parse::<MacAddr>().is_err());
    }

    #[test]
    fn mac_addr_from_chaddr_uses_leading_octets() {
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(
            MacAddr::from_chaddr(&chaddr).unwrap().octets(),
            [1, 2, 3, 4, 5, 6]
        );
        assert!(MacAddr::from_chaddr(&[1, 2, 3]).is_none());
    }

    #[test]
    fn ip_arithmetic() {
        let start = Ipv4Addr::new(10, 0, 0, 1);
        assert_eq!(ip_add(start, 0), start);
        assert_eq!(ip_add(start, 9), Ipv4Addr::new(10, 0, 0, 10));
        assert_eq!(ip_add(Ipv4Addr::new(10, 0, 0, 254), 3), Ipv4Addr::new(10, 0, 1, 1));

        assert_eq!(ip_range(start, start), 1);
        assert_eq!(ip_range(start, Ipv4Addr::new(10, 0, 0, 4)), 4);
        assert_eq!(ip_range(Ipv4Addr::new(10, 0, 0, 4), start), -2);
    }

    #[tokio::test]
    async fn init_pool_scans_from_zero() {
        let (store, allocator) = test_allocator(Ipv4Addr::new(10, 0, 0, 1), 4);
        allocator.init_pool().await.unwrap();

        let mut tx = store.watch(&[]).await.unwrap();
        assert_eq!(
            tx.bit_scan_zero(LEASING_RANGE_KEY, 0, 0).await.unwrap(),
            Some(0)
        );
    }

    #[tokio::test]
    async fn acquire_without_init_reports_missing_bitset() {
        let (_store, allocator) = test_allocator(Ipv4Addr::new(10, 0, 0, 1), 4);
        assert!(matches!(
            allocator.acquire_first_free().await,
            Err(Error::BitsetMissing)
        ));
    }

    #[tokio::test]
    async fn acquire_observes_without_claiming() {
        let (store, allocator) = test_allocator(Ipv4Addr::new(10, 0, 0, 1), 4);
        allocator.init_pool().await.unwrap();

        let first = allocator.acquire_first_free().await.unwrap();
        let second = allocator.acquire_first_free().await.unwrap();
        assert_eq!(first, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(second, first);
        assert!(!bit(&store, 0).await);
    }

    #[tokio::test]
    async fn bind_claims_first_free_slot() {
        let (store, allocator) = test_allocator(Ipv4Addr::new(10, 0, 0, 1), 4);
        allocator.init_pool().await.unwrap();

        let ip = allocator.acquire_first_free().await.unwrap();
        allocator
            .bind(ip, mac(0x01), Duration::from_secs(3600))
            .await
            .unwrap();

        assert!(bit(&store, 0).await);
        assert_eq!(allocator.lookup(ip).await.unwrap(), Some(mac(0x01)));
        assert_eq!(
            index_members(&store).await,
            vec![format!("{ip}-{}", mac(0x01))]
        );

        let next = allocator.acquire_first_free().await.unwrap();
        assert_eq!(next, Ipv4Addr::new(10, 0, 0, 2));
    }

    #[tokio::test]
    async fn bit_matches_binding_through_bind_release_sequences() {
        let (store, allocator) = test_allocator(Ipv4Addr::new(10, 0, 0, 1), 10);
        allocator.init_pool().await.unwrap();

        let mut bound = Vec::new();
        for client in 0..6u8 {
            let ip = allocator.acquire_first_free().await.unwrap();
            allocator
                .bind(ip, mac(client), Duration::from_secs(3600))
                .await
                .unwrap();
            bound.push((ip, mac(client)));
        }
        for (ip, mac) in bound.drain(2..4) {
            allocator.release(ip, mac).await.unwrap();
        }

        for offset in 0..10u32 {
            let ip = ip_add(allocator.start_ip(), offset);
            let has_binding = allocator.lookup(ip).await.unwrap().is_some();
            assert_eq!(
                bit(&store, offset).await,
                has_binding,
                "bit/binding divergence at offset {offset}"
            );
        }
    }

    #[tokio::test]
    async fn bind_retries_through_transient_conflicts() {
        // The first two commit attempts lose the optimistic race; the third
        // goes through and the three structures agree afterwards.
        let store = Arc::new(FlakyStore::conflicting(2));
        store
            .inner
            .set(LEASING_RANGE_KEY, &[0u8; 4], None)
            .await
            .unwrap();
        let allocator = LeaseAllocator::new(
            Arc::clone(&store) as Arc<dyn Store>,
            &test_config(Ipv4Addr::new(10, 0, 0, 1), 4),
        )
        .unwrap();

        let ip = Ipv4Addr::new(10, 0, 0, 1);
        allocator
            .bind(ip, mac(0x01), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(allocator.lookup(ip).await.unwrap(), Some(mac(0x01)));
        let bytes = store.inner.get(LEASING_RANGE_KEY).await.unwrap().unwrap();
        assert_eq!(bytes[0] & 0x80, 0x80);
    }

    #[tokio::test]
    async fn acquire_then_bind_only_exhausts_when_full() {
        let (_store, allocator) = test_allocator(Ipv4Addr::new(10, 0, 0, 1), 3);
        allocator.init_pool().await.unwrap();

        for client in 0..3u8 {
            let ip = allocator.acquire_first_free().await.unwrap();
            allocator
                .bind(ip, mac(client), Duration::from_secs(60))
                .await
                .unwrap();
        }

        assert!(matches!(
            allocator.acquire_first_free().await,
            Err(Error::PoolExhausted)
        ));
        assert!(matches!(
            allocator
                .bind(Ipv4Addr::new(10, 0, 0, 1), mac(9), Duration::from_secs(60))
                .await,
            Err(Error::PoolExhausted)
        ));
    }

    #[tokio::test]
    async fn pool_exhaustion_respects_pad_bits() {
        // Three slots leave five spare zero-bits in the scan byte; they
        // must not be offered.
        let (_store, allocator) = test_allocator(Ipv4Addr::new(10, 0, 0, 1), 3);
        allocator.init_pool().await.unwrap();

        for client in 0..3u8 {
            let ip = allocator.acquire_first_free().await.unwrap();
            allocator
                .bind(ip, mac(client), Duration::from_secs(60))
                .await
                .unwrap();
        }
        assert!(matches!(
            allocator.acquire_first_free().await,
            Err(Error::PoolExhausted)
        ));
    }

    #[tokio::test]
    async fn release_clears_bit_binding_and_index() {
        let (store, allocator) = test_allocator(Ipv4Addr::new(10, 0, 0, 1), 4);
        allocator.init_pool().await.unwrap();

        let ip = allocator.acquire_first_free().await.unwrap();
        allocator
            .bind(ip, mac(0x01), Duration::from_secs(3600))
            .await
            .unwrap();
        allocator.release(ip, mac(0x01)).await.unwrap();

        assert!(!bit(&store, 0).await);
        assert_eq!(allocator.lookup(ip).await.unwrap(), None);
        assert!(index_members(&store).await.is_empty());
    }

    #[tokio::test]
    async fn release_is_idempotent_for_absent_binding() {
        let (store, allocator) = test_allocator(Ipv4Addr::new(10, 0, 0, 1), 4);
        allocator.init_pool().await.unwrap();

        let ip = Ipv4Addr::new(10, 0, 0, 2);
        allocator.release(ip, mac(0x01)).await.unwrap();
        allocator.release(ip, mac(0x01)).await.unwrap();
        assert!(!bit(&store, 1).await);
    }

    #[tokio::test]
    async fn release_with_foreign_mac_keeps_binding() {
        let (store, allocator) = test_allocator(Ipv4Addr::new(10, 0, 0, 1), 4);
        allocator.init_pool().await.unwrap();

        let ip = allocator.acquire_first_free().await.unwrap();
        allocator
            .bind(ip, mac(0x01), Duration::from_secs(3600))
            .await
            .unwrap();
        allocator.release(ip, mac(0x02)).await.unwrap();

        // The obsolete caller must not evict the live lessee.
        assert_eq!(allocator.lookup(ip).await.unwrap(), Some(mac(0x01)));
        assert!(!bit(&store, 0).await);
    }

    #[tokio::test]
    async fn release_outside_pool_is_rejected() {
        let (_store, allocator) = test_allocator(Ipv4Addr::new(10, 0, 0, 1), 4);
        allocator.init_pool().await.unwrap();

        assert!(matches!(
            allocator.release(Ipv4Addr::new(10, 0, 0, 200), mac(0x01)).await,
            Err(Error::AddressOutOfRange(_))
        ));
        assert!(matches!(
            allocator.release(Ipv4Addr::new(9, 255, 255, 255), mac(0x01)).await,
            Err(Error::AddressOutOfRange(_))
        ));
    }

    #[tokio::test]
    async fn release_without_bitset_reports_no_mapping() {
        let (_store, allocator) = test_allocator(Ipv4Addr::new(10, 0, 0, 1), 4);
        assert!(matches!(
            allocator.release(Ipv4Addr::new(10, 0, 0, 1), mac(0x01)).await,
            Err(Error::NoMapping)
        ));
    }

    /// Plants a binding with a chosen index score, as if `bind` had run at
    /// that instant.
    async fn plant_binding(store: &MemoryStore, ip: Ipv4Addr, offset: u32, mac: MacAddr, score: i64) {
        let mut tx = store.watch(&[]).await.unwrap();
        tx.set_bit(LEASING_RANGE_KEY, offset, true);
        tx.zadd(IP_MAC_INDEX_KEY, score, &format!("{ip}-{mac}"));
        tx.set(&binding_key(ip), mac.to_string().as_bytes(), None);
        assert_eq!(tx.commit().await.unwrap(), TxOutcome::Committed);
    }

    #[tokio::test]
    async fn reap_releases_only_expired_bindings() {
        let (store, allocator) = test_allocator(Ipv4Addr::new(10, 0, 0, 1), 4);
        allocator.init_pool().await.unwrap();

        let base = 1_000_000_000_000i64;
        let old_ip = Ipv4Addr::new(10, 0, 0, 1);
        let fresh_ip = Ipv4Addr::new(10, 0, 0, 2);
        plant_binding(&store, old_ip, 0, mac(0x01), base).await;
        plant_binding(&store, fresh_ip, 1, mac(0x02), base + 5_000_000_000).await;

        // Six seconds after the first bind, with a two-second horizon, only
        // the first lease is stale.
        let reaped = allocator
            .reap_expired(base + 6_000_000_000, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reaped, 1);

        assert_eq!(allocator.lookup(old_ip).await.unwrap(), None);
        assert!(!bit(&store, 0).await);
        assert_eq!(allocator.lookup(fresh_ip).await.unwrap(), Some(mac(0x02)));
        assert!(bit(&store, 1).await);
        assert_eq!(
            index_members(&store).await,
            vec![format!("{fresh_ip}-{}", mac(0x02))]
        );
    }

    #[tokio::test]
    async fn reap_skips_rebound_addresses() {
        let (store, allocator) = test_allocator(Ipv4Addr::new(10, 0, 0, 1), 4);
        allocator.init_pool().await.unwrap();

        // The address changed hands; a stale index member for the previous
        // lessee survived the release race.
        let base = 1_000_000_000_000i64;
        let ip = Ipv4Addr::new(10, 0, 0, 1);
        plant_binding(&store, ip, 0, mac(0x02), base).await;
        let mut tx = store.watch(&[]).await.unwrap();
        tx.zadd(IP_MAC_INDEX_KEY, base - 60_000_000_000, &format!("{ip}-{}", mac(0x01)));
        assert_eq!(tx.commit().await.unwrap(), TxOutcome::Committed);

        let reaped = allocator
            .reap_expired(base + 10_000_000_000, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(reaped, 0);

        // The stale member is gone but the live binding survived.
        assert_eq!(allocator.lookup(ip).await.unwrap(), Some(mac(0x02)));
        assert!(bit(&store, 0).await);
        assert_eq!(index_members(&store).await, vec![format!("{ip}-{}", mac(0x02))]);
    }

    #[tokio::test]
    async fn reap_tolerates_malformed_index_members() {
        let (store, allocator) = test_allocator(Ipv4Addr::new(10, 0, 0, 1), 4);
        allocator.init_pool().await.unwrap();

        let mut tx = store.watch(&[]).await.unwrap();
        tx.zadd(IP_MAC_INDEX_KEY, 1, "garbage");
        tx.zadd(IP_MAC_INDEX_KEY, 2, "10.0.0.250-aa:aa:aa:aa:aa:aa");
        tx.zadd(IP_MAC_INDEX_KEY, 3, "not-an-ip-aa:aa:aa:aa:aa:aa");
        tx.commit().await.unwrap();

        let reaped = allocator
            .reap_expired(1_000_000_000, Duration::from_secs(0))
            .await
            .unwrap();
        assert_eq!(reaped, 0);
        assert!(index_members(&store).await.is_empty());
    }

    #[tokio::test]
    async fn full_pool_scans_negative_after_all_binds() {
        let (store, allocator) = test_allocator(Ipv4Addr::new(10, 0, 0, 1), 8);
        allocator.init_pool().await.unwrap();

        for client in 0..8u8 {
            let ip = allocator.acquire_first_free().await.unwrap();
            allocator.bind(ip, mac(client), Duration::from_secs(60)).await.unwrap();
        }

        let mut tx = store.watch(&[]).await.unwrap();
        assert_eq!(
            tx.bit_scan_zero(LEASING_RANGE_KEY, 0, 0).await.unwrap(),
            Some(-1)
        );
    }

    #[tokio::test]
    async fn retries_are_bounded_under_permanent_conflict() {
        let store = Arc::new(FlakyStore::conflicting(usize::MAX));
        store
            .inner
            .set(LEASING_RANGE_KEY, &[0u8; 4], None)
            .await
            .unwrap();
        let allocator = LeaseAllocator::new(
            Arc::clone(&store) as Arc<dyn Store>,
            &test_config(Ipv4Addr::new(10, 0, 0, 1), 4),
        )
        .unwrap();

        assert!(matches!(
            allocator
                .bind(Ipv4Addr::new(10, 0, 0, 1), mac(0x01), Duration::from_secs(60))
                .await,
            Err(Error::RetryExhausted(5))
        ));
        // Nothing was committed along the way.
        assert!(allocator.lookup(Ipv4Addr::new(10, 0, 0, 1)).await.unwrap().is_none());
    }

    /// Store whose next `conflicts` commits lose the optimistic race.
    struct FlakyStore {
        inner: MemoryStore,
        conflicts: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl FlakyStore {
        fn conflicting(conflicts: usize) -> Self {
            Self {
                inner: MemoryStore::new(),
                conflicts: Arc::new(std::sync::atomic::AtomicUsize::new(conflicts)),
            }
        }
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()> {
            self.inner.set(key, value, ttl).await
        }

        async fn del(&self, key: &str) -> StoreResult<()> {
            self.inner.del(key).await
        }

        async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
            self.inner.keys(pattern).await
        }

        async fn zrange_by_score(&self, key: &str, max: i64) -> StoreResult<Vec<String>> {
            self.inner.zrange_by_score(key, max).await
        }

        async fn watch(&self, keys: &[&str]) -> StoreResult<Box<dyn StoreTx>> {
            Ok(Box::new(FlakyTx {
                conflicts: Arc::clone(&self.conflicts),
                inner: self.inner.watch(keys).await?,
            }))
        }
    }

    struct FlakyTx {
        conflicts: Arc<std::sync::atomic::AtomicUsize>,
        inner: Box<dyn StoreTx>,
    }

    impl FlakyTx {
        fn take_conflict(&self) -> bool {
            self.conflicts
                .fetch_update(
                    std::sync::atomic::Ordering::SeqCst,
                    std::sync::atomic::Ordering::SeqCst,
                    |left| left.checked_sub(1),
                )
                .is_ok()
        }
    }

    #[async_trait]
    impl StoreTx for FlakyTx {
        async fn get(&mut self, key: &str) -> StoreResult<Option<Vec<u8>>> {
            self.inner.get(key).await
        }

        async fn bit_scan_zero(
            &mut self,
            key: &str,
            byte_lo: u32,
            byte_hi: u32,
        ) -> StoreResult<Option<i64>> {
            self.inner.bit_scan_zero(key, byte_lo, byte_hi).await
        }

        fn set(&mut self, key: &str, value: &[u8], ttl: Option<Duration>) {
            self.inner.set(key, value, ttl);
        }

        fn set_bit(&mut self, key: &str, index: u32, value: bool) {
            self.inner.set_bit(key, index, value);
        }

        fn del(&mut self, key: &str) {
            self.inner.del(key);
        }

        fn zadd(&mut self, key: &str, score: i64, member: &str) {
            self.inner.zadd(key, score, member);
        }

        fn zrem(&mut self, key: &str, member: &str) {
            self.inner.zrem(key, member);
        }

        fn zrem_range_by_score(&mut self, key: &str, max: i64) {
            self.inner.zrem_range_by_score(key, max);
        }

        async fn commit(self: Box<Self>) -> StoreResult<TxOutcome> {
            if self.take_conflict() {
                // Queued writes on the inner transaction are discarded.
                return Ok(TxOutcome::Conflict);
            }
            self.inner.commit().await
        }
    }
}
