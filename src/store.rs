//! Keyed, bounded storage of pooled bandwidth budgets.
//!
//! Entries are created lazily (zero-initialised) on first write, kept in an
//! LRU of bounded capacity, and expire `ttl` after their last write. An
//! evicted entry is simply recreated empty the next time a stream touches
//! the key, so eviction loses accumulated counters but never breaks a live
//! stream.
//!
//! Allowance refills are coalesced per key: [`BandwidthStore::set_allowed_bytes`]
//! only overwrites the stored allowance when at least `refill_window` has
//! passed since the previous overwrite. Streams sharing a key therefore share
//! one refill decision per window instead of each topping the pool up.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;
use tracing::trace;

use crate::budget::drain;
use crate::error::{Result, ThrottleError};

pub const DEFAULT_CAPACITY: usize = 5000;
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_REFILL_WINDOW: Duration = Duration::from_millis(1000);

/// Longest accepted pool lifetime.
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);
/// Longest accepted debounce window between allowance refills.
pub const MAX_REFILL_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Bounds of a [`BandwidthStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    pub capacity: usize,
    pub ttl: Duration,
    pub refill_window: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            ttl: DEFAULT_TTL,
            refill_window: DEFAULT_REFILL_WINDOW,
        }
    }
}

impl StoreOptions {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(ThrottleError::config(
                "Store capacity must be greater than 0",
            ));
        }
        if self.ttl.is_zero() {
            return Err(ThrottleError::config("Store TTL must be greater than 0"));
        }
        if self.ttl > MAX_TTL {
            return Err(ThrottleError::config(format!(
                "Store TTL must not exceed {:?}",
                MAX_TTL
            )));
        }
        if self.refill_window.is_zero() {
            return Err(ThrottleError::config(
                "Refill window must be greater than 0",
            ));
        }
        if self.refill_window > MAX_REFILL_WINDOW {
            return Err(ThrottleError::config(format!(
                "Refill window must not exceed {:?}",
                MAX_REFILL_WINDOW
            )));
        }
        Ok(())
    }
}

/// Overrides for a child store; unset fields are inherited from the parent.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScopeOptions {
    pub capacity: Option<usize>,
    pub ttl: Option<Duration>,
    pub refill_window: Option<Duration>,
}

/// Accounting state of one pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolEntry {
    pub start_time: Option<Instant>,
    pub bytes: Option<u64>,
    pub allowed_bytes: Option<u64>,
    pub allowed_bytes_updated_at: Option<Instant>,
}

#[derive(Debug)]
struct Slot {
    entry: PoolEntry,
    expires_at: Instant,
}

/// Shared bandwidth pools keyed by an opaque identifier.
///
/// Cloning is cheap and clones share the same pools. Every operation holds
/// the store lock for its whole read-modify-write, so concurrent streams on
/// different threads never lose updates.
#[derive(Clone)]
pub struct BandwidthStore {
    name: Arc<str>,
    options: StoreOptions,
    pools: Arc<Mutex<LruCache<String, Slot>>>,
}

impl BandwidthStore {
    pub fn new(options: StoreOptions) -> Result<Self> {
        Self::with_name("default", options)
    }

    pub fn with_name(name: impl Into<Arc<str>>, options: StoreOptions) -> Result<Self> {
        options.validate()?;
        let capacity = NonZeroUsize::new(options.capacity)
            .ok_or_else(|| ThrottleError::config("Store capacity must be greater than 0"))?;

        Ok(Self {
            name: name.into(),
            options,
            pools: Arc::new(Mutex::new(LruCache::new(capacity))),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> StoreOptions {
        self.options
    }

    /// A store with its own pools and bounds that keeps this store's name.
    pub fn child(&self, scope: ScopeOptions) -> Result<Self> {
        let options = StoreOptions {
            capacity: scope.capacity.unwrap_or(self.options.capacity),
            ttl: scope.ttl.unwrap_or(self.options.ttl),
            refill_window: scope.refill_window.unwrap_or(self.options.refill_window),
        };
        Self::with_name(self.name.clone(), options)
    }

    fn lock(&self) -> Result<MutexGuard<'_, LruCache<String, Slot>>> {
        self.pools
            .lock()
            .map_err(|_| ThrottleError::store("Failed to acquire lock on bandwidth pools"))
    }

    /// Run `f` against the live entry for `key`, without creating it.
    fn read<T>(&self, key: &str, f: impl FnOnce(Option<&PoolEntry>) -> T) -> Result<T> {
        let mut pools = self.lock()?;
        let now = Instant::now();

        let expired = matches!(pools.get(key), Some(slot) if slot.expires_at <= now);
        if expired {
            pools.pop(key);
            trace!(store = %self.name, key, "pool expired");
        }

        Ok(f(pools.get(key).map(|slot| &slot.entry)))
    }

    /// Run `f` against the entry for `key`, creating it if missing or expired
    /// and refreshing its TTL.
    fn write<T>(&self, key: &str, f: impl FnOnce(&mut PoolEntry, Instant) -> T) -> Result<T> {
        let now = Instant::now();
        let expires_at = now.checked_add(self.options.ttl).ok_or_else(|| {
            ThrottleError::config(format!("Store TTL {:?} is out of range", self.options.ttl))
        })?;
        let mut pools = self.lock()?;

        let expired = matches!(pools.peek(key), Some(slot) if slot.expires_at <= now);
        if expired {
            pools.pop(key);
            trace!(store = %self.name, key, "pool expired");
        }
        if !pools.contains(key) {
            let fresh = Slot {
                entry: PoolEntry::default(),
                expires_at,
            };
            if let Some((evicted, _)) = pools.push(key.to_string(), fresh) {
                trace!(store = %self.name, key = %evicted, "pool evicted");
            }
        }

        let slot = pools
            .get_mut(key)
            .ok_or_else(|| ThrottleError::store(format!("Pool '{}' vanished during update", key)))?;
        slot.expires_at = expires_at;
        let out = f(&mut slot.entry, now);
        trace!(store = %self.name, key, entry = ?slot.entry, "pool updated");
        Ok(out)
    }

    pub fn entry(&self, key: &str) -> Result<Option<PoolEntry>> {
        self.read(key, |entry| entry.copied())
    }

    pub fn set_start_time(&self, key: &str, at: Instant) -> Result<Instant> {
        self.write(key, |entry, _| *entry.start_time.get_or_insert(at))
    }

    pub fn start_time(&self, key: &str) -> Result<Option<Instant>> {
        self.read(key, |entry| entry.and_then(|e| e.start_time))
    }

    pub fn init_bytes(&self, key: &str) -> Result<u64> {
        self.write(key, |entry, _| *entry.bytes.get_or_insert(0))
    }

    pub fn get_bytes(&self, key: &str) -> Result<u64> {
        self.read(key, |entry| entry.and_then(|e| e.bytes).unwrap_or(0))
    }

    pub fn increase_bytes(&self, key: &str, n: u64) -> Result<u64> {
        self.write(key, |entry, _| {
            let bytes = entry.bytes.unwrap_or(0).saturating_add(n);
            entry.bytes = Some(bytes);
            bytes
        })
    }

    pub fn get_allowed_bytes(&self, key: &str) -> Result<u64> {
        self.read(key, |entry| entry.and_then(|e| e.allowed_bytes).unwrap_or(0))
    }

    /// Overwrite the allowance unless it was already overwritten less than
    /// `refill_window` ago, in which case the current allowance is kept and
    /// returned.
    pub fn set_allowed_bytes(&self, key: &str, n: u64) -> Result<u64> {
        let window = self.options.refill_window;
        self.write(key, |entry, now| match entry.allowed_bytes_updated_at {
            Some(updated_at) if now.duration_since(updated_at) < window => {
                entry.allowed_bytes.unwrap_or(0)
            }
            _ => {
                entry.allowed_bytes = Some(n);
                entry.allowed_bytes_updated_at = Some(now);
                n
            }
        })
    }

    pub fn decrease_allowed_bytes(&self, key: &str, n: u64) -> Result<u64> {
        self.write(key, |entry, _| {
            let allowed = drain(entry.allowed_bytes.unwrap_or(0), n);
            entry.allowed_bytes = Some(allowed);
            allowed
        })
    }

    /// Take up to `want` bytes from the pool's allowance in one step.
    pub fn claim_allowed_bytes(&self, key: &str, want: u64) -> Result<u64> {
        self.write(key, |entry, _| {
            let allowed = entry.allowed_bytes.unwrap_or(0);
            let granted = want.min(allowed);
            entry.allowed_bytes = Some(drain(allowed, granted));
            granted
        })
    }

    pub fn contains(&self, key: &str) -> Result<bool> {
        self.read(key, |entry| entry.is_some())
    }

    pub fn remove(&self, key: &str) -> Result<Option<PoolEntry>> {
        Ok(self.lock()?.pop(key).map(|slot| slot.entry))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.is_empty())
    }

    /// Drop every expired pool, returning how many were removed.
    pub fn purge_expired(&self) -> Result<usize> {
        let mut pools = self.lock()?;
        let now = Instant::now();

        let expired: Vec<String> = pools
            .iter()
            .filter(|(_, slot)| slot.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            pools.pop(key);
        }

        Ok(expired.len())
    }
}

impl std::fmt::Debug for BandwidthStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BandwidthStore")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
