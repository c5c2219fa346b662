//! Binding a stream's budget to a pool in a [`BandwidthStore`].

use tokio::time::Instant;

use crate::budget::Budget;
use crate::context::validate_pool_key;
use crate::error::Result;
use crate::store::BandwidthStore;

/// Budget operations forwarded to one store entry.
#[derive(Debug, Clone)]
pub struct GroupBudget {
    store: BandwidthStore,
    key: String,
}

impl GroupBudget {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn store(&self) -> &BandwidthStore {
        &self.store
    }
}

impl Budget for GroupBudget {
    fn set_start_time(&mut self, at: Instant) -> Result<Instant> {
        self.store.set_start_time(&self.key, at)
    }

    fn init_bytes(&mut self) -> Result<u64> {
        self.store.init_bytes(&self.key)
    }

    fn bytes(&self) -> Result<u64> {
        self.store.get_bytes(&self.key)
    }

    fn increase_bytes(&mut self, n: u64) -> Result<u64> {
        self.store.increase_bytes(&self.key, n)
    }

    fn allowed_bytes(&self) -> Result<u64> {
        self.store.get_allowed_bytes(&self.key)
    }

    fn set_allowed_bytes(&mut self, n: u64) -> Result<u64> {
        self.store.set_allowed_bytes(&self.key, n)
    }

    fn decrease_allowed_bytes(&mut self, n: u64) -> Result<u64> {
        self.store.decrease_allowed_bytes(&self.key, n)
    }

    fn claim_allowed_bytes(&mut self, want: u64) -> Result<u64> {
        self.store.claim_allowed_bytes(&self.key, want)
    }
}

/// Hands out [`GroupBudget`]s for pools of one store.
///
/// The pool key is always supplied by the caller; streams bound with the
/// same key drain the same allowance.
#[derive(Debug, Clone)]
pub struct StreamGroupBinder {
    store: BandwidthStore,
}

impl StreamGroupBinder {
    pub fn new(store: BandwidthStore) -> Self {
        Self { store }
    }

    pub fn bind(&self, key: impl Into<String>) -> Result<GroupBudget> {
        let key = key.into();
        validate_pool_key(&key)?;
        Ok(GroupBudget {
            store: self.store.clone(),
            key,
        })
    }

    pub fn store(&self) -> &BandwidthStore {
        &self.store
    }
}
