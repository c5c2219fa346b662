//! Budget accounting seen by a throttled stream.
//!
//! A stream never touches its byte counters or allowance directly; it goes
//! through [`Budget`]. [`LocalBudget`] keeps that state in the stream itself,
//! while [`GroupBudget`](crate::group::GroupBudget) redirects every
//! operation to a shared [`BandwidthStore`](crate::store::BandwidthStore)
//! entry so several streams drain one pool.

use tokio::time::Instant;

use crate::error::Result;
use crate::rate::UNLIMITED;

pub trait Budget: Send {
    /// Record the start of transfer. Only the first call takes effect; the
    /// effective start time is returned.
    fn set_start_time(&mut self, at: Instant) -> Result<Instant>;

    /// Make sure the byte counter exists, returning its value.
    fn init_bytes(&mut self) -> Result<u64>;

    /// Cumulative bytes pushed.
    fn bytes(&self) -> Result<u64>;

    fn increase_bytes(&mut self, n: u64) -> Result<u64>;

    /// Bytes currently permitted to pass.
    fn allowed_bytes(&self) -> Result<u64>;

    /// Install a freshly computed allowance. Returns the allowance actually in
    /// effect, which may be an earlier value if the implementation coalesces
    /// refills.
    fn set_allowed_bytes(&mut self, n: u64) -> Result<u64>;

    fn decrease_allowed_bytes(&mut self, n: u64) -> Result<u64>;

    /// Atomically take up to `want` bytes of allowance and return how many
    /// were granted.
    fn claim_allowed_bytes(&mut self, want: u64) -> Result<u64>;
}

/// Subtract from an allowance, leaving an unlimited allowance untouched and
/// never going below zero.
pub(crate) fn drain(allowance: u64, n: u64) -> u64 {
    if allowance == UNLIMITED {
        UNLIMITED
    } else {
        allowance.saturating_sub(n)
    }
}

/// Budget held in the stream's own fields.
#[derive(Debug, Default, Clone)]
pub struct LocalBudget {
    start_time: Option<Instant>,
    bytes: u64,
    allowance: u64,
}

impl LocalBudget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_time(&self) -> Option<Instant> {
        self.start_time
    }
}

impl Budget for LocalBudget {
    fn set_start_time(&mut self, at: Instant) -> Result<Instant> {
        Ok(*self.start_time.get_or_insert(at))
    }

    fn init_bytes(&mut self) -> Result<u64> {
        Ok(self.bytes)
    }

    fn bytes(&self) -> Result<u64> {
        Ok(self.bytes)
    }

    fn increase_bytes(&mut self, n: u64) -> Result<u64> {
        self.bytes = self.bytes.saturating_add(n);
        Ok(self.bytes)
    }

    fn allowed_bytes(&self) -> Result<u64> {
        Ok(self.allowance)
    }

    fn set_allowed_bytes(&mut self, n: u64) -> Result<u64> {
        self.allowance = n;
        Ok(n)
    }

    fn decrease_allowed_bytes(&mut self, n: u64) -> Result<u64> {
        self.allowance = drain(self.allowance, n);
        Ok(self.allowance)
    }

    fn claim_allowed_bytes(&mut self, want: u64) -> Result<u64> {
        let granted = want.min(self.allowance);
        self.allowance = drain(self.allowance, granted);
        Ok(granted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_start_time_is_set_once() {
        let mut budget = LocalBudget::new();
        let first = Instant::now();
        assert_eq!(budget.set_start_time(first).unwrap(), first);
        let later = first + Duration::from_secs(5);
        assert_eq!(budget.set_start_time(later).unwrap(), first);
        assert_eq!(budget.start_time(), Some(first));
    }

    #[test]
    fn test_claim_partial_and_full() {
        let mut budget = LocalBudget::new();
        budget.set_allowed_bytes(1000).unwrap();

        assert_eq!(budget.claim_allowed_bytes(400).unwrap(), 400);
        assert_eq!(budget.allowed_bytes().unwrap(), 600);
        assert_eq!(budget.claim_allowed_bytes(4000).unwrap(), 600);
        assert_eq!(budget.allowed_bytes().unwrap(), 0);
        assert_eq!(budget.claim_allowed_bytes(1).unwrap(), 0);
    }

    #[test]
    fn test_unlimited_allowance_is_never_drained() {
        let mut budget = LocalBudget::new();
        budget.set_allowed_bytes(UNLIMITED).unwrap();
        assert_eq!(budget.claim_allowed_bytes(1 << 40).unwrap(), 1 << 40);
        assert_eq!(budget.decrease_allowed_bytes(10).unwrap(), UNLIMITED);
    }

    #[test]
    fn test_decrease_saturates_at_zero() {
        let mut budget = LocalBudget::new();
        budget.set_allowed_bytes(5).unwrap();
        assert_eq!(budget.decrease_allowed_bytes(10).unwrap(), 0);
        assert_eq!(budget.increase_bytes(10).unwrap(), 10);
        assert_eq!(budget.init_bytes().unwrap(), 10);
    }
}
