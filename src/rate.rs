//! Rate values, rate functions and per-request rate resolvers.
//!
//! A rate function answers one question: given how long the stream has been
//! running and how many bytes it has pushed so far, how many bytes may pass
//! during the next refill period? It is asked once when the first chunk
//! arrives (with elapsed `0.0` for a fresh budget) and again on every refill
//! tick.
//!
//! ```
//! use byte_throttle::rate::{self, Rate};
//!
//! // 10 KiB/s forever
//! let steady = rate::constant(10 * 1024);
//!
//! // hold everything back for two seconds, then let it all through
//! let delayed = rate::from_fn(|elapsed, _bytes| {
//!     if elapsed < 2.0 { Rate::Limited(0) } else { Rate::Unlimited }
//! });
//! # let _ = (steady, delayed);
//! ```
use std::fmt;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};

use crate::context::RequestContext;
use crate::error::{Result, ThrottleError};

/// Allowance value standing in for an unlimited rate. Never decremented.
pub const UNLIMITED: u64 = u64::MAX;

/// Bytes permitted per refill period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rate {
    Limited(u64),
    Unlimited,
}

impl Rate {
    /// Allowance granted for one refill period.
    pub fn allowance(self) -> u64 {
        match self {
            Rate::Limited(bytes) => bytes,
            Rate::Unlimited => UNLIMITED,
        }
    }

    pub fn is_unlimited(self) -> bool {
        matches!(self, Rate::Unlimited)
    }

    /// Convert a floating point rate, the way callers computing rates from
    /// elapsed seconds naturally produce them.
    ///
    /// `+inf` is unlimited, finite values are floored, and negative or NaN
    /// values are rejected.
    pub fn from_f64(value: f64) -> Result<Self> {
        if value.is_nan() || value < 0.0 {
            return Err(ThrottleError::rate_function(format!(
                "rate must be non-negative, got {}",
                value
            )));
        }
        if value.is_infinite() || value >= u64::MAX as f64 {
            return Ok(Rate::Unlimited);
        }
        Ok(Rate::Limited(value.floor() as u64))
    }
}

impl From<u64> for Rate {
    fn from(bytes: u64) -> Self {
        Rate::Limited(bytes)
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rate::Limited(bytes) => write!(f, "{} B/s", bytes),
            Rate::Unlimited => write!(f, "unlimited"),
        }
    }
}

/// Supplies the desired sustained byte rate.
pub trait RateFunction: Send + Sync {
    /// `elapsed_secs` is measured from the budget's start time, `bytes_sent`
    /// is the budget's cumulative byte count.
    fn rate(&self, elapsed_secs: f64, bytes_sent: u64) -> Result<Rate>;
}

pub type SharedRateFn = Arc<dyn RateFunction>;

/// Fixed rate regardless of time or progress.
#[derive(Debug, Clone, Copy)]
pub struct ConstantRate(pub Rate);

impl RateFunction for ConstantRate {
    fn rate(&self, _elapsed_secs: f64, _bytes_sent: u64) -> Result<Rate> {
        Ok(self.0)
    }
}

/// Rate computed by a closure.
pub struct FnRate<F>(F);

impl<F> RateFunction for FnRate<F>
where
    F: Fn(f64, u64) -> Result<Rate> + Send + Sync,
{
    fn rate(&self, elapsed_secs: f64, bytes_sent: u64) -> Result<Rate> {
        (self.0)(elapsed_secs, bytes_sent)
    }
}

pub fn constant(bytes_per_second: impl Into<Rate>) -> SharedRateFn {
    Arc::new(ConstantRate(bytes_per_second.into()))
}

pub fn unlimited() -> SharedRateFn {
    Arc::new(ConstantRate(Rate::Unlimited))
}

/// Infallible closure rate.
pub fn from_fn<F>(f: F) -> SharedRateFn
where
    F: Fn(f64, u64) -> Rate + Send + Sync + 'static,
{
    Arc::new(FnRate(move |elapsed, bytes| Ok(f(elapsed, bytes))))
}

/// Fallible closure rate; an `Err` faults the stream.
pub fn try_from_fn<F>(f: F) -> SharedRateFn
where
    F: Fn(f64, u64) -> Result<Rate> + Send + Sync + 'static,
{
    Arc::new(FnRate(f))
}

type SyncResolveFn = dyn Fn(&RequestContext) -> Result<SharedRateFn> + Send + Sync;
type AsyncResolveFn = dyn Fn(&RequestContext) -> BoxFuture<'static, Result<SharedRateFn>> + Send + Sync;

/// Produces a rate function per stream from the request that triggered it.
///
/// The variant is the explicit marker of how the resolver runs: `Sync`
/// resolvers are called when the stream is built, `Async` resolvers return a
/// future that the stream drives to completion before it pulls its first
/// chunk.
#[derive(Clone)]
pub enum RateResolver {
    Sync(Arc<SyncResolveFn>),
    Async(Arc<AsyncResolveFn>),
}

impl RateResolver {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&RequestContext) -> Result<SharedRateFn> + Send + Sync + 'static,
    {
        RateResolver::Sync(Arc::new(f))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(&RequestContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<SharedRateFn>> + Send + 'static,
    {
        RateResolver::Async(Arc::new(move |ctx: &RequestContext| f(ctx).boxed()))
    }

    /// Start resolution for one stream.
    pub fn resolve(&self, ctx: &RequestContext) -> RateSource {
        match self {
            RateResolver::Sync(f) => match f(ctx) {
                Ok(rate_fn) => RateSource::Ready(rate_fn),
                // surfaced as a stream fault on first poll
                Err(err) => RateSource::Resolving(future::ready(Err(err)).boxed()),
            },
            RateResolver::Async(f) => RateSource::Resolving(f(ctx)),
        }
    }
}

impl fmt::Debug for RateResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateResolver::Sync(_) => f.write_str("RateResolver::Sync"),
            RateResolver::Async(_) => f.write_str("RateResolver::Async"),
        }
    }
}

/// Rate function of a single stream, possibly still being resolved.
pub enum RateSource {
    Ready(SharedRateFn),
    Resolving(BoxFuture<'static, Result<SharedRateFn>>),
}

impl RateSource {
    pub fn is_ready(&self) -> bool {
        matches!(self, RateSource::Ready(_))
    }
}

impl From<SharedRateFn> for RateSource {
    fn from(rate_fn: SharedRateFn) -> Self {
        RateSource::Ready(rate_fn)
    }
}

/// The three ways a caller can configure the rate.
#[derive(Clone)]
pub enum RateOption {
    Constant(Rate),
    Dynamic(SharedRateFn),
    Resolver(RateResolver),
}

impl RateOption {
    pub fn source(&self, ctx: &RequestContext) -> RateSource {
        match self {
            RateOption::Constant(rate) => RateSource::Ready(constant(*rate)),
            RateOption::Dynamic(rate_fn) => RateSource::Ready(rate_fn.clone()),
            RateOption::Resolver(resolver) => resolver.resolve(ctx),
        }
    }
}

impl fmt::Debug for RateOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateOption::Constant(rate) => write!(f, "RateOption::Constant({})", rate),
            RateOption::Dynamic(_) => f.write_str("RateOption::Dynamic"),
            RateOption::Resolver(resolver) => write!(f, "RateOption::Resolver({:?})", resolver),
        }
    }
}

impl From<u64> for RateOption {
    fn from(bytes_per_second: u64) -> Self {
        RateOption::Constant(Rate::Limited(bytes_per_second))
    }
}
