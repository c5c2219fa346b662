//! Byte-rate throttling for streams of [`Bytes`].
//!
//! [`ThrottleStream`] sits between a producer (any `Stream<Item = Result<Bytes, E>>`)
//! and its consumer and lets bytes through no faster than its rate function
//! allows.
//!
//! ## How it paces
//! - The first chunk activates the stream: the start time is recorded, the
//!   rate function is asked for the initial allowance, and a refill ticker is
//!   started (one tick per second by default).
//! - Each chunk is flushed as far as the allowance permits. What does not fit
//!   stays buffered, and the producer is not polled again until that buffered
//!   remainder has gone out. At most one chunk is ever held.
//! - Every tick replaces the allowance with a fresh answer from the rate
//!   function; a buffered remainder is retried in the same poll.
//! - A rate of `0` holds output until a later tick answers otherwise, and an
//!   unlimited rate flushes the whole buffered remainder in one step.
//!
//! ## Failure
//! Rate function errors, producer errors, store errors and (in
//! [`ThrottleStream::pipe_to`]) writer errors end the stream: it yields the
//! error once, stops its ticker, drops the buffered chunk and then yields
//! `None`.
//!
//! ```no_run
//! use bytes::Bytes;
//! use futures::{stream, StreamExt};
//! use byte_throttle::{rate, ThrottleStream};
//!
//! # #[tokio::main]
//! # async fn main() -> byte_throttle::Result<()> {
//! let body = stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from(vec![0u8; 4096]))]);
//! let mut throttled = ThrottleStream::new(body, rate::constant(1024u64)); // ~3 s
//! while let Some(chunk) = throttled.next().await {
//!     let _chunk = chunk?;
//! }
//! # Ok(()) }
//! ```
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{FusedStream, Stream, StreamExt};
use futures::FutureExt;
use pin_project::pin_project;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::budget::{Budget, LocalBudget};
use crate::context::RequestContext;
use crate::error::{BoxError, Result, ThrottleError};
use crate::group::StreamGroupBinder;
use crate::rate::{RateResolver, RateSource, SharedRateFn};

/// Interval between allowance refills.
pub const REFILL_PERIOD: Duration = Duration::from_millis(1000);

/// Bounds applied by [`ThrottleStream::with_refill_period`].
pub const MIN_REFILL_PERIOD: Duration = Duration::from_millis(1);
pub const MAX_REFILL_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Lifecycle of a [`ThrottleStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No chunk has arrived yet.
    Uninitialized,
    /// The refill ticker is running.
    Active,
    /// Input ended or the stream was destroyed.
    Closed,
    /// A fault ended the stream.
    Faulted,
}

/// Stream transform limiting how fast bytes pass through.
#[pin_project]
pub struct ThrottleStream<S> {
    #[pin]
    inner: S,

    engine: Engine,
}

struct Engine {
    rate: RateSource,
    budget: Box<dyn Budget>,
    refill_period: Duration,
    start_time: Option<Instant>,
    ticker: Option<Interval>,
    pending: Option<Bytes>,
    bytes_sent: u64,
    state: StreamState,
}

impl<S> ThrottleStream<S> {
    /// Throttle `inner` with a budget local to this stream.
    pub fn new(inner: S, rate: impl Into<RateSource>) -> Self {
        Self::with_budget(inner, rate, LocalBudget::new())
    }

    /// Throttle `inner`, keeping budget state in `budget`.
    pub fn with_budget(
        inner: S,
        rate: impl Into<RateSource>,
        budget: impl Budget + 'static,
    ) -> Self {
        Self {
            inner,
            engine: Engine {
                rate: rate.into(),
                budget: Box::new(budget),
                refill_period: REFILL_PERIOD,
                start_time: None,
                ticker: None,
                pending: None,
                bytes_sent: 0,
                state: StreamState::Uninitialized,
            },
        }
    }

    /// Throttle `inner` against the pool `key` of the binder's store.
    pub fn grouped(
        inner: S,
        rate: impl Into<RateSource>,
        binder: &StreamGroupBinder,
        key: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self::with_budget(inner, rate, binder.bind(key)?))
    }

    /// Throttle `inner` with a rate function produced by `resolver` for the
    /// request described by `ctx`.
    pub fn resolving(inner: S, resolver: &RateResolver, ctx: &RequestContext) -> Self {
        Self::with_budget(inner, resolver.resolve(ctx), LocalBudget::new())
    }

    /// Change the refill period, clamped to
    /// [`MIN_REFILL_PERIOD`]..=[`MAX_REFILL_PERIOD`]. Takes effect if set
    /// before the first chunk.
    pub fn with_refill_period(mut self, period: Duration) -> Self {
        self.engine.refill_period = period.clamp(MIN_REFILL_PERIOD, MAX_REFILL_PERIOD);
        self
    }

    /// Stop throttling: cancel the refill ticker and drop the buffered chunk.
    /// The stream yields `None` from then on.
    pub fn destroy(&mut self) {
        if !self.engine.is_finished() {
            self.engine.release(StreamState::Closed);
            debug!(bytes_sent = self.engine.bytes_sent, "throttled stream destroyed");
        }
    }

    pub fn state(&self) -> StreamState {
        self.engine.state
    }

    /// Bytes this stream has pushed downstream.
    pub fn bytes_sent(&self) -> u64 {
        self.engine.bytes_sent
    }

    /// Instant of activation; for pooled budgets this is the pool's start.
    pub fn start_time(&self) -> Option<Instant> {
        self.engine.start_time
    }

    pub fn has_timer(&self) -> bool {
        self.engine.ticker.is_some()
    }

    pub fn has_pending(&self) -> bool {
        self.engine.pending.is_some()
    }

    /// Length of the buffered remainder awaiting allowance.
    pub fn pending_len(&self) -> usize {
        self.engine.pending.as_ref().map_or(0, Bytes::len)
    }

    /// Allowance currently available to this stream's budget.
    pub fn allowance(&self) -> Result<u64> {
        self.engine.budget.allowed_bytes()
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl Engine {
    fn is_finished(&self) -> bool {
        matches!(self.state, StreamState::Closed | StreamState::Faulted)
    }

    fn release(&mut self, state: StreamState) {
        self.state = state;
        self.ticker = None;
        self.pending = None;
    }

    fn close(&mut self) {
        self.release(StreamState::Closed);
        debug!(bytes_sent = self.bytes_sent, "throttled stream closed");
    }

    fn fault(&mut self, err: &ThrottleError) {
        self.release(StreamState::Faulted);
        warn!(
            kind = err.kind(),
            error = %err,
            bytes_sent = self.bytes_sent,
            "throttled stream faulted"
        );
    }

    fn poll_resolve(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        if let RateSource::Resolving(fut) = &mut self.rate {
            let rate_fn = ready!(fut.poll_unpin(cx))?;
            self.rate = RateSource::Ready(rate_fn);
        }
        Poll::Ready(Ok(()))
    }

    fn rate_fn(&self) -> Result<SharedRateFn> {
        match &self.rate {
            RateSource::Ready(rate_fn) => Ok(rate_fn.clone()),
            RateSource::Resolving(_) => Err(ThrottleError::rate_function(
                "rate function used before it was resolved",
            )),
        }
    }

    fn activate(&mut self) -> Result<()> {
        let now = Instant::now();
        let first_tick = now.checked_add(self.refill_period).ok_or_else(|| {
            ThrottleError::config(format!("Refill period {:?} is out of range", self.refill_period))
        })?;
        self.start_time = Some(self.budget.set_start_time(now)?);
        self.budget.init_bytes()?;
        self.refill()?;

        let mut ticker = interval_at(first_tick, self.refill_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.ticker = Some(ticker);
        self.state = StreamState::Active;

        debug!(refill_period = ?self.refill_period, "throttled stream activated");
        Ok(())
    }

    /// Replace the allowance with the rate function's current answer.
    fn refill(&mut self) -> Result<u64> {
        let rate_fn = self.rate_fn()?;
        let elapsed = self
            .start_time
            .map_or(0.0, |start| Instant::now().duration_since(start).as_secs_f64());
        let bytes = self.budget.bytes()?;

        let rate = rate_fn.rate(elapsed, bytes)?;
        let allowance = self.budget.set_allowed_bytes(rate.allowance())?;

        trace!(elapsed, bytes, %rate, allowance, "allowance refilled");
        Ok(allowance)
    }

    /// Wait until at least one byte of `want` may pass and claim it.
    fn poll_grant(&mut self, cx: &mut Context<'_>, want: u64) -> Poll<Result<u64>> {
        while self
            .ticker
            .as_mut()
            .is_some_and(|ticker| ticker.poll_tick(cx).is_ready())
        {
            self.refill()?;
        }

        let granted = self.budget.claim_allowed_bytes(want)?;
        if granted == 0 {
            // the ticker has registered our waker
            return Poll::Pending;
        }

        self.budget.increase_bytes(granted)?;
        Poll::Ready(Ok(granted))
    }

    fn poll_chunk<S, E>(
        &mut self,
        mut inner: Pin<&mut S>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<Bytes>>>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: Into<BoxError>,
    {
        ready!(self.poll_resolve(cx))?;

        if self.pending.is_none() {
            loop {
                match ready!(inner.as_mut().poll_next(cx)) {
                    None => return Poll::Ready(Ok(None)),
                    Some(Err(err)) => return Poll::Ready(Err(ThrottleError::Upstream(err.into()))),
                    Some(Ok(chunk)) if chunk.is_empty() => continue,
                    Some(Ok(chunk)) => {
                        self.pending = Some(chunk);
                        break;
                    }
                }
            }
        }

        if self.state == StreamState::Uninitialized {
            self.activate()?;
        }

        let want = self.pending.as_ref().map_or(0, |chunk| chunk.len() as u64);
        let granted = ready!(self.poll_grant(cx, want))? as usize;

        let piece = match self.pending.as_mut() {
            Some(chunk) if granted < chunk.len() => chunk.split_to(granted),
            _ => self.pending.take().unwrap_or_default(),
        };
        self.bytes_sent += piece.len() as u64;

        trace!(
            pushed = piece.len(),
            buffered = self.pending.as_ref().map_or(0, Bytes::len),
            bytes_sent = self.bytes_sent,
            "chunk pushed"
        );
        Poll::Ready(Ok(Some(piece)))
    }
}

impl<S, E> Stream for ThrottleStream<S>
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
    E: Into<BoxError>,
{
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let engine = this.engine;

        if engine.is_finished() {
            return Poll::Ready(None);
        }

        match ready!(engine.poll_chunk(this.inner, cx)) {
            Ok(Some(chunk)) => Poll::Ready(Some(Ok(chunk))),
            Ok(None) => {
                engine.close();
                Poll::Ready(None)
            }
            Err(err) => {
                engine.fault(&err);
                Poll::Ready(Some(Err(err)))
            }
        }
    }
}

impl<S, E> FusedStream for ThrottleStream<S>
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
    E: Into<BoxError>,
{
    fn is_terminated(&self) -> bool {
        self.engine.is_finished()
    }
}

impl<S, E> ThrottleStream<S>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: Into<BoxError>,
{
    /// Drive the stream into `writer`, returning the number of bytes written.
    ///
    /// A writer error faults the stream with
    /// [`ThrottleError::DownstreamPush`].
    pub async fn pipe_to<W>(&mut self, writer: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut written = 0u64;
        while let Some(chunk) = self.next().await {
            let chunk = chunk?;
            if let Err(err) = writer.write_all(&chunk).await {
                return Err(self.downstream_failed(err));
            }
            written += chunk.len() as u64;
        }

        if let Err(err) = writer.flush().await {
            return Err(self.downstream_failed(err));
        }
        Ok(written)
    }

    fn downstream_failed(&mut self, err: std::io::Error) -> ThrottleError {
        let err = ThrottleError::DownstreamPush(err);
        if !self.engine.is_finished() {
            self.engine.fault(&err);
        }
        err
    }
}

impl<S: std::fmt::Debug> std::fmt::Debug for ThrottleStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottleStream")
            .field("inner", &self.inner)
            .field("state", &self.engine.state)
            .field("bytes_sent", &self.engine.bytes_sent)
            .field("pending", &self.pending_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate::{self, Rate};
    use futures::stream;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time;
    use tokio_test::{assert_pending, assert_ready, task};

    fn source(chunks: Vec<Vec<u8>>) -> impl Stream<Item = io::Result<Bytes>> + Unpin {
        stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from(c))))
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn drain<S>(mut throttle: S) -> Vec<(Duration, Bytes)>
    where
        S: Stream<Item = Result<Bytes>> + Unpin,
    {
        let start = Instant::now();
        let mut out = Vec::new();
        while let Some(chunk) = throttle.next().await {
            out.push((start.elapsed(), chunk.unwrap()));
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_input_within_rate_drains_immediately() {
        let throttle = ThrottleStream::new(source(vec![patterned(10_000)]), rate::constant(10_000u64));
        let out = drain(throttle).await;

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, Duration::ZERO);
        assert_eq!(out[0].1.len(), 10_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_chunk_is_split_across_ticks() {
        let input = patterned(20_000);
        let throttle = ThrottleStream::new(source(vec![input.clone()]), rate::constant(10_000u64));
        let out = drain(throttle).await;

        let times: Vec<_> = out.iter().map(|(t, _)| *t).collect();
        assert_eq!(times, vec![Duration::ZERO, Duration::from_secs(1)]);
        let joined: Vec<u8> = out.iter().flat_map(|(_, c)| c.to_vec()).collect();
        assert_eq!(joined, input);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_rate_takes_one_tick_per_allowance() {
        let throttle = ThrottleStream::new(source(vec![patterned(4096)]), rate::constant(1024u64));
        let out = drain(throttle).await;

        assert_eq!(out.len(), 4);
        assert!(out.iter().all(|(_, c)| c.len() == 1024));
        assert_eq!(out.last().unwrap().0, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_rate_pauses_until_unlimited() {
        let rate_fn = rate::from_fn(|elapsed, _| {
            if elapsed < 2.0 {
                Rate::Limited(0)
            } else {
                Rate::Unlimited
            }
        });
        let throttle = ThrottleStream::new(source(vec![patterned(32_768)]), rate_fn);
        let out = drain(throttle).await;

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, Duration::from_secs(2));
        assert_eq!(out[0].1.len(), 32_768);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_function_receives_elapsed_and_bytes() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let record = seen.clone();
        let rate_fn = rate::from_fn(move |elapsed, bytes| {
            record.lock().unwrap().push((elapsed, bytes));
            Rate::Limited(100)
        });

        let throttle = ThrottleStream::new(source(vec![patterned(250)]), rate_fn);
        drain(throttle).await;

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen, vec![(0.0, 0), (1.0, 100), (2.0, 200)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_preserves_order_across_uneven_chunks() {
        let input = patterned(5_000);
        let sizes = [1, 700, 13, 2_048, 999, 1_239];
        let mut chunks = Vec::new();
        let mut offset = 0;
        for size in sizes {
            chunks.push(input[offset..offset + size].to_vec());
            offset += size;
        }

        let throttle = ThrottleStream::new(source(chunks), rate::constant(333u64));
        let out = drain(throttle).await;

        let joined: Vec<u8> = out.iter().flat_map(|(_, c)| c.to_vec()).collect();
        assert_eq!(joined, input);
        assert!(out.iter().all(|(_, c)| c.len() <= 333));
    }

    #[tokio::test(start_paused = true)]
    async fn test_producer_is_not_polled_while_chunk_is_buffered() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = pulled.clone();
        let upstream = source(vec![patterned(1000), patterned(1000), patterned(1000)])
            .inspect(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        let mut throttle = task::spawn(ThrottleStream::new(upstream, rate::constant(500u64)));

        let first = assert_ready!(throttle.poll_next()).unwrap().unwrap();
        assert_eq!(first.len(), 500);
        assert_pending!(throttle.poll_next());
        assert_eq!(pulled.load(Ordering::SeqCst), 1);

        time::advance(REFILL_PERIOD).await;
        assert!(throttle.is_woken());
        let rest = assert_ready!(throttle.poll_next()).unwrap().unwrap();
        assert_eq!(rest.len(), 500);

        // only now is the next chunk requested
        assert_pending!(throttle.poll_next());
        assert_eq!(pulled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_cancels_timer_and_drops_buffer() {
        let mut throttle = ThrottleStream::new(source(vec![patterned(1000)]), rate::constant(100u64));

        let first = throttle.next().await.unwrap().unwrap();
        assert_eq!(first.len(), 100);
        assert!(throttle.has_timer());
        assert_eq!(throttle.pending_len(), 900);

        throttle.destroy();
        assert!(!throttle.has_timer());
        assert!(!throttle.has_pending());
        assert_eq!(throttle.state(), StreamState::Closed);
        assert!(throttle.next().await.is_none());
        assert!(throttle.is_terminated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_function_failure_on_tick_faults_stream() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let rate_fn = rate::try_from_fn(move |_, _| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(Rate::Limited(1000))
            } else {
                Err(ThrottleError::rate_function("ArbitraryError"))
            }
        });

        let mut throttle = ThrottleStream::new(source(vec![patterned(10_000)]), rate_fn);
        assert_eq!(throttle.next().await.unwrap().unwrap().len(), 1000);

        let err = throttle.next().await.unwrap().unwrap_err();
        assert!(matches!(err, ThrottleError::RateFunction(_)));
        assert_eq!(throttle.state(), StreamState::Faulted);
        assert!(!throttle.has_timer());
        assert!(!throttle.has_pending());
        assert!(throttle.next().await.is_none());

        time::advance(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_function_failure_on_start_faults_stream() {
        let rate_fn = rate::try_from_fn(|_, _| Err(ThrottleError::rate_function("ArbitraryError")));
        let mut throttle = ThrottleStream::new(source(vec![patterned(10)]), rate_fn);

        assert!(matches!(
            throttle.next().await,
            Some(Err(ThrottleError::RateFunction(_)))
        ));
        assert!(!throttle.has_timer());
        assert!(!throttle.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_rate_value_faults_stream() {
        let rate_fn = rate::try_from_fn(|_, _| Rate::from_f64(-5.0));
        let mut throttle = ThrottleStream::new(source(vec![patterned(10)]), rate_fn);
        assert!(matches!(
            throttle.next().await,
            Some(Err(ThrottleError::RateFunction(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_error_faults_stream() {
        let upstream = stream::iter(vec![
            Ok(Bytes::from_static(b"hello")),
            Err(io::Error::new(io::ErrorKind::UnexpectedEof, "producer died")),
        ]);
        let mut throttle = ThrottleStream::new(upstream, rate::unlimited());

        assert_eq!(throttle.next().await.unwrap().unwrap(), Bytes::from_static(b"hello"));
        assert!(matches!(
            throttle.next().await,
            Some(Err(ThrottleError::Upstream(_)))
        ));
        assert!(throttle.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_input_never_activates() {
        let mut throttle = ThrottleStream::new(
            source(vec![Vec::new(), Vec::new()]),
            rate::constant(10u64),
        );
        assert!(throttle.next().await.is_none());
        assert_eq!(throttle.state(), StreamState::Closed);
        assert!(throttle.start_time().is_none());
        assert_eq!(throttle.bytes_sent(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_resolver_runs_before_first_chunk() {
        let resolver = RateResolver::from_async(|ctx: &RequestContext| {
            let gold = ctx.header("x-tier") == Some("gold");
            async move {
                time::sleep(Duration::from_millis(300)).await;
                Ok(if gold { rate::unlimited() } else { rate::constant(10u64) })
            }
        });
        let ctx = RequestContext::default().with_header("x-tier", "gold");

        let throttle = ThrottleStream::resolving(source(vec![patterned(5_000)]), &resolver, &ctx);
        let out = drain(throttle).await;

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_resolver_faults_stream() {
        let resolver = RateResolver::from_async(|_: &RequestContext| async {
            Err(ThrottleError::rate_function("tier lookup failed"))
        });
        let mut throttle =
            ThrottleStream::resolving(source(vec![patterned(10)]), &resolver, &RequestContext::default());

        assert!(matches!(
            throttle.next().await,
            Some(Err(ThrottleError::RateFunction(_)))
        ));
        assert_eq!(throttle.state(), StreamState::Faulted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_accepts_pending_rate_source() {
        let resolver = RateResolver::from_async(|_: &RequestContext| async {
            time::sleep(Duration::from_millis(100)).await;
            Ok(rate::constant(1000u64))
        });
        let pending = resolver.resolve(&RequestContext::default());
        assert!(!pending.is_ready());

        let out = drain(ThrottleStream::new(source(vec![patterned(1500)]), pending)).await;
        let times: Vec<_> = out.iter().map(|(t, _)| *t).collect();
        assert_eq!(
            times,
            vec![Duration::from_millis(100), Duration::from_millis(1100)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_refill_period() {
        let throttle = ThrottleStream::new(source(vec![patterned(300)]), rate::constant(100u64))
            .with_refill_period(Duration::from_millis(250));
        let out = drain(throttle).await;
        assert_eq!(out.last().unwrap().0, Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_refill_period_is_capped() {
        let throttle = ThrottleStream::new(source(vec![patterned(150)]), rate::constant(100u64))
            .with_refill_period(Duration::MAX);
        let out = drain(throttle).await;

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].0, Duration::ZERO);
        assert_eq!(out[1].0, MAX_REFILL_PERIOD);
    }

    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "consumer went away")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipe_to_writes_everything() {
        let input = patterned(3_000);
        let mut throttle = ThrottleStream::new(source(vec![input.clone()]), rate::constant(1000u64));
        let mut out = Vec::new();

        let start = Instant::now();
        let written = throttle.pipe_to(&mut out).await.unwrap();
        assert_eq!(written, 3_000);
        assert_eq!(out, input);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert_eq!(throttle.state(), StreamState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipe_to_rejecting_writer_faults_stream() {
        let mut throttle = ThrottleStream::new(source(vec![patterned(3_000)]), rate::constant(1000u64));
        let err = throttle.pipe_to(&mut BrokenPipe).await.unwrap_err();

        assert!(matches!(err, ThrottleError::DownstreamPush(_)));
        assert_eq!(throttle.state(), StreamState::Faulted);
        assert!(!throttle.has_timer());
        assert!(!throttle.has_pending());
        assert_eq!(throttle.bytes_sent(), 1000);
    }
}
