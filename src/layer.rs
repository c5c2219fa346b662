//! Tower middleware throttling axum response bodies.
//!
//! ```no_run
//! use axum::{routing::get, Router};
//! use byte_throttle::layer::{ThrottleLayer, ThrottleOptions};
//!
//! let app: Router = Router::new()
//!     .route("/download", get(|| async { "slow text" }))
//!     .layer(ThrottleLayer::new(ThrottleOptions::new(10_000u64)));
//! ```
//!
//! Applied to a `Router` it throttles every route; applied to a single
//! `MethodRouter` it throttles only that route.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::{Body, BodyDataStream, HttpBody};
use axum::http::{header, HeaderMap, Request};
use axum::response::Response;
use futures::future::BoxFuture;
use futures::{Stream, TryStreamExt};
use pin_project::pin_project;
use tower::{Layer, Service};
use tracing::{debug, debug_span, warn, Span};
use uuid::Uuid;

use crate::budget::LocalBudget;
use crate::config::{PayloadFlags, ThrottleConfig};
use crate::context::{GroupKeyStrategy, RequestContext};
use crate::group::StreamGroupBinder;
use crate::rate::RateOption;
use crate::store::BandwidthStore;
use crate::throttle_stream::ThrottleStream;

/// Shape of a response body, deciding whether it is throttled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// Known to be empty. Never throttled.
    Empty,
    /// Length unknown up front.
    Stream,
    /// Known length, binary content.
    Buffer,
    /// Known length, text or JSON content.
    String,
}

impl PayloadKind {
    pub fn classify(headers: &HeaderMap, body: &Body) -> Self {
        match body.size_hint().exact() {
            Some(0) => PayloadKind::Empty,
            Some(_) if is_textual(headers) => PayloadKind::String,
            Some(_) => PayloadKind::Buffer,
            None => PayloadKind::Stream,
        }
    }
}

fn is_textual(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|ct| {
            let ct = ct.to_ascii_lowercase();
            ct.starts_with("text/") || ct.contains("json")
        })
        .unwrap_or(false)
}

/// A bandwidth pool shared by every response whose request maps to the same
/// key.
#[derive(Debug, Clone)]
pub struct SharedPool {
    binder: StreamGroupBinder,
    key: GroupKeyStrategy,
}

/// What to throttle and how fast.
#[derive(Debug, Clone)]
pub struct ThrottleOptions {
    pub rate: RateOption,
    pub payloads: PayloadFlags,
    pub pool: Option<SharedPool>,
}

impl ThrottleOptions {
    pub fn new(rate: impl Into<RateOption>) -> Self {
        Self {
            rate: rate.into(),
            payloads: PayloadFlags::default(),
            pool: None,
        }
    }

    pub fn from_config(config: &ThrottleConfig) -> Self {
        Self {
            rate: config.rate(),
            payloads: config.payloads(),
            pool: None,
        }
    }

    pub fn with_payloads(mut self, payloads: PayloadFlags) -> Self {
        self.payloads = payloads;
        self
    }

    /// Draw from pools of `store`, picking the pool per request with `key`.
    pub fn shared(mut self, store: BandwidthStore, key: GroupKeyStrategy) -> Self {
        self.pool = Some(SharedPool {
            binder: StreamGroupBinder::new(store),
            key,
        });
        self
    }

    pub fn applies_to(&self, kind: PayloadKind) -> bool {
        match kind {
            PayloadKind::Empty => false,
            PayloadKind::Stream => self.payloads.stream,
            PayloadKind::Buffer => self.payloads.buffer,
            PayloadKind::String => self.payloads.string,
        }
    }

    /// Wrap `body` in a throttled stream for the request described by `ctx`.
    pub fn throttle_body(
        &self,
        body: Body,
        ctx: &RequestContext,
    ) -> ThrottleStream<BodyDataStream> {
        let source = self.rate.source(ctx);
        let data = body.into_data_stream();

        let Some(pool) = &self.pool else {
            return ThrottleStream::with_budget(data, source, LocalBudget::new());
        };

        match pool.key.pool_key(ctx).and_then(|key| pool.binder.bind(key)) {
            Ok(budget) => {
                debug!(pool = budget.key(), "response joins bandwidth pool");
                ThrottleStream::with_budget(data, source, budget)
            }
            Err(err) => {
                warn!(error = %err, path = %ctx.path, "no bandwidth pool for request, throttling alone");
                ThrottleStream::with_budget(data, source, LocalBudget::new())
            }
        }
    }

    /// Replace the body of `response` with a throttled one when its payload
    /// kind is enabled. Headers are left untouched.
    pub fn throttle_response(&self, response: Response, ctx: &RequestContext) -> Response {
        let kind = PayloadKind::classify(response.headers(), response.body());
        if !self.applies_to(kind) {
            return response;
        }

        let span = debug_span!(
            "throttled_body",
            stream_id = %Uuid::new_v4(),
            ?kind,
            path = %ctx.path
        );
        let (parts, body) = response.into_parts();
        let stream = span.in_scope(|| {
            debug!("throttling response body");
            self.throttle_body(body, ctx)
                .inspect_err(|err| warn!(error = %err, "throttled body aborted"))
        });

        Response::from_parts(parts, Body::from_stream(InSpan { inner: stream, span }))
    }
}

/// Enters `span` around every poll of `inner`, so events logged while the
/// body is throttled carry its stream id.
#[pin_project]
struct InSpan<S> {
    #[pin]
    inner: S,
    span: Span,
}

impl<S: Stream> Stream for InSpan<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let _entered = this.span.enter();
        this.inner.poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// [`Layer`] applying [`ThrottleService`].
#[derive(Debug, Clone)]
pub struct ThrottleLayer {
    options: Arc<ThrottleOptions>,
}

impl ThrottleLayer {
    pub fn new(options: ThrottleOptions) -> Self {
        Self {
            options: Arc::new(options),
        }
    }
}

impl<S> Layer<S> for ThrottleLayer {
    type Service = ThrottleService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ThrottleService {
            inner,
            options: self.options.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ThrottleService<S> {
    inner: S,
    options: Arc<ThrottleOptions>,
}

impl<S, B> Service<Request<B>> for ThrottleService<S>
where
    S: Service<Request<B>, Response = Response>,
    S::Future: Send + 'static,
    S::Error: 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        let ctx = RequestContext::from_request(&request);
        let options = self.options.clone();
        let future = self.inner.call(request);

        Box::pin(async move {
            let response = future.await?;
            Ok(options.throttle_response(response, &ctx))
        })
    }
}
