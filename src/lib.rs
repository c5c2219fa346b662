//! Byte-rate throttling for async byte streams and axum response bodies.
//!
//! A [`ThrottleStream`] forwards chunks from an inner stream no faster than a
//! [`RateFunction`](rate::RateFunction) allows, refilling its allowance once
//! per second. Streams bound to the same pool of a [`BandwidthStore`] share
//! one allowance. [`ThrottleLayer`] applies this to HTTP responses.

pub mod budget;
pub mod config;
pub mod context;
pub mod error;
pub mod group;
pub mod layer;
pub mod rate;
pub mod server;
pub mod store;
pub mod throttle_stream;

pub use config::ThrottleConfig;
pub use context::{GroupKeyStrategy, RequestContext};
pub use error::{Result, ThrottleError};
pub use group::StreamGroupBinder;
pub use layer::{ThrottleLayer, ThrottleOptions};
pub use rate::{Rate, RateOption, RateResolver};
pub use store::BandwidthStore;
pub use throttle_stream::ThrottleStream;
