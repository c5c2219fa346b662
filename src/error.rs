use std::io;

/// Boxed error carried by producers feeding a throttled stream.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = ThrottleError> = std::result::Result<T, E>;

/// Every failure a throttled stream can observe.
///
/// All variants except `Config` are fatal to the stream that hit them: the
/// stream yields the error once, drops its refill ticker and buffered chunk,
/// and then ends. Bytes already pushed downstream are not retracted.
#[derive(Debug, thiserror::Error)]
pub enum ThrottleError {
    /// The rate function or its resolver failed or produced an invalid rate.
    #[error("Rate function error: {0}")]
    RateFunction(String),

    /// The consumer rejected a chunk.
    #[error("Downstream push error: {0}")]
    DownstreamPush(#[source] io::Error),

    /// A bandwidth store operation failed.
    #[error("Bandwidth store error: {0}")]
    Store(String),

    /// The producer feeding the stream failed.
    #[error("Upstream error: {0}")]
    Upstream(#[source] BoxError),

    /// Invalid options.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ThrottleError {
    /// Short machine-readable name of the variant, used as a tracing field.
    pub fn kind(&self) -> &'static str {
        match self {
            ThrottleError::RateFunction(_) => "rate_function",
            ThrottleError::DownstreamPush(_) => "downstream_push",
            ThrottleError::Store(_) => "store",
            ThrottleError::Upstream(_) => "upstream",
            ThrottleError::Config(_) => "config",
        }
    }

    pub fn rate_function(msg: impl Into<String>) -> Self {
        ThrottleError::RateFunction(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        ThrottleError::Store(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        ThrottleError::Config(msg.into())
    }
}

impl From<validator::ValidationErrors> for ThrottleError {
    fn from(err: validator::ValidationErrors) -> Self {
        ThrottleError::Config(err.to_string())
    }
}
