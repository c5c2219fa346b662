//! Request metadata handed to rate resolvers, and derivation of bandwidth
//! pool keys from it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::LazyLock;

use axum::extract::ConnectInfo;
use axum::http::Request;
use regex::Regex;

use crate::error::{Result, ThrottleError};

static POOL_KEY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9:_\-./@]+$").expect("valid pool key regex"));

/// What a resolver or key strategy may know about the request behind a
/// throttled response.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub method: String,
    pub path: String,
    pub client_ip: String,
    headers: HashMap<String, String>,
}

impl RequestContext {
    pub fn from_request<B>(request: &Request<B>) -> Self {
        let headers = request
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        Self {
            method: request.method().to_string(),
            path: request.uri().path().to_string(),
            client_ip: client_ip(request),
            headers,
        }
    }

    /// Header lookup; names are case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    pub fn with_client_ip(mut self, ip: &str) -> Self {
        self.client_ip = ip.to_string();
        self
    }
}

fn client_ip<B>(request: &Request<B>) -> String {
    if let Some(forwarded) = request.headers().get("x-forwarded-for") {
        if let Ok(forwarded_str) = forwarded.to_str() {
            if let Some(first_ip) = forwarded_str.split(',').next() {
                return first_ip.trim().to_string();
            }
        }
    }

    if let Some(real_ip) = request.headers().get("x-real-ip") {
        if let Ok(ip_str) = real_ip.to_str() {
            return ip_str.to_string();
        }
    }

    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        return addr.ip().to_string();
    }

    if let Some(addr) = request.extensions().get::<SocketAddr>() {
        addr.ip().to_string()
    } else {
        "unknown".to_string()
    }
}

/// How a throttled response picks the bandwidth pool it draws from.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupKeyStrategy {
    /// Every response shares one pool with this name.
    Fixed(String),
    /// One pool per client address.
    ClientIp,
    /// One pool per value of the named header.
    Header(String),
    /// One pool per request path.
    Path,
    /// Concatenation of the parts above.
    Composite(Vec<GroupKeyStrategy>),
}

impl GroupKeyStrategy {
    /// Derive the pool key for a request.
    pub fn pool_key(&self, ctx: &RequestContext) -> Result<String> {
        let key = match self {
            GroupKeyStrategy::Composite(parts) => {
                let mut key_parts = Vec::with_capacity(parts.len());
                for part in parts {
                    if matches!(part, GroupKeyStrategy::Composite(_)) {
                        return Err(ThrottleError::config(
                            "Nested composite pool keys not supported",
                        ));
                    }
                    key_parts.push(part.component(ctx)?);
                }
                format!("pool:composite:{}", key_parts.join(":"))
            }
            GroupKeyStrategy::Fixed(name) => format!("pool:fixed:{}", name),
            GroupKeyStrategy::ClientIp => format!("pool:ip:{}", self.component(ctx)?),
            GroupKeyStrategy::Header(_) => format!("pool:header:{}", self.component(ctx)?),
            GroupKeyStrategy::Path => format!("pool:path:{}", self.component(ctx)?),
        };
        Ok(sanitize_key(&key))
    }

    fn component(&self, ctx: &RequestContext) -> Result<String> {
        match self {
            GroupKeyStrategy::Fixed(name) => Ok(name.clone()),
            GroupKeyStrategy::ClientIp => Ok(ctx.client_ip.clone()),
            GroupKeyStrategy::Header(name) => ctx
                .header(name)
                .map(str::to_string)
                .ok_or_else(|| ThrottleError::config(format!("Missing '{}' header", name))),
            GroupKeyStrategy::Path => Ok(ctx.path.clone()),
            GroupKeyStrategy::Composite(_) => Err(ThrottleError::config(
                "Nested composite pool keys not supported",
            )),
        }
    }
}

/// Replace anything outside the pool key alphabet with `_`.
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, ':' | '-' | '_' | '.' | '/' | '@') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Reject empty or malformed pool keys supplied directly by callers.
pub fn validate_pool_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(ThrottleError::config("Pool key cannot be empty"));
    }
    if !POOL_KEY_PATTERN.is_match(key) {
        return Err(ThrottleError::config(format!(
            "Pool key '{}' contains invalid characters",
            key
        )));
    }
    Ok(())
}
