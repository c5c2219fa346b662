use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::{Validate, ValidationError};

use crate::error::{Result, ThrottleError};
use crate::rate::{Rate, RateOption};
use crate::store::{
    BandwidthStore, StoreOptions, DEFAULT_CAPACITY, DEFAULT_REFILL_WINDOW, DEFAULT_TTL,
    MAX_REFILL_WINDOW, MAX_TTL,
};

/// Rate applied when a configuration does not name one.
pub const DEFAULT_BYTES_PER_SECOND: u64 = 16384;

/// Declarative throttling configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ThrottleConfig {
    #[serde(default = "default_bytes_per_second")]
    pub bytes_per_second: u64,

    /// Throttle bodies of unknown length.
    #[serde(default = "default_true")]
    pub stream_payloads: bool,

    /// Throttle binary bodies of known length.
    #[serde(default)]
    pub buffer_payloads: bool,

    /// Throttle text and JSON bodies of known length.
    #[serde(default)]
    pub string_payloads: bool,

    #[serde(default)]
    #[validate(nested)]
    pub store: StoreConfig,
}

/// Bounds of the shared bandwidth store.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StoreConfig {
    #[serde(default = "default_capacity")]
    #[validate(range(min = 1, message = "Store capacity must be greater than 0"))]
    pub capacity: usize,

    #[serde(default = "default_ttl", with = "humantime_serde")]
    #[validate(custom(function = "validate_ttl"))]
    pub ttl: Duration,

    #[serde(default = "default_refill_window", with = "humantime_serde")]
    #[validate(custom(function = "validate_refill_window"))]
    pub refill_window: Duration,
}

fn default_bytes_per_second() -> u64 {
    DEFAULT_BYTES_PER_SECOND
}

fn default_true() -> bool {
    true
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_ttl() -> Duration {
    DEFAULT_TTL
}

fn default_refill_window() -> Duration {
    DEFAULT_REFILL_WINDOW
}

fn validate_bounded(value: &Duration, max: Duration) -> std::result::Result<(), ValidationError> {
    if value.is_zero() {
        return Err(ValidationError::new("zero_duration"));
    }
    if *value > max {
        return Err(ValidationError::new("duration_too_long"));
    }
    Ok(())
}

fn validate_ttl(value: &Duration) -> std::result::Result<(), ValidationError> {
    validate_bounded(value, MAX_TTL)
}

fn validate_refill_window(value: &Duration) -> std::result::Result<(), ValidationError> {
    validate_bounded(value, MAX_REFILL_WINDOW)
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            bytes_per_second: DEFAULT_BYTES_PER_SECOND,
            stream_payloads: true,
            buffer_payloads: false,
            string_payloads: false,
            store: StoreConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            ttl: DEFAULT_TTL,
            refill_window: DEFAULT_REFILL_WINDOW,
        }
    }
}

impl ThrottleConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: ThrottleConfig = serde_json::from_str(raw)
            .map_err(|e| ThrottleError::config(format!("Invalid throttle config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn rate(&self) -> RateOption {
        RateOption::Constant(Rate::Limited(self.bytes_per_second))
    }

    pub fn payloads(&self) -> PayloadFlags {
        PayloadFlags {
            stream: self.stream_payloads,
            buffer: self.buffer_payloads,
            string: self.string_payloads,
        }
    }
}

impl StoreConfig {
    pub fn options(&self) -> StoreOptions {
        StoreOptions {
            capacity: self.capacity,
            ttl: self.ttl,
            refill_window: self.refill_window,
        }
    }

    pub fn build(&self, name: &str) -> Result<BandwidthStore> {
        self.validate()?;
        BandwidthStore::with_name(name, self.options())
    }
}

/// Which payload kinds get throttled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadFlags {
    pub stream: bool,
    pub buffer: bool,
    pub string: bool,
}

impl Default for PayloadFlags {
    fn default() -> Self {
        Self {
            stream: true,
            buffer: false,
            string: false,
        }
    }
}

impl PayloadFlags {
    pub fn all() -> Self {
        Self {
            stream: true,
            buffer: true,
            string: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let config = ThrottleConfig::from_json("{}").unwrap();
        assert_eq!(config.bytes_per_second, DEFAULT_BYTES_PER_SECOND);
        assert_eq!(config.payloads(), PayloadFlags::default());
        assert_eq!(config.store.capacity, 5000);
        assert_eq!(config.store.ttl, Duration::from_secs(3600));
        assert_eq!(config.store.refill_window, Duration::from_millis(1000));
    }

    #[test]
    fn test_humantime_durations() {
        let config = ThrottleConfig::from_json(
            r#"{
                "bytes_per_second": 1000,
                "buffer_payloads": true,
                "store": { "capacity": 10, "ttl": "5m", "refill_window": "250ms" }
            }"#,
        )
        .unwrap();

        assert!(config.rate().source(&Default::default()).is_ready());
        assert!(config.payloads().buffer);
        assert!(!config.payloads().string);
        assert_eq!(config.store.ttl, Duration::from_secs(300));
        assert_eq!(config.store.options().refill_window, Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_store_config() {
        assert!(ThrottleConfig::from_json(r#"{ "store": { "capacity": 0 } }"#).is_err());
        assert!(ThrottleConfig::from_json(r#"{ "store": { "ttl": "0s" } }"#).is_err());
        assert!(ThrottleConfig::from_json(r#"{ "bytes_per_second": "fast" }"#).is_err());
    }

    #[test]
    fn test_oversized_store_durations_rejected() {
        assert!(ThrottleConfig::from_json(r#"{ "store": { "ttl": "1000years" } }"#).is_err());
        assert!(ThrottleConfig::from_json(r#"{ "store": { "refill_window": "2days" } }"#).is_err());

        let config = StoreConfig {
            ttl: Duration::MAX,
            ..StoreConfig::default()
        };
        assert!(config.build("huge").is_err());
    }

    #[test]
    fn test_store_config_builds_store() {
        let store = StoreConfig::default().build("routes").unwrap();
        assert_eq!(store.name(), "routes");
        assert_eq!(store.options(), StoreOptions::default());
    }
}
