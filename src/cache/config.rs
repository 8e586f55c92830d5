//! Cache configuration.

use std::time::Duration;

/// Size and expiry of one cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_capacity: u64,

    /// Entries are dropped this long after insertion.
    pub ttl: Option<Duration>,

    /// Entries are dropped when not read for this long.
    pub tti: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            ttl: Some(Duration::from_secs(3600)),
            tti: None,
        }
    }
}

impl CacheConfig {
    pub fn with_capacity(max_capacity: u64) -> Self {
        Self {
            max_capacity,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn ttl(mut self, duration: Duration) -> Self {
        self.ttl = Some(duration);
        self
    }

    /// Short-lived answers from the Telegram API (member status, admin rights).
    pub fn api_lookup() -> Self {
        Self {
            max_capacity: 10_000,
            ttl: Some(Duration::from_secs(300)),
            tti: Some(Duration::from_secs(120)),
        }
    }
}
