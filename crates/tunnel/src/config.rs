//! Configuration types for the tunnel client.

use rand::Rng;
use std::time::Duration;
use url::Url;

/// Configuration for a tunnel to the relay.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Relay websocket endpoint (`ws://` or `wss://`).
    pub relay_url: Url,
    /// Key sent as a bearer token when connecting to the relay.
    pub relay_key: Option<String>,
    /// Subdomain to request from the relay.
    pub subdomain: Option<String>,
    /// Port of the local server that forwarded requests are replayed against.
    pub local_port: u16,
    /// Interval between websocket pings. A connection silent for two
    /// intervals is considered lost.
    pub keepalive: Duration,
    /// Limit on establishing a relay connection and registering.
    pub connect_timeout: Duration,
    /// Reconnect behavior after the connection is lost.
    pub retry: RetryConfig,
}

impl TunnelConfig {
    /// Create a configuration with default timing.
    pub fn new(relay_url: Url, local_port: u16) -> Self {
        Self {
            relay_url,
            relay_key: None,
            subdomain: None,
            local_port,
            keepalive: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_relay_key(mut self, key: impl Into<String>) -> Self {
        self.relay_key = Some(key.into());
        self
    }

    pub fn with_subdomain(mut self, subdomain: impl Into<String>) -> Self {
        self.subdomain = Some(subdomain.into());
        self
    }

    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Configuration for reconnect backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Backoff ceiling of the first reconnect attempt.
    pub initial_backoff: Duration,
    /// Maximum backoff duration.
    pub max_backoff: Duration,
    /// Backoff multiplier.
    pub backoff_multiplier: f64,
    /// Give up after this many failed attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl RetryConfig {
    /// Upper bound of the backoff for a given attempt (0-based).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_ms = self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi(attempt.min(63) as i32);
        let max_ms = self.max_backoff.as_millis() as f64;
        Duration::from_millis(backoff_ms.min(max_ms) as u64)
    }

    /// Full jitter: a uniform delay between zero and the attempt's ceiling.
    pub fn jittered_backoff(&self, attempt: u32) -> Duration {
        let ceiling = self.backoff_for_attempt(attempt).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }

    /// Whether another attempt is allowed after `failed` failures.
    pub fn allows_attempt(&self, failed: u32) -> bool {
        self.max_attempts.map_or(true, |max| failed < max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        let config = RetryConfig::default();

        assert_eq!(config.backoff_for_attempt(0), Duration::from_millis(500));
        assert_eq!(config.backoff_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_millis(2000));
    }

    #[test]
    fn test_backoff_capped_at_max() {
        let config = RetryConfig::default();

        assert_eq!(config.backoff_for_attempt(6), Duration::from_secs(30));
        assert_eq!(config.backoff_for_attempt(1000), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_under_ceiling() {
        let config = RetryConfig::default();

        for attempt in 0..10 {
            let ceiling = config.backoff_for_attempt(attempt);
            for _ in 0..20 {
                assert!(config.jittered_backoff(attempt) <= ceiling);
            }
        }
    }

    #[test]
    fn test_allows_attempt() {
        let unlimited = RetryConfig::default();
        assert!(unlimited.allows_attempt(10_000));

        let limited = RetryConfig {
            max_attempts: Some(3),
            ..Default::default()
        };
        assert!(limited.allows_attempt(2));
        assert!(!limited.allows_attempt(3));
    }

    #[test]
    fn test_tunnel_config_defaults() {
        let url = Url::parse("wss://relay.example.com/connect").unwrap();
        let config = TunnelConfig::new(url.clone(), 8787).with_subdomain("tools");

        assert_eq!(config.relay_url, url);
        assert_eq!(config.local_port, 8787);
        assert_eq!(config.keepalive, Duration::from_secs(20));
        assert_eq!(config.subdomain.as_deref(), Some("tools"));
        assert!(config.relay_key.is_none());
    }
}
