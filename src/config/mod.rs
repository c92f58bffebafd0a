//! Configuration module
//!
//! This module handles all configuration types and loading
//! for the proxy node and the client router.

mod defaults;
mod loading;
mod types;
mod validation;

pub use loading::{
    apply_env_overrides, create_default_config, load_config, load_or_create_config, parse_config,
};
pub use types::{
    CircuitBreakerConfig, ClientConfig, ClusterConfig, Config, DatasourceConfig, NodeConfig,
    PoolConfig, SegregationConfig, SessionConfig, XaConfig,
};
pub use validation::timeouts_ordered;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_client_defaults() {
        let client = ClientConfig::default();
        assert_eq!(client.retry_attempts, -1);
        assert_eq!(client.retry_delay, Duration::from_secs(5));
        assert_eq!(client.max_probe_backoff, Duration::from_secs(60));
        assert!(client.load_aware_selection);
        assert!(client.allows_attempt(1_000_000));
    }

    #[test]
    fn test_client_attempt_limit() {
        let client = ClientConfig {
            retry_attempts: 3,
            ..ClientConfig::default()
        };
        assert!(client.allows_attempt(2));
        assert!(!client.allows_attempt(3));

        let once = ClientConfig {
            retry_attempts: 0,
            ..ClientConfig::default()
        };
        assert!(once.allows_attempt(0));
        assert!(!once.allows_attempt(1));
    }

    #[test]
    fn test_client_config_partial_toml() {
        let client: ClientConfig = toml::from_str("retry_attempts = 2\nretry_delay = 1").unwrap();
        assert_eq!(client.retry_attempts, 2);
        assert_eq!(client.retry_delay, Duration::from_secs(1));
        assert_eq!(client.transport_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_timeout_ordering() {
        let s = Duration::from_secs;
        assert!(timeouts_ordered(s(10), s(30), Some(s(60))));
        assert!(!timeouts_ordered(s(30), s(30), Some(s(60))));
        assert!(!timeouts_ordered(s(10), s(90), Some(s(60))));

        let node = create_default_config();
        assert!(ClientConfig::default().check_against(&node));
    }
}
