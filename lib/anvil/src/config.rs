//! Transport configuration types.

use std::collections::HashMap;
use std::time::Duration;

/// Configuration of the HTTP transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Connection timeout duration.
    pub connect_timeout: Duration,
    /// Proxy URLs keyed by URL prefix (e.g. `http://`), `None` when no proxy is set.
    pub proxies: Option<HashMap<String, String>>,
    /// Whether server certificates are verified.
    pub verify_certificate: bool,
    /// Maximum idle connections per host.
    pub pool_idle_per_host: usize,
    /// Idle connection timeout.
    pub pool_idle_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            proxies: None,
            verify_certificate: true,
            pool_idle_per_host: 32,
            pool_idle_timeout: Duration::from_secs(90),
        }
    }
}

impl TransportConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub fn builder() -> TransportConfigBuilder {
        TransportConfigBuilder::default()
    }

    /// Proxy URL configured for the given target URL, matched on the longest prefix.
    #[must_use]
    pub fn proxy_for(&self, url: &str) -> Option<&str> {
        self.proxies
            .as_ref()?
            .iter()
            .filter(|(prefix, _)| url.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, proxy)| proxy.as_str())
    }
}

/// Builder for [`TransportConfig`].
#[derive(Debug, Clone, Default)]
pub struct TransportConfigBuilder {
    connect_timeout: Option<Duration>,
    proxies: Option<HashMap<String, String>>,
    verify_certificate: Option<bool>,
    pool_idle_per_host: Option<usize>,
    pool_idle_timeout: Option<Duration>,
}

impl TransportConfigBuilder {
    /// Set the connection timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the proxies.
    #[must_use]
    pub fn proxies(mut self, proxies: Option<HashMap<String, String>>) -> Self {
        self.proxies = proxies;
        self
    }

    /// Enable or disable certificate verification.
    #[must_use]
    pub const fn verify_certificate(mut self, verify: bool) -> Self {
        self.verify_certificate = Some(verify);
        self
    }

    /// Set the maximum idle connections per host.
    #[must_use]
    pub const fn pool_idle_per_host(mut self, count: usize) -> Self {
        self.pool_idle_per_host = Some(count);
        self
    }

    /// Set the idle connection timeout.
    #[must_use]
    pub const fn pool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool_idle_timeout = Some(timeout);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> TransportConfig {
        let defaults = TransportConfig::default();
        TransportConfig {
            connect_timeout: self.connect_timeout.unwrap_or(defaults.connect_timeout),
            proxies: self.proxies,
            verify_certificate: self
                .verify_certificate
                .unwrap_or(defaults.verify_certificate),
            pool_idle_per_host: self
                .pool_idle_per_host
                .unwrap_or(defaults.pool_idle_per_host),
            pool_idle_timeout: self.pool_idle_timeout.unwrap_or(defaults.pool_idle_timeout),
        }
    }
}
