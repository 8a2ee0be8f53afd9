use std::any::Any;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;

use super::{ServiceDiscovery, render};
use crate::Result;

/// URL templates of the router strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterConfig {
    /// Template for versioned services; `{service}` and `{version}` are substituted.
    pub service_url_fmt: String,
    /// Template for unversioned services; `{service}` is substituted.
    pub unversioned_service_url_fmt: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            service_url_fmt: "http://router/{service}-{version}/{version}".to_string(),
            unversioned_service_url_fmt: "http://router/{service}".to_string(),
        }
    }
}

/// Discovery through a routing proxy: the endpoint is computed, never looked up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterDiscovery {
    config: RouterConfig,
}

impl RouterDiscovery {
    /// Create a router discovery.
    #[must_use]
    pub const fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    /// URL templates in use.
    #[must_use]
    pub const fn config(&self) -> &RouterConfig {
        &self.config
    }
}

impl ServiceDiscovery for RouterDiscovery {
    fn get_endpoint<'a>(
        &'a self,
        service: &'a str,
        version: Option<&'a str>,
    ) -> BoxFuture<'a, Result<String>> {
        let url = match version {
            Some(version) => render(
                &self.config.service_url_fmt,
                &[("service", service), ("version", version)],
            ),
            None => render(
                &self.config.unversioned_service_url_fmt,
                &[("service", service)],
            ),
        };
        futures_util::future::ready(Ok(url)).boxed()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
