use std::any::Any;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;

use super::{ServiceDiscovery, render};
use crate::{Error, Result};

/// Environment variable and URL templates of the nomad strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NomadConfig {
    /// Name of the variable holding the upstream address of a versioned service.
    pub service_env_fmt: String,
    /// Name of the variable holding the upstream address of an unversioned service.
    pub unversioned_service_env_fmt: String,
    /// URL template; `{nomad_upstream_addr}` and `{version}` are substituted.
    pub service_url_fmt: String,
    /// URL template of unversioned services.
    pub unversioned_service_url_fmt: String,
}

impl Default for NomadConfig {
    fn default() -> Self {
        Self {
            service_env_fmt: "NOMAD_UPSTREAM_ADDR_{service}-{version}".to_string(),
            unversioned_service_env_fmt: "NOMAD_UPSTREAM_ADDR_{service}".to_string(),
            service_url_fmt: "http://{nomad_upstream_addr}/{version}".to_string(),
            unversioned_service_url_fmt: "http://{nomad_upstream_addr}".to_string(),
        }
    }
}

/// Discovery through nomad upstreams exposed as environment variables.
///
/// Variables are read at resolution time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NomadDiscovery {
    config: NomadConfig,
}

impl NomadDiscovery {
    /// Create a nomad discovery.
    #[must_use]
    pub const fn new(config: NomadConfig) -> Self {
        Self { config }
    }

    /// Templates in use.
    #[must_use]
    pub const fn config(&self) -> &NomadConfig {
        &self.config
    }

    fn resolve(&self, service: &str, version: Option<&str>) -> Result<String> {
        let vars = [("service", service), ("version", version.unwrap_or(""))];
        let (env_fmt, url_fmt) = match version {
            Some(_) => (&self.config.service_env_fmt, &self.config.service_url_fmt),
            None => (
                &self.config.unversioned_service_env_fmt,
                &self.config.unversioned_service_url_fmt,
            ),
        };
        let env_name = render(env_fmt, &vars);
        let upstream = std::env::var(&env_name)
            .map_err(|_| Error::discovery(format!("missing environment variable {env_name}")))?;
        Ok(render(
            url_fmt,
            &[
                ("nomad_upstream_addr", upstream.as_str()),
                ("service", service),
                ("version", version.unwrap_or("")),
            ],
        ))
    }
}

impl ServiceDiscovery for NomadDiscovery {
    fn get_endpoint<'a>(
        &'a self,
        service: &'a str,
        version: Option<&'a str>,
    ) -> BoxFuture<'a, Result<String>> {
        futures_util::future::ready(self.resolve(service, version)).boxed()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
