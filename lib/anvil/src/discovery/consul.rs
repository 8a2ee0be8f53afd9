use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::future::BoxFuture;
use serde::Deserialize;
use tower::ServiceExt;

use super::{ServiceDiscovery, render};
use crate::middleware::{BearerAuthLayer, HttpMiddleware, apply_middlewares};
use crate::{Error, HyperTransport, Method, Request, RequestMeta, Result, Transport};

/// Settings of the consul strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsulConfig {
    /// Consul HTTP API root.
    pub addr: String,
    /// Catalog name of a versioned service.
    pub service_name_fmt: String,
    /// URL template of a versioned service; `{address}`, `{port}`, `{version}` are substituted.
    pub service_url_fmt: String,
    /// Catalog name of an unversioned service.
    pub unversioned_service_name_fmt: String,
    /// URL template of an unversioned service.
    pub unversioned_service_url_fmt: String,
    /// ACL token sent as a bearer token to consul.
    pub consul_token: Option<String>,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            addr: "http://consul:8500/v1".to_string(),
            service_name_fmt: "{service}-{version}".to_string(),
            service_url_fmt: "http://{address}:{port}/{version}".to_string(),
            unversioned_service_name_fmt: "{service}".to_string(),
            unversioned_service_url_fmt: "http://{address}:{port}".to_string(),
            consul_token: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CatalogService {
    #[serde(rename = "Address", default)]
    address: String,
    #[serde(rename = "ServiceAddress", default)]
    service_address: String,
    #[serde(rename = "ServicePort")]
    service_port: u16,
}

/// Discovery through the consul catalog.
///
/// Every resolution queries `GET {addr}/catalog/service/{name}` and picks the
/// next instance in round-robin order.
pub struct ConsulDiscovery {
    config: ConsulConfig,
    transport: Arc<dyn Transport>,
    middlewares: Vec<Arc<dyn HttpMiddleware>>,
    next: AtomicUsize,
}

impl fmt::Debug for ConsulDiscovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsulDiscovery")
            .field("addr", &self.config.addr)
            .field("middlewares", &self.middlewares)
            .finish_non_exhaustive()
    }
}

impl ConsulDiscovery {
    /// Create a consul discovery using its own hyper transport.
    #[must_use]
    pub fn new(config: ConsulConfig) -> Self {
        Self::with_transport(config, Arc::new(HyperTransport::default()))
    }

    /// Create a consul discovery on top of the given transport.
    ///
    /// A bearer authentication middleware is installed on the discovery's
    /// internal client when a token is configured.
    #[must_use]
    pub fn with_transport(config: ConsulConfig, transport: Arc<dyn Transport>) -> Self {
        let middlewares: Vec<Arc<dyn HttpMiddleware>> = config
            .consul_token
            .iter()
            .map(|token| Arc::new(BearerAuthLayer::new(token.as_str())) as Arc<dyn HttpMiddleware>)
            .collect();
        Self {
            config,
            transport,
            middlewares,
            next: AtomicUsize::new(0),
        }
    }

    /// Settings in use.
    #[must_use]
    pub const fn config(&self) -> &ConsulConfig {
        &self.config
    }

    /// Middlewares of the internal consul client.
    #[must_use]
    pub fn middlewares(&self) -> &[Arc<dyn HttpMiddleware>] {
        &self.middlewares
    }

    async fn resolve(&self, service: &str, version: Option<&str>) -> Result<String> {
        let vars = [("service", service), ("version", version.unwrap_or(""))];
        let (name_fmt, url_fmt) = match version {
            Some(_) => (&self.config.service_name_fmt, &self.config.service_url_fmt),
            None => (
                &self.config.unversioned_service_name_fmt,
                &self.config.unversioned_service_url_fmt,
            ),
        };
        let name = render(name_fmt, &vars);

        let url = url::Url::parse(&format!(
            "{}/catalog/service/{name}",
            self.config.addr.trim_end_matches('/')
        ))?;
        let request = Request::builder(Method::Get, url)
            .header("Accept", "application/json")
            .meta(RequestMeta {
                client_name: Arc::from("consul"),
                path: Arc::from("/catalog/service/{name}"),
                ..RequestMeta::default()
            })
            .build();

        let service_chain = apply_middlewares(&self.middlewares, self.transport.service());
        let response = service_chain.oneshot(request).await?;
        if !response.is_success() {
            return Err(Error::discovery(format!(
                "consul returned {} for {name}",
                response.status()
            )));
        }

        let instances: Vec<CatalogService> = response.json()?;
        if instances.is_empty() {
            return Err(Error::discovery(format!("no instance of {name} in consul")));
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % instances.len();
        let Some(instance) = instances.get(index) else {
            return Err(Error::discovery(format!("no instance of {name} in consul")));
        };

        let address = if instance.service_address.is_empty() {
            instance.address.as_str()
        } else {
            instance.service_address.as_str()
        };
        let port = instance.service_port.to_string();
        tracing::debug!(service = name, address, port, "resolved consul instance");
        Ok(render(
            url_fmt,
            &[
                ("address", address),
                ("port", port.as_str()),
                ("service", service),
                ("version", version.unwrap_or("")),
            ],
        ))
    }
}

impl ServiceDiscovery for ConsulDiscovery {
    fn get_endpoint<'a>(
        &'a self,
        service: &'a str,
        version: Option<&'a str>,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(self.resolve(service, version))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_token_no_middleware() {
        let sd = ConsulDiscovery::new(ConsulConfig::default());
        assert!(sd.middlewares().is_empty());
    }

    #[test]
    fn token_installs_bearer_auth() {
        let sd = ConsulDiscovery::new(ConsulConfig {
            consul_token: Some("abc".to_string()),
            ..ConsulConfig::default()
        });

        assert_eq!(sd.middlewares().len(), 1);
        let auth = sd
            .middlewares()
            .first()
            .and_then(|middleware| middleware.as_any().downcast_ref::<BearerAuthLayer>())
            .expect("bearer auth");
        assert_eq!(
            auth.headers(),
            vec![("Authorization".to_string(), "Bearer abc".to_string())]
        );
    }
}
