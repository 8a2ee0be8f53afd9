//! HTTP transport using hyper-util.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnector;
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use tower::util::BoxCloneService;
use tower_service::Service;

use crate::connector::{ProxyConnector, https_connector};
use crate::{Error, Request, Response, Result, TransportConfig};

// ============================================================================
// Type-Erased Service for Middleware Composition
// ============================================================================

/// Type-erased service every middleware wraps.
pub type BoxedService = BoxCloneService<Request, Response, Error>;

/// Future type for Tower Service implementations.
pub type ServiceFuture = Pin<Box<dyn Future<Output = Result<Response>> + Send + 'static>>;

/// Sends requests over the network.
///
/// A transport hands out the innermost service of a client's middleware chain.
pub trait Transport: Send + Sync + fmt::Debug + 'static {
    /// A fresh handle on the underlying service.
    fn service(&self) -> BoxedService;

    /// Access to the concrete type, for introspection.
    fn as_any(&self) -> &dyn Any;
}

// ============================================================================
// Raw Client
// ============================================================================

#[derive(Clone)]
struct RawHyperClient {
    inner: Client<HttpsConnector<ProxyConnector>, Full<Bytes>>,
}

impl RawHyperClient {
    fn new(config: &TransportConfig) -> Self {
        let connector = https_connector(config);

        let inner = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.pool_idle_per_host)
            .build(connector);

        Self { inner }
    }

    fn build_hyper_request(request: Request) -> Result<http::Request<Full<Bytes>>> {
        let (method, url, headers, body, _meta) = request.into_parts();

        let mut builder = http::Request::builder()
            .method(http::Method::from(method))
            .uri(url.as_str());

        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let body = body.map_or_else(Full::default, Full::new);
        builder
            .body(body)
            .map_err(|e| Error::invalid_request(e.to_string()))
    }

    fn extract_headers(headers: &http::HeaderMap) -> HashMap<String, String> {
        headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.to_string(), v.to_string()))
            })
            .collect()
    }

    async fn execute(&self, request: Request) -> Result<Response> {
        let timeout = request.meta().timeout.read;
        let hyper_request = Self::build_hyper_request(request)?;

        tokio::time::timeout(timeout, self.exchange(hyper_request))
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// Send the request and read the whole response body.
    async fn exchange(&self, request: http::Request<Full<Bytes>>) -> Result<Response> {
        let response = self
            .inner
            .request(request)
            .await
            .map_err(Self::map_hyper_error)?;

        let status = response.status().as_u16();
        let response_headers = Self::extract_headers(response.headers());

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::connection(e.to_string()))?
            .to_bytes();

        Ok(Response::new(status, response_headers, body))
    }

    #[allow(clippy::needless_pass_by_value)]
    fn map_hyper_error(err: hyper_util::client::legacy::Error) -> Error {
        let msg = err.to_string();

        if err.is_connect() {
            return Error::connection(msg);
        }

        if msg.contains("ssl") || msg.contains("tls") || msg.contains("certificate") {
            return Error::tls(msg);
        }

        Error::connection(msg)
    }
}

impl Service<Request> for RawHyperClient {
    type Response = Response;
    type Error = Error;
    type Future = ServiceFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let client = self.clone();
        Box::pin(async move { client.execute(request).await })
    }
}

// ============================================================================
// Public Transport
// ============================================================================

/// Transport over hyper with connection pooling and rustls.
///
/// The total timeout of a call is read from the request metadata, the connect
/// timeout from the [`TransportConfig`].
///
/// # Example
///
/// ```ignore
/// use anvil::{HyperTransport, Transport, TransportConfig};
///
/// let transport = HyperTransport::new(TransportConfig::default());
/// let service = transport.service();
/// ```
#[derive(Clone)]
pub struct HyperTransport {
    raw: RawHyperClient,
    config: TransportConfig,
}

impl fmt::Debug for HyperTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HyperTransport")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HyperTransport {
    /// Create a transport from its configuration.
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        let raw = RawHyperClient::new(&config);
        Self { raw, config }
    }

    /// Transport configuration.
    #[must_use]
    pub const fn config(&self) -> &TransportConfig {
        &self.config
    }
}

impl Default for HyperTransport {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

impl Transport for HyperTransport {
    fn service(&self) -> BoxedService {
        BoxCloneService::new(self.raw.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
