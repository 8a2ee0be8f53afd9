//! Static header injection middleware.
//!
//! This middleware sets a fixed set of headers on every outgoing request,
//! replacing values already present under the same name.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower::util::BoxCloneService;
use tower::{Layer, Service};

use super::HttpMiddleware;
use crate::{BoxedService, Error, Request, Response, Result};

/// Layer that adds headers to requests.
///
/// # Example
///
/// ```ignore
/// use anvil::middleware::AddHeadersLayer;
///
/// let layer = AddHeadersLayer::new([("X-Request-Source", "notif")]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddHeadersLayer {
    headers: Arc<[(String, String)]>,
}

impl AddHeadersLayer {
    /// Create a layer from `(name, value)` pairs.
    pub fn new<K, V>(headers: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            headers: headers
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        }
    }

    /// Headers set by this layer.
    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }
}

impl<S> Layer<S> for AddHeadersLayer {
    type Service = AddHeaders<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AddHeaders {
            inner,
            headers: Arc::clone(&self.headers),
        }
    }
}

impl HttpMiddleware for AddHeadersLayer {
    fn wrap(&self, next: BoxedService) -> BoxedService {
        BoxCloneService::new(self.layer(next))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Service that adds headers to requests.
#[derive(Debug, Clone)]
pub struct AddHeaders<S> {
    inner: S,
    headers: Arc<[(String, String)]>,
}

impl<S> Service<Request> for AddHeaders<S>
where
    S: Service<Request, Response = Response, Error = Error> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request) -> Self::Future {
        for (name, value) in self.headers.iter() {
            request.set_header(name.as_str(), value.as_str());
        }

        let mut inner = self.inner.clone();
        Box::pin(async move { inner.call(request).await })
    }
}
