//! Bearer token authentication middleware.
//!
//! This middleware sets an `Authorization: Bearer <token>` header on all
//! outgoing requests.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower::util::BoxCloneService;
use tower::{Layer, Service};

use super::HttpMiddleware;
use crate::{BoxedService, Error, Request, Response, Result};

/// Name of the header set by [`BearerAuthLayer`].
pub const AUTHORIZATION: &str = "Authorization";

/// Layer that adds bearer token authentication to requests.
///
/// # Example
///
/// ```ignore
/// use anvil::middleware::BearerAuthLayer;
/// use tower::ServiceBuilder;
///
/// let service = ServiceBuilder::new()
///     .layer(BearerAuthLayer::new("my-secret-token"))
///     .service(transport.service());
/// ```
#[derive(Debug, Clone)]
pub struct BearerAuthLayer {
    token: Arc<str>,
}

impl BearerAuthLayer {
    /// Create a new bearer auth layer with the given token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Arc::from(token.into()),
        }
    }

    /// The token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Headers set by this layer.
    #[must_use]
    pub fn headers(&self) -> Vec<(String, String)> {
        vec![(AUTHORIZATION.to_string(), format!("Bearer {}", self.token))]
    }
}

impl<S> Layer<S> for BearerAuthLayer {
    type Service = BearerAuth<S>;

    fn layer(&self, inner: S) -> Self::Service {
        BearerAuth {
            inner,
            token: Arc::clone(&self.token),
        }
    }
}

impl HttpMiddleware for BearerAuthLayer {
    fn wrap(&self, next: BoxedService) -> BoxedService {
        BoxCloneService::new(self.layer(next))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Service that adds bearer token authentication to requests.
#[derive(Debug, Clone)]
pub struct BearerAuth<S> {
    inner: S,
    token: Arc<str>,
}

impl<S> Service<Request> for BearerAuth<S>
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
        request.set_header(AUTHORIZATION, format!("Bearer {}", self.token));

        let mut inner = self.inner.clone();
        Box::pin(async move { inner.call(request).await })
    }
}
