//! Tower middleware layers for anvil clients.
//!
//! Every layer implements Tower's [`Layer`](tower::Layer) trait for the
//! [`Request`](crate::Request)/[`Response`](crate::Response) pair, and
//! [`HttpMiddleware`] so a client factory can hold a heterogeneous, ordered
//! list of them.
//!
//! # Available Layers
//!
//! - [`AddHeadersLayer`] - Sets static headers
//! - [`BearerAuthLayer`] - Adds `Authorization: Bearer <token>` header
//! - [`PrometheusMetrics`] - Records Prometheus latency histograms
//! - [`CircuitBreakerLayer`] - Opens a circuit per client after repeated failures
//! - [`HttpCacheLayer`] - Serves cacheable calls from a cache backend
//! - [`ZipkinLayer`] - Propagates B3 trace headers
//! - [`LoggingLayer`] - Logs requests/responses using `tracing`
//!
//! # Ordering
//!
//! [`apply_middlewares`] wraps a service so that the first middleware of the
//! list is the outermost one: it sees the request first and the response last.
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use anvil::middleware::{AddHeadersLayer, HttpMiddleware, LoggingLayer, apply_middlewares};
//!
//! let middlewares: Vec<Arc<dyn HttpMiddleware>> = vec![
//!     Arc::new(LoggingLayer::new()),
//!     Arc::new(AddHeadersLayer::new([("X-Source", "notif")])),
//! ];
//! let service = apply_middlewares(&middlewares, transport.service());
//! ```

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::BoxedService;

mod bearer_auth;
mod circuit_breaker;
mod headers;
mod http_cache;
mod logging;
mod metrics;
mod zipkin;

pub use bearer_auth::{AUTHORIZATION, BearerAuth, BearerAuthLayer};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerLayer, CircuitListener, CircuitRecord,
    CircuitState, InMemoryUnitOfWork, PrometheusHook, UnitOfWork,
};
pub use headers::{AddHeaders, AddHeadersLayer};
pub use http_cache::{
    CacheBackend, CacheInfo, CacheSerializer, CachedResponse, CachingPolicy,
    DefaultCachingPolicy, HttpCache, HttpCacheLayer, InMemoryCache, JsonSerializer, MAX_TTL,
};
pub use logging::{LogLevel, Logging, LoggingLayer};
pub use metrics::{
    DEFAULT_BUCKETS, METRIC_CACHE_HIT_LATENCY, METRIC_CACHE_MISS, METRIC_CIRCUIT_ERRORS,
    METRIC_CIRCUIT_STATE, METRIC_INFO, METRIC_REQUEST_LATENCY, Prometheus, PrometheusConfig,
    PrometheusMetrics,
};
pub use zipkin::{Zipkin, ZipkinLayer};

/// A middleware that can wrap a boxed service.
///
/// Implementors are usually Tower layers; `wrap` boxes the layered service so
/// middlewares of different types compose into one chain.
pub trait HttpMiddleware: Send + Sync + fmt::Debug + 'static {
    /// Wrap the next service of the chain.
    fn wrap(&self, next: BoxedService) -> BoxedService;

    /// Access to the concrete type, for introspection.
    fn as_any(&self) -> &dyn Any;
}

/// Wraps `service` with `middlewares`, the first one being the outermost.
#[must_use]
pub fn apply_middlewares(
    middlewares: &[Arc<dyn HttpMiddleware>],
    service: BoxedService,
) -> BoxedService {
    middlewares
        .iter()
        .rev()
        .fold(service, |service, middleware| middleware.wrap(service))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use bytes::Bytes;
    use tower::ServiceExt;
    use tower::util::BoxCloneService;

    use super::*;
    use crate::{Error, Method, Request, Response};

    #[tokio::test]
    async fn first_middleware_is_outermost() {
        let seen = Arc::new(Mutex::new(None));
        let record = Arc::clone(&seen);
        let service = tower::service_fn(move |request: Request| {
            *record.lock().expect("lock") = request.header("X-Order").map(ToString::to_string);
            async { Ok::<_, Error>(Response::new(200, HashMap::new(), Bytes::new())) }
        });

        let middlewares: Vec<Arc<dyn HttpMiddleware>> = vec![
            Arc::new(AddHeadersLayer::new([("X-Order", "outer")])),
            Arc::new(AddHeadersLayer::new([("X-Order", "inner")])),
        ];
        let service = apply_middlewares(&middlewares, BoxCloneService::new(service));

        let url = url::Url::parse("https://example.com/").expect("url");
        service
            .oneshot(Request::builder(Method::Get, url).build())
            .await
            .expect("response");

        // The inner layer runs last, so its value reaches the transport
        assert_eq!(seen.lock().expect("lock").as_deref(), Some("inner"));
    }

    #[test]
    fn downcast_middleware() {
        let middleware: Arc<dyn HttpMiddleware> = Arc::new(BearerAuthLayer::new("abc"));
        let bearer = middleware.as_any().downcast_ref::<BearerAuthLayer>();
        assert_eq!(bearer.map(BearerAuthLayer::token), Some("abc"));
        assert!(middleware.as_any().downcast_ref::<ZipkinLayer>().is_none());
    }
}
