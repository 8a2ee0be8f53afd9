//! HTTP cache middleware.
//!
//! Responses of safe calls are stored in a [`CacheBackend`] for the lifetime
//! announced by their `Cache-Control` header. The [`CachingPolicy`] decides
//! which calls are cacheable and computes the keys; the [`CacheSerializer`]
//! encodes stored responses.
//!
//! Two keys are written per cached response: the vary key (client and path)
//! stores the names of the headers listed in `Vary`, and the response key adds
//! the values of those headers to the vary key.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tower::util::BoxCloneService;
use tower::{Layer, Service};

use super::HttpMiddleware;
use super::metrics::{PrometheusMetrics, status_label};
use crate::{BoxedService, Error, Request, Response, Result};

/// Longest lifetime granted to a cached response: one year.
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

// ============================================================================
// Policy
// ============================================================================

/// Caching decision for a response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheInfo {
    /// Lifetime of the entry, zero when the response must not be stored,
    /// at most [`MAX_TTL`].
    pub ttl: Duration,
    /// Request headers the response varies on.
    pub vary: Vec<String>,
}

/// Decides what gets cached and under which keys.
pub trait CachingPolicy: Send + Sync + fmt::Debug + 'static {
    /// Whether the request may be served from cache.
    fn handle_request(&self, request: &Request) -> bool;

    /// Key storing the vary header names of a request target.
    fn vary_key(&self, request: &Request) -> String;

    /// Key storing the response for the given vary header names.
    fn response_key(&self, request: &Request, vary: &[String]) -> String;

    /// Caching decision for a response.
    fn cache_info(&self, request: &Request, response: &Response) -> CacheInfo;

    /// Access to the concrete type, for introspection.
    fn as_any(&self) -> &dyn Any;
}

/// Policy driven by the `Cache-Control` and `Vary` response headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultCachingPolicy {
    sep: String,
}

impl Default for DefaultCachingPolicy {
    fn default() -> Self {
        Self::new("$")
    }
}

impl DefaultCachingPolicy {
    /// Create a policy joining key parts with `sep`.
    pub fn new(sep: impl Into<String>) -> Self {
        Self { sep: sep.into() }
    }

    /// Key separator.
    #[must_use]
    pub fn sep(&self) -> &str {
        &self.sep
    }

    fn max_age(cache_control: &str) -> Option<u64> {
        let mut max_age = None;
        let mut shared_max_age = None;
        for directive in cache_control.split(',').map(str::trim) {
            let (name, value) = directive
                .split_once('=')
                .map_or((directive, None), |(name, value)| (name, Some(value)));
            match name.to_ascii_lowercase().as_str() {
                "no-store" | "no-cache" | "private" => return None,
                "max-age" => max_age = value.and_then(|v| v.trim_matches('"').parse().ok()),
                "s-maxage" => shared_max_age = value.and_then(|v| v.trim_matches('"').parse().ok()),
                _ => {}
            }
        }
        shared_max_age.or(max_age)
    }
}

impl CachingPolicy for DefaultCachingPolicy {
    fn handle_request(&self, request: &Request) -> bool {
        request.method() == crate::Method::Get
    }

    fn vary_key(&self, request: &Request) -> String {
        let url = request.url();
        let target = url
            .query()
            .map_or_else(|| url.path().to_string(), |query| format!("{}?{query}", url.path()));
        format!("{}{}{target}", request.meta().client_name, self.sep)
    }

    fn response_key(&self, request: &Request, vary: &[String]) -> String {
        let values = vary
            .iter()
            .map(|name| format!("{name}={}", request.header(name).unwrap_or("")))
            .collect::<Vec<_>>()
            .join("|");
        format!("{}{}{values}", self.vary_key(request), self.sep)
    }

    fn cache_info(&self, _request: &Request, response: &Response) -> CacheInfo {
        if !response.is_success() {
            return CacheInfo::default();
        }
        let vary: Vec<String> = response
            .header("Vary")
            .map(|vary| {
                vary.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if vary.iter().any(|name| name == "*") {
            return CacheInfo::default();
        }
        let ttl = response
            .header("Cache-Control")
            .and_then(Self::max_age)
            .map_or(Duration::ZERO, |secs| Duration::from_secs(secs).min(MAX_TTL));
        CacheInfo { ttl, vary }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// Serializer
// ============================================================================

/// Stored form of a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: HashMap<String, String>,
    /// Response body.
    pub body: Vec<u8>,
}

impl From<&Response> for CachedResponse {
    fn from(response: &Response) -> Self {
        Self {
            status: response.status(),
            headers: response.headers().clone(),
            body: response.body().to_vec(),
        }
    }
}

impl From<CachedResponse> for Response {
    fn from(cached: CachedResponse) -> Self {
        Self::new(cached.status, cached.headers, Bytes::from(cached.body))
    }
}

/// Encodes cached responses.
pub trait CacheSerializer: Send + Sync + fmt::Debug + 'static {
    /// Encode a response.
    ///
    /// # Errors
    ///
    /// Returns an error if the response cannot be encoded.
    fn serialize(&self, response: &CachedResponse) -> Result<String>;

    /// Decode a response.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a response.
    fn deserialize(&self, payload: &str) -> Result<CachedResponse>;

    /// Access to the concrete type, for introspection.
    fn as_any(&self) -> &dyn Any;
}

/// JSON encoding of cached responses.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl CacheSerializer for JsonSerializer {
    fn serialize(&self, response: &CachedResponse) -> Result<String> {
        serde_json::to_string(response).map_err(Error::from)
    }

    fn deserialize(&self, payload: &str) -> Result<CachedResponse> {
        crate::from_json(payload.as_bytes())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// Backend
// ============================================================================

/// Key-value store with expiration.
pub trait CacheBackend: Send + Sync + fmt::Debug + 'static {
    /// Read a live entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write an entry expiring after `ttl`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Access to the concrete type, for introspection.
    fn as_any(&self) -> &dyn Any;
}

/// Process-local store bound to a cache URL.
#[derive(Debug)]
pub struct InMemoryCache {
    url: url::Url,
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryCache {
    /// Create a store for the given cache URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn new(url: &str) -> Result<Self> {
        Ok(Self {
            url: url::Url::parse(url)?,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Cache URL.
    #[must_use]
    pub const fn url(&self) -> &url::Url {
        &self.url
    }
}

impl CacheBackend for InMemoryCache {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, (_, expires)| *expires > now);
        if let Some(expires) = now.checked_add(ttl.min(MAX_TTL))
            && expires > now
        {
            entries.insert(key.to_string(), (value, expires));
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// Middleware
// ============================================================================

#[derive(Debug)]
struct Cache {
    backend: Arc<dyn CacheBackend>,
    policy: Arc<dyn CachingPolicy>,
    serializer: Arc<dyn CacheSerializer>,
    metrics: Option<PrometheusMetrics>,
}

impl Cache {
    fn lookup(&self, request: &Request) -> Result<Option<Response>> {
        let Some(vary) = self.backend.get(&self.policy.vary_key(request))? else {
            return Ok(None);
        };
        let vary: Vec<String> = crate::from_json(vary.as_bytes())?;
        let Some(payload) = self.backend.get(&self.policy.response_key(request, &vary))? else {
            return Ok(None);
        };
        Ok(Some(self.serializer.deserialize(&payload)?.into()))
    }

    fn store(&self, request: &Request, response: &Response) -> Result<()> {
        let info = self.policy.cache_info(request, response);
        if info.ttl.is_zero() {
            return Ok(());
        }
        let vary = serde_json::to_string(&info.vary)?;
        self.backend
            .set(&self.policy.vary_key(request), vary, info.ttl)?;
        let payload = self.serializer.serialize(&CachedResponse::from(response))?;
        self.backend
            .set(&self.policy.response_key(request, &info.vary), payload, info.ttl)
    }
}

/// Layer serving cacheable calls from a cache backend.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
///
/// use anvil::middleware::{DefaultCachingPolicy, HttpCacheLayer, InMemoryCache, JsonSerializer};
///
/// let layer = HttpCacheLayer::new(
///     Arc::new(InMemoryCache::new("redis://redis/0")?),
///     Arc::new(DefaultCachingPolicy::default()),
///     Arc::new(JsonSerializer),
/// );
/// ```
#[derive(Debug, Clone)]
pub struct HttpCacheLayer {
    cache: Arc<Cache>,
}

impl HttpCacheLayer {
    /// Create a cache layer.
    #[must_use]
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        policy: Arc<dyn CachingPolicy>,
        serializer: Arc<dyn CacheSerializer>,
    ) -> Self {
        Self {
            cache: Arc::new(Cache {
                backend,
                policy,
                serializer,
                metrics: None,
            }),
        }
    }

    /// Record hits and misses into `metrics`.
    #[must_use]
    pub fn with_metrics(self, metrics: PrometheusMetrics) -> Self {
        Self {
            cache: Arc::new(Cache {
                backend: Arc::clone(&self.cache.backend),
                policy: Arc::clone(&self.cache.policy),
                serializer: Arc::clone(&self.cache.serializer),
                metrics: Some(metrics),
            }),
        }
    }

    /// Cache backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.cache.backend
    }

    /// Caching policy.
    #[must_use]
    pub fn policy(&self) -> &Arc<dyn CachingPolicy> {
        &self.cache.policy
    }

    /// Response serializer.
    #[must_use]
    pub fn serializer(&self) -> &Arc<dyn CacheSerializer> {
        &self.cache.serializer
    }

    /// Metrics receiving hits and misses, if any.
    #[must_use]
    pub fn metrics(&self) -> Option<&PrometheusMetrics> {
        self.cache.metrics.as_ref()
    }
}

impl<S> Layer<S> for HttpCacheLayer {
    type Service = HttpCache<S>;

    fn layer(&self, inner: S) -> Self::Service {
        HttpCache {
            inner,
            cache: Arc::clone(&self.cache),
        }
    }
}

impl HttpMiddleware for HttpCacheLayer {
    fn wrap(&self, next: BoxedService) -> BoxedService {
        BoxCloneService::new(self.layer(next))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Service serving cacheable calls from a cache backend.
#[derive(Debug, Clone)]
pub struct HttpCache<S> {
    inner: S,
    cache: Arc<Cache>,
}

impl<S> Service<Request> for HttpCache<S>
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

    fn call(&mut self, request: Request) -> Self::Future {
        let mut inner = self.inner.clone();

        if !self.cache.policy.handle_request(&request) {
            return Box::pin(async move { inner.call(request).await });
        }

        let cache = Arc::clone(&self.cache);
        let start = Instant::now();
        let method = request.method().to_string();
        let meta = request.meta().clone();

        match cache.lookup(&request) {
            Ok(Some(response)) => {
                tracing::debug!(url = %request.url(), "served from cache");
                if let Some(metrics) = &cache.metrics {
                    let status = response.status().to_string();
                    let elapsed = start.elapsed().as_secs_f64();
                    metrics.observe_cache_hit(&meta, &method, &status, elapsed);
                }
                return Box::pin(async move { Ok(response) });
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(error = %err, "cache lookup failed"),
        }

        Box::pin(async move {
            let result = inner.call(request.clone()).await;
            if let Ok(response) = &result
                && let Err(err) = cache.store(&request, response)
            {
                tracing::warn!(error = %err, "cache store failed");
            }
            if let Some(metrics) = &cache.metrics {
                metrics.observe_cache_miss(&meta, &method, &status_label(&result));
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tower::ServiceExt;

    use super::*;
    use crate::middleware::PrometheusConfig;
    use crate::{Method, RequestMeta};

    /// Mock service answering with fixed headers and counting calls.
    #[derive(Clone)]
    struct MockService {
        headers: HashMap<String, String>,
        call_count: Arc<AtomicU32>,
    }

    impl MockService {
        fn new(headers: &[(&str, &str)]) -> Self {
            Self {
                headers: headers
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
                call_count: Arc::new(AtomicU32::new(0)),
            }
        }

        fn call_count(&self) -> u32 {
            self.call_count.load(Ordering::SeqCst)
        }
    }

    impl Service<Request> for MockService {
        type Response = Response;
        type Error = Error;
        type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _request: Request) -> Self::Future {
            let count = self.call_count.fetch_add(1, Ordering::SeqCst);
            let headers = self.headers.clone();
            Box::pin(async move {
                Ok(Response::new(200, headers, Bytes::from(format!("call {count}"))))
            })
        }
    }

    fn create_request(method: Method, language: &str) -> Request {
        let url = url::Url::parse("https://example.com/users/42?full=1").expect("valid url");
        Request::builder(method, url)
            .header("Accept-Language", language)
            .meta(RequestMeta {
                client_name: Arc::from("api"),
                path: Arc::from("/users/{id}"),
                ..RequestMeta::default()
            })
            .build()
    }

    fn layer() -> HttpCacheLayer {
        HttpCacheLayer::new(
            Arc::new(InMemoryCache::new("redis://redis/0").expect("url")),
            Arc::new(DefaultCachingPolicy::default()),
            Arc::new(JsonSerializer),
        )
    }

    #[test]
    fn policy_keys() {
        let policy = DefaultCachingPolicy::default();
        let request = create_request(Method::Get, "fr");

        assert_eq!(policy.vary_key(&request), "api$/users/42?full=1");
        assert_eq!(
            policy.response_key(&request, &["Accept-Language".to_string()]),
            "api$/users/42?full=1$Accept-Language=fr"
        );
    }

    #[test]
    fn policy_cache_info() {
        let policy = DefaultCachingPolicy::new("#");
        let request = create_request(Method::Get, "fr");
        let response = |headers: &[(&str, &str)]| {
            Response::new(
                200,
                headers
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
                Bytes::new(),
            )
        };

        let cached = response(&[("Cache-Control", "public, max-age=60")]);
        let info = policy.cache_info(&request, &cached);
        assert_eq!(info.ttl, Duration::from_secs(60));

        let info = policy.cache_info(
            &request,
            &response(&[
                ("Cache-Control", "max-age=60, s-maxage=120"),
                ("Vary", "Accept-Language, Accept"),
            ]),
        );
        assert_eq!(info.ttl, Duration::from_secs(120));
        assert_eq!(info.vary, vec!["Accept-Language".to_string(), "Accept".to_string()]);

        let info = policy.cache_info(&request, &response(&[("Cache-Control", "no-store")]));
        assert!(info.ttl.is_zero());

        let varying = response(&[("Cache-Control", "max-age=60"), ("Vary", "*")]);
        let info = policy.cache_info(&request, &varying);
        assert!(info.ttl.is_zero());

        let info = policy.cache_info(&request, &response(&[]));
        assert!(info.ttl.is_zero());
    }

    #[test]
    fn in_memory_cache_requires_url() {
        assert!(InMemoryCache::new("not a url").is_err());
        let cache = InMemoryCache::new("redis://redis/0").expect("url");
        assert_eq!(cache.url().as_str(), "redis://redis/0");
    }

    #[tokio::test]
    async fn serves_second_call_from_cache() {
        let mock =
            MockService::new(&[("Cache-Control", "max-age=60"), ("Vary", "Accept-Language")]);
        let layer = layer();

        let first = layer
            .layer(mock.clone())
            .oneshot(create_request(Method::Get, "fr"))
            .await
            .expect("first");
        let second = layer
            .layer(mock.clone())
            .oneshot(create_request(Method::Get, "fr"))
            .await
            .expect("second");

        assert_eq!(mock.call_count(), 1);
        assert_eq!(first, second);

        // Different value of a vary header
        let third = layer
            .layer(mock.clone())
            .oneshot(create_request(Method::Get, "en"))
            .await
            .expect("third");
        assert_eq!(mock.call_count(), 2);
        assert_eq!(third.body().as_ref(), b"call 1");
    }

    #[tokio::test]
    async fn huge_max_age_is_capped() {
        let mock = MockService::new(&[("Cache-Control", "max-age=18446744073709551615")]);
        let layer = layer();

        let info = DefaultCachingPolicy::default().cache_info(
            &create_request(Method::Get, "fr"),
            &Response::new(200, mock.headers.clone(), Bytes::new()),
        );
        assert_eq!(info.ttl, MAX_TTL);

        for _ in 0..2 {
            layer
                .layer(mock.clone())
                .oneshot(create_request(Method::Get, "fr"))
                .await
                .expect("get");
        }
        assert_eq!(mock.call_count(), 1);
    }

    #[test]
    fn in_memory_cache_ttl_out_of_range() {
        let cache = InMemoryCache::new("redis://redis/0").expect("url");

        cache.set("key", "value".to_string(), Duration::MAX).expect("set");
        assert_eq!(cache.get("key").expect("get"), Some("value".to_string()));
    }

    #[test]
    fn in_memory_cache_purges_expired_entries() {
        let cache = InMemoryCache::new("redis://redis/0").expect("url");

        for index in 0..1000 {
            cache.set(&format!("stale-{index}"), "value".to_string(), Duration::ZERO).expect("set");
        }
        cache.set("live", "value".to_string(), Duration::from_secs(60)).expect("set");

        let entries = cache.entries.lock().expect("lock");
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key("live"));
    }

    #[tokio::test]
    async fn uncacheable_calls_go_through() {
        let mock = MockService::new(&[("Cache-Control", "max-age=60")]);
        let layer = layer();

        for _ in 0..2 {
            layer
                .layer(mock.clone())
                .oneshot(create_request(Method::Post, "fr"))
                .await
                .expect("post");
        }
        assert_eq!(mock.call_count(), 2);

        let mock = MockService::new(&[("Cache-Control", "no-cache")]);
        for _ in 0..2 {
            layer
                .layer(mock.clone())
                .oneshot(create_request(Method::Get, "fr"))
                .await
                .expect("get");
        }
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn records_hits_and_misses() {
        let metrics = PrometheusMetrics::new(PrometheusConfig::default()).expect("metrics");
        let layer = layer().with_metrics(metrics.clone());
        let mock = MockService::new(&[("Cache-Control", "max-age=60")]);

        for _ in 0..2 {
            layer
                .layer(mock.clone())
                .oneshot(create_request(Method::Get, "fr"))
                .await
                .expect("get");
        }

        let rendered = metrics.render();
        assert!(rendered.contains("anvil_cache_miss_total"), "{rendered}");
        assert!(rendered.contains("anvil_cache_hit_latency_seconds_bucket"), "{rendered}");
    }
}
