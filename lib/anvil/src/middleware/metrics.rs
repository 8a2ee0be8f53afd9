//! Prometheus metrics middleware.
//!
//! Metrics go through the `metrics` facade into a Prometheus recorder owned by
//! the middleware, so several bindings in one process never share (or fight
//! over) the global recorder.
//!
//! # Metrics
//! - `anvil_info` (gauge): always 1, labeled by crate version
//! - `anvil_request_latency_seconds` (histogram): latency of remote calls
//! - `anvil_cache_hit_latency_seconds` (histogram): latency of calls served from cache
//! - `anvil_cache_miss_total` (counter): calls the cache could not serve
//! - `anvil_circuit_breaker_error_total` (counter): failures seen by circuit breakers
//! - `anvil_circuit_breaker_state` (gauge): 0 closed, 1 half-open, 2 open

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use metrics_exporter_prometheus::{
    BuildError, Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder,
};
use tower::util::BoxCloneService;
use tower::{Layer, Service};

use super::HttpMiddleware;
use super::circuit_breaker::CircuitState;
use crate::{BoxedService, Error, Request, RequestMeta, Response, Result};

/// Labels used for metrics.
const LABEL_METHOD: &str = "method";
const LABEL_CLIENT: &str = "client_name";
const LABEL_PATH: &str = "path";
const LABEL_STATUS: &str = "status_code";
const LABEL_CIRCUIT: &str = "circuit_name";
const LABEL_VERSION: &str = "version";

/// Metric names.
pub const METRIC_INFO: &str = "anvil_info";
/// Latency of remote calls.
pub const METRIC_REQUEST_LATENCY: &str = "anvil_request_latency_seconds";
/// Latency of calls served from cache.
pub const METRIC_CACHE_HIT_LATENCY: &str = "anvil_cache_hit_latency_seconds";
/// Calls the cache could not serve.
pub const METRIC_CACHE_MISS: &str = "anvil_cache_miss_total";
/// Failures seen by circuit breakers.
pub const METRIC_CIRCUIT_ERRORS: &str = "anvil_circuit_breaker_error_total";
/// Circuit breaker state.
pub const METRIC_CIRCUIT_STATE: &str = "anvil_circuit_breaker_state";

/// Default histogram buckets, in seconds.
pub const DEFAULT_BUCKETS: [f64; 10] = [0.05, 0.1, 0.2, 0.4, 0.8, 1.6, 3.2, 6.4, 12.8, 25.6];

/// Histogram buckets of the two latency families.
#[derive(Debug, Clone, PartialEq)]
pub struct PrometheusConfig {
    /// Buckets of `anvil_request_latency_seconds`.
    pub buckets: Vec<f64>,
    /// Buckets of `anvil_cache_hit_latency_seconds`.
    pub hit_cache_buckets: Vec<f64>,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            buckets: DEFAULT_BUCKETS.to_vec(),
            hit_cache_buckets: DEFAULT_BUCKETS.to_vec(),
        }
    }
}

struct PrometheusState {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
    config: PrometheusConfig,
}

/// Prometheus metrics, usable as a middleware and as an observer of other middlewares.
///
/// Cloning is cheap and every clone records into the same registry.
#[derive(Clone)]
pub struct PrometheusMetrics {
    state: Arc<PrometheusState>,
}

impl fmt::Debug for PrometheusMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrometheusMetrics")
            .field("config", &self.state.config)
            .finish_non_exhaustive()
    }
}

impl PrometheusMetrics {
    /// Create the registry and record the info metric.
    ///
    /// # Errors
    ///
    /// Fails when a bucket list is empty.
    pub fn new(config: PrometheusConfig) -> std::result::Result<Self, BuildError> {
        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Full(METRIC_REQUEST_LATENCY.to_string()),
                &config.buckets,
            )?
            .set_buckets_for_metric(
                Matcher::Full(METRIC_CACHE_HIT_LATENCY.to_string()),
                &config.hit_cache_buckets,
            )?
            .build_recorder();
        let handle = recorder.handle();

        let metrics = Self {
            state: Arc::new(PrometheusState {
                recorder,
                handle,
                config,
            }),
        };
        metrics.with_recorder(|| {
            metrics::gauge!(METRIC_INFO, LABEL_VERSION => env!("CARGO_PKG_VERSION")).set(1.0);
        });
        Ok(metrics)
    }

    /// Buckets in use.
    #[must_use]
    pub fn config(&self) -> &PrometheusConfig {
        &self.state.config
    }

    /// Render the registry in the Prometheus text exposition format.
    #[must_use]
    pub fn render(&self) -> String {
        self.state.handle.render()
    }

    fn with_recorder<T>(&self, f: impl FnOnce() -> T) -> T {
        metrics::with_local_recorder(&self.state.recorder, f)
    }

    /// Record the latency of a remote call.
    pub fn observe_request(&self, meta: &RequestMeta, method: &str, status: &str, seconds: f64) {
        self.with_recorder(|| {
            metrics::histogram!(
                METRIC_REQUEST_LATENCY,
                LABEL_METHOD => method.to_string(),
                LABEL_CLIENT => meta.client_name.to_string(),
                LABEL_PATH => meta.path.to_string(),
                LABEL_STATUS => status.to_string()
            )
            .record(seconds);
        });
    }

    /// Record a call served from cache.
    pub fn observe_cache_hit(&self, meta: &RequestMeta, method: &str, status: &str, seconds: f64) {
        self.with_recorder(|| {
            metrics::histogram!(
                METRIC_CACHE_HIT_LATENCY,
                LABEL_METHOD => method.to_string(),
                LABEL_CLIENT => meta.client_name.to_string(),
                LABEL_PATH => meta.path.to_string(),
                LABEL_STATUS => status.to_string()
            )
            .record(seconds);
        });
    }

    /// Record a call the cache could not serve.
    pub fn observe_cache_miss(&self, meta: &RequestMeta, method: &str, status: &str) {
        self.with_recorder(|| {
            metrics::counter!(
                METRIC_CACHE_MISS,
                LABEL_METHOD => method.to_string(),
                LABEL_CLIENT => meta.client_name.to_string(),
                LABEL_PATH => meta.path.to_string(),
                LABEL_STATUS => status.to_string()
            )
            .increment(1);
        });
    }

    /// Record a failure seen by a circuit breaker.
    pub fn observe_circuit_error(&self, circuit: &str) {
        self.with_recorder(|| {
            metrics::counter!(METRIC_CIRCUIT_ERRORS, LABEL_CIRCUIT => circuit.to_string())
                .increment(1);
        });
    }

    /// Record the state of a circuit.
    pub fn observe_circuit_state(&self, circuit: &str, state: CircuitState) {
        self.with_recorder(|| {
            metrics::gauge!(METRIC_CIRCUIT_STATE, LABEL_CIRCUIT => circuit.to_string())
                .set(state.as_gauge());
        });
    }
}

/// Status label of a call outcome.
pub(crate) fn status_label(result: &Result<Response>) -> String {
    match result {
        Ok(response) => response.status().to_string(),
        Err(err) => err
            .status()
            .map_or_else(|| "error".to_string(), |status| status.to_string()),
    }
}

impl<S> Layer<S> for PrometheusMetrics {
    type Service = Prometheus<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Prometheus {
            inner,
            metrics: self.clone(),
        }
    }
}

impl HttpMiddleware for PrometheusMetrics {
    fn wrap(&self, next: BoxedService) -> BoxedService {
        BoxCloneService::new(self.layer(next))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Service that records request latency.
#[derive(Debug, Clone)]
pub struct Prometheus<S> {
    inner: S,
    metrics: PrometheusMetrics,
}

impl<S> Service<Request> for Prometheus<S>
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
        let method = request.method().to_string();
        let meta = request.meta().clone();
        let metrics = self.metrics.clone();
        let start = Instant::now();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let result = inner.call(request).await;
            let status = status_label(&result);
            metrics.observe_request(&meta, &method, &status, start.elapsed().as_secs_f64());
            result
        })
    }
}
