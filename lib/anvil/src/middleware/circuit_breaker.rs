//! Circuit breaker middleware for fault tolerance.
//!
//! One circuit exists per client name. The state of every circuit lives in a
//! [`UnitOfWork`], so several processes may share it when the unit of work is
//! backed by a shared store.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tower::util::BoxCloneService;
use tower::{Layer, Service};

use super::HttpMiddleware;
use super::metrics::PrometheusMetrics;
use crate::{BoxedService, Error, Request, Response, Result};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally.
    #[default]
    Closed,
    /// Circuit is open, requests are rejected immediately.
    Open,
    /// Circuit is half-open, the next request decides whether it closes.
    HalfOpen,
}

impl CircuitState {
    /// Gauge value exported for the state.
    #[must_use]
    pub const fn as_gauge(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub threshold: u32,
    /// Duration the circuit stays open before transitioning to half-open.
    pub ttl: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            ttl: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Set the failure threshold.
    #[must_use]
    pub const fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Set the open duration.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

// ============================================================================
// Unit of Work
// ============================================================================

/// Persisted state of one circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CircuitRecord {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failure count.
    pub failures: u32,
    /// When the circuit last opened.
    pub opened_at: Option<Instant>,
}

/// Storage of circuit records.
///
/// `transact` must run the update atomically with respect to other updates
/// of the same circuit.
pub trait UnitOfWork: Send + Sync + fmt::Debug + 'static {
    /// Load the record of `circuit`, let `update` modify it, store it back.
    fn transact(&self, circuit: &str, update: &mut dyn FnMut(&mut CircuitRecord));

    /// Access to the concrete type, for introspection.
    fn as_any(&self) -> &dyn Any;
}

/// Process-local unit of work.
#[derive(Debug, Default)]
pub struct InMemoryUnitOfWork {
    circuits: Mutex<HashMap<String, CircuitRecord>>,
}

impl InMemoryUnitOfWork {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl UnitOfWork for InMemoryUnitOfWork {
    fn transact(&self, circuit: &str, update: &mut dyn FnMut(&mut CircuitRecord)) {
        let mut circuits = self
            .circuits
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        update(circuits.entry(circuit.to_string()).or_default());
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// Listeners
// ============================================================================

/// Observer of circuit events.
pub trait CircuitListener: Send + Sync + fmt::Debug + 'static {
    /// A call counted as a failure.
    fn on_failure(&self, circuit: &str);

    /// A circuit changed state.
    fn on_state_change(&self, circuit: &str, state: CircuitState);

    /// Access to the concrete type, for introspection.
    fn as_any(&self) -> &dyn Any;
}

/// Exports circuit events as Prometheus metrics.
#[derive(Debug, Clone)]
pub struct PrometheusHook {
    metrics: PrometheusMetrics,
}

impl PrometheusHook {
    /// Create a hook recording into `metrics`.
    #[must_use]
    pub const fn new(metrics: PrometheusMetrics) -> Self {
        Self { metrics }
    }

    /// The metrics the hook records into.
    #[must_use]
    pub const fn metrics(&self) -> &PrometheusMetrics {
        &self.metrics
    }
}

impl CircuitListener for PrometheusHook {
    fn on_failure(&self, circuit: &str) {
        self.metrics.observe_circuit_error(circuit);
    }

    fn on_state_change(&self, circuit: &str, state: CircuitState) {
        self.metrics.observe_circuit_state(circuit, state);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// Breaker
// ============================================================================

#[derive(Debug)]
struct Breaker {
    config: CircuitBreakerConfig,
    uow: Arc<dyn UnitOfWork>,
    listeners: Vec<Arc<dyn CircuitListener>>,
}

impl Breaker {
    fn notify_state(&self, circuit: &str, state: CircuitState) {
        tracing::info!(circuit, ?state, "circuit state changed");
        for listener in &self.listeners {
            listener.on_state_change(circuit, state);
        }
    }

    fn allow_request(&self, circuit: &str) -> bool {
        let ttl = self.config.ttl;
        let mut allowed = true;
        let mut transition = None;
        self.uow.transact(circuit, &mut |record: &mut CircuitRecord| {
            allowed = match record.state {
                CircuitState::Closed | CircuitState::HalfOpen => true,
                CircuitState::Open => {
                    let elapsed = record.opened_at.map_or(ttl, |opened| opened.elapsed());
                    if elapsed >= ttl {
                        record.state = CircuitState::HalfOpen;
                        transition = Some(CircuitState::HalfOpen);
                        true
                    } else {
                        false
                    }
                }
            };
        });
        if let Some(state) = transition {
            self.notify_state(circuit, state);
        }
        allowed
    }

    fn record_success(&self, circuit: &str) {
        let mut transition = None;
        self.uow.transact(circuit, &mut |record: &mut CircuitRecord| {
            record.failures = 0;
            if record.state == CircuitState::HalfOpen {
                record.state = CircuitState::Closed;
                record.opened_at = None;
                transition = Some(CircuitState::Closed);
            }
        });
        if let Some(state) = transition {
            self.notify_state(circuit, state);
        }
    }

    fn record_failure(&self, circuit: &str) {
        for listener in &self.listeners {
            listener.on_failure(circuit);
        }

        let threshold = self.config.threshold;
        let mut transition = None;
        self.uow.transact(circuit, &mut |record: &mut CircuitRecord| match record.state {
            CircuitState::Closed => {
                record.failures = record.failures.saturating_add(1);
                if record.failures >= threshold {
                    record.state = CircuitState::Open;
                    record.opened_at = Some(Instant::now());
                    transition = Some(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                record.state = CircuitState::Open;
                record.opened_at = Some(Instant::now());
                transition = Some(CircuitState::Open);
            }
            CircuitState::Open => {}
        });
        if let Some(state) = transition {
            self.notify_state(circuit, state);
        }
    }

    fn state(&self, circuit: &str) -> CircuitState {
        let mut state = CircuitState::Closed;
        self.uow.transact(circuit, &mut |record: &mut CircuitRecord| state = record.state);
        state
    }
}

/// Calls that count against a circuit.
fn is_failure(result: &Result<Response>) -> bool {
    match result {
        Ok(response) => response.is_server_error(),
        Err(Error::Http { status, .. }) => *status >= 500,
        Err(_) => true,
    }
}

/// Layer that applies circuit breaker pattern to requests.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// use anvil::middleware::{CircuitBreakerConfig, CircuitBreakerLayer, InMemoryUnitOfWork};
///
/// let config = CircuitBreakerConfig::default()
///     .with_threshold(3)
///     .with_ttl(Duration::from_secs(60));
/// let layer = CircuitBreakerLayer::new(config, Arc::new(InMemoryUnitOfWork::new()), Vec::new());
/// ```
#[derive(Debug, Clone)]
pub struct CircuitBreakerLayer {
    breaker: Arc<Breaker>,
}

impl CircuitBreakerLayer {
    /// Create a new circuit breaker layer.
    #[must_use]
    pub fn new(
        config: CircuitBreakerConfig,
        uow: Arc<dyn UnitOfWork>,
        listeners: Vec<Arc<dyn CircuitListener>>,
    ) -> Self {
        Self {
            breaker: Arc::new(Breaker {
                config,
                uow,
                listeners,
            }),
        }
    }

    /// Thresholds in use.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.breaker.config
    }

    /// Store of the circuit records.
    #[must_use]
    pub fn uow(&self) -> &Arc<dyn UnitOfWork> {
        &self.breaker.uow
    }

    /// Attached observers.
    #[must_use]
    pub fn listeners(&self) -> &[Arc<dyn CircuitListener>] {
        &self.breaker.listeners
    }

    /// Current state of a circuit.
    #[must_use]
    pub fn circuit_state(&self, circuit: &str) -> CircuitState {
        self.breaker.state(circuit)
    }
}

impl<S> Layer<S> for CircuitBreakerLayer {
    type Service = CircuitBreaker<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CircuitBreaker {
            inner,
            breaker: Arc::clone(&self.breaker),
        }
    }
}

impl HttpMiddleware for CircuitBreakerLayer {
    fn wrap(&self, next: BoxedService) -> BoxedService {
        BoxCloneService::new(self.layer(next))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Service that applies circuit breaker pattern to requests.
#[derive(Debug, Clone)]
pub struct CircuitBreaker<S> {
    inner: S,
    breaker: Arc<Breaker>,
}

impl<S> CircuitBreaker<S> {
    /// Get the current state of a circuit.
    #[must_use]
    pub fn circuit_state(&self, circuit: &str) -> CircuitState {
        self.breaker.state(circuit)
    }
}

impl<S> Service<Request> for CircuitBreaker<S>
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
        let breaker = Arc::clone(&self.breaker);
        let circuit = request.meta().client_name.to_string();

        if !breaker.allow_request(&circuit) {
            return Box::pin(async move { Err(Error::CircuitOpen { circuit }) });
        }

        let mut inner = self.inner.clone();

        Box::pin(async move {
            let result = inner.call(request).await;

            if is_failure(&result) {
                breaker.record_failure(&circuit);
            } else {
                breaker.record_success(&circuit);
            }

            result
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use bytes::Bytes;
    use tower::ServiceExt;

    use super::*;
    use crate::middleware::PrometheusConfig;
    use crate::{Method, RequestMeta};

    /// Mock service that returns configurable responses.
    #[derive(Clone)]
    struct MockService {
        status: u16,
        call_count: Arc<AtomicU32>,
        should_error: bool,
    }

    impl MockService {
        fn new(status: u16) -> Self {
            Self {
                status,
                call_count: Arc::new(AtomicU32::new(0)),
                should_error: false,
            }
        }

        fn with_error() -> Self {
            Self {
                status: 0,
                call_count: Arc::new(AtomicU32::new(0)),
                should_error: true,
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
            self.call_count.fetch_add(1, Ordering::SeqCst);
            let status = self.status;
            let should_error = self.should_error;

            Box::pin(async move {
                if should_error {
                    Err(Error::connection("mock error"))
                } else {
                    Ok(Response::new(status, HashMap::new(), Bytes::new()))
                }
            })
        }
    }

    fn create_request(client_name: &str) -> Request {
        let url = url::Url::parse("https://example.com/test").expect("valid url");
        Request::builder(Method::Get, url)
            .meta(RequestMeta {
                client_name: Arc::from(client_name),
                ..RequestMeta::default()
            })
            .build()
    }

    fn layer(config: CircuitBreakerConfig) -> CircuitBreakerLayer {
        CircuitBreakerLayer::new(config, Arc::new(InMemoryUnitOfWork::new()), Vec::new())
    }

    #[test]
    fn circuit_breaker_config_default() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.threshold, 5);
        assert_eq!(config.ttl, Duration::from_secs(30));
    }

    #[test]
    fn circuit_breaker_config_builder() {
        let config = CircuitBreakerConfig::default()
            .with_threshold(10)
            .with_ttl(Duration::from_secs(42));

        assert_eq!(config.threshold, 10);
        assert_eq!(config.ttl, Duration::from_secs(42));
    }

    #[tokio::test]
    async fn circuit_breaker_success_stays_closed() {
        let mock = MockService::new(200);
        let layer = layer(CircuitBreakerConfig::default().with_threshold(3));
        let mut service = layer.layer(mock.clone());

        for _ in 0..5 {
            let result = service
                .ready()
                .await
                .expect("ready")
                .call(create_request("api"))
                .await;
            assert!(result.is_ok());
            assert_eq!(service.circuit_state("api"), CircuitState::Closed);
        }

        assert_eq!(mock.call_count(), 5);
    }

    #[tokio::test]
    async fn circuit_breaker_opens_after_failures() {
        let mock = MockService::with_error();
        let layer = layer(
            CircuitBreakerConfig::default()
                .with_threshold(3)
                .with_ttl(Duration::from_secs(60)),
        );
        let mut service = layer.layer(mock.clone());

        for i in 0..3 {
            let result = service
                .ready()
                .await
                .expect("ready")
                .call(create_request("api"))
                .await;
            assert!(result.is_err(), "request {i} should fail");
        }

        assert_eq!(service.circuit_state("api"), CircuitState::Open);
        assert_eq!(mock.call_count(), 3);

        // Rejected without calling the inner service
        let err = service
            .ready()
            .await
            .expect("ready")
            .call(create_request("api"))
            .await
            .expect_err("circuit open");
        assert!(err.is_circuit_open());
        assert_eq!(err.to_string(), "circuit api is open");
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn circuits_are_isolated_per_client() {
        let mock = MockService::new(503);
        let layer = layer(CircuitBreakerConfig::default().with_threshold(1));
        let mut service = layer.layer(mock);

        let result = service
            .ready()
            .await
            .expect("ready")
            .call(create_request("api"))
            .await;
        assert!(result.is_ok()); // Response received, but it's a 5xx

        assert_eq!(layer.circuit_state("api"), CircuitState::Open);
        assert_eq!(layer.circuit_state("notif"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn circuit_breaker_closes_from_half_open_on_success() {
        #[derive(Clone)]
        struct SwitchableMock {
            fail_count: Arc<AtomicU32>,
            max_failures: u32,
        }

        impl Service<Request> for SwitchableMock {
            type Response = Response;
            type Error = Error;
            type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

            fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
                Poll::Ready(Ok(()))
            }

            fn call(&mut self, _request: Request) -> Self::Future {
                let count = self.fail_count.fetch_add(1, Ordering::SeqCst);
                let should_fail = count < self.max_failures;

                Box::pin(async move {
                    if should_fail {
                        Err(Error::connection("mock error"))
                    } else {
                        Ok(Response::new(200, HashMap::new(), Bytes::new()))
                    }
                })
            }
        }

        let mock = SwitchableMock {
            fail_count: Arc::new(AtomicU32::new(0)),
            max_failures: 1,
        };
        let layer = layer(
            CircuitBreakerConfig::default()
                .with_threshold(1)
                .with_ttl(Duration::from_millis(10)),
        );
        let mut service = layer.layer(mock);

        let _ = service
            .ready()
            .await
            .expect("ready")
            .call(create_request("api"))
            .await;
        assert_eq!(service.circuit_state("api"), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = service
            .ready()
            .await
            .expect("ready")
            .call(create_request("api"))
            .await;
        assert!(result.is_ok());
        assert_eq!(service.circuit_state("api"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn client_errors_do_not_count() {
        let mock = MockService::new(404);
        let layer = layer(CircuitBreakerConfig::default().with_threshold(1));
        let service = layer.layer(mock);

        let response = service.oneshot(create_request("api")).await.expect("response");
        assert_eq!(response.status(), 404);
        assert_eq!(layer.circuit_state("api"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn prometheus_hook_records_transitions() {
        let metrics = PrometheusMetrics::new(PrometheusConfig::default()).expect("metrics");
        let layer = CircuitBreakerLayer::new(
            CircuitBreakerConfig::default().with_threshold(1),
            Arc::new(InMemoryUnitOfWork::new()),
            vec![Arc::new(PrometheusHook::new(metrics.clone()))],
        );
        assert_eq!(layer.listeners().len(), 1);

        let service = layer.layer(MockService::with_error());
        let _ = service.oneshot(create_request("api")).await;

        let rendered = metrics.render();
        assert!(
            rendered.contains("anvil_circuit_breaker_state{circuit_name=\"api\"} 2"),
            "{rendered}"
        );
        assert!(
            rendered.contains("anvil_circuit_breaker_error_total{circuit_name=\"api\"} 1"),
            "{rendered}"
        );
    }
}
