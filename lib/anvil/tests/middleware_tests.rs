//! Integration tests for middleware chains driven by `ClientFactory`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anvil::discovery::StaticDiscovery;
use anvil::middleware::{
    AddHeadersLayer, BearerAuthLayer, CircuitBreakerConfig, CircuitBreakerLayer, CircuitState,
    DefaultCachingPolicy, HttpCacheLayer, HttpMiddleware, InMemoryCache, InMemoryUnitOfWork,
    JsonSerializer, LoggingLayer, PrometheusConfig, PrometheusHook, PrometheusMetrics, ZipkinLayer,
};
use anvil::{ClientFactory, Error, Registry, Resource, ResourceDef};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{header, header_exists, method, path},
};

fn resource(
    server: &MockServer,
    middlewares: Vec<Arc<dyn HttpMiddleware>>,
) -> (ClientFactory, Resource) {
    let mut registry = Registry::new();
    registry.register(ResourceDef::new("api", "item", "item", None).path("/items/{id}"));

    let endpoints = HashMap::from([(("item".to_string(), None), server.uri())]);
    let factory = ClientFactory::builder(Arc::new(StaticDiscovery::new(endpoints)))
        .registry(Arc::new(registry))
        .middlewares(middlewares)
        .build();
    let resource = factory
        .client("api")
        .and_then(|client| client.resource("item"))
        .expect("resource");
    (factory, resource)
}

#[tokio::test]
async fn test_static_and_auth_headers() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/items/1"))
        .and(header("Authorization", "Bearer token"))
        .and(header("X-Source", "tests"))
        .and(header_exists("X-B3-TraceId"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (_, resource) = resource(
        &mock_server,
        vec![
            Arc::new(LoggingLayer::debug()),
            Arc::new(ZipkinLayer::new()),
            Arc::new(BearerAuthLayer::new("token")),
            Arc::new(AddHeadersLayer::new([("X-Source", "tests")])),
        ],
    );

    let response = resource.get(&serde_json::json!({ "id": 1 })).await.expect("response");
    assert!(response.is_success());
}

#[tokio::test]
async fn test_request_middlewares_override_static_ones() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/items/1"))
        .and(header("Accept-Language", "fr"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (factory, _) = resource(
        &mock_server,
        vec![Arc::new(AddHeadersLayer::new([("Accept-Language", "en")]))],
    );

    // The per-request layer sits next to the transport and runs last
    let extended = factory.with_request_middlewares([
        Arc::new(AddHeadersLayer::new([("Accept-Language", "fr")])) as Arc<dyn HttpMiddleware>,
    ]);
    let resource = extended
        .client("api")
        .and_then(|client| client.resource("item"))
        .expect("resource");

    resource.get(&serde_json::json!({ "id": 1 })).await.expect("response");
}

#[tokio::test]
async fn test_circuit_breaker_opens_and_reports() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/items/1"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&mock_server)
        .await;

    let metrics = PrometheusMetrics::new(PrometheusConfig::default()).expect("metrics");
    let breaker = CircuitBreakerLayer::new(
        CircuitBreakerConfig::default()
            .with_threshold(2)
            .with_ttl(Duration::from_secs(60)),
        Arc::new(InMemoryUnitOfWork::new()),
        vec![Arc::new(PrometheusHook::new(metrics.clone()))],
    );
    let (_, resource) = resource(
        &mock_server,
        vec![Arc::new(metrics.clone()), Arc::new(breaker.clone())],
    );

    for _ in 0..2 {
        let err = resource.get(&serde_json::json!({ "id": 1 })).await.expect_err("500");
        assert_eq!(err.status(), Some(500));
    }
    assert_eq!(breaker.circuit_state("api"), CircuitState::Open);

    let err = resource.get(&serde_json::json!({ "id": 1 })).await.expect_err("open");
    assert!(matches!(err, Error::CircuitOpen { ref circuit } if circuit == "api"));

    let rendered = metrics.render();
    assert!(rendered.contains("anvil_circuit_breaker_error_total"), "{rendered}");
    assert!(rendered.contains("anvil_circuit_breaker_state"), "{rendered}");
    assert!(rendered.contains("anvil_request_latency_seconds_bucket"), "{rendered}");
}

#[tokio::test]
async fn test_http_cache_serves_repeated_calls() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/items/1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Cache-Control", "max-age=60")
                .set_body_json(serde_json::json!({ "id": 1 })),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let cache = HttpCacheLayer::new(
        Arc::new(InMemoryCache::new("redis://redis/0").expect("url")),
        Arc::new(DefaultCachingPolicy::default()),
        Arc::new(JsonSerializer),
    );
    let (_, resource) = resource(&mock_server, vec![Arc::new(cache)]);

    for _ in 0..3 {
        let response = resource.get(&serde_json::json!({ "id": 1 })).await.expect("response");
        let body: serde_json::Value = response.json().expect("json");
        assert_eq!(body, serde_json::json!({ "id": 1 }));
    }
}
