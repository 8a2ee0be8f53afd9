//! Client factory and resource calls.
//!
//! A [`ClientFactory`] holds everything needed to reach the resources of one
//! logical client: service discovery, the resource registry, the transport,
//! timeouts, parsers and the ordered middleware chain. It is immutable and
//! cheap to clone; per-request variants are derived with
//! [`ClientFactory::with_request_middlewares`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde_json::Value;
use tower::ServiceExt;

use crate::discovery::ServiceDiscovery;
use crate::middleware::{HttpMiddleware, apply_middlewares};
use crate::parser::{
    Collection, CollectionParser, DefaultCollectionParser, DefaultErrorParser, ErrorParser,
};
use crate::registry::{Registry, ResourceDef};
use crate::{
    ContentType, Error, HttpTimeout, HyperTransport, Method, Request, RequestMeta, Response,
    Result, Transport, TransportConfig, to_json, to_query_string,
};

/// Encodes everything but unreserved characters and sub-delimiters.
const PATH_SEGMENT_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'?')
    .add(b'{')
    .add(b'}')
    .add(b'/')
    .add(b'\\')
    .add(b'%');

// ============================================================================
// Client Factory
// ============================================================================

/// Builds clients of remote services.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
///
/// use anvil::ClientFactory;
/// use anvil::discovery::RouterDiscovery;
///
/// let factory = ClientFactory::builder(Arc::new(RouterDiscovery::default()))
///     .registry(Arc::new(registry))
///     .build();
///
/// let user = factory
///     .client("api")?
///     .resource("user")?
///     .get(&serde_json::json!({ "username": "alice" }))
///     .await?;
/// ```
#[derive(Clone)]
pub struct ClientFactory {
    sd: Arc<dyn ServiceDiscovery>,
    registry: Arc<Registry>,
    transport: Arc<dyn Transport>,
    timeout: HttpTimeout,
    proxies: Option<Arc<HashMap<String, String>>>,
    verify_certificate: bool,
    collection_parser: Arc<dyn CollectionParser>,
    error_parser: Arc<dyn ErrorParser>,
    middlewares: Arc<[Arc<dyn HttpMiddleware>]>,
}

impl fmt::Debug for ClientFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientFactory")
            .field("sd", &self.sd)
            .field("transport", &self.transport)
            .field("timeout", &self.timeout)
            .field("proxies", &self.proxies)
            .field("verify_certificate", &self.verify_certificate)
            .field("middlewares", &self.middlewares.len())
            .finish_non_exhaustive()
    }
}

impl ClientFactory {
    /// Create a builder resolving endpoints with `sd`.
    #[must_use]
    pub fn builder(sd: Arc<dyn ServiceDiscovery>) -> ClientFactoryBuilder {
        ClientFactoryBuilder::new(sd)
    }

    /// Service discovery.
    #[must_use]
    pub fn sd(&self) -> &Arc<dyn ServiceDiscovery> {
        &self.sd
    }

    /// Registered resources.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Transport sending the requests.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Call timeouts.
    #[must_use]
    pub const fn timeout(&self) -> HttpTimeout {
        self.timeout
    }

    /// Proxies by URL prefix.
    #[must_use]
    pub fn proxies(&self) -> Option<&HashMap<String, String>> {
        self.proxies.as_deref()
    }

    /// Whether TLS certificates are verified.
    #[must_use]
    pub const fn verify_certificate(&self) -> bool {
        self.verify_certificate
    }

    /// Parser of collection responses.
    #[must_use]
    pub fn collection_parser(&self) -> &Arc<dyn CollectionParser> {
        &self.collection_parser
    }

    /// Parser of error responses.
    #[must_use]
    pub fn error_parser(&self) -> &Arc<dyn ErrorParser> {
        &self.error_parser
    }

    /// Middlewares, outermost first.
    #[must_use]
    pub fn middlewares(&self) -> &[Arc<dyn HttpMiddleware>] {
        &self.middlewares
    }

    /// A copy of this factory with `extra` middlewares between the existing
    /// chain and the transport, so their headers win over static ones. The
    /// factory itself is left untouched.
    #[must_use]
    pub fn with_request_middlewares(
        &self,
        extra: impl IntoIterator<Item = Arc<dyn HttpMiddleware>>,
    ) -> Self {
        let middlewares = self.middlewares.iter().cloned().chain(extra).collect();
        Self {
            middlewares,
            ..self.clone()
        }
    }

    /// Client of the resources registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnregisteredClient`] if no resource is registered for
    /// that client.
    pub fn client(&self, name: &str) -> Result<Client> {
        if self.registry.client(name).is_none() {
            return Err(Error::UnregisteredClient(name.to_string()));
        }
        Ok(Client {
            name: Arc::from(name),
            factory: self.clone(),
        })
    }

    async fn send(&self, request: Request) -> Result<Response> {
        let service = apply_middlewares(&self.middlewares, self.transport.service());
        let client_name = Arc::clone(&request.meta().client_name);
        let response = service.oneshot(request).await?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(self.error_parser.parse(&client_name, response))
        }
    }
}

/// Builder for [`ClientFactory`].
#[derive(Debug)]
pub struct ClientFactoryBuilder {
    sd: Arc<dyn ServiceDiscovery>,
    registry: Arc<Registry>,
    transport: Option<Arc<dyn Transport>>,
    timeout: HttpTimeout,
    proxies: Option<HashMap<String, String>>,
    verify_certificate: bool,
    collection_parser: Arc<dyn CollectionParser>,
    error_parser: Arc<dyn ErrorParser>,
    middlewares: Vec<Arc<dyn HttpMiddleware>>,
}

impl ClientFactoryBuilder {
    fn new(sd: Arc<dyn ServiceDiscovery>) -> Self {
        Self {
            sd,
            registry: Arc::default(),
            transport: None,
            timeout: HttpTimeout::default(),
            proxies: None,
            verify_certificate: true,
            collection_parser: Arc::new(DefaultCollectionParser),
            error_parser: Arc::new(DefaultErrorParser),
            middlewares: Vec::new(),
        }
    }

    /// Set the resource registry.
    #[must_use]
    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = registry;
        self
    }

    /// Set the transport. Defaults to a [`HyperTransport`] configured from
    /// the timeout, proxies and certificate settings of this builder.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the call timeouts.
    #[must_use]
    pub const fn timeout(mut self, timeout: HttpTimeout) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the proxies by URL prefix.
    #[must_use]
    pub fn proxies(mut self, proxies: Option<HashMap<String, String>>) -> Self {
        self.proxies = proxies;
        self
    }

    /// Enable or disable TLS certificate verification.
    #[must_use]
    pub const fn verify_certificate(mut self, verify: bool) -> Self {
        self.verify_certificate = verify;
        self
    }

    /// Set the collection parser.
    #[must_use]
    pub fn collection_parser(mut self, parser: Arc<dyn CollectionParser>) -> Self {
        self.collection_parser = parser;
        self
    }

    /// Set the error parser.
    #[must_use]
    pub fn error_parser(mut self, parser: Arc<dyn ErrorParser>) -> Self {
        self.error_parser = parser;
        self
    }

    /// Append a middleware, inside the ones already added.
    #[must_use]
    pub fn middleware(mut self, middleware: Arc<dyn HttpMiddleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Append several middlewares, in order.
    #[must_use]
    pub fn middlewares(
        mut self,
        middlewares: impl IntoIterator<Item = Arc<dyn HttpMiddleware>>,
    ) -> Self {
        self.middlewares.extend(middlewares);
        self
    }

    /// Transport configuration matching the timeout, proxies and
    /// certificate verification set so far.
    #[must_use]
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig::builder()
            .connect_timeout(self.timeout.connect)
            .proxies(self.proxies.clone())
            .verify_certificate(self.verify_certificate)
            .build()
    }

    /// Build the factory.
    #[must_use]
    pub fn build(mut self) -> ClientFactory {
        let transport = match self.transport.take() {
            Some(transport) => transport,
            None => Arc::new(HyperTransport::new(self.transport_config())),
        };

        ClientFactory {
            sd: self.sd,
            registry: self.registry,
            transport,
            timeout: self.timeout,
            proxies: self.proxies.map(Arc::new),
            verify_certificate: self.verify_certificate,
            collection_parser: self.collection_parser,
            error_parser: self.error_parser,
            middlewares: self.middlewares.into(),
        }
    }
}

// ============================================================================
// Client & Resource
// ============================================================================

/// Resources of one logical client.
#[derive(Debug, Clone)]
pub struct Client {
    name: Arc<str>,
    factory: ClientFactory,
}

impl Client {
    /// Client name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A registered resource of this client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnregisteredResource`] if the resource is unknown.
    pub fn resource(&self, name: &str) -> Result<Resource> {
        let def = self.factory.registry.get(&self.name, name)?.clone();
        Ok(Resource {
            client: self.clone(),
            def,
        })
    }
}

/// A remote resource.
///
/// Parameters are any serializable struct or map: fields matching a
/// `{placeholder}` of the path template are substituted, the others are sent
/// in the query string.
#[derive(Debug, Clone)]
pub struct Resource {
    client: Client,
    def: ResourceDef,
}

impl Resource {
    /// Declaration of the resource.
    #[must_use]
    pub const fn def(&self) -> &ResourceDef {
        &self.def
    }

    /// `GET` on the item path.
    pub async fn get<P: serde::Serialize + ?Sized>(&self, params: &P) -> Result<Response> {
        self.call(Method::Get, params, None).await
    }

    /// `DELETE` on the item path.
    pub async fn delete<P: serde::Serialize + ?Sized>(&self, params: &P) -> Result<Response> {
        self.call(Method::Delete, params, None).await
    }

    /// `POST` a JSON body on the item path.
    pub async fn post<P, B>(&self, params: &P, body: &B) -> Result<Response>
    where
        P: serde::Serialize + ?Sized,
        B: serde::Serialize + ?Sized,
    {
        self.call(Method::Post, params, Some(to_json(body)?)).await
    }

    /// `PUT` a JSON body on the item path.
    pub async fn put<P, B>(&self, params: &P, body: &B) -> Result<Response>
    where
        P: serde::Serialize + ?Sized,
        B: serde::Serialize + ?Sized,
    {
        self.call(Method::Put, params, Some(to_json(body)?)).await
    }

    /// `PATCH` a JSON body on the item path.
    pub async fn patch<P, B>(&self, params: &P, body: &B) -> Result<Response>
    where
        P: serde::Serialize + ?Sized,
        B: serde::Serialize + ?Sized,
    {
        self.call(Method::Patch, params, Some(to_json(body)?)).await
    }

    /// `GET` on the collection path, parsed by the collection parser.
    pub async fn collection_get<P: serde::Serialize + ?Sized>(
        &self,
        params: &P,
    ) -> Result<Collection> {
        let template = self.template(self.def.collection_path.as_deref(), "collection path")?;
        let response = self.send(Method::Get, template, params, None).await?;
        self.client.factory.collection_parser.parse(&response)
    }

    /// Call the item path with any method and an optional JSON body.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource has no item path, a path parameter
    /// is missing, discovery fails, or the call fails.
    pub async fn call<P: serde::Serialize + ?Sized>(
        &self,
        method: Method,
        params: &P,
        body: Option<Bytes>,
    ) -> Result<Response> {
        let template = self.template(self.def.path.as_deref(), "path")?;
        self.send(method, template, params, body).await
    }

    fn template<'a>(&self, template: Option<&'a str>, kind: &str) -> Result<&'a str> {
        template.ok_or_else(|| {
            Error::invalid_request(format!(
                "resource {} of client {} has no {kind}",
                self.def.resource, self.def.client_name
            ))
        })
    }

    async fn send<P: serde::Serialize + ?Sized>(
        &self,
        method: Method,
        template: &str,
        params: &P,
        body: Option<Bytes>,
    ) -> Result<Response> {
        let factory = &self.client.factory;
        let (path, query) = bind_params(template, params)?;
        let endpoint = factory
            .sd
            .get_endpoint(&self.def.service, self.def.version.as_deref())
            .await?;

        let mut url = format!("{}{path}", endpoint.trim_end_matches('/'));
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query);
        }
        let url = url::Url::parse(&url)?;

        let mut builder = Request::builder(method, url).meta(RequestMeta {
            client_name: Arc::clone(&self.client.name),
            path: Arc::from(template),
            timeout: factory.timeout,
        });
        if let Some(body) = body {
            builder = builder
                .header("Content-Type", ContentType::Json.as_str())
                .body(body);
        }

        tracing::debug!(
            client = %self.client.name,
            resource = %self.def.resource,
            %method,
            "calling resource"
        );
        factory.send(builder.build()).await
    }
}

/// Substitutes path placeholders with `params`, and encodes the remaining
/// parameters as a query string.
fn bind_params<P: serde::Serialize + ?Sized>(
    template: &str,
    params: &P,
) -> Result<(String, String)> {
    let mut fields = match serde_json::to_value(params)? {
        Value::Object(fields) => fields,
        Value::Null => serde_json::Map::new(),
        other => {
            return Err(Error::invalid_request(format!(
                "parameters must be an object, got {other}"
            )));
        }
    };

    let mut path = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let Some(len) = rest[start..].find('}') else {
            break;
        };
        let name = &rest[start + 1..start + len];
        let value = fields
            .remove(name)
            .and_then(|value| scalar(&value))
            .ok_or_else(|| Error::invalid_request(format!("missing path parameter {name}")))?;
        path.push_str(&rest[..start]);
        path.push_str(&utf8_percent_encode(&value, PATH_SEGMENT_ENCODE_SET).to_string());
        rest = &rest[start + len + 1..];
    }
    path.push_str(rest);

    let mut pairs = Vec::new();
    for (name, value) in fields {
        match value {
            Value::Array(values) => {
                pairs.extend(values.iter().filter_map(scalar).map(|v| (name.clone(), v)));
            }
            value => pairs.extend(scalar(&value).map(|v| (name, v))),
        }
    }
    let query = to_query_string(&pairs)?;

    Ok((path, query))
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(value) => Some(value.clone()),
        Value::Number(value) => Some(value.to_string()),
        Value::Bool(value) => Some(value.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::discovery::StaticDiscovery;
    use crate::middleware::AddHeadersLayer;

    #[test]
    fn bind_path_and_query() {
        let (path, query) = bind_params(
            "/users/{username}/posts/{id}",
            &json!({
                "username": "jane doe",
                "id": 42,
                "sort": "asc",
                "tags": ["a", "b"],
                "skip": null,
            }),
        )
        .expect("bind");

        assert_eq!(path, "/users/jane%20doe/posts/42");
        assert_eq!(query, "sort=asc&tags=a&tags=b");
    }

    #[test]
    fn bind_encodes_slashes() {
        let (path, _) = bind_params("/files/{name}", &json!({ "name": "a/b" })).expect("bind");
        assert_eq!(path, "/files/a%2Fb");
    }

    #[test]
    fn bind_requires_path_parameters() {
        let err = bind_params("/users/{username}", &json!({})).expect_err("missing");
        assert_eq!(err.to_string(), "invalid request: missing path parameter username");
    }

    #[test]
    fn bind_rejects_scalars() {
        assert!(bind_params("/users", &42).is_err());
        let (path, query) = bind_params("/users", &()).expect("unit");
        assert_eq!(path, "/users");
        assert_eq!(query, "");
    }

    fn factory() -> ClientFactory {
        let mut registry = Registry::new();
        registry.register(ResourceDef::new("api", "user", "user", Some("v1")).path("/users/{id}"));
        ClientFactory::builder(Arc::new(StaticDiscovery::new(HashMap::new())))
            .registry(Arc::new(registry))
            .middleware(Arc::new(AddHeadersLayer::new([("X-Static", "1")])))
            .build()
    }

    #[test]
    fn builder_defaults() {
        let factory = factory();

        assert_eq!(factory.timeout(), HttpTimeout::from_secs(30, 15));
        assert!(factory.proxies().is_none());
        assert!(factory.verify_certificate());
        assert!(factory.transport().as_any().is::<HyperTransport>());
        assert!(factory.collection_parser().as_any().is::<DefaultCollectionParser>());
        assert!(factory.error_parser().as_any().is::<DefaultErrorParser>());
        assert_eq!(factory.middlewares().len(), 1);
    }

    #[test]
    fn transport_config_follows_builder() {
        let proxies = HashMap::from([("http://".to_string(), "http://proxy:3128".to_string())]);
        let builder = ClientFactory::builder(Arc::new(StaticDiscovery::new(HashMap::new())))
            .timeout(HttpTimeout::from_secs(10, 2))
            .proxies(Some(proxies.clone()))
            .verify_certificate(false);

        let config = builder.transport_config();
        assert_eq!(config.connect_timeout, std::time::Duration::from_secs(2));
        assert_eq!(config.proxies, Some(proxies));
        assert!(!config.verify_certificate);

        let factory = builder.build();
        let transport = factory
            .transport()
            .as_any()
            .downcast_ref::<HyperTransport>()
            .expect("hyper transport");
        assert_eq!(transport.config(), &config);
    }

    #[test]
    fn request_middlewares_are_innermost() {
        let factory = factory();
        let extended = factory.with_request_middlewares([
            Arc::new(AddHeadersLayer::new([("X-Request", "1")])) as Arc<dyn HttpMiddleware>,
        ]);

        assert_eq!(factory.middlewares().len(), 1);
        assert_eq!(extended.middlewares().len(), 2);
        let last = extended
            .middlewares()
            .last()
            .and_then(|m| m.as_any().downcast_ref::<AddHeadersLayer>())
            .expect("headers");
        assert_eq!(last.headers(), &[("X-Request".to_string(), "1".to_string())]);
        assert!(Arc::ptr_eq(factory.transport(), extended.transport()));
    }

    #[test]
    fn unknown_client_and_resource() {
        let factory = factory();

        let err = factory.client("billing").expect_err("unknown client");
        assert_eq!(err.to_string(), "client billing is not registered");

        let client = factory.client("api").expect("client");
        assert_eq!(client.name(), "api");
        assert!(client.resource("user").is_ok());
        let err = client.resource("group").expect_err("unknown resource");
        assert_eq!(err.to_string(), "resource group is not registered for client api");
    }
}
