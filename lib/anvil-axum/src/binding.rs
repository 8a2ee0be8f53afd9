//! The binding: every configured client, assembled once at startup.
//!
//! ```toml
//! [anvil]
//! clients = ["api", "billing"]
//! scan = ["users"]
//!
//! [anvil.api]
//! service_discovery = "router"
//! middlewares = "prometheus\ncircuitbreaker"
//! middleware_factories = "accept_language"
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock};

use anvil::middleware::{HttpMiddleware, PrometheusMetrics};
use anvil::{ClientFactory, Registry};

use crate::client_settings::{AssemblyContext, ClientOverrides, build_client_factory};
use crate::entry_point::EntryPoints;
use crate::error::{ConfigurationError, UnknownClient};
use crate::middleware::MetricsSlot;
use crate::middleware_factory::{IncomingRequest, MiddlewareFactory, build_middleware_factories};
use crate::settings::{Settings, as_list};

/// Default root of the settings keys.
pub const DEFAULT_ROOT: &str = "anvil";

/// Client declared when `<root>.clients` is absent.
pub const DEFAULT_CLIENT: &str = "client";

/// Client factories and per-request middleware factories, by client name.
pub struct AnvilBinding {
    root: String,
    registry: Arc<Registry>,
    factories: BTreeMap<String, ClientFactory>,
    middleware_factories: HashMap<String, Vec<Arc<dyn MiddlewareFactory>>>,
    metrics: MetricsSlot,
}

impl fmt::Debug for AnvilBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnvilBinding")
            .field("root", &self.root)
            .field("clients", &self.factories.keys().collect::<Vec<_>>())
            .field("metrics", &self.metrics.get().is_some())
            .finish_non_exhaustive()
    }
}

impl AnvilBinding {
    /// Start configuring a binding from `settings`.
    #[must_use]
    pub fn builder(settings: Settings) -> AnvilBindingBuilder {
        AnvilBindingBuilder {
            settings,
            root: DEFAULT_ROOT.to_string(),
            entry_points: EntryPoints::default(),
            overrides: HashMap::new(),
            metrics: MetricsSlot::process_wide(),
        }
    }

    /// A binding with the built-in entry points.
    ///
    /// # Errors
    ///
    /// See [`AnvilBindingBuilder::build`].
    pub fn from_settings(settings: Settings) -> Result<Self, ConfigurationError> {
        Self::builder(settings).build()
    }

    /// Root of the settings keys.
    #[must_use]
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Declared client names, sorted.
    pub fn client_names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Shared factory of a client, without per-request middlewares.
    #[must_use]
    pub fn factory(&self, name: &str) -> Option<&ClientFactory> {
        self.factories.get(name)
    }

    /// Per-request middleware factories of a client, in declaration order.
    #[must_use]
    pub fn middleware_factories(&self, name: &str) -> &[Arc<dyn MiddlewareFactory>] {
        self.middleware_factories.get(name).map_or(&[], Vec::as_slice)
    }

    /// Resources registered by the scanned contract modules.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Prometheus metrics, when a client declares them.
    #[must_use]
    pub fn metrics(&self) -> Option<&Arc<PrometheusMetrics>> {
        self.metrics.get()
    }

    /// Prometheus text exposition of the metrics, when a client declares them.
    #[must_use]
    pub fn render_metrics(&self) -> Option<String> {
        self.metrics().map(|metrics| metrics.render())
    }

    /// Client accessor for one incoming request.
    #[must_use]
    pub fn for_request(self: &Arc<Self>, request: IncomingRequest) -> Clients {
        let bound = self
            .factories
            .keys()
            .map(|name| (name.clone(), OnceLock::new()))
            .collect();
        Clients {
            inner: Arc::new(ClientsInner {
                binding: Arc::clone(self),
                request,
                bound,
            }),
        }
    }
}

/// Builder for [`AnvilBinding`].
#[derive(Debug)]
pub struct AnvilBindingBuilder {
    settings: Settings,
    root: String,
    entry_points: EntryPoints,
    overrides: HashMap<String, ClientOverrides>,
    metrics: MetricsSlot,
}

impl AnvilBindingBuilder {
    /// Root of the settings keys, `anvil` by default.
    #[must_use]
    pub fn root(mut self, root: impl Into<String>) -> Self {
        self.root = root.into();
        self
    }

    /// Entry points used to resolve references.
    #[must_use]
    pub fn entry_points(mut self, entry_points: EntryPoints) -> Self {
        self.entry_points = entry_points;
        self
    }

    /// Where the prometheus middleware lives, [`MetricsSlot::process_wide`] by default.
    #[must_use]
    pub fn metrics(mut self, metrics: MetricsSlot) -> Self {
        self.metrics = metrics;
        self
    }

    /// Collaborators of the client `name` given as objects.
    #[must_use]
    pub fn overrides(mut self, name: impl Into<String>, overrides: ClientOverrides) -> Self {
        self.overrides.insert(name.into(), overrides);
        self
    }

    /// Assemble every declared client.
    ///
    /// # Errors
    ///
    /// Fails on the first invalid setting.
    pub fn build(self) -> Result<AnvilBinding, ConfigurationError> {
        let Self {
            settings,
            root,
            entry_points,
            overrides,
            metrics,
        } = self;

        let mut registry = Registry::new();
        if let Some(modules) = settings.get(&format!("{root}.scan")) {
            entry_points.scan(&as_list(modules), &mut registry)?;
        }
        let registry = Arc::new(registry);

        let names = settings
            .get(&format!("{root}.clients"))
            .map(as_list)
            .filter(|names| !names.is_empty())
            .unwrap_or_else(|| vec![DEFAULT_CLIENT.to_string()]);

        let no_overrides = ClientOverrides::default();
        let mut factories = BTreeMap::new();
        let mut middleware_factories = HashMap::new();
        for name in names {
            let prefix = format!("{root}.{name}");
            let ctx = AssemblyContext {
                settings: &settings,
                entry_points: &entry_points,
                registry: &registry,
                metrics: &metrics,
            };
            let client_overrides = overrides.get(&name).unwrap_or(&no_overrides);
            let factory = build_client_factory(ctx, &prefix, client_overrides)?;
            let request_factories = build_middleware_factories(&settings, &prefix, &entry_points)?;

            factories.insert(name.clone(), factory);
            middleware_factories.insert(name, request_factories);
        }

        Ok(AnvilBinding {
            root,
            registry,
            factories,
            middleware_factories,
            metrics,
        })
    }
}

/// Clients of one request.
///
/// The first access to a name binds the request's middlewares on top of the
/// shared factory; later accesses reuse that client. Cloning shares the memo.
#[derive(Debug, Clone)]
pub struct Clients {
    inner: Arc<ClientsInner>,
}

#[derive(Debug)]
struct ClientsInner {
    binding: Arc<AnvilBinding>,
    request: IncomingRequest,
    bound: HashMap<String, OnceLock<ClientFactory>>,
}

impl Clients {
    /// Client factory `name`, with this request's middlewares.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownClient`] if `name` was not declared.
    pub fn get(&self, name: &str) -> Result<ClientFactory, UnknownClient> {
        let inner = &self.inner;
        let (Some(slot), Some(factory)) = (inner.bound.get(name), inner.binding.factory(name))
        else {
            return Err(UnknownClient {
                name: name.to_string(),
            });
        };

        let bound = slot.get_or_init(|| {
            let middlewares: Vec<Arc<dyn HttpMiddleware>> = inner
                .binding
                .middleware_factories(name)
                .iter()
                .map(|factory| factory.create(&inner.request))
                .collect();
            if middlewares.is_empty() {
                factory.clone()
            } else {
                tracing::debug!(
                    client = name,
                    count = middlewares.len(),
                    "binding request middlewares"
                );
                factory.with_request_middlewares(middlewares)
            }
        });
        Ok(bound.clone())
    }

    /// The incoming request the clients are bound to.
    #[must_use]
    pub fn request(&self) -> &IncomingRequest {
        &self.inner.request
    }

    /// The binding the clients come from.
    #[must_use]
    pub fn binding(&self) -> &Arc<AnvilBinding> {
        &self.inner.binding
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anvil::ResourceDef;
    use anvil::middleware::AddHeadersLayer;
    use assert2::{check, let_assert};

    use super::*;
    use crate::middleware_factory::{AcceptLanguage, MiddlewareFactoryBuilder};
    use crate::settings::ParsedList;

    fn router_client(settings: Settings, name: &str) -> Settings {
        settings.with(format!("anvil.{name}.service_discovery"), "router")
    }

    #[test]
    fn default_client() {
        let binding =
            AnvilBinding::from_settings(router_client(Settings::new(), "client")).expect("binding");

        check!(binding.root() == "anvil");
        check!(binding.client_names().collect::<Vec<_>>() == vec!["client"]);
        check!(binding.factory("client").is_some());
        check!(binding.middleware_factories("client").is_empty());
        check!(binding.metrics().is_none());
        check!(binding.render_metrics().is_none());
    }

    #[test]
    fn several_clients_and_custom_root() {
        let settings = Settings::new()
            .with("rpc.clients", "api\nbilling")
            .with("rpc.api.service_discovery", "router")
            .with("rpc.billing.service_discovery", "static")
            .with("rpc.billing.timeout", "3");
        let binding = AnvilBinding::builder(settings).root("rpc").build().expect("binding");

        check!(binding.client_names().collect::<Vec<_>>() == vec!["api", "billing"]);
        let billing = binding.factory("billing").expect("billing");
        check!(billing.timeout().read == std::time::Duration::from_secs(3));
        let timeout = binding.factory("api").map(ClientFactory::timeout);
        check!(timeout == Some(anvil::HttpTimeout::default()));
    }

    #[test]
    fn client_error_is_reported() {
        let settings = Settings::new().with("anvil.clients", "api");
        let_assert!(Err(err) = AnvilBinding::from_settings(settings));
        check!(err.to_string() == "Missing setting anvil.api.service_discovery");
    }

    #[test]
    fn prometheus_shared_between_clients() {
        let settings = Settings::new()
            .with("anvil.clients", vec!["api", "billing"])
            .with("anvil.api.service_discovery", "router")
            .with("anvil.api.middlewares", "prometheus")
            .with("anvil.billing.service_discovery", "router")
            .with("anvil.billing.middlewares", "prometheus");
        let binding = AnvilBinding::from_settings(settings).expect("binding");

        let api = binding.factory("api").and_then(|f| f.middlewares().first().cloned());
        let billing = binding.factory("billing").and_then(|f| f.middlewares().first().cloned());
        let_assert!(Some(api) = api);
        let_assert!(Some(billing) = billing);
        check!(Arc::ptr_eq(&api, &billing));

        let rendered = binding.render_metrics().expect("metrics");
        check!(rendered.contains("anvil_info"));
    }

    #[test]
    fn prometheus_shared_between_bindings() {
        let settings = Settings::new()
            .with("anvil.api.service_discovery", "router")
            .with("anvil.api.middlewares", "prometheus")
            .with("anvil.clients", "api");
        let first = AnvilBinding::from_settings(settings.clone()).expect("first");
        let second = AnvilBinding::from_settings(settings).expect("second");

        let_assert!(Some(first) = first.metrics());
        let_assert!(Some(second) = second.metrics());
        check!(Arc::ptr_eq(first, second));
    }

    #[test]
    fn scan_registers_contracts() {
        let mut entry_points = EntryPoints::default();
        entry_points.register_contracts("users", |registry| {
            registry
                .register(ResourceDef::new("api", "user", "user", Some("v1")).path("/users/{id}"));
        });
        let settings = router_client(Settings::new(), "client").with("anvil.scan", "users");
        let binding = AnvilBinding::builder(settings)
            .entry_points(entry_points)
            .build()
            .expect("binding");

        check!(binding.registry().get("api", "user").is_ok());
        let factory = binding.factory("client").expect("factory");
        check!(factory.client("api").is_ok());
    }

    #[test]
    fn scan_unknown_module() {
        let settings = router_client(Settings::new(), "client").with("anvil.scan", "users");
        let_assert!(Err(err) = AnvilBinding::from_settings(settings));
        check!(err.to_string() == "Unresolvable entry point users");
    }

    #[test]
    fn unknown_client_at_request_time() {
        let settings = router_client(Settings::new(), "client");
        let binding = Arc::new(AnvilBinding::from_settings(settings).expect("binding"));
        let clients = binding.for_request(IncomingRequest::default());

        let_assert!(Err(err) = clients.get("billing"));
        check!(err.to_string() == "Client billing is not registered");
    }

    #[derive(Debug, Default)]
    struct Counting {
        created: Arc<AtomicUsize>,
    }

    impl MiddlewareFactory for Counting {
        fn create(&self, _request: &IncomingRequest) -> Arc<dyn HttpMiddleware> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Arc::new(AddHeadersLayer::new([("X-Counted", "1")]))
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[derive(Debug, Default)]
    struct CountingBuilder {
        created: Arc<AtomicUsize>,
    }

    impl MiddlewareFactoryBuilder for CountingBuilder {
        fn build(
            &self,
            _params: &ParsedList,
        ) -> Result<Arc<dyn MiddlewareFactory>, ConfigurationError> {
            Ok(Arc::new(Counting {
                created: Arc::clone(&self.created),
            }))
        }
    }

    #[test]
    fn request_middlewares_bound_once_per_request() {
        let created = Arc::new(AtomicUsize::new(0));
        let mut entry_points = EntryPoints::default();
        entry_points.register_middleware_factory(
            "tests:Counting",
            CountingBuilder {
                created: Arc::clone(&created),
            },
        );
        let settings = router_client(Settings::new(), "client")
            .with("anvil.client.middlewares", "zipkin")
            .with("anvil.client.middleware_factories", "counting tests:Counting\naccept_language");
        let binding = Arc::new(
            AnvilBinding::builder(settings)
                .entry_points(entry_points)
                .build()
                .expect("binding"),
        );
        check!(binding.middleware_factories("client").len() == 2);
        check!(
            binding
                .middleware_factories("client")
                .get(1)
                .is_some_and(|factory| factory.as_any().is::<AcceptLanguage>())
        );

        let clients = binding.for_request(IncomingRequest::default());
        let first = clients.get("client").expect("first");
        let second = clients.clone().get("client").expect("second");
        check!(created.load(Ordering::SeqCst) == 1);
        check!(first.middlewares().len() == 3);
        check!(second.middlewares().len() == 3);

        // The shared factory is left untouched
        check!(binding.factory("client").map(|f| f.middlewares().len()) == Some(1));

        let other_request = binding.for_request(IncomingRequest::default());
        other_request.get("client").expect("other request");
        check!(created.load(Ordering::SeqCst) == 2);
    }
}
