//! Resolution of `<module>:<attribute>` references to implementations.
//!
//! Settings name implementations by reference (`anvil:InMemoryUnitOfWork`).
//! Every reference must be registered up front in [`EntryPoints`], one typed
//! [`Plugins`] table per kind of collaborator. The built-in implementations
//! are registered by [`EntryPoints::default`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anvil::middleware::{
    CacheBackend, CacheSerializer, CachingPolicy, DefaultCachingPolicy, InMemoryCache,
    InMemoryUnitOfWork, JsonSerializer, UnitOfWork,
};
use anvil::parser::{CollectionParser, DefaultCollectionParser, DefaultErrorParser, ErrorParser};
use anvil::{HyperTransport, Registry, Transport, TransportConfig};

use crate::ConfigurationError;
use crate::middleware::{
    CircuitBreakerBuilder, HttpCacheBuilder, LoggingBuilder, MiddlewareBuilder, PrometheusBuilder,
    StaticHeadersBuilder, ZipkinBuilder,
};
use crate::middleware_factory::{
    AcceptLanguageBuilder, ForwardHeaderBuilder, MiddlewareFactoryBuilder,
};
use crate::settings::ParsedList;

/// A value given either as an object or as a reference to resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Configured<T> {
    /// The object itself.
    Literal(T),
    /// A `<module>:<attribute>` reference.
    Reference(String),
}

impl<T> Configured<T> {
    /// A reference to resolve.
    pub fn reference(reference: impl Into<String>) -> Self {
        Self::Reference(reference.into())
    }
}

/// Constructor registered under a reference.
pub type Constructor<A, T> = Arc<dyn Fn(&A) -> Result<T, ConfigurationError> + Send + Sync>;

/// Constructors of one kind of collaborator, by reference.
///
/// `A` is the argument every constructor of the table receives.
pub struct Plugins<A, T> {
    constructors: BTreeMap<String, Constructor<A, T>>,
}

impl<A, T> Default for Plugins<A, T> {
    fn default() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }
}

impl<A, T> Clone for Plugins<A, T> {
    fn clone(&self) -> Self {
        Self {
            constructors: self.constructors.clone(),
        }
    }
}

impl<A, T> fmt::Debug for Plugins<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.constructors.keys()).finish()
    }
}

impl<A, T> Plugins<A, T> {
    /// Register a constructor, replacing any previous one.
    pub fn register<F>(&mut self, reference: impl Into<String>, constructor: F)
    where
        F: Fn(&A) -> Result<T, ConfigurationError> + Send + Sync + 'static,
    {
        self.constructors.insert(reference.into(), Arc::new(constructor));
    }

    /// Whether a reference is registered.
    #[must_use]
    pub fn contains(&self, reference: &str) -> bool {
        self.constructors.contains_key(reference)
    }

    /// Registered references, sorted.
    pub fn references(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// Build the object registered under `reference`.
    ///
    /// An empty reference is absent.
    ///
    /// # Errors
    ///
    /// Fails if the reference is malformed, unknown, or if its constructor
    /// fails.
    pub fn resolve(&self, reference: &str, arg: &A) -> Result<Option<T>, ConfigurationError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Ok(None);
        }
        let well_formed = reference
            .split_once(':')
            .is_some_and(|(module, attribute)| !module.is_empty() && !attribute.is_empty());
        if !well_formed {
            return Err(ConfigurationError::MalformedEntryPoint(reference.to_string()));
        }
        let constructor = self
            .constructors
            .get(reference)
            .ok_or_else(|| ConfigurationError::UnresolvableEntryPoint(reference.to_string()))?;
        constructor(arg).map(Some)
    }

    /// Resolve a configured value: literals are returned unchanged.
    ///
    /// # Errors
    ///
    /// See [`Plugins::resolve`].
    pub fn resolve_configured(
        &self,
        value: Option<Configured<T>>,
        arg: &A,
    ) -> Result<Option<T>, ConfigurationError> {
        match value {
            None => Ok(None),
            Some(Configured::Literal(value)) => Ok(Some(value)),
            Some(Configured::Reference(reference)) => self.resolve(&reference, arg),
        }
    }
}

/// Populates the resource registry.
pub type Contract = Arc<dyn Fn(&mut Registry) + Send + Sync>;

/// Every pluggable implementation known to the binding.
#[derive(Clone)]
pub struct EntryPoints {
    /// Transports, built from the client's transport settings.
    pub transports: Plugins<TransportConfig, Arc<dyn Transport>>,
    /// Collection parsers.
    pub collection_parsers: Plugins<(), Arc<dyn CollectionParser>>,
    /// Error parsers.
    pub error_parsers: Plugins<(), Arc<dyn ErrorParser>>,
    /// Middleware builders.
    pub middlewares: Plugins<(), Arc<dyn MiddlewareBuilder>>,
    /// Per-request middleware factory builders.
    pub middleware_factories: Plugins<(), Arc<dyn MiddlewareFactoryBuilder>>,
    /// Circuit breaker stores, built from their parameter block.
    pub units_of_work: Plugins<ParsedList, Arc<dyn UnitOfWork>>,
    /// Caching policies, built from their parameter block.
    pub caching_policies: Plugins<ParsedList, Arc<dyn CachingPolicy>>,
    /// Cached response encodings.
    pub serializers: Plugins<(), Arc<dyn CacheSerializer>>,
    /// Cache stores, built from the cache URL.
    pub cache_backends: Plugins<String, Arc<dyn CacheBackend>>,
    contracts: BTreeMap<String, Contract>,
}

impl fmt::Debug for EntryPoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryPoints")
            .field("transports", &self.transports)
            .field("collection_parsers", &self.collection_parsers)
            .field("error_parsers", &self.error_parsers)
            .field("middlewares", &self.middlewares)
            .field("middleware_factories", &self.middleware_factories)
            .field("units_of_work", &self.units_of_work)
            .field("caching_policies", &self.caching_policies)
            .field("serializers", &self.serializers)
            .field("cache_backends", &self.cache_backends)
            .field("contracts", &self.contracts.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for EntryPoints {
    fn default() -> Self {
        let mut entry_points = Self::empty();

        entry_points
            .transports
            .register("anvil:HyperTransport", |config: &TransportConfig| {
                Ok(Arc::new(HyperTransport::new(config.clone())) as Arc<dyn Transport>)
            });
        entry_points
            .collection_parsers
            .register("anvil:DefaultCollectionParser", |(): &()| {
                Ok(Arc::new(DefaultCollectionParser) as Arc<dyn CollectionParser>)
            });
        entry_points
            .error_parsers
            .register("anvil:DefaultErrorParser", |(): &()| {
                Ok(Arc::new(DefaultErrorParser) as Arc<dyn ErrorParser>)
            });

        entry_points.register_middleware("anvil:PrometheusBuilder", PrometheusBuilder);
        entry_points.register_middleware("anvil:CircuitBreakerBuilder", CircuitBreakerBuilder);
        entry_points.register_middleware("anvil:HttpCacheBuilder", HttpCacheBuilder);
        entry_points.register_middleware("anvil:StaticHeadersBuilder", StaticHeadersBuilder);
        entry_points.register_middleware("anvil:ZipkinBuilder", ZipkinBuilder);
        entry_points.register_middleware("anvil:LoggingBuilder", LoggingBuilder);

        entry_points
            .register_middleware_factory("anvil:ForwardHeaderBuilder", ForwardHeaderBuilder);
        entry_points
            .register_middleware_factory("anvil:AcceptLanguageBuilder", AcceptLanguageBuilder);

        entry_points
            .units_of_work
            .register("anvil:InMemoryUnitOfWork", |_: &ParsedList| {
                Ok(Arc::new(InMemoryUnitOfWork::new()) as Arc<dyn UnitOfWork>)
            });
        entry_points
            .caching_policies
            .register("anvil:DefaultCachingPolicy", |params: &ParsedList| {
                let policy = DefaultCachingPolicy::new(params.text("sep").unwrap_or("$"));
                Ok(Arc::new(policy) as Arc<dyn CachingPolicy>)
            });
        entry_points
            .serializers
            .register("anvil:JsonSerializer", |(): &()| {
                Ok(Arc::new(JsonSerializer) as Arc<dyn CacheSerializer>)
            });
        entry_points
            .cache_backends
            .register("anvil:InMemoryCache", |url: &String| {
                let cache = InMemoryCache::new(url).map_err(|_| ConfigurationError::InvalidUrl {
                    value: url.clone(),
                    setting: "redis".to_string(),
                })?;
                Ok(Arc::new(cache) as Arc<dyn CacheBackend>)
            });

        entry_points
    }
}

impl EntryPoints {
    /// Entry points without any registration.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            transports: Plugins::default(),
            collection_parsers: Plugins::default(),
            error_parsers: Plugins::default(),
            middlewares: Plugins::default(),
            middleware_factories: Plugins::default(),
            units_of_work: Plugins::default(),
            caching_policies: Plugins::default(),
            serializers: Plugins::default(),
            cache_backends: Plugins::default(),
            contracts: BTreeMap::new(),
        }
    }

    /// Register a middleware builder.
    pub fn register_middleware<B: MiddlewareBuilder>(
        &mut self,
        reference: impl Into<String>,
        builder: B,
    ) {
        let builder: Arc<dyn MiddlewareBuilder> = Arc::new(builder);
        self.middlewares
            .register(reference, move |(): &()| Ok(Arc::clone(&builder)));
    }

    /// Register a per-request middleware factory builder.
    pub fn register_middleware_factory<B: MiddlewareFactoryBuilder>(
        &mut self,
        reference: impl Into<String>,
        builder: B,
    ) {
        let builder: Arc<dyn MiddlewareFactoryBuilder> = Arc::new(builder);
        self.middleware_factories
            .register(reference, move |(): &()| Ok(Arc::clone(&builder)));
    }

    /// Register a contract module, run when its name is listed in `<root>.scan`.
    pub fn register_contracts<F>(&mut self, module: impl Into<String>, contract: F)
    where
        F: Fn(&mut Registry) + Send + Sync + 'static,
    {
        self.contracts.insert(module.into(), Arc::new(contract));
    }

    /// Run the contract modules named in `modules` on `registry`.
    ///
    /// # Errors
    ///
    /// Fails on the first unknown module.
    pub fn scan(
        &self,
        modules: &[String],
        registry: &mut Registry,
    ) -> Result<(), ConfigurationError> {
        for module in modules {
            let contract = self
                .contracts
                .get(module)
                .ok_or_else(|| ConfigurationError::UnresolvableEntryPoint(module.clone()))?;
            tracing::debug!(module = %module, "registering contracts");
            contract(registry);
        }
        Ok(())
    }
}
