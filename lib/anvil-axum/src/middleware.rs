//! Middleware builders.
//!
//! `<prefix>.middlewares` lists the middlewares of a client, one per line, as
//! `alias [reference]`. A bare alias selects a built-in builder:
//!
//! | Alias | Middleware |
//! |-------|------------|
//! | `prometheus` | [`PrometheusMetrics`] |
//! | `circuitbreaker` | [`CircuitBreakerLayer`] |
//! | `http_cache` | [`HttpCacheLayer`] |
//! | `static_headers` | [`AddHeadersLayer`] |
//! | `zipkin` | [`ZipkinLayer`] |
//! | `logging` | [`LoggingLayer`] |
//!
//! Each builder reads its parameters from `<prefix>.middleware.<alias>`.
//! Middlewares are built in declaration order, and a builder only sees the
//! middlewares declared before it. At runtime the first declared middleware
//! is the outermost one.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anvil::middleware::{
    AddHeadersLayer, CircuitBreakerConfig, CircuitBreakerLayer, CircuitListener, HttpCacheLayer,
    HttpMiddleware, LoggingLayer, PrometheusConfig, PrometheusHook, PrometheusMetrics, ZipkinLayer,
};

use crate::ConfigurationError;
use crate::entry_point::EntryPoints;
use crate::settings::{ListMode, ParsedList, Settings, parse_integer, parse_list, parse_numbers};

/// Built-in aliases and the reference of their builder.
const BUILTINS: [(&str, &str); 6] = [
    ("circuitbreaker", "anvil:CircuitBreakerBuilder"),
    ("http_cache", "anvil:HttpCacheBuilder"),
    ("logging", "anvil:LoggingBuilder"),
    ("prometheus", "anvil:PrometheusBuilder"),
    ("static_headers", "anvil:StaticHeadersBuilder"),
    ("zipkin", "anvil:ZipkinBuilder"),
];

static PROCESS_METRICS: OnceLock<Arc<PrometheusMetrics>> = OnceLock::new();

/// The prometheus middleware used by the clients of a binding.
///
/// [`MetricsSlot::process_wide`] shares one instance with every other binding
/// of the process. A default slot is private to its binding.
#[derive(Debug, Default)]
pub struct MetricsSlot {
    shared: Option<&'static OnceLock<Arc<PrometheusMetrics>>>,
    declared: OnceLock<Arc<PrometheusMetrics>>,
}

impl MetricsSlot {
    /// A slot backed by the process-wide metrics.
    #[must_use]
    pub fn process_wide() -> Self {
        Self {
            shared: Some(&PROCESS_METRICS),
            declared: OnceLock::new(),
        }
    }

    /// The metrics, once a client declared them.
    #[must_use]
    pub fn get(&self) -> Option<&Arc<PrometheusMetrics>> {
        self.declared.get()
    }

    fn existing(&self) -> Option<Arc<PrometheusMetrics>> {
        self.declared
            .get()
            .or_else(|| self.shared.and_then(OnceLock::get))
            .cloned()
    }

    /// Keep `metrics` unless another declaration got there first.
    fn adopt(&self, metrics: Arc<PrometheusMetrics>) -> Arc<PrometheusMetrics> {
        let metrics = match self.shared {
            Some(shared) => Arc::clone(shared.get_or_init(|| metrics)),
            None => metrics,
        };
        Arc::clone(self.declared.get_or_init(|| metrics))
    }
}

/// Middlewares built so far for one client, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct MiddlewareRegistry {
    entries: Vec<(String, Arc<dyn HttpMiddleware>)>,
}

impl MiddlewareRegistry {
    /// Add a middleware; an existing alias is replaced in place.
    pub fn insert(&mut self, alias: impl Into<String>, middleware: Arc<dyn HttpMiddleware>) {
        let alias = alias.into();
        match self.entries.iter_mut().find(|(name, _)| *name == alias) {
            Some(entry) => entry.1 = middleware,
            None => self.entries.push((alias, middleware)),
        }
    }

    /// Middleware built under `alias`.
    #[must_use]
    pub fn get(&self, alias: &str) -> Option<&Arc<dyn HttpMiddleware>> {
        self.entries
            .iter()
            .find(|(name, _)| name == alias)
            .map(|(_, middleware)| middleware)
    }

    /// First middleware of type `T`.
    #[must_use]
    pub fn find<T: 'static>(&self) -> Option<&T> {
        self.entries
            .iter()
            .find_map(|(_, middleware)| middleware.as_any().downcast_ref::<T>())
    }

    /// Aliases, in declaration order.
    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(alias, _)| alias.as_str())
    }

    /// Number of middlewares.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no middleware was built.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Middlewares, outermost first.
    #[must_use]
    pub fn into_middlewares(self) -> Vec<Arc<dyn HttpMiddleware>> {
        self.entries.into_iter().map(|(_, middleware)| middleware).collect()
    }
}

/// What a builder can see while building one middleware.
#[derive(Debug)]
pub struct MiddlewareContext<'a> {
    /// All settings.
    pub settings: &'a Settings,
    /// Key of the middleware's parameters, `<client prefix>.middleware.<alias>`.
    pub prefix: String,
    /// Middlewares declared earlier for the same client.
    pub registry: &'a MiddlewareRegistry,
    /// Pluggable implementations.
    pub entry_points: &'a EntryPoints,
    metrics: &'a MetricsSlot,
}

impl<'a> MiddlewareContext<'a> {
    /// Create a context.
    #[must_use]
    pub fn new(
        settings: &'a Settings,
        prefix: String,
        registry: &'a MiddlewareRegistry,
        entry_points: &'a EntryPoints,
        metrics: &'a MetricsSlot,
    ) -> Self {
        Self {
            settings,
            prefix,
            registry,
            entry_points,
            metrics,
        }
    }

    /// Parameters of the middleware, as `key value` lines.
    ///
    /// # Errors
    ///
    /// Fails on a malformed line.
    pub fn params(&self) -> Result<ParsedList, ConfigurationError> {
        parse_list(self.settings, &self.prefix, ListMode::Pairs)
    }

    /// Parameters of a nested block, `<prefix>.<name>`.
    ///
    /// # Errors
    ///
    /// Fails on a malformed line.
    pub fn nested_params(&self, name: &str) -> Result<ParsedList, ConfigurationError> {
        parse_list(self.settings, &format!("{}.{name}", self.prefix), ListMode::Pairs)
    }

    /// Prometheus metrics declared earlier for the same client.
    #[must_use]
    pub fn prometheus(&self) -> Option<&PrometheusMetrics> {
        self.registry.find::<PrometheusMetrics>()
    }
}

/// Builds one middleware from settings.
pub trait MiddlewareBuilder: Send + Sync + fmt::Debug + 'static {
    /// Build the middleware.
    ///
    /// # Errors
    ///
    /// Fails on invalid parameters.
    fn build(
        &self,
        ctx: &MiddlewareContext<'_>,
    ) -> Result<Arc<dyn HttpMiddleware>, ConfigurationError>;
}

/// Builds the middlewares declared under `<prefix>.middlewares`.
///
/// # Errors
///
/// Fails on an unknown alias, an unresolvable reference or an invalid
/// middleware configuration.
pub fn build_middlewares(
    settings: &Settings,
    prefix: &str,
    entry_points: &EntryPoints,
    metrics: &MetricsSlot,
) -> Result<MiddlewareRegistry, ConfigurationError> {
    let setting = format!("{prefix}.middlewares");
    let declared = parse_list(settings, &setting, ListMode::Flags)?;

    let mut registry = MiddlewareRegistry::default();
    for (alias, value) in declared.iter() {
        let reference = match value.as_text() {
            Some(reference) => reference,
            None => builtin(alias).ok_or_else(|| ConfigurationError::InvalidChoice {
                value: alias.to_string(),
                setting: setting.clone(),
                choices: BUILTINS.map(|(alias, _)| alias).join(", "),
            })?,
        };
        let builder = entry_points
            .middlewares
            .resolve(reference, &())?
            .ok_or_else(|| ConfigurationError::UnresolvableEntryPoint(reference.to_string()))?;

        let ctx = MiddlewareContext::new(
            settings,
            format!("{prefix}.middleware.{alias}"),
            &registry,
            entry_points,
            metrics,
        );
        let middleware = builder.build(&ctx)?;
        tracing::debug!(prefix, alias, reference, "built middleware");
        registry.insert(alias, middleware);
    }
    Ok(registry)
}

fn builtin(alias: &str) -> Option<&'static str> {
    BUILTINS
        .iter()
        .find(|(name, _)| *name == alias)
        .map(|(_, reference)| *reference)
}

// ============================================================================
// Built-in builders
// ============================================================================

/// `prometheus`: `buckets` and `hit_cache_buckets`, space-separated seconds.
///
/// One instance is shared by every client; the first declaration configures
/// it and later bucket settings are ignored with a warning.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusBuilder;

impl MiddlewareBuilder for PrometheusBuilder {
    fn build(
        &self,
        ctx: &MiddlewareContext<'_>,
    ) -> Result<Arc<dyn HttpMiddleware>, ConfigurationError> {
        let params = ctx.params()?;
        let buckets = params
            .text("buckets")
            .map(|buckets| parse_numbers(buckets, &ctx.prefix))
            .transpose()?;
        let hit_cache_buckets = params
            .text("hit_cache_buckets")
            .map(|buckets| parse_numbers(buckets, &ctx.prefix))
            .transpose()?;

        if let Some(metrics) = ctx.metrics.existing() {
            let config = metrics.config();
            let differs = buckets.as_ref().is_some_and(|b| *b != config.buckets)
                || hit_cache_buckets
                    .as_ref()
                    .is_some_and(|b| *b != config.hit_cache_buckets);
            if differs {
                tracing::warn!(
                    prefix = %ctx.prefix,
                    buckets = ?config.buckets,
                    hit_cache_buckets = ?config.hit_cache_buckets,
                    "prometheus buckets differ from the first declaration, keeping the first ones"
                );
            } else {
                tracing::debug!(prefix = %ctx.prefix, "reusing prometheus metrics");
            }
            return Ok(ctx.metrics.adopt(metrics) as Arc<dyn HttpMiddleware>);
        }

        let mut config = PrometheusConfig::default();
        if let Some(buckets) = buckets {
            config.buckets = buckets;
        }
        if let Some(buckets) = hit_cache_buckets {
            config.hit_cache_buckets = buckets;
        }

        let metrics = Arc::new(PrometheusMetrics::new(config)?);
        Ok(ctx.metrics.adopt(metrics) as Arc<dyn HttpMiddleware>)
    }
}

/// `circuitbreaker`: `threshold`, `ttl` (seconds) and `uow`, a unit of work
/// reference whose parameters are read from `<prefix>.uow`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CircuitBreakerBuilder;

impl MiddlewareBuilder for CircuitBreakerBuilder {
    fn build(
        &self,
        ctx: &MiddlewareContext<'_>,
    ) -> Result<Arc<dyn HttpMiddleware>, ConfigurationError> {
        let params = ctx.params()?;

        let mut config = CircuitBreakerConfig::default();
        if let Some(threshold) = params.text("threshold") {
            let threshold = parse_integer(threshold, &format!("{}.threshold", ctx.prefix))?;
            config.threshold =
                u32::try_from(threshold).map_err(|_| ConfigurationError::InvalidInteger {
                    value: threshold.to_string(),
                    setting: format!("{}.threshold", ctx.prefix),
                })?;
        }
        if let Some(ttl) = params.text("ttl") {
            config.ttl = Duration::from_secs(parse_integer(ttl, &format!("{}.ttl", ctx.prefix))?);
        }

        let reference = params.text("uow").unwrap_or("anvil:InMemoryUnitOfWork");
        let uow = ctx
            .entry_points
            .units_of_work
            .resolve(reference, &ctx.nested_params("uow")?)?
            .ok_or_else(|| ConfigurationError::UnresolvableEntryPoint(reference.to_string()))?;

        let listeners: Vec<Arc<dyn CircuitListener>> = ctx
            .prometheus()
            .map(|metrics| {
                Arc::new(PrometheusHook::new(metrics.clone())) as Arc<dyn CircuitListener>
            })
            .into_iter()
            .collect();

        Ok(Arc::new(CircuitBreakerLayer::new(config, uow, listeners)))
    }
}

/// `http_cache`: `redis` (required URL), `policy` with parameters from
/// `<prefix>.policy`, `serializer` and `backend` references.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpCacheBuilder;

impl MiddlewareBuilder for HttpCacheBuilder {
    fn build(
        &self,
        ctx: &MiddlewareContext<'_>,
    ) -> Result<Arc<dyn HttpMiddleware>, ConfigurationError> {
        let params = ctx.params()?;
        let url = params.text("redis").ok_or_else(|| ConfigurationError::MissingSubKey {
            key: "redis".to_string(),
            setting: ctx.prefix.clone(),
        })?;

        let entry_points = ctx.entry_points;
        let reference = params.text("policy").unwrap_or("anvil:DefaultCachingPolicy");
        let policy = entry_points
            .caching_policies
            .resolve(reference, &ctx.nested_params("policy")?)?
            .ok_or_else(|| ConfigurationError::UnresolvableEntryPoint(reference.to_string()))?;

        let reference = params.text("serializer").unwrap_or("anvil:JsonSerializer");
        let serializer = entry_points
            .serializers
            .resolve(reference, &())?
            .ok_or_else(|| ConfigurationError::UnresolvableEntryPoint(reference.to_string()))?;

        let reference = params.text("backend").unwrap_or("anvil:InMemoryCache");
        let backend = entry_points
            .cache_backends
            .resolve(reference, &url.to_string())?
            .ok_or_else(|| ConfigurationError::UnresolvableEntryPoint(reference.to_string()))?;

        let layer = HttpCacheLayer::new(backend, policy, serializer);
        let layer = match ctx.prometheus() {
            Some(metrics) => layer.with_metrics(metrics.clone()),
            None => layer,
        };
        Ok(Arc::new(layer))
    }
}

/// `static_headers`: one `Header-Name: value` per line.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticHeadersBuilder;

impl MiddlewareBuilder for StaticHeadersBuilder {
    fn build(
        &self,
        ctx: &MiddlewareContext<'_>,
    ) -> Result<Arc<dyn HttpMiddleware>, ConfigurationError> {
        let headers = parse_list(ctx.settings, &ctx.prefix, ListMode::Separator(':'))?;
        let headers = headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .as_text()
                    .map(|value| (name.to_string(), value.to_string()))
            });
        Ok(Arc::new(AddHeadersLayer::new(headers)))
    }
}

/// `zipkin`: no parameter.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipkinBuilder;

impl MiddlewareBuilder for ZipkinBuilder {
    fn build(
        &self,
        _ctx: &MiddlewareContext<'_>,
    ) -> Result<Arc<dyn HttpMiddleware>, ConfigurationError> {
        Ok(Arc::new(ZipkinLayer::new()))
    }
}

/// `logging`: `level`, `debug` or `info` (default).
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingBuilder;

impl MiddlewareBuilder for LoggingBuilder {
    fn build(
        &self,
        ctx: &MiddlewareContext<'_>,
    ) -> Result<Arc<dyn HttpMiddleware>, ConfigurationError> {
        let params = ctx.params()?;
        let layer = match params.text("level") {
            None | Some("info") => LoggingLayer::new(),
            Some("debug") => LoggingLayer::debug(),
            Some(other) => {
                return Err(ConfigurationError::InvalidChoice {
                    value: other.to_string(),
                    setting: format!("{}.level", ctx.prefix),
                    choices: "debug, info".to_string(),
                });
            }
        };
        Ok(Arc::new(layer))
    }
}
