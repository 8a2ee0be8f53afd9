//! Assembly of one [`ClientFactory`] from the settings under its prefix.

use std::sync::Arc;

use anvil::parser::{CollectionParser, ErrorParser};
use anvil::{ClientFactory, HttpTimeout, Registry, Transport};

use crate::ConfigurationError;
use crate::discovery::build_sd_strategy;
use crate::entry_point::{Configured, EntryPoints};
use crate::middleware::{MetricsSlot, build_middlewares};
use crate::settings::{ListMode, Settings, as_bool, parse_list};

const DEFAULT_TIMEOUT: u64 = 30;
const DEFAULT_CONNECT_TIMEOUT: u64 = 15;

/// Collaborators given as objects rather than references.
///
/// A literal takes precedence over the reference found in the settings.
#[derive(Debug, Clone, Default)]
pub struct ClientOverrides {
    /// Transport of the client.
    pub transport: Option<Configured<Arc<dyn Transport>>>,
    /// Parser of collection responses.
    pub collection_parser: Option<Configured<Arc<dyn CollectionParser>>>,
    /// Parser of error responses.
    pub error_parser: Option<Configured<Arc<dyn ErrorParser>>>,
}

/// Shared inputs of every client assembly.
#[derive(Debug, Clone, Copy)]
pub struct AssemblyContext<'a> {
    /// All settings.
    pub settings: &'a Settings,
    /// Pluggable implementations.
    pub entry_points: &'a EntryPoints,
    /// Resources of every client.
    pub registry: &'a Arc<Registry>,
    /// Prometheus metrics shared by the clients.
    pub metrics: &'a MetricsSlot,
}

/// Builds the factory of the client configured under `prefix`.
///
/// # Errors
///
/// Fails on any invalid setting of the client.
pub fn build_client_factory(
    ctx: AssemblyContext<'_>,
    prefix: &str,
    overrides: &ClientOverrides,
) -> Result<ClientFactory, ConfigurationError> {
    let settings = ctx.settings;
    let sd = build_sd_strategy(settings, prefix)?;

    let timeout = HttpTimeout::from_secs(
        settings.integer(&format!("{prefix}.timeout"))?.unwrap_or(DEFAULT_TIMEOUT),
        settings
            .integer(&format!("{prefix}.connect_timeout"))?
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT),
    );
    let proxies = parse_list(settings, &format!("{prefix}.proxies"), ListMode::Pairs)?;
    let proxies = (!proxies.is_empty()).then(|| proxies.to_map());
    let verify_certificate = settings
        .get(&format!("{prefix}.verify_certificate"))
        .is_none_or(as_bool);

    let mut builder = ClientFactory::builder(sd)
        .registry(Arc::clone(ctx.registry))
        .timeout(timeout)
        .proxies(proxies)
        .verify_certificate(verify_certificate);

    let transport_config = builder.transport_config();
    let transport = configured(settings, prefix, "transport", overrides.transport.clone());
    if let Some(transport) = ctx
        .entry_points
        .transports
        .resolve_configured(transport, &transport_config)?
    {
        builder = builder.transport(transport);
    }

    let parser = configured(
        settings,
        prefix,
        "collection_parser",
        overrides.collection_parser.clone(),
    );
    if let Some(parser) = ctx.entry_points.collection_parsers.resolve_configured(parser, &())? {
        builder = builder.collection_parser(parser);
    }

    let parser = configured(settings, prefix, "error_parser", overrides.error_parser.clone());
    if let Some(parser) = ctx.entry_points.error_parsers.resolve_configured(parser, &())? {
        builder = builder.error_parser(parser);
    }

    let middlewares = build_middlewares(settings, prefix, ctx.entry_points, ctx.metrics)?;
    let aliases = middlewares.aliases().collect::<Vec<_>>().join(",");
    tracing::info!(prefix, middlewares = %aliases, "registered client");

    Ok(builder.middlewares(middlewares.into_middlewares()).build())
}

fn configured<T>(
    settings: &Settings,
    prefix: &str,
    key: &str,
    literal: Option<Configured<T>>,
) -> Option<Configured<T>> {
    literal.or_else(|| {
        settings
            .text(&format!("{prefix}.{key}"))
            .map(Configured::reference)
    })
}
