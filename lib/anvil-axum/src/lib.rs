//! # anvil-axum
//!
//! Settings-driven [`anvil`] clients for axum applications.
//!
//! At startup, [`AnvilBinding`] reads flat dotted settings (usually loaded
//! from TOML) and assembles one [`ClientFactory`](anvil::ClientFactory) per
//! declared client: service discovery, transport, timeouts, parsers and an
//! ordered middleware chain. Each request then extracts a [`Clients`]
//! accessor that layers the request's own middlewares (forwarded headers,
//! locale) on top of the shared factories.
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use anvil_axum::{AnvilBinding, Clients, Settings, UnknownClient};
//! use axum::{Router, routing::get};
//!
//! async fn user(clients: Clients) -> Result<String, UnknownClient> {
//!     let users = clients.get("client")?;
//!     // users.client("api")?.resource("user")?.get(...)
//!     Ok(format!("{users:?}"))
//! }
//!
//! let settings = Settings::from_toml_str(include_str!("settings.toml"))?;
//! let binding = Arc::new(AnvilBinding::from_settings(settings)?);
//! let app = Router::new()
//!     .route("/user", get(user))
//!     .route("/metrics", get(anvil_axum::metrics_endpoint))
//!     .with_state(binding);
//! ```

mod binding;
mod client_settings;
mod discovery;
mod entry_point;
mod error;
mod extract;
mod middleware;
mod middleware_factory;
mod settings;

pub use binding::{AnvilBinding, AnvilBindingBuilder, Clients, DEFAULT_CLIENT, DEFAULT_ROOT};
pub use client_settings::{AssemblyContext, ClientOverrides, build_client_factory};
pub use discovery::build_sd_strategy;
pub use entry_point::{Configured, Constructor, Contract, EntryPoints, Plugins};
pub use error::{ConfigurationError, UnknownClient};
pub use extract::metrics_endpoint;
pub use middleware::{
    CircuitBreakerBuilder, HttpCacheBuilder, LoggingBuilder, MetricsSlot, MiddlewareBuilder,
    MiddlewareContext, MiddlewareRegistry, PrometheusBuilder, StaticHeadersBuilder, ZipkinBuilder,
    build_middlewares,
};
pub use middleware_factory::{
    AcceptLanguage, AcceptLanguageBuilder, ForwardHeader, ForwardHeaderBuilder, IncomingRequest,
    Locale, MiddlewareFactory, MiddlewareFactoryBuilder, build_middleware_factories,
};
pub use settings::{
    ListMode, ListValue, ParsedList, SettingValue, Settings, as_bool, as_list, parse_list,
};
