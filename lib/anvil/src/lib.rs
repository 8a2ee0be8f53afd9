//! Remote-procedure HTTP client with service discovery and composable middleware.
//!
//! Resources of remote services are declared in a [`Registry`], grouped by
//! client name. A [`ClientFactory`] resolves the endpoint of a resource with a
//! [`ServiceDiscovery`] strategy and sends the call through an ordered chain of
//! Tower middlewares down to a [`Transport`].
//!
//! # Example
//!
//! ```ignore
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! use anvil::discovery::StaticDiscovery;
//! use anvil::middleware::LoggingLayer;
//! use anvil::{ClientFactory, Registry, ResourceDef};
//!
//! let mut registry = Registry::new();
//! registry.register(ResourceDef::new("api", "user", "user", Some("v1")).path("/users/{id}"));
//!
//! let endpoints = HashMap::from([(("user".into(), Some("v1".into())), "http://user.v1".into())]);
//! let sd = StaticDiscovery::new(endpoints);
//! let factory = ClientFactory::builder(Arc::new(sd))
//!     .registry(Arc::new(registry))
//!     .middleware(Arc::new(LoggingLayer::new()))
//!     .build();
//!
//! let user = factory.client("api")?.resource("user")?;
//! let response = user.get(&serde_json::json!({ "id": 42 })).await?;
//! ```

mod client;
mod config;
mod connector;
pub mod discovery;
pub mod middleware;
pub mod parser;
mod registry;
mod transport;

// Re-export client types
pub use client::{Client, ClientFactory, ClientFactoryBuilder, Resource};
pub use config::{TransportConfig, TransportConfigBuilder};
pub use discovery::ServiceDiscovery;
pub use registry::{Registry, ResourceDef};
pub use transport::{BoxedService, HyperTransport, ServiceFuture, Transport};

// Re-export tower for middleware composition
pub use tower;

// Re-export core types
pub use anvil_core::{
    ContentType, Error, HttpTimeout, Method, Request, RequestBuilder, RequestMeta, Response,
    Result, from_json, to_json, to_query_string,
};

// Re-export http types for status codes and headers
pub use anvil_core::{StatusCode, header};

pub use url;
