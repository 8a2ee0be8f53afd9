//! Service discovery strategies.
//!
//! A [`ServiceDiscovery`] maps a logical `(service, version)` pair to the base
//! URL of one endpoint of that service.
//!
//! | Strategy | Resolution |
//! |----------|------------|
//! | [`StaticDiscovery`] | fixed table of endpoints |
//! | [`ConsulDiscovery`] | consul catalog lookup, round-robin over instances |
//! | [`RouterDiscovery`] | URL template pointing at a routing proxy |
//! | [`NomadDiscovery`] | upstream address read from the environment |

use std::any::Any;
use std::fmt;

use futures_util::future::BoxFuture;

use crate::Result;

mod consul;
mod nomad;
mod router;
mod static_sd;

pub use consul::{ConsulConfig, ConsulDiscovery};
pub use nomad::{NomadConfig, NomadDiscovery};
pub use router::{RouterConfig, RouterDiscovery};
pub use static_sd::{Endpoints, StaticDiscovery};

/// Locates backend services.
pub trait ServiceDiscovery: Send + Sync + fmt::Debug + 'static {
    /// Base URL of the service, without trailing path of the resource.
    fn get_endpoint<'a>(
        &'a self,
        service: &'a str,
        version: Option<&'a str>,
    ) -> BoxFuture<'a, Result<String>>;

    /// Access to the concrete type, for introspection.
    fn as_any(&self) -> &dyn Any;
}

/// Substitutes `{name}` placeholders of a URL or name template.
pub(crate) fn render(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{name}}}"), value)
    })
}
