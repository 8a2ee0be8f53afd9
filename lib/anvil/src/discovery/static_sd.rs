use std::any::Any;
use std::collections::HashMap;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;

use super::ServiceDiscovery;
use crate::{Error, Result};

/// Endpoints keyed by `(service, version)`.
pub type Endpoints = HashMap<(String, Option<String>), String>;

/// Discovery over a fixed table of endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticDiscovery {
    endpoints: Endpoints,
}

impl StaticDiscovery {
    /// Create a discovery from its endpoints.
    #[must_use]
    pub const fn new(endpoints: Endpoints) -> Self {
        Self { endpoints }
    }

    /// The endpoint table.
    #[must_use]
    pub const fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }
}

impl ServiceDiscovery for StaticDiscovery {
    fn get_endpoint<'a>(
        &'a self,
        service: &'a str,
        version: Option<&'a str>,
    ) -> BoxFuture<'a, Result<String>> {
        let key = (service.to_string(), version.map(ToString::to_string));
        let endpoint = self.endpoints.get(&key).cloned().ok_or_else(|| {
            Error::discovery(format!(
                "no static endpoint for {service}/{}",
                version.unwrap_or("")
            ))
        });
        futures_util::future::ready(endpoint).boxed()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discovery() -> StaticDiscovery {
        StaticDiscovery::new(HashMap::from([
            (
                ("api".to_string(), Some("v1".to_string())),
                "http://api.v1".to_string(),
            ),
            (("smtp".to_string(), None), "smtp://host/".to_string()),
        ]))
    }

    #[tokio::test]
    async fn resolves_versioned_and_unversioned() {
        let sd = discovery();
        assert_eq!(
            sd.get_endpoint("api", Some("v1")).await.expect("api"),
            "http://api.v1"
        );
        assert_eq!(
            sd.get_endpoint("smtp", None).await.expect("smtp"),
            "smtp://host/"
        );
    }

    #[tokio::test]
    async fn unknown_service_fails() {
        let err = discovery()
            .get_endpoint("api", Some("v2"))
            .await
            .expect_err("unknown");
        assert_eq!(
            err.to_string(),
            "service discovery error: no static endpoint for api/v2"
        );
    }
}
