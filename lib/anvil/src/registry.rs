//! Registry of remote resources, grouped by client name.

use std::collections::BTreeMap;

use crate::{Error, Result};

/// Declaration of one remote resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDef {
    /// Name of the client exposing the resource (e.g. `api`).
    pub client_name: String,
    /// Name of the resource within the client (e.g. `user`).
    pub resource: String,
    /// Service name resolved by service discovery.
    pub service: String,
    /// Service version, `None` for unversioned services.
    pub version: Option<String>,
    /// Path template of a single item, e.g. `/users/{username}`.
    pub path: Option<String>,
    /// Path template of the collection, e.g. `/users`.
    pub collection_path: Option<String>,
}

impl ResourceDef {
    /// Declare a resource.
    pub fn new(
        client_name: impl Into<String>,
        resource: impl Into<String>,
        service: impl Into<String>,
        version: Option<&str>,
    ) -> Self {
        Self {
            client_name: client_name.into(),
            resource: resource.into(),
            service: service.into(),
            version: version.map(ToString::to_string),
            path: None,
            collection_path: None,
        }
    }

    /// Set the item path template.
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Set the collection path template.
    #[must_use]
    pub fn collection_path(mut self, path: impl Into<String>) -> Self {
        self.collection_path = Some(path.into());
        self
    }
}

/// Resources known by the clients, populated by contract modules at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registry {
    clients: BTreeMap<String, BTreeMap<String, ResourceDef>>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource, replacing a previous declaration of the same name.
    pub fn register(&mut self, def: ResourceDef) {
        self.clients
            .entry(def.client_name.clone())
            .or_default()
            .insert(def.resource.clone(), def);
    }

    /// Resources of a client.
    #[must_use]
    pub fn client(&self, client_name: &str) -> Option<&BTreeMap<String, ResourceDef>> {
        self.clients.get(client_name)
    }

    /// Names of the registered clients.
    pub fn client_names(&self) -> impl Iterator<Item = &str> {
        self.clients.keys().map(String::as_str)
    }

    /// Look up a resource.
    ///
    /// # Errors
    ///
    /// Fails when the client or the resource is not registered.
    pub fn get(&self, client_name: &str, resource: &str) -> Result<&ResourceDef> {
        let resources = self
            .clients
            .get(client_name)
            .ok_or_else(|| Error::UnregisteredClient(client_name.to_string()))?;
        resources
            .get(resource)
            .ok_or_else(|| Error::UnregisteredResource {
                client: client_name.to_string(),
                resource: resource.to_string(),
            })
    }
}
