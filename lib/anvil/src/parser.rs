//! Collection and error parsers.
//!
//! A [`CollectionParser`] turns the response of a collection call into a
//! [`Collection`]; an [`ErrorParser`] turns a non-2xx response into an
//! [`Error`].

use std::any::Any;
use std::fmt;

use crate::{Error, Response, Result, StatusCode};

/// Header carrying the total number of items of a paginated collection.
pub const TOTAL_COUNT_HEADER: &str = "Total-Count";

/// Items returned by a collection call.
#[derive(Debug, Clone, PartialEq)]
pub struct Collection {
    /// Decoded items.
    pub items: Vec<serde_json::Value>,
    /// Total number of items on the server side.
    pub total_count: usize,
}

impl Collection {
    /// Decode every item into `T`.
    ///
    /// # Errors
    ///
    /// Returns an error if one item does not match `T`.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<Vec<T>> {
        self.items
            .iter()
            .map(|item| serde_json::from_value(item.clone()).map_err(Error::from))
            .collect()
    }
}

/// Parses the response of a collection call.
pub trait CollectionParser: Send + Sync + fmt::Debug + 'static {
    /// Parse the response.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not a collection.
    fn parse(&self, response: &Response) -> Result<Collection>;

    /// Access to the concrete type, for introspection.
    fn as_any(&self) -> &dyn Any;
}

/// Reads a JSON array body and the `Total-Count` header.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCollectionParser;

impl CollectionParser for DefaultCollectionParser {
    fn parse(&self, response: &Response) -> Result<Collection> {
        let items: Vec<serde_json::Value> = response.json()?;
        let total_count = response
            .header(TOTAL_COUNT_HEADER)
            .and_then(|count| count.trim().parse().ok())
            .unwrap_or(items.len());
        Ok(Collection { items, total_count })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Builds the error returned for a non-2xx response.
pub trait ErrorParser: Send + Sync + fmt::Debug + 'static {
    /// Build the error of a failed call.
    fn parse(&self, client_name: &str, response: Response) -> Error;

    /// Access to the concrete type, for introspection.
    fn as_any(&self) -> &dyn Any;
}

/// Produces [`Error::Http`] with the canonical reason and the response body.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultErrorParser;

impl ErrorParser for DefaultErrorParser {
    fn parse(&self, client_name: &str, response: Response) -> Error {
        let status = response.status();
        let reason = StatusCode::from_u16(status)
            .ok()
            .and_then(|code| code.canonical_reason())
            .unwrap_or("Unknown Status");
        tracing::debug!(client_name, status, "remote call failed");
        Error::http_with_body(status, reason, response.into_body())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
