//! Methods of resource calls.

use derive_more::Display;

/// Method of a resource call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Method {
    /// Read an item or a collection.
    #[display("GET")]
    Get,
    /// Create an item.
    #[display("POST")]
    Post,
    /// Replace an item.
    #[display("PUT")]
    Put,
    /// Update part of an item.
    #[display("PATCH")]
    Patch,
    /// Remove an item.
    #[display("DELETE")]
    Delete,
}

impl From<Method> for http::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => Self::GET,
            Method::Post => Self::POST,
            Method::Put => Self::PUT,
            Method::Patch => Self::PATCH,
            Method::Delete => Self::DELETE,
        }
    }
}
