//! Core types for the anvil HTTP client.
//!
//! This crate provides the wire-level types shared by the client library and
//! its framework bindings:
//! - [`Method`] - HTTP method enum
//! - [`Request`], [`RequestBuilder`] and [`RequestMeta`] - outgoing requests
//! - [`Response`] - buffered HTTP response
//! - [`HttpTimeout`] - total and connect timeouts of a call
//! - [`Error`] and [`Result`] - runtime error handling
//! - [`from_json`] / [`to_json`] - body helpers

mod body;
mod error;
mod method;
mod request;
mod response;
mod timeout;

pub use body::{ContentType, from_json, to_json, to_query_string};
pub use error::{Error, Result};
pub use method::Method;
pub use request::{Request, RequestBuilder, RequestMeta};
pub use response::Response;
pub use timeout::HttpTimeout;

// Re-export http crate types for status codes and headers
pub use http::{StatusCode, header};
