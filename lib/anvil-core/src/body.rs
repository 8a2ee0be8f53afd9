//! JSON and query string encoding of call payloads.

use bytes::Bytes;

use crate::Result;

/// Media type of a request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    /// `application/json`.
    Json,
}

impl ContentType {
    /// Header value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Json => "application/json",
        }
    }
}

/// Encode a JSON body.
///
/// # Errors
///
/// Returns an error if `value` cannot be represented in JSON.
pub fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

/// Encode pairs as an `application/x-www-form-urlencoded` query string.
///
/// ```
/// let query = anvil_core::to_query_string(&[("fields", "name"), ("page", "2")]).expect("encode");
/// assert_eq!(query, "fields=name&page=2");
/// ```
///
/// # Errors
///
/// Returns an error if `value` is not a sequence of pairs or a flat struct.
pub fn to_query_string<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_urlencoded::to_string(value)?)
}

/// Decode a JSON body.
///
/// # Errors
///
/// The error names the path of the first mismatching field, e.g.
/// `items[2].id`.
pub fn from_json<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let mut deserializer = serde_json::Deserializer::from_slice(bytes);
    serde_path_to_error::deserialize(&mut deserializer)
        .map_err(|err| {
            crate::Error::json_deserialization(err.path().to_string(), err.inner().to_string())
        })
}
