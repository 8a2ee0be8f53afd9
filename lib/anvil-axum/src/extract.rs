//! axum integration.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{FromRef, FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};

use crate::binding::{AnvilBinding, Clients};
use crate::error::UnknownClient;
use crate::middleware_factory::IncomingRequest;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Extracts the clients of the current request.
///
/// The application state must provide an `Arc<AnvilBinding>`. Extracting
/// twice within one request yields the same accessor.
impl<S> FromRequestParts<S> for Clients
where
    Arc<AnvilBinding>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        if let Some(clients) = parts.extensions.get::<Self>() {
            return Ok(clients.clone());
        }

        let binding = Arc::<AnvilBinding>::from_ref(state);
        let clients = binding.for_request(IncomingRequest::from_parts(parts));
        parts.extensions.insert(clients.clone());
        Ok(clients)
    }
}

impl IntoResponse for UnknownClient {
    fn into_response(self) -> Response {
        tracing::warn!(client = %self.name, "unknown client requested");
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}

/// Prometheus scrape handler; `404 Not Found` when no client declares metrics.
pub async fn metrics_endpoint(State(binding): State<Arc<AnvilBinding>>) -> Response {
    match binding.render_metrics() {
        Some(rendered) => {
            ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], rendered).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
