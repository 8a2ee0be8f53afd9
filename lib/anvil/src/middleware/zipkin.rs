//! Zipkin B3 propagation middleware.
//!
//! Every outgoing call gets a new span id. The trace id is kept when the
//! request already carries one, otherwise a new trace is started.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tower::util::BoxCloneService;
use tower::{Layer, Service};
use tracing::{Instrument, Level, span};

use super::HttpMiddleware;
use crate::{BoxedService, Error, Request, Response, Result};

/// Trace id header.
pub const TRACE_ID: &str = "X-B3-TraceId";
/// Span id header.
pub const SPAN_ID: &str = "X-B3-SpanId";
/// Parent span id header.
pub const PARENT_SPAN_ID: &str = "X-B3-ParentSpanId";
/// Sampling decision header.
pub const SAMPLED: &str = "X-B3-Sampled";

fn new_id(len: usize) -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(len);
    id
}

/// Layer propagating B3 headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipkinLayer;

impl ZipkinLayer {
    /// Create a new zipkin layer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for ZipkinLayer {
    type Service = Zipkin<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Zipkin { inner }
    }
}

impl HttpMiddleware for ZipkinLayer {
    fn wrap(&self, next: BoxedService) -> BoxedService {
        BoxCloneService::new(self.layer(next))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Service propagating B3 headers.
#[derive(Debug, Clone)]
pub struct Zipkin<S> {
    inner: S,
}

impl<S> Service<Request> for Zipkin<S>
where
    S: Service<Request, Response = Response, Error = Error> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request) -> Self::Future {
        let trace_id = request
            .header(TRACE_ID)
            .map_or_else(|| new_id(32), ToString::to_string);
        let parent = request.header(SPAN_ID).map(ToString::to_string);
        let span_id = new_id(16);

        request.set_header(TRACE_ID, trace_id.as_str());
        request.set_header(SPAN_ID, span_id.as_str());
        if let Some(parent) = &parent {
            request.set_header(PARENT_SPAN_ID, parent.as_str());
        }
        if request.header(SAMPLED).is_none() {
            request.set_header(SAMPLED, "1");
        }

        let span = span!(
            Level::DEBUG,
            "zipkin",
            trace_id = %trace_id,
            span_id = %span_id,
            client = %request.meta().client_name,
        );

        let mut inner = self.inner.clone();
        Box::pin(async move { inner.call(request).await }.instrument(span))
    }
}
