//! Per-request middleware factories.
//!
//! A factory is built once at startup and turned into a middleware for each
//! incoming request, from what that request carries.
//! `<prefix>.middleware_factories` declares them like middlewares; the
//! parameters of `alias` are read from `<prefix>.middleware_factory.<alias>`,
//! one key or `key value` per line.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use anvil::middleware::{AddHeadersLayer, HttpMiddleware};
use http::HeaderMap;
use http::request::Parts;

use crate::ConfigurationError;
use crate::entry_point::EntryPoints;
use crate::settings::{ListMode, ParsedList, Settings, parse_list};

const BUILTINS: [(&str, &str); 2] = [
    ("accept_language", "anvil:AcceptLanguageBuilder"),
    ("forward_header", "anvil:ForwardHeaderBuilder"),
];

/// Locale negotiated for a request, stored in the request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locale(pub String);

/// What a factory can read from the incoming request.
#[derive(Debug, Clone, Default)]
pub struct IncomingRequest {
    /// Headers of the incoming request.
    pub headers: HeaderMap,
    /// Locale of the request, from the [`Locale`] extension.
    pub locale: Option<String>,
}

impl IncomingRequest {
    /// Capture the relevant parts of an axum request.
    #[must_use]
    pub fn from_parts(parts: &Parts) -> Self {
        Self {
            headers: parts.headers.clone(),
            locale: parts.extensions.get::<Locale>().map(|locale| locale.0.clone()),
        }
    }
}

/// Produces a middleware for each incoming request.
pub trait MiddlewareFactory: Send + Sync + fmt::Debug + 'static {
    /// Middleware for `request`.
    fn create(&self, request: &IncomingRequest) -> Arc<dyn HttpMiddleware>;

    /// Access to the concrete type, for introspection.
    fn as_any(&self) -> &dyn Any;
}

/// Builds a factory from its parameters.
pub trait MiddlewareFactoryBuilder: Send + Sync + fmt::Debug + 'static {
    /// Build the factory.
    ///
    /// # Errors
    ///
    /// Fails on invalid parameters.
    fn build(&self, params: &ParsedList) -> Result<Arc<dyn MiddlewareFactory>, ConfigurationError>;
}

/// Copies incoming headers onto outgoing requests.
///
/// Only headers present on the incoming request are forwarded; they replace
/// outgoing values of the same name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardHeader {
    headers: Vec<String>,
}

impl ForwardHeader {
    /// Forward `headers`.
    pub fn new<H: Into<String>>(headers: impl IntoIterator<Item = H>) -> Self {
        Self {
            headers: headers.into_iter().map(Into::into).collect(),
        }
    }

    /// Forwarded header names.
    #[must_use]
    pub fn headers(&self) -> &[String] {
        &self.headers
    }
}

impl MiddlewareFactory for ForwardHeader {
    fn create(&self, request: &IncomingRequest) -> Arc<dyn HttpMiddleware> {
        let forwarded = self.headers.iter().filter_map(|name| {
            let value = request.headers.get(name.as_str())?.to_str().ok()?;
            Some((name.clone(), value.to_string()))
        });
        Arc::new(AddHeadersLayer::new(forwarded))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Sets `Accept-Language` from the request locale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptLanguage {
    default_locale: String,
}

impl Default for AcceptLanguage {
    fn default() -> Self {
        Self::new("en")
    }
}

impl AcceptLanguage {
    /// Fall back to `default_locale` when the request has no locale.
    pub fn new(default_locale: impl Into<String>) -> Self {
        Self {
            default_locale: default_locale.into(),
        }
    }

    /// Locale used when the request has none.
    #[must_use]
    pub fn default_locale(&self) -> &str {
        &self.default_locale
    }
}

impl MiddlewareFactory for AcceptLanguage {
    fn create(&self, request: &IncomingRequest) -> Arc<dyn HttpMiddleware> {
        let locale = request.locale.as_deref().unwrap_or(&self.default_locale);
        Arc::new(AddHeadersLayer::new([("Accept-Language", locale)]))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// `forward_header`: one header name per line.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardHeaderBuilder;

impl MiddlewareFactoryBuilder for ForwardHeaderBuilder {
    fn build(&self, params: &ParsedList) -> Result<Arc<dyn MiddlewareFactory>, ConfigurationError> {
        Ok(Arc::new(ForwardHeader::new(params.keys())))
    }
}

/// `accept_language`: `default_locale` (`en`).
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptLanguageBuilder;

impl MiddlewareFactoryBuilder for AcceptLanguageBuilder {
    fn build(&self, params: &ParsedList) -> Result<Arc<dyn MiddlewareFactory>, ConfigurationError> {
        let factory = params
            .text("default_locale")
            .map_or_else(AcceptLanguage::default, AcceptLanguage::new);
        Ok(Arc::new(factory))
    }
}

/// Builds the factories declared under `<prefix>.middleware_factories`, in
/// declaration order.
///
/// # Errors
///
/// Fails on an unknown alias or an unresolvable reference.
pub fn build_middleware_factories(
    settings: &Settings,
    prefix: &str,
    entry_points: &EntryPoints,
) -> Result<Vec<Arc<dyn MiddlewareFactory>>, ConfigurationError> {
    let setting = format!("{prefix}.middleware_factories");
    let declared = parse_list(settings, &setting, ListMode::Flags)?;

    declared
        .iter()
        .map(|(alias, value)| -> Result<Arc<dyn MiddlewareFactory>, ConfigurationError> {
            let reference = match value.as_text() {
                Some(reference) => reference,
                None => BUILTINS
                    .iter()
                    .find(|(name, _)| *name == alias)
                    .map(|(_, reference)| *reference)
                    .ok_or_else(|| ConfigurationError::InvalidChoice {
                        value: alias.to_string(),
                        setting: setting.clone(),
                        choices: BUILTINS.map(|(alias, _)| alias).join(", "),
                    })?,
            };
            let builder = entry_points
                .middleware_factories
                .resolve(reference, &())?
                .ok_or_else(|| ConfigurationError::UnresolvableEntryPoint(reference.to_string()))?;

            let params = parse_list(
                settings,
                &format!("{prefix}.middleware_factory.{alias}"),
                ListMode::Flags,
            )?;
            let factory = builder.build(&params)?;
            tracing::debug!(prefix, alias, reference, "built middleware factory");
            Ok(factory)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use assert2::{check, let_assert};
    use http::HeaderValue;

    use super::*;

    fn headers_of(middleware: &Arc<dyn HttpMiddleware>) -> Vec<(String, String)> {
        middleware
            .as_any()
            .downcast_ref::<AddHeadersLayer>()
            .map(|layer| layer.headers().to_vec())
            .unwrap_or_default()
    }

    fn incoming(headers: &[(&'static str, &'static str)]) -> IncomingRequest {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(*name, HeaderValue::from_static(value));
        }
        IncomingRequest {
            headers: map,
            locale: None,
        }
    }

    #[test]
    fn forward_header_only_forwards_present_headers() {
        let factory = ForwardHeader::new(["Authorization", "X-Correlation-Id"]);
        let request = incoming(&[("authorization", "Bearer abc"), ("x-other", "1")]);
        let middleware = factory.create(&request);

        let expected = vec![("Authorization".to_string(), "Bearer abc".to_string())];
        check!(headers_of(&middleware) == expected);
    }

    #[test]
    fn accept_language_uses_request_locale() {
        let factory = AcceptLanguage::default();

        let middleware = factory.create(&IncomingRequest::default());
        check!(headers_of(&middleware) == vec![("Accept-Language".to_string(), "en".to_string())]);

        let request = IncomingRequest {
            locale: Some("fr".to_string()),
            ..IncomingRequest::default()
        };
        let middleware = factory.create(&request);
        check!(headers_of(&middleware) == vec![("Accept-Language".to_string(), "fr".to_string())]);
    }

    #[test]
    fn incoming_request_from_parts() {
        let mut request = http::Request::builder()
            .header("Authorization", "Bearer abc")
            .body(())
            .expect("request");
        request.extensions_mut().insert(Locale("de".to_string()));
        let (parts, ()) = request.into_parts();

        let incoming = IncomingRequest::from_parts(&parts);
        check!(incoming.locale.as_deref() == Some("de"));
        let authorization = incoming.headers.get("authorization").map(HeaderValue::as_bytes);
        check!(authorization == Some(&b"Bearer abc"[..]));
    }

    #[test]
    fn build_declared_factories() {
        let settings = Settings::new()
            .with("anvil.client.middleware_factories", "forward_header\naccept_language")
            .with(
                "anvil.client.middleware_factory.forward_header",
                "Authorization\nX-Correlation-Id",
            )
            .with("anvil.client.middleware_factory.accept_language", "default_locale fr");

        let factories =
            build_middleware_factories(&settings, "anvil.client", &EntryPoints::default())
                .expect("build");
        check!(factories.len() == 2);

        let forward = factories.first().and_then(|f| f.as_any().downcast_ref::<ForwardHeader>());
        check!(
            forward.map(ForwardHeader::headers)
                == Some(&["Authorization".to_string(), "X-Correlation-Id".to_string()][..])
        );
        let language = factories.get(1).and_then(|f| f.as_any().downcast_ref::<AcceptLanguage>());
        check!(language.map(AcceptLanguage::default_locale) == Some("fr"));
    }

    #[test]
    fn no_factory_declared() {
        let factories =
            build_middleware_factories(&Settings::new(), "anvil.client", &EntryPoints::default())
                .expect("build");
        check!(factories.is_empty());
    }

    #[test]
    fn unknown_factory() {
        let settings = Settings::new().with("anvil.client.middleware_factories", "cookies");
        let result = build_middleware_factories(&settings, "anvil.client", &EntryPoints::default());
        let_assert!(Err(err) = result);
        check!(
            err.to_string()
                == "Invalid value cookies for anvil.client.middleware_factories: \
                    not in accept_language, forward_header"
        );
    }
}
