//! HTTPS connector using rustls, with CONNECT tunnels through configured proxies.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::Uri;
use http::uri::Scheme;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::connect::proxy::Tunnel;
use tower::ServiceExt;
use tower_service::Service;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};

use crate::TransportConfig;

/// Create an HTTPS connector with rustls.
///
/// Uses the Mozilla root certificates unless certificate verification is
/// disabled in the configuration. HTTP/1.1 and HTTP/2 are both enabled.
/// Targets matching one of the configured proxies are reached through an
/// HTTP CONNECT tunnel, TLS is negotiated end to end inside the tunnel.
#[must_use]
pub fn https_connector(config: &TransportConfig) -> HttpsConnector<ProxyConnector> {
    let root_store: rustls::RootCertStore =
        webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect();

    let mut tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    if !config.verify_certificate {
        let provider = Arc::clone(tls_config.crypto_provider());
        tls_config
            .dangerous()
            .set_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)));
    }

    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_connect_timeout(Some(config.connect_timeout));

    HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(ProxyConnector::new(http, config.clone()))
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

type TcpConnection = <HttpConnector as Service<Uri>>::Response;

/// TCP connector opening a CONNECT tunnel when a proxy is configured for the target.
#[derive(Debug, Clone)]
pub struct ProxyConnector {
    http: HttpConnector,
    config: Arc<TransportConfig>,
}

impl ProxyConnector {
    fn new(http: HttpConnector, config: TransportConfig) -> Self {
        Self {
            http,
            config: Arc::new(config),
        }
    }

    fn proxy_for(&self, dst: &Uri) -> Option<&str> {
        self.config.proxy_for(&dst.to_string())
    }
}

impl Service<Uri> for ProxyConnector {
    type Response = TcpConnection;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<TcpConnection, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), BoxError>> {
        self.http.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let Some(proxy) = self.proxy_for(&dst) else {
            let connecting = self.http.call(dst);
            return Box::pin(async move { connecting.await.map_err(Into::into) });
        };

        tracing::debug!(%dst, proxy, "tunnelling through proxy");
        let proxy = proxy.parse::<Uri>();
        let target = tunnel_target(&dst);
        let http = self.http.clone();
        Box::pin(async move {
            let tunnel = Tunnel::new(proxy?, http);
            let stream = tunnel.oneshot(target?).await?;
            Ok::<_, BoxError>(stream)
        })
    }
}

/// Authority-form target of the CONNECT request, with the scheme's default port.
fn tunnel_target(dst: &Uri) -> Result<Uri, BoxError> {
    let host = dst.host().ok_or("missing destination host")?;
    let default_port = if dst.scheme() == Some(&Scheme::HTTP) {
        80
    } else {
        443
    };
    let port = dst.port_u16().unwrap_or(default_port);
    Ok(format!("{host}:{port}").parse()?)
}

/// Verifier used when `verify_certificate` is off: any chain is trusted,
/// handshake signatures are still checked.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn creates_connector() {
        let _connector = https_connector(&TransportConfig::default());
    }

    #[test]
    fn creates_connector_without_verification() {
        let config = TransportConfig::builder().verify_certificate(false).build();
        let _connector = https_connector(&config);
    }

    #[test]
    fn proxy_matches_target_uri() {
        let proxies = HashMap::from([("http://".to_string(), "http://proxy:3128".to_string())]);
        let config = TransportConfig::builder().proxies(Some(proxies)).build();
        let connector = ProxyConnector::new(HttpConnector::new(), config);

        let plain = Uri::from_static("http://api.example.com/users");
        assert_eq!(connector.proxy_for(&plain), Some("http://proxy:3128"));

        let secure = Uri::from_static("https://api.example.com/users");
        assert_eq!(connector.proxy_for(&secure), None);
    }

    #[test]
    fn no_proxy_without_configuration() {
        let connector = ProxyConnector::new(HttpConnector::new(), TransportConfig::default());
        let dst = Uri::from_static("http://api.example.com/");
        assert_eq!(connector.proxy_for(&dst), None);
    }

    #[test]
    fn tunnel_target_uses_default_ports() {
        let plain = tunnel_target(&Uri::from_static("http://api.example.com/users")).unwrap();
        assert_eq!(plain.to_string(), "api.example.com:80");

        let secure = tunnel_target(&Uri::from_static("https://api.example.com/")).unwrap();
        assert_eq!(secure.to_string(), "api.example.com:443");

        let explicit = tunnel_target(&Uri::from_static("http://localhost:8080/")).unwrap();
        assert_eq!(explicit.to_string(), "localhost:8080");
    }
}
