//! Upstream side of the proxy: the pooled HTTP client, target URL
//! resolution, and timeout-aware send/collect helpers.

use crate::config::Settings;
use crate::error::{categorize_error, ErrorCategory};
use crate::proxy::context::BoxBody;
use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;

pub type ProxyClient = Client<HttpsConnector<HttpConnector>, BoxBody>;

/// A rustls `ServerCertVerifier` that accepts any certificate. Default for
/// an intercepting proxy: encryption without upstream identity checks.
/// Strict mode swaps in real verification.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Build the pooled HTTP/1.1 client used for every upstream exchange.
///
/// - Plain `http://` goes through the inner `HttpConnector` directly.
/// - `https://` is terminated with rustls (ring backend).
/// - With strict TLS off (default) certificates are not validated; strict
///   mode verifies against webpki roots plus an optional extra CA bundle.
pub fn build_proxy_client(settings: &Settings) -> Result<ProxyClient> {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.set_keepalive(Some(Duration::from_secs(60)));
    http.set_connect_timeout(Some(Duration::from_millis(
        settings.upstream_headers_timeout_ms,
    )));
    http.enforce_http(false);

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(upstream_tls_config(settings)?)
        .https_or_http()
        .enable_http1()
        .wrap_connector(http);

    Ok(Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(60))
        .pool_max_idle_per_host(16)
        .build(https))
}

/// The rustls client config used for every upstream TLS session (HTTP and
/// WebSocket alike) — permissive by default, verifying in strict mode.
pub fn upstream_tls_config(settings: &Settings) -> Result<rustls::ClientConfig> {
    if settings.strict_tls_enabled {
        let mut roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        if let Some(ref ca_file) = settings.strict_tls_ca_file {
            let pem = std::fs::read(ca_file)
                .with_context(|| format!("failed to read {}", ca_file.display()))?;
            for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
                let cert = cert.context("invalid certificate in strict TLS CA file")?;
                roots
                    .add(cert)
                    .context("failed to add strict TLS CA certificate")?;
            }
        }
        Ok(rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth())
    } else {
        Ok(rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth())
    }
}

/// Resolve the absolute upstream URL for a request:
/// 1. `X-Target-URL` header when present and absolute;
/// 2. the absolute request-URI;
/// 3. `{proto}://{Host}{path}`, proto from `X-Forwarded-Proto` or the
///    transport (MITM flows are always https).
pub fn resolve_target_url<B>(req: &Request<B>, mitm_host: Option<&str>) -> Option<String> {
    if let Some(target) = req
        .headers()
        .get("x-target-url")
        .and_then(|v| v.to_str().ok())
    {
        if target.starts_with("http://") || target.starts_with("https://") {
            return Some(target.to_string());
        }
    }

    if req.uri().scheme().is_some() && req.uri().authority().is_some() {
        return Some(req.uri().to_string());
    }

    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    if let Some(host) = mitm_host {
        return Some(format!("https://{}{}", host, path));
    }

    let host = req.headers().get(http::header::HOST)?.to_str().ok()?;
    let proto = req
        .headers()
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    Some(format!("{}://{}{}", proto, host, path))
}

/// Send an upstream request bounded by the headers timeout. On failure the
/// error is categorised for the log entry.
pub async fn send_with_timeout(
    client: &ProxyClient,
    req: Request<BoxBody>,
    headers_timeout_ms: u64,
) -> std::result::Result<Response<Incoming>, (ErrorCategory, String)> {
    match tokio::time::timeout(
        Duration::from_millis(headers_timeout_ms),
        client.request(req),
    )
    .await
    {
        Ok(Ok(resp)) => Ok(resp),
        Ok(Err(e)) => Err((categorize_error(&e), e.to_string())),
        Err(_) => Err((
            ErrorCategory::Timeout,
            format!("upstream headers timeout after {}ms", headers_timeout_ms),
        )),
    }
}

/// Collect a response body bounded by the body timeout.
pub async fn collect_with_timeout(
    body: Incoming,
    body_timeout_ms: u64,
) -> std::result::Result<Bytes, (ErrorCategory, String)> {
    match tokio::time::timeout(Duration::from_millis(body_timeout_ms), body.collect()).await {
        Ok(Ok(collected)) => Ok(collected.to_bytes()),
        Ok(Err(e)) => Err((categorize_error(&e), e.to_string())),
        Err(_) => Err((
            ErrorCategory::Timeout,
            format!("upstream body timeout after {}ms", body_timeout_ms),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(uri: &str, headers: &[(&str, &str)], mitm: Option<&str>) -> Option<String> {
        let mut builder = Request::builder().method("GET").uri(uri);
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        let req = builder.body(()).unwrap();
        resolve_target_url(&req, mitm)
    }

    #[test]
    fn test_target_header_wins() {
        assert_eq!(
            resolve(
                "/path",
                &[("x-target-url", "https://real.example.com/api"), ("host", "h")],
                None
            ),
            Some("https://real.example.com/api".to_string())
        );
    }

    #[test]
    fn test_absolute_uri() {
        assert_eq!(
            resolve("http://abs.example.com/x?y=1", &[], None),
            Some("http://abs.example.com/x?y=1".to_string())
        );
    }

    #[test]
    fn test_host_header_fallback() {
        assert_eq!(
            resolve("/x", &[("host", "fallback.example.com")], None),
            Some("http://fallback.example.com/x".to_string())
        );
        assert_eq!(
            resolve(
                "/x",
                &[("host", "fallback.example.com"), ("x-forwarded-proto", "https")],
                None
            ),
            Some("https://fallback.example.com/x".to_string())
        );
    }

    #[test]
    fn test_mitm_reconstruction() {
        assert_eq!(
            resolve("/api/v1", &[("host", "inner.example.com")], Some("inner.example.com")),
            Some("https://inner.example.com/api/v1".to_string())
        );
    }
}
