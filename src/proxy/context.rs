use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use std::net::SocketAddr;
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Per-flow context carried through every pipeline phase.
#[derive(Debug)]
pub struct FlowContext {
    pub method: String,
    /// The client-facing request URL exactly as received.
    pub request_url: String,
    /// Resolved absolute URL the flow targets.
    pub full_url: String,
    /// Host without port.
    pub host: String,
    pub path: String,
    pub peer_addr: SocketAddr,
    pub start: Instant,
    pub upstream_start: Option<Instant>,
}

impl FlowContext {
    pub fn new(
        method: String,
        request_url: String,
        full_url: String,
        peer_addr: SocketAddr,
    ) -> Self {
        let (host, path) = host_and_path(&full_url, &request_url);
        Self {
            method,
            request_url,
            full_url,
            host,
            path,
            peer_addr,
            start: Instant::now(),
            upstream_start: None,
        }
    }

    pub fn total_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn upstream_ms(&self) -> Option<u64> {
        self.upstream_start
            .map(|s| s.elapsed().as_millis() as u64)
    }

    /// Single exit point for error responses — keeps metric labels and the
    /// JSON shape consistent across every failure path.
    pub fn error_response(&self, status: StatusCode, msg: &str) -> hyper::Response<BoxBody> {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(status.as_u16());

        metrics::counter!(
            "proxy_http_errors_total",
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
        )
        .increment(1);

        hyper::Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(full_body(format!(r#"{{"error":"{}"}}"#, msg)))
            .unwrap()
    }
}

/// Split an absolute URL into (host-without-port, path-and-query), falling
/// back to the raw request URL for origin-form requests.
pub fn host_and_path(full_url: &str, request_url: &str) -> (String, String) {
    for candidate in [full_url, request_url] {
        if let Some(rest) = candidate
            .strip_prefix("https://")
            .or_else(|| candidate.strip_prefix("http://"))
            .or_else(|| candidate.strip_prefix("wss://"))
            .or_else(|| candidate.strip_prefix("ws://"))
        {
            let (authority, path) = match rest.find('/') {
                Some(idx) => (&rest[..idx], &rest[idx..]),
                None => (rest, "/"),
            };
            let host = authority.split('@').next_back().unwrap_or(authority);
            let host = host.split(':').next().unwrap_or(host).to_string();
            return (host, path.to_string());
        }
    }
    if request_url.starts_with('/') {
        (String::new(), request_url.to_string())
    } else {
        // CONNECT authority-form: "host:port".
        let host = request_url.split(':').next().unwrap_or(request_url);
        (host.to_string(), "/".to_string())
    }
}
