//! CONNECT handling: raw tunnels for bypassed hosts, TLS termination plus
//! a synthesized HTTPS server for mediated ones.

use crate::logstore::{NewLogEntry, Source};
use crate::proxy::context::{empty_body, full_body, BoxBody};
use crate::proxy::handler;
use crate::routing::{self, RouteContext, RouteDecision};
use crate::server::ProxyState;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

// Plain fn (not `async fn`) returning an explicitly boxed future: handle_connect
// and handle_request are mutually recursive (a MITM'd CONNECT tunnel can carry a
// nested CONNECT), and the compiler cannot resolve the resulting cyclic opaque
// `impl Future` types. Boxing here gives this edge of the cycle a concrete,
// already-Send type, which breaks the cycle for the type checker.
pub fn handle_connect(
    req: Request<Incoming>,
    state: ProxyState,
    peer_addr: SocketAddr,
) -> Pin<Box<dyn Future<Output = Result<Response<BoxBody>, hyper::Error>> + Send>> {
    Box::pin(async move {
        let Some(authority) = req.uri().authority().cloned() else {
            return Ok(Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(full_body(r#"{"error":"CONNECT requires authority"}"#))
                .unwrap());
        };

        let host = authority.host().to_string();
        let port = authority.port_u16().unwrap_or(443);
        let target = format!("{}:{}", host, port);
        let full_url = format!("https://{}", target);

        let route_ctx = RouteContext {
            method: "CONNECT",
            request_url: &target,
            full_url: &full_url,
            host: &host,
        };
        let decision = routing::decide(
            &route_ctx,
            &state.routing_modes(),
            &state.rules.block_matchers(),
            &state.rules.filter_matchers(),
            state.listen_port(),
        );

        let start = Instant::now();
        match decision {
            RouteDecision::Direct => {
                tokio::spawn(async move {
                    match hyper::upgrade::on(req).await {
                        Ok(upgraded) => {
                            run_raw_tunnel(upgraded, state, target, full_url, start).await;
                        }
                        Err(e) => debug!("connect: upgrade failed, error={}", e),
                    }
                });
            }
            // Blocked CONNECT targets are still MITM'd: the inner requests hit
            // the block decision individually and get their 204s.
            RouteDecision::Block | RouteDecision::Proxy => {
                tokio::spawn(async move {
                    match hyper::upgrade::on(req).await {
                        Ok(upgraded) => {
                            run_mitm_tunnel(upgraded, state, host, port, peer_addr).await;
                        }
                        Err(e) => debug!("connect: upgrade failed, error={}", e),
                    }
                });
            }
        }

        Ok(Response::builder()
            .status(StatusCode::OK)
            .body(empty_body())
            .unwrap())
    })
}

/// Bypassed CONNECT: plain TCP splice. TLS stays end-to-end between the
/// client and the origin.
async fn run_raw_tunnel(
    upgraded: hyper::upgrade::Upgraded,
    state: ProxyState,
    target: String,
    full_url: String,
    start: Instant,
) {
    let upstream = match TcpStream::connect(&target).await {
        Ok(s) => s,
        Err(e) => {
            warn!("connect: tunnel connect failed, target={}, error={}", target, e);
            state.logs.add(NewLogEntry {
                method: "CONNECT".into(),
                url: target,
                full_url,
                source: Some(Source::Error),
                error: Some(e.to_string()),
                upstream_error_category: Some(crate::error::categorize_error(&e)),
                total_duration_ms: Some(start.elapsed().as_millis() as u64),
                ..Default::default()
            });
            return;
        }
    };

    let mut client = TokioIo::new(upgraded);
    let mut upstream = upstream;
    let (client_bytes, upstream_bytes) =
        match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
            Ok(counts) => counts,
            Err(e) => {
                debug!("connect: tunnel closed with error, target={}, error={}", target, e);
                (0, 0)
            }
        };

    state.logs.add(NewLogEntry {
        method: "CONNECT".into(),
        url: target,
        full_url,
        source: Some(Source::Tunnel),
        status_code: Some(200),
        total_duration_ms: Some(start.elapsed().as_millis() as u64),
        request_bytes: client_bytes,
        response_bytes: upstream_bytes,
        ..Default::default()
    });
}

/// Mediated CONNECT: terminate TLS with a leaf certificate for the target
/// host and run each decrypted request through the HTTP pipeline. The
/// resolved URL becomes `https://host{path}` since only the path arrives.
async fn run_mitm_tunnel(
    upgraded: hyper::upgrade::Upgraded,
    state: ProxyState,
    host: String,
    port: u16,
    peer_addr: SocketAddr,
) {
    let config = match state.authority.server_config_for_host(&host) {
        Ok(c) => c,
        Err(e) => {
            // Leaf issuance failure closes the connection.
            warn!("connect: leaf issuance failed, host={}, error={}", host, e);
            return;
        }
    };

    let acceptor = TlsAcceptor::from(config);
    let tls_stream = match acceptor.accept(TokioIo::new(upgraded)).await {
        Ok(s) => s,
        Err(e) => {
            debug!("connect: TLS handshake failed, host={}, error={}", host, e);
            return;
        }
    };

    let mitm_host = if port == 443 {
        host.clone()
    } else {
        format!("{}:{}", host, port)
    };

    let io = TokioIo::new(tls_stream);
    let svc = service_fn(move |req: Request<Incoming>| {
        let state = state.clone();
        let mitm_host = mitm_host.clone();
        async move { handler::handle_request(req, state, peer_addr, Some(mitm_host)).await }
    });

    if let Err(e) = hyper::server::conn::http1::Builder::new()
        .preserve_header_case(true)
        .serve_connection(io, svc)
        .with_upgrades()
        .await
    {
        let msg = e.to_string();
        if !msg.contains("connection closed") && !msg.contains("connection reset") {
            debug!("connect: MITM connection ended, host={}, error={}", host, msg);
        }
    }
}
