//! The WebSocket pipeline.
//!
//! Blocked upgrades die with a 204. Bypassed upgrades replay the original
//! handshake verbatim and splice bytes. Mediated upgrades complete the 101
//! toward the client, open a fresh upstream connection, and relay frames
//! through the rewrite engine — client frames as phase `request`, server
//! frames as phase `response`. A per-connection summary entry is emitted
//! when either side closes.

use crate::logstore::{NewLogEntry, Source};
use crate::proxy::context::{empty_body, full_body, BoxBody, FlowContext};
use crate::proxy::upstream::upstream_tls_config;
use crate::rewrite::websocket::rewrite_ws_text;
use crate::rewrite::AppliedRules;
use crate::routing::{self, RouteContext, RouteDecision, WsRouteDecision};
use crate::rules::RulePhase;
use crate::server::ProxyState;
use futures_util::{SinkExt, StreamExt};
use http::header::{
    CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, UPGRADE,
};
use http::{HeaderValue, StatusCode};
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Message, Role};
use tokio_tungstenite::{connect_async_tls_with_config, Connector, WebSocketStream};
use tracing::{debug, warn};

pub fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    req.headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

pub async fn handle_upgrade(
    req: Request<Incoming>,
    state: ProxyState,
    peer_addr: SocketAddr,
    mitm_host: Option<String>,
) -> Result<Response<BoxBody>, hyper::Error> {
    let request_url = req.uri().to_string();
    let http_url = crate::proxy::upstream::resolve_target_url(&req, mitm_host.as_deref())
        .unwrap_or_else(|| request_url.clone());
    let ws_url = to_ws_scheme(&http_url);

    let ctx = FlowContext::new(
        req.method().as_str().to_string(),
        request_url,
        ws_url.clone(),
        peer_addr,
    );

    let route_ctx = RouteContext {
        method: &ctx.method,
        request_url: &ctx.request_url,
        full_url: &ctx.full_url,
        host: &ctx.host,
    };
    let decision = routing::decide(
        &route_ctx,
        &state.routing_modes(),
        &state.rules.block_matchers(),
        &state.rules.filter_matchers(),
        state.listen_port(),
    );

    match routing::decide_websocket(decision) {
        WsRouteDecision::Block => {
            state.logs.add(NewLogEntry {
                method: ctx.method.clone(),
                url: ctx.request_url.clone(),
                full_url: ctx.full_url.clone(),
                source: Some(Source::Blocked),
                status_code: Some(204),
                total_duration_ms: Some(ctx.total_ms()),
                ..Default::default()
            });
            Ok(Response::builder()
                .status(StatusCode::NO_CONTENT)
                .body(empty_body())
                .unwrap())
        }
        WsRouteDecision::Direct => direct_splice(req, ctx, state, mitm_host.is_some()).await,
        WsRouteDecision::Mitm => mediate(req, ctx, state, mitm_host.is_some()).await,
    }
}

fn to_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        url.to_string()
    }
}

// ---------------------------------------------------------------------------
// Direct: verbatim handshake replay + byte splice
// ---------------------------------------------------------------------------

async fn direct_splice(
    req: Request<Incoming>,
    ctx: FlowContext,
    state: ProxyState,
    upstream_tls: bool,
) -> Result<Response<BoxBody>, hyper::Error> {
    let (parts, _body) = req.into_parts();
    let raw_request = serialize_handshake(&parts);

    let default_port = if upstream_tls { 443 } else { 80 };
    let port = authority_port(&ctx.full_url).unwrap_or(default_port);
    let addr = format!("{}:{}", ctx.host, port);

    let result: std::io::Result<Response<BoxBody>> = async {
        if upstream_tls {
            let config = upstream_tls_config(&state.settings)
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
            let server_name = rustls::pki_types::ServerName::try_from(ctx.host.clone())
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            let tcp = TcpStream::connect(&addr).await?;
            let stream = connector.connect(server_name, tcp).await?;
            relay_handshake(stream, raw_request, parts, ctx, state).await
        } else {
            let stream = TcpStream::connect(&addr).await?;
            relay_handshake(stream, raw_request, parts, ctx, state).await
        }
    }
    .await;

    match result {
        Ok(resp) => Ok(resp),
        Err(e) => {
            warn!("ws: direct connect failed, addr={}, error={}", addr, e);
            Ok(Response::builder()
                .status(StatusCode::BAD_GATEWAY)
                .body(full_body(r#"{"error":"bad gateway"}"#))
                .unwrap())
        }
    }
}

/// Forward the original handshake, mirror the upstream response, and on a
/// 101 splice the two sockets.
async fn relay_handshake<S>(
    mut upstream: S,
    raw_request: Vec<u8>,
    parts: http::request::Parts,
    ctx: FlowContext,
    state: ProxyState,
) -> std::io::Result<Response<BoxBody>>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    upstream.write_all(&raw_request).await?;

    // Read the upstream response head; anything past CRLFCRLF already
    // belongs to the spliced stream.
    let mut buf = Vec::with_capacity(1024);
    let head_end = loop {
        let mut chunk = [0u8; 1024];
        let n = upstream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "upstream closed during handshake",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > 16 * 1024 {
            return Err(std::io::Error::other("handshake response too large"));
        }
    };

    let (status, headers) = parse_response_head(&buf[..head_end])
        .ok_or_else(|| std::io::Error::other("malformed handshake response"))?;
    let leftover = buf[head_end..].to_vec();

    let mut builder = Response::builder().status(status);
    for (name, value) in &headers {
        builder = builder.header(name.as_str(), value.as_str());
    }

    if status != 101 {
        debug!("ws: upstream refused upgrade, url={}, status={}", ctx.full_url, status);
        return Ok(builder.body(full_body(leftover)).unwrap());
    }

    let start = Instant::now();
    let on_upgrade = hyper::upgrade::on(Request::from_parts(parts, empty_body()));
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(u) => u,
            Err(e) => {
                debug!("ws: client upgrade failed, error={}", e);
                return;
            }
        };
        let mut client = TokioIo::new(upgraded);
        if !leftover.is_empty() {
            if client.write_all(&leftover).await.is_err() {
                return;
            }
        }
        let mut upstream = upstream;
        let (sent, received) =
            match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                Ok(counts) => counts,
                Err(_) => (0, 0),
            };

        state.logs.add(NewLogEntry {
            method: "GET".into(),
            url: ctx.request_url.clone(),
            full_url: ctx.full_url.clone(),
            source: Some(Source::Direct),
            status_code: Some(101),
            total_duration_ms: Some(start.elapsed().as_millis() as u64),
            request_bytes: sent,
            response_bytes: received,
            ..Default::default()
        });
    });

    Ok(builder.body(empty_body()).unwrap())
}

fn serialize_handshake(parts: &http::request::Parts) -> Vec<u8> {
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut out = format!("{} {} HTTP/1.1\r\n", parts.method, path).into_bytes();
    for (name, value) in &parts.headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

fn parse_response_head(head: &[u8]) -> Option<(u16, Vec<(String, String)>)> {
    let text = std::str::from_utf8(head).ok()?;
    let mut lines = text.split("\r\n");
    let status_line = lines.next()?;
    let status: u16 = status_line.split_whitespace().nth(1)?.parse().ok()?;
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':')?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Some((status, headers))
}

fn authority_port(url: &str) -> Option<u16> {
    let rest = url.split("://").nth(1)?;
    let authority = rest.split('/').next()?;
    authority.rsplit_once(':')?.1.parse().ok()
}

// ---------------------------------------------------------------------------
// MITM: both sides handled as WebSocket, frames run through the rewriter
// ---------------------------------------------------------------------------

#[derive(Default)]
struct WsSummary {
    client_messages: u64,
    upstream_messages: u64,
    client_bytes: u64,
    upstream_bytes: u64,
    rewrites: u64,
}

async fn mediate(
    req: Request<Incoming>,
    ctx: FlowContext,
    state: ProxyState,
    upstream_tls: bool,
) -> Result<Response<BoxBody>, hyper::Error> {
    let Some(key) = req
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .map(|v| v.as_bytes().to_vec())
    else {
        return Ok(Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(full_body(r#"{"error":"missing Sec-WebSocket-Key"}"#))
            .unwrap());
    };

    // Upstream first: a refused upstream means the client never sees 101.
    let mut upstream_req =
        match tokio_tungstenite::tungstenite::client::IntoClientRequest::into_client_request(
            ctx.full_url.as_str(),
        ) {
            Ok(r) => r,
            Err(e) => {
                warn!("ws: invalid upstream url, url={}, error={}", ctx.full_url, e);
                return Ok(Response::builder()
                    .status(StatusCode::BAD_GATEWAY)
                    .body(full_body(r#"{"error":"bad gateway"}"#))
                    .unwrap());
            }
        };
    for name in [
        SEC_WEBSOCKET_PROTOCOL,
        http::header::COOKIE,
        http::header::ORIGIN,
        http::header::USER_AGENT,
        http::header::AUTHORIZATION,
    ] {
        if let Some(value) = req.headers().get(&name) {
            upstream_req.headers_mut().insert(name, value.clone());
        }
    }

    let connector = if upstream_tls {
        match upstream_tls_config(&state.settings) {
            Ok(config) => Some(Connector::Rustls(Arc::new(config))),
            Err(e) => {
                warn!("ws: upstream tls config failed, error={}", e);
                None
            }
        }
    } else {
        Some(Connector::Plain)
    };

    let (upstream_ws, upstream_resp) =
        match connect_async_tls_with_config(upstream_req, None, false, connector).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("ws: upstream connect failed, url={}, error={}", ctx.full_url, e);
                state.logs.add(NewLogEntry {
                    method: ctx.method.clone(),
                    url: ctx.request_url.clone(),
                    full_url: ctx.full_url.clone(),
                    source: Some(Source::Error),
                    error: Some(e.to_string()),
                    upstream_error_category: Some(crate::error::categorize_message(
                        &e.to_string(),
                    )),
                    total_duration_ms: Some(ctx.total_ms()),
                    ..Default::default()
                });
                return Ok(Response::builder()
                    .status(StatusCode::BAD_GATEWAY)
                    .body(full_body(r#"{"error":"bad gateway"}"#))
                    .unwrap());
            }
        };

    let accept = derive_accept_key(&key);
    let mut builder = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(UPGRADE, HeaderValue::from_static("websocket"))
        .header(CONNECTION, HeaderValue::from_static("Upgrade"))
        .header(SEC_WEBSOCKET_ACCEPT, accept);
    if let Some(protocol) = upstream_resp.headers().get(SEC_WEBSOCKET_PROTOCOL) {
        builder = builder.header(SEC_WEBSOCKET_PROTOCOL, protocol.clone());
    }

    let on_upgrade = hyper::upgrade::on(req);
    let start = Instant::now();
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(u) => u,
            Err(e) => {
                debug!("ws: client upgrade failed, error={}", e);
                return;
            }
        };
        let client_ws =
            WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
        relay_frames(client_ws, upstream_ws, ctx, state, start).await;
    });

    Ok(builder.body(empty_body()).unwrap())
}

async fn relay_frames<C, U>(
    client_ws: WebSocketStream<C>,
    upstream_ws: WebSocketStream<U>,
    ctx: FlowContext,
    state: ProxyState,
    start: Instant,
) where
    C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    U: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut client_tx, mut client_rx) = client_ws.split();
    let (mut upstream_tx, mut upstream_rx) = upstream_ws.split();
    let mut summary = WsSummary::default();

    loop {
        tokio::select! {
            msg = client_rx.next() => match msg {
                Some(Ok(msg)) => {
                    let msg = mediate_message(msg, RulePhase::Request, &ctx, &state, &mut summary);
                    summary.client_messages += 1;
                    metrics::counter!("proxy_ws_messages_total", "direction" => "client").increment(1);
                    if upstream_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    debug!("ws: client read error, url={}, error={}", ctx.full_url, e);
                    let _ = upstream_tx.send(Message::Close(None)).await;
                    break;
                }
                None => {
                    let _ = upstream_tx.send(Message::Close(None)).await;
                    break;
                }
            },
            msg = upstream_rx.next() => match msg {
                Some(Ok(msg)) => {
                    let msg = mediate_message(msg, RulePhase::Response, &ctx, &state, &mut summary);
                    summary.upstream_messages += 1;
                    metrics::counter!("proxy_ws_messages_total", "direction" => "upstream").increment(1);
                    if client_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    debug!("ws: upstream read error, url={}, error={}", ctx.full_url, e);
                    let _ = client_tx.send(Message::Close(None)).await;
                    break;
                }
                None => {
                    let _ = client_tx.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }

    state.logs.add(NewLogEntry {
        method: ctx.method.clone(),
        url: ctx.request_url.clone(),
        full_url: ctx.full_url.clone(),
        source: Some(Source::Websocket),
        status_code: Some(101),
        response_body: Some(serde_json::json!({
            "clientMessages": summary.client_messages,
            "upstreamMessages": summary.upstream_messages,
            "rewrites": summary.rewrites,
        })),
        total_duration_ms: Some(start.elapsed().as_millis() as u64),
        request_bytes: summary.client_bytes,
        response_bytes: summary.upstream_bytes,
        ..Default::default()
    });
}

/// Run one frame through the rewrite engine. Text frames (opcode 1) within
/// the size cap are rewritable; binary frames (opcode 2) and control
/// frames pass through untouched.
fn mediate_message(
    msg: Message,
    phase: RulePhase,
    ctx: &FlowContext,
    state: &ProxyState,
    summary: &mut WsSummary,
) -> Message {
    let direction_bytes = |summary: &mut WsSummary, n: u64| match phase {
        RulePhase::Request => summary.client_bytes += n,
        RulePhase::Response => summary.upstream_bytes += n,
    };

    match msg {
        Message::Text(text) => {
            direction_bytes(summary, text.len() as u64);
            let modes = state.modes();
            if !modes.edit_rules_enabled {
                return Message::Text(text);
            }
            let compiled = state.rules.compiled();
            let mut applied = AppliedRules::new();
            let outcome = rewrite_ws_text(
                text.as_str(),
                &compiled,
                phase,
                &ctx.path,
                &ctx.full_url,
                state.settings.ws_max_text_bytes,
                &mut applied,
            );
            summary.rewrites += applied.len() as u64;

            if state.settings.ws_log_body_enabled
                && (outcome.changed || outcome.json_before.is_some())
            {
                state.logs.add(NewLogEntry {
                    method: ctx.method.clone(),
                    url: ctx.request_url.clone(),
                    full_url: ctx.full_url.clone(),
                    source: Some(Source::Websocket),
                    ws_body_json_before: outcome.json_before,
                    ws_body_json_after: outcome.json_after,
                    rewrites: applied.into_tags(),
                    request_bytes: if phase == RulePhase::Request {
                        outcome.text.len() as u64
                    } else {
                        0
                    },
                    response_bytes: if phase == RulePhase::Response {
                        outcome.text.len() as u64
                    } else {
                        0
                    },
                    ..Default::default()
                });
            }

            Message::Text(outcome.text.into())
        }
        Message::Binary(bytes) => {
            direction_bytes(summary, bytes.len() as u64);
            Message::Binary(bytes)
        }
        other => other,
    }
}
