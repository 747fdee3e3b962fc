//! The HTTP pipeline.
//!
//! Every request runs through a phased lifecycle:
//!
//! 1. DEMUX     — CONNECT and WebSocket upgrades peel off to their pipelines
//! 2. RESOLVE   — target URL resolution, flow context
//! 3. ROUTE     — block / direct / proxy decision
//! 4. LOCAL     — local resource override check
//! 5. REWRITE   — request header + body rewrites
//! 6. UPSTREAM  — pooled client with header/body timeouts
//! 7. RESPOND   — response rewrites, cache-busting, log commit

use crate::codec;
use crate::error::ErrorCategory;
use crate::logstore::{NewLogEntry, Source};
use crate::proxy::context::{empty_body, full_body, BoxBody, FlowContext};
use crate::proxy::upstream::{collect_with_timeout, resolve_target_url, send_with_timeout};
use crate::proxy::{connect, websocket};
use crate::rewrite::connect::{is_connect_content, process_connect_body, ConnectView};
use crate::rewrite::headers::{
    apply_cache_busting, apply_header_rules, create_forward_headers, strip_identifying_headers,
};
use crate::rewrite::jsonpath::apply_jsonpath_rules;
use crate::rewrite::text::apply_text_rules;
use crate::rewrite::AppliedRules;
use crate::routing::{self, RouteContext, RouteDecision};
use crate::rules::compiler::{url_matches, CompiledRules};
use crate::rules::RulePhase;
use crate::server::{admin, ProxyState};
use bytes::Bytes;
use http::header::{HeaderMap, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use http::{HeaderValue, Method, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, warn};

pub async fn handle_request(
    req: Request<Incoming>,
    state: ProxyState,
    peer_addr: SocketAddr,
    mitm_host: Option<String>,
) -> Result<Response<BoxBody>, hyper::Error> {
    if req.method() == Method::CONNECT {
        return connect::handle_connect(req, state, peer_addr).await;
    }
    if websocket::is_websocket_upgrade(&req) {
        return websocket::handle_upgrade(req, state, peer_addr, mitm_host).await;
    }

    let request_url = req.uri().to_string();
    let full_url = resolve_target_url(&req, mitm_host.as_deref()).unwrap_or_else(|| {
        // No Host header and no absolute form — nothing to resolve.
        request_url.clone()
    });
    let ctx = FlowContext::new(
        req.method().as_str().to_string(),
        request_url,
        full_url,
        peer_addr,
    );

    // Control surface: requests addressed to the proxy itself.
    if is_admin_request(&ctx) {
        return admin::handle_admin(req, state).await;
    }

    let decision = route(&ctx, &state);
    let source = if mitm_host.is_some() {
        Source::Mitm
    } else {
        Source::Proxied
    };

    match decision {
        RouteDecision::Block => Ok(block_response(&ctx, &state)),
        RouteDecision::Direct => phase_direct(req, ctx, state).await,
        RouteDecision::Proxy => {
            if let Some(resp) = phase_local(&ctx, &state).await {
                return Ok(resp);
            }
            phase_proxy(req, ctx, state, source).await
        }
    }
}

fn route(ctx: &FlowContext, state: &ProxyState) -> RouteDecision {
    let route_ctx = RouteContext {
        method: &ctx.method,
        request_url: &ctx.request_url,
        full_url: &ctx.full_url,
        host: &ctx.host,
    };
    routing::decide(
        &route_ctx,
        &state.routing_modes(),
        &state.rules.block_matchers(),
        &state.rules.filter_matchers(),
        state.listen_port(),
    )
}

fn is_admin_request(ctx: &FlowContext) -> bool {
    let host = ctx.host.to_lowercase();
    (host == "localhost" || host == "127.0.0.1" || host.is_empty())
        && (ctx.path.starts_with("/api/")
            || ctx.path == "/health"
            || ctx.path == "/metrics"
            || ctx.path == "/ca.pem")
}

fn block_response(ctx: &FlowContext, state: &ProxyState) -> Response<BoxBody> {
    debug!("proxy: blocked, url={}", ctx.full_url);
    state.logs.add(NewLogEntry {
        method: ctx.method.clone(),
        url: ctx.request_url.clone(),
        full_url: ctx.full_url.clone(),
        source: Some(Source::Blocked),
        status_code: Some(204),
        total_duration_ms: Some(ctx.total_ms()),
        ..Default::default()
    });
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(empty_body())
        .unwrap()
}

// ---------------------------------------------------------------------------
// Direct (bypass) path — forward verbatim, stream both directions, no
// rewrites and no tracing-header stripping.
// ---------------------------------------------------------------------------

async fn phase_direct(
    req: Request<Incoming>,
    mut ctx: FlowContext,
    state: ProxyState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let (parts, body) = req.into_parts();

    let mut headers = parts.headers.clone();
    remove_transport_headers(&mut headers);
    let request_bytes = content_length(&headers);

    let upstream_req = match build_upstream_request(
        &parts.method,
        &ctx.full_url,
        &headers,
        body.boxed(),
    ) {
        Ok(r) => r,
        Err(e) => {
            warn!("proxy: direct request build failed, url={}, error={}", ctx.full_url, e);
            return Ok(ctx.error_response(StatusCode::BAD_GATEWAY, "bad gateway"));
        }
    };

    ctx.upstream_start = Some(Instant::now());
    let resp = match send_with_timeout(
        &state.client,
        upstream_req,
        state.settings.upstream_headers_timeout_ms,
    )
    .await
    {
        Ok(resp) => resp,
        Err((category, message)) => {
            return Ok(upstream_error_response(&ctx, &state, category, message));
        }
    };

    let status = resp.status();
    let (resp_parts, resp_body) = resp.into_parts();

    let id = state.logs.add(NewLogEntry {
        method: ctx.method.clone(),
        url: ctx.request_url.clone(),
        full_url: ctx.full_url.clone(),
        source: Some(Source::Direct),
        request_headers: headers_to_map(&parts.headers),
        status_code: Some(status.as_u16()),
        response_headers: headers_to_map(&resp_parts.headers),
        upstream_duration_ms: ctx.upstream_ms(),
        total_duration_ms: Some(ctx.total_ms()),
        request_bytes,
        streaming: true,
        ..Default::default()
    });

    let counted = CountingBody::new(resp_body, state.clone(), id);
    let mut builder = Response::builder().status(status);
    for (name, value) in &resp_parts.headers {
        builder = builder.header(name, value);
    }
    Ok(builder.body(BoxBody::new(counted)).unwrap())
}

// ---------------------------------------------------------------------------
// Local override path
// ---------------------------------------------------------------------------

async fn phase_local(ctx: &FlowContext, state: &ProxyState) -> Option<Response<BoxBody>> {
    if !state.modes().local_resources_enabled {
        return None;
    }
    let (key, resource) = state.local.lookup(&ctx.request_url, &ctx.full_url)?;

    let bytes = match state.local.read_body(&resource).await {
        Ok(b) => b,
        Err(e) => {
            warn!("proxy: local resource read failed, key={}, error={}", key, e);
            return None;
        }
    };

    debug!("proxy: serving local resource, key={}, url={}", key, ctx.full_url);

    let mut headers = HeaderMap::new();
    if let Ok(ct) = HeaderValue::from_str(&resource.content_type) {
        headers.insert(CONTENT_TYPE, ct);
    }
    apply_cache_busting(&mut headers, "local");

    let body_preview = preview_value(&bytes, Some(&resource.content_type), None, state);
    state.logs.add(NewLogEntry {
        method: ctx.method.clone(),
        url: ctx.request_url.clone(),
        full_url: ctx.full_url.clone(),
        source: Some(Source::Local),
        status_code: Some(200),
        response_headers: headers_to_map(&headers),
        response_body: body_preview,
        total_duration_ms: Some(ctx.total_ms()),
        response_bytes: bytes.len() as u64,
        ..Default::default()
    });

    let mut builder = Response::builder().status(StatusCode::OK);
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }
    builder = builder.header(CONTENT_LENGTH, bytes.len());
    Some(builder.body(full_body(bytes)).unwrap())
}

// ---------------------------------------------------------------------------
// Mediated (proxy) path
// ---------------------------------------------------------------------------

async fn phase_proxy(
    req: Request<Incoming>,
    mut ctx: FlowContext,
    state: ProxyState,
    source: Source,
) -> Result<Response<BoxBody>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let original_request_headers = headers_to_map(&parts.headers);

    // Reject oversize bodies before buffering them whole.
    if content_length(&parts.headers) > state.settings.body_limit as u64 {
        return Ok(ctx.error_response(StatusCode::PAYLOAD_TOO_LARGE, "payload too large"));
    }
    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("proxy: failed to read request body, url={}, error={}", ctx.full_url, e);
            return Ok(ctx.error_response(StatusCode::BAD_REQUEST, "bad request"));
        }
    };
    if body_bytes.len() > state.settings.body_limit {
        return Ok(ctx.error_response(StatusCode::PAYLOAD_TOO_LARGE, "payload too large"));
    }

    let modes = state.modes();
    let rewrites_enabled = modes.edit_rules_enabled
        && (source != Source::Mitm || state.settings.mitm_bypass_rewrites_enabled);
    let compiled = state.rules.compiled();
    let mut applied = AppliedRules::new();

    // Request headers: hop-by-hop/conditional drop, tracing strip, rules.
    let mut headers = create_forward_headers(&parts.headers);
    strip_identifying_headers(&mut headers);
    if rewrites_enabled {
        apply_header_rules(
            &mut headers,
            &compiled.text,
            RulePhase::Request,
            &ctx.path,
            &ctx.full_url,
            &mut applied,
        );
    }

    // Request body rewrites.
    let req_content_type = header_str(&parts.headers, CONTENT_TYPE);
    let req_encoding = header_str(&parts.headers, CONTENT_ENCODING);
    let req_connect_encoding = connect_encoding(&parts.headers);
    let (out_body, connect_request_view, request_preview) = rewrite_body(
        &body_bytes,
        req_content_type.as_deref(),
        req_encoding.as_deref(),
        req_connect_encoding.as_deref(),
        RulePhase::Request,
        &ctx,
        &state,
        if rewrites_enabled { Some(&compiled) } else { None },
        &mut applied,
    );
    let request_bytes = out_body.len() as u64;
    if out_body.len() != body_bytes.len() || !applied.is_empty() {
        headers.remove(CONTENT_LENGTH);
        if !out_body.is_empty() {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(out_body.len()));
        }
    }

    // Forward upstream.
    let upstream_body: BoxBody = if out_body.is_empty() {
        empty_body()
    } else {
        full_body(Bytes::from(out_body))
    };
    let upstream_req =
        match build_upstream_request(&parts.method, &ctx.full_url, &headers, upstream_body) {
            Ok(r) => r,
            Err(e) => {
                warn!(
                    "proxy: failed to build upstream request, url={}, error={}",
                    ctx.full_url, e
                );
                return Ok(
                    ctx.error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
                );
            }
        };

    ctx.upstream_start = Some(Instant::now());
    let resp = match send_with_timeout(
        &state.client,
        upstream_req,
        state.settings.upstream_headers_timeout_ms,
    )
    .await
    {
        Ok(resp) => resp,
        Err((category, message)) => {
            return Ok(upstream_error_response(&ctx, &state, category, message));
        }
    };

    let status = resp.status();
    let (resp_parts, resp_body) = resp.into_parts();
    let resp_content_type = header_str(&resp_parts.headers, CONTENT_TYPE);
    let resp_encoding = header_str(&resp_parts.headers, CONTENT_ENCODING);
    let resp_connect_encoding = connect_encoding(&resp_parts.headers);

    // Stream uninspected responses straight through when nothing can
    // rewrite them and the content is not worth decoding for the log.
    let inspectable = resp_content_type
        .as_deref()
        .map(codec::should_decompress)
        .unwrap_or(false);
    let response_rules_bound =
        rewrites_enabled && has_phase_rules(&compiled, RulePhase::Response, &ctx);
    // Oversize responses are never buffered, whatever the rules say.
    let oversize = content_length(&resp_parts.headers) > state.settings.body_limit as u64;
    if oversize
        || (state.settings.stream_uninspected_responses && !inspectable && !response_rules_bound)
    {
        let mut out_headers = resp_parts.headers.clone();
        apply_cache_busting(&mut out_headers, "remote");

        let id = state.logs.add(NewLogEntry {
            method: ctx.method.clone(),
            url: ctx.request_url.clone(),
            full_url: ctx.full_url.clone(),
            source: Some(source),
            request_headers: original_request_headers,
            request_body: request_preview,
            connect_request: connect_request_view,
            status_code: Some(status.as_u16()),
            response_headers: headers_to_map(&resp_parts.headers),
            rewrites: applied.into_tags(),
            upstream_duration_ms: ctx.upstream_ms(),
            total_duration_ms: Some(ctx.total_ms()),
            request_bytes,
            streaming: true,
            ..Default::default()
        });

        observe_flow_metrics(&ctx);
        let counted = CountingBody::new(resp_body, state.clone(), id);
        let mut builder = Response::builder().status(status);
        for (name, value) in &out_headers {
            builder = builder.header(name, value);
        }
        return Ok(builder.body(BoxBody::new(counted)).unwrap());
    }

    // Buffered response path.
    let resp_bytes = match collect_with_timeout(
        resp_body,
        state.settings.upstream_body_timeout_ms,
    )
    .await
    {
        Ok(bytes) => bytes,
        Err((category, message)) => {
            return Ok(upstream_error_response(&ctx, &state, category, message));
        }
    };

    let mut out_headers = resp_parts.headers.clone();
    if rewrites_enabled {
        apply_header_rules(
            &mut out_headers,
            &compiled.text,
            RulePhase::Response,
            &ctx.path,
            &ctx.full_url,
            &mut applied,
        );
    }

    let (resp_out, connect_response_view, response_preview) = rewrite_body(
        &resp_bytes,
        resp_content_type.as_deref(),
        resp_encoding.as_deref(),
        resp_connect_encoding.as_deref(),
        RulePhase::Response,
        &ctx,
        &state,
        if rewrites_enabled { Some(&compiled) } else { None },
        &mut applied,
    );
    let response_bytes = resp_out.len() as u64;
    if resp_out.len() != resp_bytes.len() {
        out_headers.remove(CONTENT_LENGTH);
        out_headers.insert(CONTENT_LENGTH, HeaderValue::from(resp_out.len()));
    }
    out_headers.remove(http::header::TRANSFER_ENCODING);
    apply_cache_busting(&mut out_headers, "remote");

    let rewrite_total = applied.len();
    state.logs.add(NewLogEntry {
        method: ctx.method.clone(),
        url: ctx.request_url.clone(),
        full_url: ctx.full_url.clone(),
        source: Some(source),
        request_headers: original_request_headers,
        request_body: request_preview,
        connect_request: connect_request_view,
        status_code: Some(status.as_u16()),
        response_headers: headers_to_map(&resp_parts.headers),
        response_body: response_preview,
        connect_response: connect_response_view,
        rewrites: applied.into_tags(),
        upstream_duration_ms: ctx.upstream_ms(),
        total_duration_ms: Some(ctx.total_ms()),
        request_bytes,
        response_bytes,
        ..Default::default()
    });
    if rewrite_total > 0 {
        metrics::counter!("proxy_rewrites_applied_total").increment(rewrite_total as u64);
    }
    observe_flow_metrics(&ctx);
    metrics::histogram!("proxy_response_size_bytes").record(response_bytes as f64);

    let mut builder = Response::builder().status(status);
    for (name, value) in &out_headers {
        builder = builder.header(name, value);
    }
    Ok(builder.body(full_body(resp_out)).unwrap())
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Apply Connect / JSON / text rewrites to one buffered body. Returns the
/// outgoing bytes, an optional Connect decode view, and a log preview.
#[allow(clippy::too_many_arguments)]
fn rewrite_body(
    body: &[u8],
    content_type: Option<&str>,
    content_encoding: Option<&str>,
    connect_encoding: Option<&str>,
    phase: RulePhase,
    ctx: &FlowContext,
    state: &ProxyState,
    compiled: Option<&CompiledRules>,
    applied: &mut AppliedRules,
) -> (Vec<u8>, Option<ConnectView>, Option<Value>) {
    if body.is_empty() {
        return (Vec::new(), None, None);
    }

    // Logging-side decode, reused by the rewrite pipeline below.
    let log_decoded: Option<Vec<u8>> = match content_encoding {
        Some(enc) => codec::decompress_for_logging(
            enc,
            body,
            state.settings.log_decompress_max_bytes,
        ),
        None => None,
    };
    let inspect_bytes: &[u8] = log_decoded.as_deref().unwrap_or(body);

    let ct = content_type.unwrap_or("");
    let empty_rules = CompiledRules::default();
    let rules = compiled.unwrap_or(&empty_rules);

    if is_connect_content(ct, inspect_bytes) {
        let outcome = process_connect_body(
            body,
            content_encoding,
            connect_encoding,
            log_decoded,
            rules,
            phase,
            &ctx.path,
            &ctx.full_url,
            &state.connect_limits(),
            applied,
        );
        return (outcome.body, outcome.view, None);
    }

    // Textual path: text rules, then JSONPath when the body parses.
    if codec::printable_ratio(inspect_bytes) < codec::BINARY_SKIP_RATIO {
        return (body.to_vec(), None, None);
    }
    let Ok(text) = std::str::from_utf8(inspect_bytes) else {
        return (body.to_vec(), None, None);
    };

    let (mut working, mut changed) =
        apply_text_rules(text, &rules.text, phase, &ctx.path, &ctx.full_url, applied);

    if !rules.jsonpath.is_empty() {
        if let Ok(mut json) = serde_json::from_str::<Value>(&working) {
            let outcome = apply_jsonpath_rules(
                &mut json,
                &rules.jsonpath,
                phase,
                &ctx.path,
                &ctx.full_url,
                applied,
            );
            if outcome.changed {
                if let Ok(serialized) = serde_json::to_string(&json) {
                    working = serialized;
                    changed = true;
                }
            }
        }
    }

    let preview = preview_value(working.as_bytes(), content_type, None, state);

    if !changed {
        return (body.to_vec(), None, preview);
    }

    // Recompress with the original encoding; failure degrades to the
    // untouched original body.
    let out = match content_encoding {
        Some(enc) if codec::is_supported_encoding(enc) => {
            match codec::compress(enc, working.as_bytes()) {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!("proxy: body recompress failed, error={}", e);
                    return (body.to_vec(), None, preview);
                }
            }
        }
        Some(_) => return (body.to_vec(), None, preview),
        None => working.into_bytes(),
    };
    (out, None, preview)
}

/// Bounded log preview of a (possibly decoded) body: structured JSON when
/// it parses, text when printable, nothing otherwise.
fn preview_value(
    bytes: &[u8],
    content_type: Option<&str>,
    content_encoding: Option<&str>,
    state: &ProxyState,
) -> Option<Value> {
    if bytes.is_empty() {
        return None;
    }
    let decoded;
    let bytes = match content_encoding {
        Some(enc) => {
            decoded = codec::decompress_for_logging(
                enc,
                bytes,
                state.settings.log_decompress_max_bytes,
            )?;
            &decoded[..]
        }
        None => bytes,
    };

    let max = state.settings.log_preview_max_bytes;
    let ct = content_type.unwrap_or("");
    if (ct.contains("json") || ct.is_empty()) && bytes.len() <= max {
        if let Ok(v) = serde_json::from_slice::<Value>(bytes) {
            return Some(v);
        }
    }
    if codec::printable_ratio(bytes) >= codec::PREVIEW_KEEP_RATIO {
        let text = String::from_utf8_lossy(bytes);
        let mut end = text.len().min(max);
        while end > 0 && !text.is_char_boundary(end) {
            end -= 1;
        }
        return Some(Value::String(text[..end].to_string()));
    }
    None
}

fn has_phase_rules(compiled: &CompiledRules, phase: RulePhase, ctx: &FlowContext) -> bool {
    compiled
        .text
        .iter()
        .any(|r| r.target.applies_to(phase) && url_matches(&r.url_pattern, &ctx.path, &ctx.full_url))
        || compiled
            .jsonpath
            .iter()
            .any(|r| {
                r.target.applies_to(phase) && url_matches(&r.url_pattern, &ctx.path, &ctx.full_url)
            })
}

fn upstream_error_response(
    ctx: &FlowContext,
    state: &ProxyState,
    category: ErrorCategory,
    message: String,
) -> Response<BoxBody> {
    warn!(
        "proxy: upstream error, url={}, category={}, error={}",
        ctx.full_url, category, message
    );
    state.logs.add(NewLogEntry {
        method: ctx.method.clone(),
        url: ctx.request_url.clone(),
        full_url: ctx.full_url.clone(),
        source: Some(Source::Error),
        error: Some(message),
        upstream_error_category: Some(category),
        upstream_duration_ms: ctx.upstream_ms(),
        total_duration_ms: Some(ctx.total_ms()),
        ..Default::default()
    });

    if category == ErrorCategory::Aborted {
        // Client is gone — the response will never be read.
        return Response::builder()
            .status(StatusCode::BAD_GATEWAY)
            .body(empty_body())
            .unwrap();
    }
    ctx.error_response(StatusCode::BAD_GATEWAY, "bad gateway")
}

fn build_upstream_request(
    method: &Method,
    full_url: &str,
    headers: &HeaderMap,
    body: BoxBody,
) -> Result<Request<BoxBody>, http::Error> {
    let uri: http::Uri = full_url
        .parse()
        .map_err(http::Error::from)?;
    let mut builder = Request::builder().method(method.clone()).uri(&uri);
    for (name, value) in headers {
        if name == HOST {
            continue;
        }
        builder = builder.header(name, value);
    }
    if let Some(authority) = uri.authority() {
        builder = builder.header(HOST, authority.as_str());
    }
    builder.body(body)
}

/// Transport-level headers that cannot survive re-framing. Unlike the
/// mediated path this keeps conditionals and tracing headers.
fn remove_transport_headers(headers: &mut HeaderMap) {
    for name in ["connection", "proxy-connection", "keep-alive", "transfer-encoding"] {
        headers.remove(name);
    }
}

fn headers_to_map(headers: &HeaderMap) -> HashMap<String, String> {
    let mut map: HashMap<String, String> = HashMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).to_string();
        map.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    map
}

fn header_str(headers: &HeaderMap, name: http::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn connect_encoding(headers: &HeaderMap) -> Option<String> {
    for name in ["connect-content-encoding", "connect-encoding", "grpc-encoding"] {
        if let Some(v) = headers.get(name).and_then(|v| v.to_str().ok()) {
            return Some(v.to_string());
        }
    }
    None
}

fn content_length(headers: &HeaderMap) -> u64 {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn observe_flow_metrics(ctx: &FlowContext) {
    metrics::histogram!("proxy_request_duration_seconds")
        .record(ctx.start.elapsed().as_secs_f64());
    if let Some(upstream_start) = ctx.upstream_start {
        metrics::histogram!("proxy_upstream_duration_seconds")
            .record(upstream_start.elapsed().as_secs_f64());
    }
}

// ---------------------------------------------------------------------------
// Streamed response accounting
// ---------------------------------------------------------------------------

/// Wraps a streamed upstream body, counting bytes and completing the
/// placeholder log entry when the stream ends.
struct CountingBody {
    inner: Incoming,
    state: Option<(ProxyState, u64)>,
    count: u64,
}

impl CountingBody {
    fn new(inner: Incoming, state: ProxyState, log_id: u64) -> Self {
        Self {
            inner,
            state: Some((state, log_id)),
            count: 0,
        }
    }

    fn finish(&mut self) {
        if let Some((state, id)) = self.state.take() {
            state.logs.complete_streaming(id, None, self.count);
            metrics::histogram!("proxy_response_size_bytes").record(self.count as f64);
        }
    }
}

impl hyper::body::Body for CountingBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Result<hyper::body::Frame<Self::Data>, Self::Error>>> {
        use std::task::Poll;
        match std::pin::Pin::new(&mut self.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    self.count += data.len() as u64;
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.finish();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for CountingBody {
    fn drop(&mut self) {
        self.finish();
    }
}
