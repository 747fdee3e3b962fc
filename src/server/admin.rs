//! The /api control surface.
//!
//! Thin REST/CRUD over the stores: every mutation validates its input,
//! applies through the owning store, and queues a persistence write.
//! Errors come back as structured 4xx JSON.

use crate::local::ResourceKind;
use crate::logstore::filter::LogQuery;
use crate::logstore::Source;
use crate::persist::StoreKind;
use crate::proxy::context::{full_body, BoxBody};
use crate::rules::{BlockRule, EditRule, FilterMode, FilterRule};
use crate::server::ProxyState;
use base64::Engine;
use http::{Method, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};

const ADMIN_BODY_LIMIT: usize = 4 * 1024 * 1024;

pub async fn handle_admin(
    req: Request<Incoming>,
    state: ProxyState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();

    let body = match collect_admin_body(req).await {
        Ok(b) => b,
        Err(resp) => return Ok(resp),
    };

    let response = match (method.as_str(), path.as_str()) {
        ("GET", "/health") => json_response(StatusCode::OK, &json!({"status": "ok"})),

        ("GET", "/metrics") => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
            .body(full_body(state.metrics.render()))
            .unwrap(),

        ("GET", "/ca.pem") => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/x-pem-file")
            .header("content-disposition", "attachment; filename=\"ca-cert.pem\"")
            .body(full_body(state.authority.ca_cert_pem().to_string()))
            .unwrap(),

        ("GET", "/api/logs") => {
            let log_query = parse_log_query(&query);
            let noise = state.rules.block_matchers().noise.clone();
            let entries = state.logs.filtered(&log_query, &noise);
            let total = entries.len();
            json_response(StatusCode::OK, &json!({"logs": entries, "total": total}))
        }

        ("GET", "/api/logs/export") => {
            let entries = state.logs.export_all();
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "application/json")
                .header(
                    "content-disposition",
                    "attachment; filename=\"proxy-logs.json\"",
                )
                .body(full_body(
                    serde_json::to_string_pretty(&entries).unwrap_or_default(),
                ))
                .unwrap()
        }

        ("DELETE", "/api/logs") => {
            state.logs.clear();
            json_response(StatusCode::OK, &json!({"ok": true}))
        }

        ("GET", "/api/config") => json_response(StatusCode::OK, &state.modes()),

        ("POST", "/api/interactive-mode") => set_mode(&state, &body, |modes, enabled| {
            modes.interactive_mode_enabled = enabled;
        }),
        ("POST", "/api/edit-rules-mode") => set_mode(&state, &body, |modes, enabled| {
            modes.edit_rules_enabled = enabled;
        }),
        ("POST", "/api/local-resources-mode") => set_mode(&state, &body, |modes, enabled| {
            modes.local_resources_enabled = enabled;
        }),
        ("POST", "/api/filter-rules-mode") => set_mode(&state, &body, |modes, enabled| {
            modes.filter_rules_enabled = enabled;
        }),
        ("POST", "/api/blocked-rules-mode") => set_mode(&state, &body, |modes, enabled| {
            modes.blocked_rules_enabled = enabled;
        }),

        ("GET", "/api/filter-mode") => {
            json_response(StatusCode::OK, &json!({"mode": state.modes().filter_mode}))
        }
        ("POST", "/api/filter-mode") => {
            #[derive(Deserialize)]
            struct ModeBody {
                mode: FilterMode,
            }
            match serde_json::from_slice::<ModeBody>(&body) {
                Ok(parsed) => {
                    let modes = state.update_modes(|m| m.filter_mode = parsed.mode);
                    json_response(StatusCode::OK, &json!({"mode": modes.filter_mode}))
                }
                Err(_) => bad_request("mode must be \"ignore\" or \"focus\""),
            }
        }

        ("GET", "/api/resources") => {
            json_response(StatusCode::OK, &*state.local.snapshot())
        }
        ("POST", "/api/resources") => create_resource(&state, &body),
        ("POST", "/api/resources/toggle") => {
            #[derive(Deserialize)]
            struct ToggleBody {
                url: String,
            }
            match serde_json::from_slice::<ToggleBody>(&body) {
                Ok(parsed) => match state.local.toggle(&parsed.url) {
                    Some(enabled) => {
                        state.writer.mark(StoreKind::Resources);
                        json_response(StatusCode::OK, &json!({"url": parsed.url, "enabled": enabled}))
                    }
                    None => not_found("resource not found"),
                },
                Err(_) => bad_request("url is required"),
            }
        }

        ("GET", "/api/blocked") => {
            json_response(StatusCode::OK, &*state.rules.block_rules())
        }
        ("POST", "/api/blocked") => mutate_blocked(&state, &body),

        ("GET", "/api/filters") => {
            json_response(StatusCode::OK, &*state.rules.filter_rules())
        }
        ("POST", "/api/filters") => mutate_filters(&state, &body),

        ("GET", "/api/filters/suggestions") => {
            let limit = parse_query_map(&query)
                .get("limit")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10);
            let suggestions = state.logs.suggestions(limit, &state.rules.filter_matchers());
            json_response(StatusCode::OK, &json!({"suggestions": suggestions}))
        }

        ("GET", "/api/filters/metrics") => {
            let patterns: Vec<String> = state
                .rules
                .filter_rules()
                .iter()
                .map(|r| r.url.clone())
                .collect();
            let hits: Vec<_> = state
                .logs
                .pattern_hits(&patterns)
                .into_iter()
                .map(|(pattern, count)| json!({"url": pattern, "hits": count}))
                .collect();
            json_response(StatusCode::OK, &json!({"metrics": hits}))
        }

        ("GET", "/api/edit-rules") => {
            json_response(StatusCode::OK, &*state.rules.edit_rules())
        }
        ("POST", "/api/edit-rules") => match serde_json::from_slice::<EditRule>(&body) {
            Ok(rule) => {
                let rule = rule.normalize();
                let created = rule.clone();
                state.rules.with_edit_rules(|rules| rules.push(rule));
                state.writer.mark(StoreKind::EditRules);
                json_response(StatusCode::OK, &created)
            }
            Err(e) => bad_request(&format!("invalid rule: {}", e)),
        },

        ("GET", "/api/dashboard") => json_response(StatusCode::OK, &state.logs.dashboard()),

        ("GET", "/api/audit") => {
            let modes = state.modes();
            json_response(
                StatusCode::OK,
                &json!({
                    "editRules": state.rules.edit_rules().len(),
                    "blockedRules": state.rules.block_rules().len(),
                    "filterRules": state.rules.filter_rules().len(),
                    "localResources": state.local.len(),
                    "logEntries": state.logs.len(),
                    "cachedCertificates": state.authority.cached_host_count(),
                    "config": modes,
                }),
            )
        }

        _ => {
            // Parameterised paths.
            if let Some(id) = path.strip_prefix("/api/edit-rules/") {
                edit_rule_by_id(&state, method.as_str(), id, &body)
            } else if let Some(encoded) = path.strip_prefix("/api/resources/") {
                if method == Method::DELETE {
                    delete_resource(&state, encoded)
                } else {
                    not_found("not found")
                }
            } else {
                not_found("not found")
            }
        }
    };

    Ok(response)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn set_mode(
    state: &ProxyState,
    body: &[u8],
    apply: impl FnOnce(&mut crate::config::RuntimeModes, bool),
) -> Response<BoxBody> {
    #[derive(Deserialize)]
    struct EnabledBody {
        enabled: bool,
    }
    match serde_json::from_slice::<EnabledBody>(body) {
        Ok(parsed) => {
            let modes = state.update_modes(|m| apply(m, parsed.enabled));
            json_response(StatusCode::OK, &modes)
        }
        Err(_) => bad_request("enabled must be a boolean"),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuleMutation {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    mode: Option<FilterMode>,
    action: String,
}

fn mutate_blocked(state: &ProxyState, body: &[u8]) -> Response<BoxBody> {
    let mutation: RuleMutation = match serde_json::from_slice(body) {
        Ok(m) => m,
        Err(e) => return bad_request(&format!("invalid mutation: {}", e)),
    };

    let result = state.rules.with_block_rules(|rules| match mutation.action.as_str() {
        "add" => {
            let url = mutation.url.clone().unwrap_or_default();
            if url.trim().is_empty() {
                return Err("url is required");
            }
            rules.push(BlockRule {
                id: mutation.id.clone().unwrap_or_default(),
                enabled: mutation.enabled.unwrap_or(true),
                name: mutation.name.clone().unwrap_or_default(),
                url,
            });
            Ok(())
        }
        "update" => {
            let Some(id) = mutation.id.as_deref() else {
                return Err("id is required");
            };
            let Some(rule) = rules.iter_mut().find(|r| r.id == id) else {
                return Err("rule not found");
            };
            if let Some(url) = mutation.url.clone() {
                rule.url = url;
            }
            if let Some(name) = mutation.name.clone() {
                rule.name = name;
            }
            if let Some(enabled) = mutation.enabled {
                rule.enabled = enabled;
            }
            Ok(())
        }
        "remove" => {
            let Some(id) = mutation.id.as_deref() else {
                return Err("id is required");
            };
            let before = rules.len();
            rules.retain(|r| r.id != id);
            if rules.len() == before {
                return Err("rule not found");
            }
            Ok(())
        }
        _ => Err("action must be add, update, or remove"),
    });

    match result {
        Ok(()) => {
            state.writer.mark(StoreKind::BlockRules);
            json_response(StatusCode::OK, &*state.rules.block_rules())
        }
        Err(msg) => bad_request(msg),
    }
}

fn mutate_filters(state: &ProxyState, body: &[u8]) -> Response<BoxBody> {
    let mutation: RuleMutation = match serde_json::from_slice(body) {
        Ok(m) => m,
        Err(e) => return bad_request(&format!("invalid mutation: {}", e)),
    };

    let result = state.rules.with_filter_rules(|rules| match mutation.action.as_str() {
        "add" => {
            let url = mutation.url.clone().unwrap_or_default();
            if url.trim().is_empty() {
                return Err("url is required");
            }
            rules.push(FilterRule {
                id: mutation.id.clone().unwrap_or_default(),
                enabled: mutation.enabled.unwrap_or(true),
                name: mutation.name.clone().unwrap_or_default(),
                url,
                mode: mutation.mode.unwrap_or_default(),
            });
            Ok(())
        }
        "update" => {
            let Some(id) = mutation.id.as_deref() else {
                return Err("id is required");
            };
            let Some(rule) = rules.iter_mut().find(|r| r.id == id) else {
                return Err("rule not found");
            };
            if let Some(url) = mutation.url.clone() {
                rule.url = url;
            }
            if let Some(name) = mutation.name.clone() {
                rule.name = name;
            }
            if let Some(enabled) = mutation.enabled {
                rule.enabled = enabled;
            }
            if let Some(mode) = mutation.mode {
                rule.mode = mode;
            }
            Ok(())
        }
        "remove" => {
            let Some(id) = mutation.id.as_deref() else {
                return Err("id is required");
            };
            let before = rules.len();
            rules.retain(|r| r.id != id);
            if rules.len() == before {
                return Err("rule not found");
            }
            Ok(())
        }
        _ => Err("action must be add, update, or remove"),
    });

    match result {
        Ok(()) => {
            state.writer.mark(StoreKind::FilterRules);
            json_response(StatusCode::OK, &*state.rules.filter_rules())
        }
        Err(msg) => bad_request(msg),
    }
}

fn edit_rule_by_id(
    state: &ProxyState,
    method: &str,
    id: &str,
    body: &[u8],
) -> Response<BoxBody> {
    match method {
        "PUT" => {
            let mut update: EditRule = match serde_json::from_slice(body) {
                Ok(r) => r,
                Err(e) => return bad_request(&format!("invalid rule: {}", e)),
            };
            update.id = id.to_string();
            let update = update.normalize();
            let updated = update.clone();
            let found = state.rules.with_edit_rules(|rules| {
                match rules.iter_mut().find(|r| r.id == id) {
                    Some(slot) => {
                        *slot = update;
                        true
                    }
                    None => false,
                }
            });
            if found {
                state.writer.mark(StoreKind::EditRules);
                json_response(StatusCode::OK, &updated)
            } else {
                not_found("rule not found")
            }
        }
        "DELETE" => {
            let removed = state.rules.with_edit_rules(|rules| {
                let before = rules.len();
                rules.retain(|r| r.id != id);
                rules.len() != before
            });
            if removed {
                state.writer.mark(StoreKind::EditRules);
                json_response(StatusCode::OK, &json!({"ok": true}))
            } else {
                not_found("rule not found")
            }
        }
        _ => not_found("not found"),
    }
}

fn create_resource(state: &ProxyState, body: &[u8]) -> Response<BoxBody> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct ResourceBody {
        url: String,
        kind: ResourceKind,
        #[serde(default)]
        filename: Option<String>,
        #[serde(default)]
        content_type: Option<String>,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        data_base64: Option<String>,
    }

    let parsed: ResourceBody = match serde_json::from_slice(body) {
        Ok(p) => p,
        Err(e) => return bad_request(&format!("invalid resource: {}", e)),
    };
    if parsed.url.trim().is_empty() {
        return bad_request("url is required");
    }

    let bytes: Vec<u8> = match (&parsed.kind, &parsed.content, &parsed.data_base64) {
        (ResourceKind::Text, Some(content), _) => content.clone().into_bytes(),
        (ResourceKind::File, _, Some(encoded)) => {
            match base64::engine::general_purpose::STANDARD.decode(encoded) {
                Ok(b) => b,
                Err(_) => return bad_request("dataBase64 is not valid base64"),
            }
        }
        _ => return bad_request("text resources need content, file resources need dataBase64"),
    };

    let content_type = parsed.content_type.unwrap_or_else(|| {
        match parsed.kind {
            ResourceKind::Text => "text/plain; charset=utf-8".to_string(),
            ResourceKind::File => "application/octet-stream".to_string(),
        }
    });

    match state
        .local
        .create(parsed.url.clone(), parsed.kind, parsed.filename, content_type, &bytes)
    {
        Ok(resource) => {
            state.writer.mark(StoreKind::Resources);
            json_response(StatusCode::OK, &json!({"url": parsed.url, "resource": resource}))
        }
        Err(e) => {
            tracing::warn!("admin: resource write failed, error={}", e);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to store resource")
        }
    }
}

fn delete_resource(state: &ProxyState, encoded: &str) -> Response<BoxBody> {
    let key = percent_decode_str(encoded)
        .decode_utf8()
        .map(|s| s.to_string())
        .unwrap_or_else(|_| encoded.to_string());
    if state.local.remove(&key) {
        state.writer.mark(StoreKind::Resources);
        json_response(StatusCode::OK, &json!({"ok": true}))
    } else {
        not_found("resource not found")
    }
}

// ---------------------------------------------------------------------------
// Request plumbing
// ---------------------------------------------------------------------------

async fn collect_admin_body(
    req: Request<Incoming>,
) -> Result<Vec<u8>, Response<BoxBody>> {
    let body = req.into_body();
    match body.collect().await {
        Ok(collected) => {
            let bytes = collected.to_bytes();
            if bytes.len() > ADMIN_BODY_LIMIT {
                return Err(json_error(StatusCode::PAYLOAD_TOO_LARGE, "body too large"));
            }
            Ok(bytes.to_vec())
        }
        Err(_) => Err(json_error(StatusCode::BAD_REQUEST, "failed to read body")),
    }
}

fn parse_query_map(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            let k = percent_decode_str(k).decode_utf8().ok()?.to_string();
            let v = percent_decode_str(&v.replace('+', " "))
                .decode_utf8()
                .ok()?
                .to_string();
            Some((k, v))
        })
        .collect()
}

fn parse_log_query(query: &str) -> LogQuery {
    let params = parse_query_map(query);
    let csv_set = |key: &str| -> Option<HashSet<String>> {
        params.get(key).map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
    };

    LogQuery {
        search: params.get("search").cloned().unwrap_or_default(),
        sources: params.get("sources").map(|v| {
            v.split(',')
                .filter_map(|s| Source::parse(s.trim()))
                .collect()
        }),
        methods: csv_set("methods").map(|set| {
            set.into_iter().map(|m| m.to_uppercase()).collect()
        }),
        file_types: csv_set("fileTypes"),
        show_websocket: params
            .get("showWebsocket")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true),
        rewritten_request_only: params
            .get("rewrittenRequest")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false),
        rewritten_response_only: params
            .get("rewrittenResponse")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false),
        include_noise: params
            .get("includeNoise")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false),
    }
}

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(
            serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string()),
        ))
        .unwrap()
}

fn json_error(status: StatusCode, msg: &str) -> Response<BoxBody> {
    json_response(status, &json!({"error": msg}))
}

fn bad_request(msg: &str) -> Response<BoxBody> {
    json_error(StatusCode::BAD_REQUEST, msg)
}

fn not_found(msg: &str) -> Response<BoxBody> {
    json_error(StatusCode::NOT_FOUND, msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_map() {
        let params = parse_query_map("search=hello%20world&limit=5&flag");
        assert_eq!(params["search"], "hello world");
        assert_eq!(params["limit"], "5");
        assert_eq!(params["flag"], "");
    }

    #[test]
    fn test_parse_log_query() {
        let q = parse_log_query(
            "search=users%3B!beacon&sources=proxied,mitm&methods=get,post&showWebsocket=false&rewrittenRequest=true",
        );
        assert_eq!(q.search, "users;!beacon");
        let sources = q.sources.unwrap();
        assert!(sources.contains(&Source::Proxied));
        assert!(sources.contains(&Source::Mitm));
        assert_eq!(sources.len(), 2);
        let methods = q.methods.unwrap();
        assert!(methods.contains("GET"));
        assert!(methods.contains("POST"));
        assert!(!q.show_websocket);
        assert!(q.rewritten_request_only);
        assert!(!q.rewritten_response_only);
    }

    #[test]
    fn test_parse_log_query_defaults() {
        let q = parse_log_query("");
        assert!(q.search.is_empty());
        assert!(q.sources.is_none());
        assert!(q.show_websocket);
        assert!(!q.include_noise);
    }
}
