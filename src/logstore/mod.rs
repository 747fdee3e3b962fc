//! Log entry model.
//!
//! Entries are owned exclusively by the bounded store in [`store`];
//! aggregates key on host/path strings and hold counters only, never
//! references back into entries.

pub mod filter;
pub mod stats;
pub mod store;

use crate::error::ErrorCategory;
use crate::rewrite::connect::ConnectView;
use crate::rewrite::RewriteTag;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

/// Where a flow was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Proxied,
    Mitm,
    Websocket,
    Direct,
    Tunnel,
    Local,
    Blocked,
    Error,
    Unknown,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Proxied => "proxied",
            Source::Mitm => "mitm",
            Source::Websocket => "websocket",
            Source::Direct => "direct",
            Source::Tunnel => "tunnel",
            Source::Local => "local",
            Source::Blocked => "blocked",
            Source::Error => "error",
            Source::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Source> {
        Some(match s {
            "proxied" => Source::Proxied,
            "mitm" => Source::Mitm,
            "websocket" => Source::Websocket,
            "direct" => Source::Direct,
            "tunnel" => Source::Tunnel,
            "local" => Source::Local,
            "blocked" => Source::Blocked,
            "error" => Source::Error,
            "unknown" => Source::Unknown,
            _ => return None,
        })
    }

    /// Flows forwarded without mediation.
    pub fn is_bypassed(&self) -> bool {
        matches!(self, Source::Direct | Source::Tunnel)
    }
}

/// Lowercase search snapshots, precomputed at commit and bounded per side.
#[derive(Debug, Clone, Default)]
pub struct SearchSnapshots {
    pub url: String,
    pub request_body: String,
    pub response_body: String,
    pub headers: String,
}

pub const SEARCH_SNAPSHOT_MAX_BYTES: usize = 256 * 1024;

/// One committed log entry. Immutable after commit, except that a
/// streaming-mode entry gets its placeholder response body and size filled
/// in when the stream completes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: u64,
    pub timestamp: String,
    pub method: String,
    pub url: String,
    pub full_url: String,
    pub host: String,
    pub path: String,
    pub source: Source,
    pub request_headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub response_headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_request: Option<ConnectView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_response: Option<ConnectView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_body_json_before: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_body_json_after: Option<Value>,
    pub rewrites: Vec<RewriteTag>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_error_category: Option<ErrorCategory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_overhead_ms: Option<u64>,
    pub request_bytes: u64,
    pub response_bytes: u64,
    pub rewrite_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(skip)]
    pub committed_at_ms: u64,
    #[serde(skip)]
    pub search: SearchSnapshots,
    #[serde(skip)]
    pub streaming: bool,
}

/// Raw inputs for a new entry; the store computes everything derived.
#[derive(Debug, Default)]
pub struct NewLogEntry {
    pub method: String,
    pub url: String,
    pub full_url: String,
    pub source: Option<Source>,
    pub request_headers: HashMap<String, String>,
    pub request_body: Option<Value>,
    pub status_code: Option<u16>,
    pub response_headers: HashMap<String, String>,
    pub response_body: Option<Value>,
    pub connect_request: Option<ConnectView>,
    pub connect_response: Option<ConnectView>,
    pub ws_body_json_before: Option<Value>,
    pub ws_body_json_after: Option<Value>,
    pub rewrites: Vec<RewriteTag>,
    pub error: Option<String>,
    pub upstream_error_category: Option<ErrorCategory>,
    pub upstream_duration_ms: Option<u64>,
    pub total_duration_ms: Option<u64>,
    pub request_bytes: u64,
    pub response_bytes: u64,
    pub streaming: bool,
}

/// Classify a response for the file-type filter: content type first, then
/// URL extension for fonts, then best-effort JSON sniffing of string bodies.
pub fn classify_file_type(
    content_type: Option<&str>,
    url: &str,
    body: Option<&Value>,
) -> Option<String> {
    if let Some(ct) = content_type {
        let ct = ct.to_ascii_lowercase();
        let bucket = if ct.contains("json") {
            Some("json")
        } else if ct.contains("html") {
            Some("html")
        } else if ct.contains("css") {
            Some("css")
        } else if ct.contains("javascript") || ct.contains("ecmascript") {
            Some("javascript")
        } else if ct.starts_with("image/") {
            Some("image")
        } else if ct.starts_with("font/") || ct.contains("font-woff") {
            Some("font")
        } else if ct.starts_with("video/") {
            Some("video")
        } else if ct.starts_with("audio/") {
            Some("audio")
        } else if ct.contains("proto") || ct.contains("grpc") || ct.contains("connect") {
            Some("proto")
        } else if ct.contains("xml") {
            Some("xml")
        } else if ct.starts_with("text/") {
            Some("text")
        } else if ct.contains("octet-stream") {
            Some("binary")
        } else {
            None
        };
        if let Some(b) = bucket {
            return Some(b.to_string());
        }
    }

    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    for ext in [".woff2", ".woff", ".ttf", ".otf", ".eot"] {
        if path.ends_with(ext) {
            return Some("font".to_string());
        }
    }

    if let Some(Value::String(s)) = body {
        let trimmed = s.trim_start();
        if (trimmed.starts_with('{') || trimmed.starts_with('['))
            && serde_json::from_str::<Value>(trimmed).is_ok()
        {
            return Some("json".to_string());
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_by_content_type() {
        assert_eq!(
            classify_file_type(Some("application/json; charset=utf-8"), "/a", None),
            Some("json".into())
        );
        assert_eq!(
            classify_file_type(Some("image/png"), "/a.png", None),
            Some("image".into())
        );
        assert_eq!(
            classify_file_type(Some("application/connect+proto"), "/svc", None),
            Some("proto".into())
        );
    }

    #[test]
    fn test_classify_font_by_extension() {
        assert_eq!(
            classify_file_type(None, "https://cdn/fonts/Inter.woff2?v=3", None),
            Some("font".into())
        );
        assert_eq!(
            classify_file_type(Some("application/x-unknown"), "/f.ttf", None),
            Some("font".into())
        );
    }

    #[test]
    fn test_classify_json_sniffing() {
        let body = json!("{\"nested\":true}");
        assert_eq!(
            classify_file_type(None, "/data", Some(&body)),
            Some("json".into())
        );
        let not_json = json!("plain words");
        assert_eq!(classify_file_type(None, "/data", Some(&not_json)), None);
    }

    #[test]
    fn test_source_round_trip() {
        for s in [
            Source::Proxied,
            Source::Mitm,
            Source::Websocket,
            Source::Direct,
            Source::Tunnel,
            Source::Local,
            Source::Blocked,
            Source::Error,
            Source::Unknown,
        ] {
            assert_eq!(Source::parse(s.as_str()), Some(s));
        }
        assert!(Source::parse("bogus").is_none());
    }
}
