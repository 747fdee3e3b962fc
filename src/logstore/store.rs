//! The bounded log store.
//!
//! A FIFO-on-overflow ring plus incrementally maintained aggregates and the
//! suggestion side-table. Writes to the ring, aggregates, and suggestions
//! happen under one critical section per insertion/eviction; dashboard
//! handlers read cloned snapshots.

use crate::logstore::filter::{entry_matches, LogQuery};
use crate::logstore::stats::{sanitize_path, DashboardStats, SuggestionStats};
use crate::logstore::{
    classify_file_type, LogEntry, NewLogEntry, SearchSnapshots, Source, SEARCH_SNAPSHOT_MAX_BYTES,
};
use crate::rules::compiler::FilterMatchers;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub struct LogStore {
    inner: Mutex<Inner>,
    cap: usize,
}

struct Inner {
    ring: VecDeque<LogEntry>,
    seq: u64,
    stats: DashboardStats,
    suggestions: SuggestionStats,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    pub host: String,
    pub count: u64,
    pub last_seen: u64,
    pub top_paths: Vec<String>,
}

impl LogStore {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                ring: VecDeque::with_capacity(cap.min(1024)),
                seq: 0,
                stats: DashboardStats::default(),
                suggestions: SuggestionStats::default(),
            }),
            cap: cap.max(1),
        }
    }

    /// Enrich, commit, and evict under one lock. Returns the entry id.
    pub fn add(&self, new: NewLogEntry) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.seq += 1;
        let id = inner.seq;

        let entry = enrich(new, id);
        metrics::counter!(
            "proxy_requests_total",
            "source" => entry.source.as_str(),
        )
        .increment(1);

        inner.stats.apply(&entry, 1);
        inner.suggestions.apply(&entry, 1);
        inner.ring.push_back(entry);

        while inner.ring.len() > self.cap {
            if let Some(evicted) = inner.ring.pop_front() {
                inner.stats.apply(&evicted, -1);
                inner.suggestions.apply(&evicted, -1);
            }
        }
        metrics::gauge!("proxy_log_entries").set(inner.ring.len() as f64);

        id
    }

    /// Late completion for a streaming-mode entry: only the placeholder
    /// response body and size are set; aggregates pick up the delta.
    pub fn complete_streaming(&self, id: u64, response_body: Option<Value>, response_bytes: u64) {
        let mut inner = self.inner.lock().unwrap();
        let Some(idx) = inner.ring.iter().rposition(|e| e.id == id) else {
            return;
        };

        let old = inner.ring[idx].clone();
        if !old.streaming {
            return;
        }
        inner.stats.apply(&old, -1);
        inner.suggestions.apply(&old, -1);

        {
            let entry = &mut inner.ring[idx];
            entry.response_bytes = response_bytes;
            if let Some(body) = response_body {
                entry.search.response_body =
                    snapshot_text(&body_search_text(Some(&body)));
                entry.response_body = Some(body);
            }
            entry.streaming = false;
        }

        let updated = inner.ring[idx].clone();
        inner.stats.apply(&updated, 1);
        inner.suggestions.apply(&updated, 1);
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.ring.clear();
        inner.stats = DashboardStats::default();
        inner.suggestions = SuggestionStats::default();
        metrics::gauge!("proxy_log_entries").set(0.0);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Filtered view, newest first.
    pub fn filtered(&self, query: &LogQuery, noise_patterns: &[String]) -> Vec<LogEntry> {
        let inner = self.inner.lock().unwrap();
        inner
            .ring
            .iter()
            .rev()
            .filter(|e| entry_matches(e, query, noise_patterns))
            .cloned()
            .collect()
    }

    /// The whole ring, newest first, ignoring every filter.
    pub fn export_all(&self) -> Vec<LogEntry> {
        let inner = self.inner.lock().unwrap();
        inner.ring.iter().rev().cloned().collect()
    }

    pub fn dashboard(&self) -> DashboardStats {
        self.inner.lock().unwrap().stats.clone()
    }

    /// Top-N hosts worth a bypass rule: not internal, not already covered
    /// by an enabled host-type filter, sorted by count, then last-seen,
    /// then name. Each carries its three most frequent path prefixes.
    pub fn suggestions(&self, top_n: usize, filters: &FilterMatchers) -> Vec<Suggestion> {
        use crate::rules::compiler::{host_pattern_matches, MatcherKind};

        let inner = self.inner.lock().unwrap();
        let covered = |host: &str| {
            filters
                .ignore
                .iter()
                .chain(filters.focus.iter())
                .filter(|m| m.kind == MatcherKind::Host)
                .any(|m| host_pattern_matches(&m.pattern, host))
        };

        let mut out: Vec<Suggestion> = inner
            .suggestions
            .hosts
            .iter()
            .filter(|(host, stat)| stat.count > 0 && !covered(host))
            .map(|(host, stat)| {
                let mut paths: Vec<(&String, &u64)> = stat.path_counts.iter().collect();
                paths.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
                Suggestion {
                    host: host.clone(),
                    count: stat.count,
                    last_seen: stat.last_seen,
                    top_paths: paths.into_iter().take(3).map(|(p, _)| p.clone()).collect(),
                }
            })
            .collect();

        out.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| b.last_seen.cmp(&a.last_seen))
                .then_with(|| a.host.cmp(&b.host))
        });
        out.truncate(top_n);
        out
    }

    /// Per-pattern hit counts over the current ring, for the filter
    /// metrics endpoint.
    pub fn pattern_hits(&self, patterns: &[String]) -> Vec<(String, u64)> {
        let inner = self.inner.lock().unwrap();
        patterns
            .iter()
            .map(|pattern| {
                let p = pattern.to_lowercase();
                let hits = inner
                    .ring
                    .iter()
                    .filter(|e| {
                        e.search.url.contains(&p) || e.host.to_lowercase().contains(&p)
                    })
                    .count() as u64;
                (pattern.clone(), hits)
            })
            .collect()
    }
}

fn enrich(new: NewLogEntry, id: u64) -> LogEntry {
    let now = OffsetDateTime::now_utc();
    let timestamp = now.format(&Rfc3339).unwrap_or_default();
    let committed_at_ms = (now.unix_timestamp_nanos() / 1_000_000) as u64;

    let (host, path) = crate::proxy::context::host_and_path(&new.full_url, &new.url);

    let total_duration_ms = new.total_duration_ms;
    let upstream_duration_ms = new.upstream_duration_ms;
    let proxy_overhead_ms = match (total_duration_ms, upstream_duration_ms) {
        (Some(total), Some(upstream)) => Some(total.saturating_sub(upstream)),
        _ => None,
    };

    let content_type = new
        .response_headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
        .map(|(_, v)| v.clone());
    let file_type = classify_file_type(
        content_type.as_deref(),
        &new.full_url,
        new.response_body.as_ref(),
    );

    let search = SearchSnapshots {
        url: snapshot_text(&format!("{} {}", new.url, new.full_url)),
        request_body: snapshot_text(&body_search_text(new.request_body.as_ref())),
        response_body: snapshot_text(&body_search_text(new.response_body.as_ref())),
        headers: snapshot_text(&headers_search_text(
            &new.request_headers,
            &new.response_headers,
        )),
    };

    let rewrite_count = new.rewrites.len() as u32;

    LogEntry {
        id,
        timestamp,
        method: new.method,
        url: new.url,
        full_url: new.full_url,
        host,
        path: sanitize_full_path(&path),
        source: new.source.unwrap_or(Source::Unknown),
        request_headers: new.request_headers,
        request_body: new.request_body,
        status_code: new.status_code,
        response_headers: new.response_headers,
        response_body: new.response_body,
        connect_request: new.connect_request,
        connect_response: new.connect_response,
        ws_body_json_before: new.ws_body_json_before,
        ws_body_json_after: new.ws_body_json_after,
        rewrites: new.rewrites,
        error: new.error,
        upstream_error_category: new.upstream_error_category,
        upstream_duration_ms,
        total_duration_ms,
        proxy_overhead_ms,
        request_bytes: new.request_bytes,
        response_bytes: new.response_bytes,
        rewrite_count,
        file_type,
        committed_at_ms,
        search,
        streaming: new.streaming,
    }
}

fn sanitize_full_path(path: &str) -> String {
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}

fn body_search_text(body: Option<&Value>) -> String {
    match body {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn headers_search_text(
    request: &std::collections::HashMap<String, String>,
    response: &std::collections::HashMap<String, String>,
) -> String {
    let mut out = String::new();
    for (k, v) in request.iter().chain(response.iter()) {
        out.push_str(k);
        out.push_str(": ");
        out.push_str(v);
        out.push('\n');
        if out.len() > SEARCH_SNAPSHOT_MAX_BYTES {
            break;
        }
    }
    out
}

fn snapshot_text(s: &str) -> String {
    let lower = s.to_lowercase();
    if lower.len() <= SEARCH_SNAPSHOT_MAX_BYTES {
        return lower;
    }
    let mut end = SEARCH_SNAPSHOT_MAX_BYTES;
    while end > 0 && !lower.is_char_boundary(end) {
        end -= 1;
    }
    lower[..end].to_string()
}
