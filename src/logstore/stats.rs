//! Incremental dashboard aggregates.
//!
//! Every committed entry contributes a delta; eviction applies the same
//! delta with the opposite sign, so the aggregates always equal the sum
//! over the entries currently in the ring (the per-route `maxMs` is the
//! one monotone exception).

use crate::logstore::{LogEntry, Source};
use serde::Serialize;
use std::collections::HashMap;

/// Upper bucket bounds in milliseconds; a final +inf bucket is implicit.
pub const LATENCY_BUCKETS_MS: &[u64] = &[10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10000];

/// Upper bucket bounds in bytes; a final +inf bucket is implicit.
pub const PAYLOAD_BUCKETS_BYTES: &[u64] =
    &[1024, 10 * 1024, 100 * 1024, 1024 * 1024, 10 * 1024 * 1024];

#[derive(Debug, Clone, Serialize)]
pub struct Histogram {
    /// One count per bound in the bucket table, plus a trailing overflow
    /// bucket.
    pub buckets: Vec<u64>,
    pub count: u64,
    pub sum: u64,
    #[serde(skip)]
    bounds: &'static [u64],
}

impl Histogram {
    pub fn new(bounds: &'static [u64]) -> Self {
        Self {
            buckets: vec![0; bounds.len() + 1],
            count: 0,
            sum: 0,
            bounds,
        }
    }

    fn bucket_index(&self, value: u64) -> usize {
        self.bounds
            .iter()
            .position(|&bound| value <= bound)
            .unwrap_or(self.bounds.len())
    }

    pub fn apply(&mut self, value: u64, sign: i64) {
        let idx = self.bucket_index(value);
        if sign >= 0 {
            self.buckets[idx] += 1;
            self.count += 1;
            self.sum += value;
        } else {
            self.buckets[idx] = self.buckets[idx].saturating_sub(1);
            self.count = self.count.saturating_sub(1);
            self.sum = self.sum.saturating_sub(value);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteStat {
    pub count: u64,
    pub total_ms: u64,
    /// Monotone over the route's lifetime; not reversed on eviction.
    pub max_ms: u64,
    pub total_response_bytes: u64,
    pub source_counts: HashMap<String, u64>,
}

impl RouteStat {
    fn apply(&mut self, entry: &LogEntry, sign: i64) {
        let total_ms = entry.total_duration_ms.unwrap_or(0);
        if sign >= 0 {
            self.count += 1;
            self.total_ms += total_ms;
            self.max_ms = self.max_ms.max(total_ms);
            self.total_response_bytes += entry.response_bytes;
            *self
                .source_counts
                .entry(entry.source.as_str().to_string())
                .or_default() += 1;
        } else {
            self.count = self.count.saturating_sub(1);
            self.total_ms = self.total_ms.saturating_sub(total_ms);
            self.total_response_bytes =
                self.total_response_bytes.saturating_sub(entry.response_bytes);
            if let Some(c) = self.source_counts.get_mut(entry.source.as_str()) {
                *c = c.saturating_sub(1);
                if *c == 0 {
                    self.source_counts.remove(entry.source.as_str());
                }
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub total: u64,
    pub by_source: HashMap<String, u64>,
    pub errors: u64,
    pub upstream_ms: Histogram,
    pub total_ms: Histogram,
    pub proxy_overhead_ms: Histogram,
    pub request_bytes: Histogram,
    pub response_bytes: Histogram,
    /// Keyed by `host + sanitised path` — deliberately lossy (first 1–2
    /// non-empty segments) to keep the hotspot table small.
    pub routes: HashMap<String, RouteStat>,
    pub hosts: HashMap<String, RouteStat>,
}

impl Default for DashboardStats {
    fn default() -> Self {
        Self {
            total: 0,
            by_source: HashMap::new(),
            errors: 0,
            upstream_ms: Histogram::new(LATENCY_BUCKETS_MS),
            total_ms: Histogram::new(LATENCY_BUCKETS_MS),
            proxy_overhead_ms: Histogram::new(LATENCY_BUCKETS_MS),
            request_bytes: Histogram::new(PAYLOAD_BUCKETS_BYTES),
            response_bytes: Histogram::new(PAYLOAD_BUCKETS_BYTES),
            routes: HashMap::new(),
            hosts: HashMap::new(),
        }
    }
}

impl DashboardStats {
    pub fn apply(&mut self, entry: &LogEntry, sign: i64) {
        if sign >= 0 {
            self.total += 1;
            *self
                .by_source
                .entry(entry.source.as_str().to_string())
                .or_default() += 1;
            if entry.source == Source::Error {
                self.errors += 1;
            }
        } else {
            self.total = self.total.saturating_sub(1);
            if let Some(c) = self.by_source.get_mut(entry.source.as_str()) {
                *c = c.saturating_sub(1);
            }
            if entry.source == Source::Error {
                self.errors = self.errors.saturating_sub(1);
            }
        }

        if let Some(v) = entry.upstream_duration_ms {
            self.upstream_ms.apply(v, sign);
        }
        if let Some(v) = entry.total_duration_ms {
            self.total_ms.apply(v, sign);
        }
        if let Some(v) = entry.proxy_overhead_ms {
            self.proxy_overhead_ms.apply(v, sign);
        }
        self.request_bytes.apply(entry.request_bytes, sign);
        self.response_bytes.apply(entry.response_bytes, sign);

        if !entry.host.is_empty() {
            let route_key = format!("{}{}", entry.host, sanitize_path(&entry.path));
            let stat = self.routes.entry(route_key.clone()).or_default();
            stat.apply(entry, sign);
            if sign < 0 && stat.is_empty() {
                self.routes.remove(&route_key);
            }

            let host_stat = self.hosts.entry(entry.host.clone()).or_default();
            host_stat.apply(entry, sign);
            if sign < 0 && host_stat.is_empty() {
                self.hosts.remove(&entry.host);
            }
        }
    }
}

/// Keep only the first 1–2 non-empty path segments.
pub fn sanitize_path(path: &str) -> String {
    let trimmed = path.split(['?', '#']).next().unwrap_or(path);
    let segments: Vec<&str> = trimmed
        .split('/')
        .filter(|s| !s.is_empty())
        .take(2)
        .collect();
    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

// ---------------------------------------------------------------------------
// Suggestion side-table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestStat {
    pub count: u64,
    pub last_seen: u64,
    pub path_counts: HashMap<String, u64>,
}

/// Per-host suggestion accumulator. Weak side-table: cleared with logs,
/// never pointed into by entries.
#[derive(Debug, Clone, Default)]
pub struct SuggestionStats {
    pub hosts: HashMap<String, SuggestStat>,
}

impl SuggestionStats {
    pub fn apply(&mut self, entry: &LogEntry, sign: i64) {
        // Bypassed and internal traffic never produces suggestions.
        if entry.source.is_bypassed() || entry.host.is_empty() {
            return;
        }
        let host_lower = entry.host.to_lowercase();
        if host_lower == "localhost" || host_lower == "127.0.0.1" {
            return;
        }

        let path_key = sanitize_path(&entry.path);
        if sign >= 0 {
            let stat = self.hosts.entry(host_lower).or_default();
            stat.count += 1;
            stat.last_seen = stat.last_seen.max(entry.committed_at_ms);
            *stat.path_counts.entry(path_key).or_default() += 1;
        } else if let Some(stat) = self.hosts.get_mut(&host_lower) {
            stat.count = stat.count.saturating_sub(1);
            if let Some(c) = stat.path_counts.get_mut(&path_key) {
                *c = c.saturating_sub(1);
                if *c == 0 {
                    stat.path_counts.remove(&path_key);
                }
            }
            if stat.count == 0 {
                self.hosts.remove(&host_lower);
            }
        }
    }
}
