//! Log view filtering.
//!
//! The search expression supports OR groups (`||`), AND terms (`;`), and
//! `!`-prefixed negation, matched against the precomputed lowercase
//! snapshots. Block patterns mute matching entries from the default view
//! regardless of whether the block rule is enabled.

use crate::logstore::{LogEntry, Source};
use crate::rules::RulePhase;
use std::collections::HashSet;

#[derive(Debug, Default, Clone)]
pub struct LogQuery {
    pub search: String,
    /// Allow-list of sources; `local`, `blocked`, and `error` entries are
    /// always included regardless.
    pub sources: Option<HashSet<Source>>,
    pub methods: Option<HashSet<String>>,
    pub file_types: Option<HashSet<String>>,
    pub show_websocket: bool,
    pub rewritten_request_only: bool,
    pub rewritten_response_only: bool,
    /// Include entries muted by block patterns.
    pub include_noise: bool,
}

impl LogQuery {
    pub fn default_view() -> Self {
        Self {
            show_websocket: true,
            ..Default::default()
        }
    }
}

pub fn entry_matches(entry: &LogEntry, query: &LogQuery, noise_patterns: &[String]) -> bool {
    if !query.include_noise && matches_noise(entry, noise_patterns) {
        return false;
    }

    if !query.show_websocket && entry.source == Source::Websocket {
        return false;
    }

    let always_included =
        matches!(entry.source, Source::Local | Source::Blocked | Source::Error);
    if let Some(sources) = &query.sources {
        if !always_included && !sources.contains(&entry.source) {
            return false;
        }
    }

    if let Some(methods) = &query.methods {
        if !methods.contains(&entry.method.to_uppercase()) {
            return false;
        }
    }

    if let Some(file_types) = &query.file_types {
        match &entry.file_type {
            Some(ft) if file_types.contains(ft) => {}
            _ => return false,
        }
    }

    if query.rewritten_request_only && !has_rewrite(entry, RulePhase::Request) {
        return false;
    }
    if query.rewritten_response_only && !has_rewrite(entry, RulePhase::Response) {
        return false;
    }

    matches_search(entry, &query.search)
}

fn has_rewrite(entry: &LogEntry, phase: RulePhase) -> bool {
    entry.rewrites.iter().any(|tag| tag.target == phase)
}

fn matches_noise(entry: &LogEntry, noise_patterns: &[String]) -> bool {
    if noise_patterns.is_empty() {
        return false;
    }
    let url = entry.url.to_lowercase();
    let full = entry.full_url.to_lowercase();
    noise_patterns
        .iter()
        .any(|p| url.contains(p) || full.contains(p))
}

/// OR groups delimited by `||`; AND terms delimited by `;`; leading `!`
/// negates a term. Empty expressions match everything.
fn matches_search(entry: &LogEntry, search: &str) -> bool {
    let search = search.trim();
    if search.is_empty() {
        return true;
    }

    search.split("||").any(|group| {
        group
            .split(';')
            .map(str::trim)
            .filter(|term| !term.is_empty())
            .all(|term| {
                let (negated, needle) = match term.strip_prefix('!') {
                    Some(rest) => (true, rest.trim()),
                    None => (false, term),
                };
                if needle.is_empty() {
                    return true;
                }
                let needle = needle.to_lowercase();
                let hit = entry.search.url.contains(&needle)
                    || entry.search.request_body.contains(&needle)
                    || entry.search.response_body.contains(&needle)
                    || entry.search.headers.contains(&needle);
                hit != negated
            })
    })
}
