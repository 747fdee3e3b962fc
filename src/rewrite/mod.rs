//! The rewrite engine.
//!
//! Pure with respect to its inputs: for a given (compiled rule snapshot,
//! input) pair the output is deterministic. Errors in any rewrite path
//! degrade to passthrough — a failed decode or codec round-trip never
//! breaks the flow, it only skips the edit.

pub mod connect;
pub mod headers;
pub mod jsonpath;
pub mod text;
pub mod websocket;

use crate::rules::{RuleKind, RulePhase};
use serde::Serialize;
use std::collections::HashSet;

/// Descriptor of an applied rule, attached to log entries.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RewriteTag {
    pub id: String,
    pub name: String,
    pub kind: RuleKind,
    pub target: RulePhase,
    pub url: String,
}

/// Accumulates applied-rule descriptors across a flow, deduplicated by
/// (rule id, phase).
#[derive(Debug, Default)]
pub struct AppliedRules {
    tags: Vec<RewriteTag>,
    seen: HashSet<(String, RulePhase)>,
}

impl AppliedRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        id: &str,
        name: &str,
        kind: RuleKind,
        phase: RulePhase,
        url: &str,
    ) {
        if self.seen.insert((id.to_string(), phase)) {
            self.tags.push(RewriteTag {
                id: id.to_string(),
                name: name.to_string(),
                kind,
                target: phase,
                url: url.to_string(),
            });
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn tags(&self) -> &[RewriteTag] {
        &self.tags
    }

    pub fn into_tags(self) -> Vec<RewriteTag> {
        self.tags
    }
}
