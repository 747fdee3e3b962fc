//! WebSocket text-frame rewrites.
//!
//! Text frames within the size cap get the text rules first, then JSONPath
//! rules against the JSON tail of the payload (everything from the first
//! `{` or `[`), preserving any protocol prefix such as socket.io's
//! `42/ws/channel,`. Binary frames and oversize frames pass through
//! unchanged.

use crate::rewrite::jsonpath::apply_jsonpath_rules;
use crate::rewrite::text::apply_text_rules;
use crate::rewrite::AppliedRules;
use crate::rules::compiler::CompiledRules;
use crate::rules::RulePhase;
use serde_json::Value;

#[derive(Debug)]
pub struct WsRewriteOutcome {
    pub text: String,
    pub changed: bool,
    /// JSON view of the payload before any rewrite, when parseable.
    pub json_before: Option<Value>,
    /// JSON view after all rewrites, when parseable.
    pub json_after: Option<Value>,
}

pub fn rewrite_ws_text(
    text: &str,
    compiled: &CompiledRules,
    phase: RulePhase,
    request_path: &str,
    full_url: &str,
    max_text_bytes: usize,
    applied: &mut AppliedRules,
) -> WsRewriteOutcome {
    if text.len() > max_text_bytes {
        return WsRewriteOutcome {
            text: text.to_string(),
            changed: false,
            json_before: None,
            json_after: None,
        };
    }

    let json_before = parse_json_tail(text).map(|(_, v)| v);

    let (mut working, mut changed) = apply_text_rules(
        text,
        &compiled.text,
        phase,
        request_path,
        full_url,
        applied,
    );

    if !compiled.jsonpath.is_empty() {
        if let Some((prefix_len, mut json)) = parse_json_tail(&working) {
            let outcome = apply_jsonpath_rules(
                &mut json,
                &compiled.jsonpath,
                phase,
                request_path,
                full_url,
                applied,
            );
            if outcome.changed {
                if let Ok(serialized) = serde_json::to_string(&json) {
                    working = format!("{}{}", &working[..prefix_len], serialized);
                    changed = true;
                }
            }
        }
    }

    let json_after = parse_json_tail(&working).map(|(_, v)| v);

    WsRewriteOutcome {
        text: working,
        changed,
        json_before,
        json_after,
    }
}

/// Locate the first `{` or `[` and parse everything after it as JSON.
/// Returns the prefix length and the parsed value.
fn parse_json_tail(text: &str) -> Option<(usize, Value)> {
    let start = text.find(['{', '['])?;
    let value: Value = serde_json::from_str(&text[start..]).ok()?;
    Some((start, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::compiler::compile_rules;
    use crate::rules::{EditRule, RuleKind, RuleTarget, ValueType};
    use serde_json::json;

    fn text_rule(start: &str, replacement: &str) -> EditRule {
        EditRule {
            id: "w1".into(),
            name: "ws".into(),
            enabled: true,
            kind: RuleKind::Text,
            start: start.into(),
            end: String::new(),
            replacement: replacement.into(),
            use_regex: false,
            case_sensitive: false,
            path: String::new(),
            value: Value::Null,
            value_type: ValueType::String,
            url: String::new(),
            target: Some(RuleTarget::Both),
        }
    }

    fn jsonpath_rule(path: &str, value: Value) -> EditRule {
        EditRule {
            id: "w2".into(),
            name: "ws-jp".into(),
            enabled: true,
            kind: RuleKind::JsonPath,
            start: String::new(),
            end: String::new(),
            replacement: String::new(),
            use_regex: false,
            case_sensitive: false,
            path: path.into(),
            value,
            value_type: ValueType::String,
            url: "/ws".into(),
            target: Some(RuleTarget::Both),
        }
    }

    #[test]
    fn test_prefix_rule_rewrites_socketio_payload() {
        let compiled = compile_rules(&[text_rule("hello", "world")]);
        let mut applied = AppliedRules::new();
        let outcome = rewrite_ws_text(
            r#"42/ws/channel,["msg","hello"]"#,
            &compiled,
            RulePhase::Request,
            "/ws/channel",
            "ws://h/ws/channel",
            1 << 18,
            &mut applied,
        );
        assert!(outcome.changed);
        assert_eq!(outcome.text, r#"42/ws/channel,["msg","world"]"#);
        assert_eq!(outcome.json_before.unwrap(), json!(["msg", "hello"]));
        assert_eq!(outcome.json_after.unwrap(), json!(["msg", "world"]));
        assert_eq!(applied.len(), 1);
    }

    #[test]
    fn test_jsonpath_on_tail_preserves_prefix() {
        let compiled = compile_rules(&[jsonpath_rule("user.name", json!("admin"))]);
        let mut applied = AppliedRules::new();
        let outcome = rewrite_ws_text(
            r#"42,{"user":{"name":"guest"},"seq":9}"#,
            &compiled,
            RulePhase::Request,
            "/ws",
            "ws://h/ws",
            1 << 18,
            &mut applied,
        );
        assert!(outcome.changed);
        assert!(outcome.text.starts_with("42,"));
        let tail: Value = serde_json::from_str(&outcome.text[3..]).unwrap();
        assert_eq!(tail["user"]["name"], json!("admin"));
        assert_eq!(tail["seq"], json!(9));
    }

    #[test]
    fn test_oversize_frame_unchanged() {
        let compiled = compile_rules(&[text_rule("a", "b")]);
        let mut applied = AppliedRules::new();
        let big = "a".repeat(64);
        let outcome = rewrite_ws_text(
            &big,
            &compiled,
            RulePhase::Request,
            "/ws",
            "ws://h/ws",
            16,
            &mut applied,
        );
        assert!(!outcome.changed);
        assert_eq!(outcome.text, big);
        assert!(outcome.json_before.is_none());
        assert!(applied.is_empty());
    }

    #[test]
    fn test_non_json_payload_still_gets_text_rules() {
        let compiled = compile_rules(&[text_rule("ping", "pong")]);
        let mut applied = AppliedRules::new();
        let outcome = rewrite_ws_text(
            "ping",
            &compiled,
            RulePhase::Response,
            "/ws",
            "ws://h/ws",
            1 << 18,
            &mut applied,
        );
        assert!(outcome.changed);
        assert_eq!(outcome.text, "pong");
        assert!(outcome.json_after.is_none());
    }
}
