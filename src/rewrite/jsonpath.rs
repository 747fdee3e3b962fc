//! JSONPath rule application on decoded JSON objects.
//!
//! The walk is overwrite-only: a missing key or index anywhere along the
//! path skips the rule. Identity writes are skipped so they do not mark the
//! rule as applied.

use crate::rewrite::AppliedRules;
use crate::rules::compiler::{url_matches, CompiledJsonPathRule, PathSegment};
use crate::rules::{RuleKind, RulePhase, ValueType};
use serde_json::Value;

#[derive(Debug, Default)]
pub struct JsonPathOutcome {
    pub changed: bool,
    /// Top-level keys matching `f\d+` that were mutated — lets the Connect
    /// rewriter surgically re-encode only those protobuf fields.
    pub changed_top_level_keys: Vec<String>,
}

pub fn apply_jsonpath_rules(
    root: &mut Value,
    rules: &[CompiledJsonPathRule],
    phase: RulePhase,
    request_path: &str,
    full_url: &str,
    applied: &mut AppliedRules,
) -> JsonPathOutcome {
    let mut outcome = JsonPathOutcome::default();

    for rule in rules {
        if !rule.target.applies_to(phase) {
            continue;
        }
        if !url_matches(&rule.url_pattern, request_path, full_url) {
            continue;
        }
        let Some(new_value) = coerce_value(&rule.value, rule.value_type) else {
            continue;
        };

        if apply_one(root, &rule.segments, new_value, &mut outcome) {
            applied.record(&rule.id, &rule.name, RuleKind::JsonPath, phase, full_url);
        }
    }

    outcome
}

/// Coerce the configured value according to its declared type. `None`
/// means the coercion failed and the rule must be skipped.
pub fn coerce_value(raw: &Value, value_type: ValueType) -> Option<Value> {
    match value_type {
        ValueType::String => Some(Value::String(stringify(raw))),
        ValueType::Number => match raw {
            Value::Number(n) => Some(Value::Number(n.clone())),
            Value::String(s) => parse_number_strict(s),
            _ => None,
        },
        ValueType::Boolean => match raw {
            Value::Bool(b) => Some(Value::Bool(*b)),
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            _ => None,
        },
        ValueType::Null => Some(Value::Null),
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn parse_number_strict(s: &str) -> Option<Value> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(i) = s.parse::<i64>() {
        return Some(Value::Number(i.into()));
    }
    let f: f64 = s.parse().ok()?;
    serde_json::Number::from_f64(f).map(Value::Number)
}

fn apply_one(
    root: &mut Value,
    segments: &[PathSegment],
    new_value: Value,
    outcome: &mut JsonPathOutcome,
) -> bool {
    let (last, parents) = match segments.split_last() {
        Some(v) => v,
        None => return false,
    };

    let is_root_write = parents.is_empty();
    let mut node = &mut *root;
    for segment in parents {
        node = match (segment, node) {
            (PathSegment::Key(k), Value::Object(map)) => match map.get_mut(k) {
                Some(v) => v,
                None => return false,
            },
            (PathSegment::Index(i), Value::Array(arr)) => match arr.get_mut(*i) {
                Some(v) => v,
                None => return false,
            },
            _ => return false,
        };
    }

    let slot = match (last, node) {
        (PathSegment::Key(k), Value::Object(map)) => match map.get_mut(k) {
            Some(v) => v,
            None => return false,
        },
        (PathSegment::Index(i), Value::Array(arr)) => match arr.get_mut(*i) {
            Some(v) => v,
            None => return false,
        },
        _ => return false,
    };

    // Identity writes do not count as applied.
    if *slot == new_value {
        return false;
    }

    *slot = new_value;
    outcome.changed = true;

    if is_root_write {
        if let PathSegment::Key(key) = last {
            if is_proto_field_key(key) {
                outcome.changed_top_level_keys.push(key.clone());
            }
        }
    }

    true
}

fn is_proto_field_key(key: &str) -> bool {
    key.len() > 1
        && key.starts_with('f')
        && key[1..].bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::compiler::parse_path;
    use serde_json::json;

    fn compiled(path: &str, value: Value, value_type: ValueType) -> CompiledJsonPathRule {
        CompiledJsonPathRule {
            id: "j1".into(),
            name: "jp".into(),
            target: crate::rules::RuleTarget::Both,
            url_pattern: "/svc".into(),
            segments: parse_path(path).unwrap(),
            value,
            value_type,
        }
    }

    fn apply(root: &mut Value, rule: CompiledJsonPathRule) -> (JsonPathOutcome, usize) {
        let mut applied = AppliedRules::new();
        let outcome = apply_jsonpath_rules(
            root,
            &[rule],
            RulePhase::Request,
            "/svc",
            "http://h/svc",
            &mut applied,
        );
        (outcome, applied.len())
    }

    #[test]
    fn test_overwrite_string() {
        let mut root = json!({"f2": "alpha"});
        let (outcome, count) = apply(
            &mut root,
            compiled("root.f2", json!("beta"), ValueType::String),
        );
        assert!(outcome.changed);
        assert_eq!(count, 1);
        assert_eq!(root["f2"], json!("beta"));
        assert_eq!(outcome.changed_top_level_keys, vec!["f2"]);
    }

    #[test]
    fn test_nested_path_and_index() {
        let mut root = json!({"a": {"items": [1, 2, 3]}});
        let (outcome, _) = apply(
            &mut root,
            compiled("a.items[1]", json!("9"), ValueType::Number),
        );
        assert!(outcome.changed);
        assert_eq!(root["a"]["items"][1], json!(9));
        // Not a root-level fN write.
        assert!(outcome.changed_top_level_keys.is_empty());
    }

    #[test]
    fn test_missing_path_skips() {
        let mut root = json!({"a": 1});
        let (outcome, count) = apply(
            &mut root,
            compiled("b.c", json!("x"), ValueType::String),
        );
        assert!(!outcome.changed);
        assert_eq!(count, 0);
        assert_eq!(root, json!({"a": 1}));
    }

    #[test]
    fn test_identity_write_not_applied() {
        let mut root = json!({"f1": "same"});
        let (outcome, count) = apply(
            &mut root,
            compiled("root.f1", json!("same"), ValueType::String),
        );
        assert!(!outcome.changed);
        assert_eq!(count, 0);
    }

    #[test]
    fn test_number_coercion_strict() {
        assert_eq!(
            coerce_value(&json!("42"), ValueType::Number),
            Some(json!(42))
        );
        assert_eq!(
            coerce_value(&json!("4.5"), ValueType::Number),
            Some(json!(4.5))
        );
        assert_eq!(coerce_value(&json!("4x"), ValueType::Number), None);
        assert_eq!(coerce_value(&json!(true), ValueType::Number), None);
    }

    #[test]
    fn test_boolean_coercion() {
        assert_eq!(
            coerce_value(&json!("TRUE"), ValueType::Boolean),
            Some(json!(true))
        );
        assert_eq!(
            coerce_value(&json!("false"), ValueType::Boolean),
            Some(json!(false))
        );
        assert_eq!(coerce_value(&json!("yes"), ValueType::Boolean), None);
        assert_eq!(
            coerce_value(&json!(false), ValueType::Boolean),
            Some(json!(false))
        );
    }

    #[test]
    fn test_string_coercion_stringifies() {
        assert_eq!(
            coerce_value(&json!(12), ValueType::String),
            Some(json!("12"))
        );
        assert_eq!(
            coerce_value(&json!(null), ValueType::String),
            Some(json!("null"))
        );
    }

    #[test]
    fn test_null_always_sets_null() {
        let mut root = json!({"k": 5});
        let (outcome, _) = apply(&mut root, compiled("k", json!("ignored"), ValueType::Null));
        assert!(outcome.changed);
        assert_eq!(root["k"], Value::Null);
    }

    #[test]
    fn test_proto_field_key_detection() {
        assert!(is_proto_field_key("f1"));
        assert!(is_proto_field_key("f42"));
        assert!(!is_proto_field_key("f"));
        assert!(!is_proto_field_key("field1"));
        assert!(!is_proto_field_key("g2"));
    }
}
