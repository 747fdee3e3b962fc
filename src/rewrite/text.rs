//! Text rule application.
//!
//! Each compiled rule walks the working text exactly once, in declaration
//! order; the output of rule *i* is the input of rule *i+1*. Case-insensitive
//! matching folds ASCII case for comparison but slices the original text, so
//! replacements never mangle the untouched surroundings.

use crate::rewrite::AppliedRules;
use crate::rules::compiler::{url_matches, CompiledTextRule, TextMatcher};
use crate::rules::{RuleKind, RulePhase};

/// Apply every matching text rule. Returns the rewritten text and whether
/// anything changed.
pub fn apply_text_rules(
    text: &str,
    rules: &[CompiledTextRule],
    phase: RulePhase,
    request_path: &str,
    full_url: &str,
    applied: &mut AppliedRules,
) -> (String, bool) {
    let mut working = text.to_string();
    let mut changed = false;

    for rule in rules {
        if !rule.target.applies_to(phase) {
            continue;
        }
        if !url_matches(&rule.url_pattern, request_path, full_url) {
            continue;
        }

        let result = match &rule.matcher {
            TextMatcher::Between { start, end } => replace_between(
                &working,
                start,
                end,
                &rule.replacement,
                rule.case_sensitive,
            ),
            TextMatcher::Prefix { start } => {
                replace_all(&working, start, &rule.replacement, rule.case_sensitive)
            }
            TextMatcher::Suffix { end } => {
                replace_all(&working, end, &rule.replacement, rule.case_sensitive)
            }
            TextMatcher::Regex(re) => {
                if re.is_match(&working) {
                    Some(re.replace_all(&working, rule.replacement.as_str()).into_owned())
                } else {
                    None
                }
            }
        };

        if let Some(rewritten) = result {
            working = rewritten;
            changed = true;
            applied.record(&rule.id, &rule.name, RuleKind::Text, phase, full_url);
        }
    }

    (working, changed)
}

/// ASCII case fold — byte-length preserving, so indices found in the folded
/// copy are valid in the original.
fn fold(s: &str) -> String {
    s.chars().map(|c| c.to_ascii_lowercase()).collect()
}

/// Replace every `[start..end]` span (inclusive of both anchors), scanning
/// left to right and continuing after each replacement.
fn replace_between(
    text: &str,
    start: &str,
    end: &str,
    replacement: &str,
    case_sensitive: bool,
) -> Option<String> {
    let (haystack, start_n, end_n) = if case_sensitive {
        (text.to_string(), start.to_string(), end.to_string())
    } else {
        (fold(text), fold(start), fold(end))
    };

    let mut out = String::with_capacity(text.len());
    let mut pos = 0usize;
    let mut replaced = false;

    while let Some(found) = haystack[pos..].find(&start_n) {
        let s_idx = pos + found;
        let after_start = s_idx + start_n.len();
        match haystack[after_start..].find(&end_n) {
            Some(e_found) => {
                let e_idx = after_start + e_found;
                out.push_str(&text[pos..s_idx]);
                out.push_str(replacement);
                pos = e_idx + end_n.len();
                replaced = true;
            }
            None => break,
        }
    }

    if !replaced {
        return None;
    }
    out.push_str(&text[pos..]);
    Some(out)
}

/// Replace every occurrence of `needle` (prefix/suffix single-anchor modes).
fn replace_all(
    text: &str,
    needle: &str,
    replacement: &str,
    case_sensitive: bool,
) -> Option<String> {
    if needle.is_empty() {
        return None;
    }
    let (haystack, needle_n) = if case_sensitive {
        (text.to_string(), needle.to_string())
    } else {
        (fold(text), fold(needle))
    };

    let mut out = String::with_capacity(text.len());
    let mut pos = 0usize;
    let mut replaced = false;

    while let Some(found) = haystack[pos..].find(&needle_n) {
        let idx = pos + found;
        out.push_str(&text[pos..idx]);
        out.push_str(replacement);
        pos = idx + needle_n.len();
        replaced = true;
    }

    if !replaced {
        return None;
    }
    out.push_str(&text[pos..]);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::compiler::compile_rules;
    use crate::rules::{EditRule, RuleTarget, ValueType};

    fn rule(start: &str, end: &str, replacement: &str) -> EditRule {
        EditRule {
            id: "t".into(),
            name: "t".into(),
            enabled: true,
            kind: RuleKind::Text,
            start: start.into(),
            end: end.into(),
            replacement: replacement.into(),
            use_regex: false,
            case_sensitive: false,
            path: String::new(),
            value: serde_json::Value::Null,
            value_type: ValueType::String,
            url: String::new(),
            target: Some(RuleTarget::Both),
        }
    }

    fn apply_one(r: EditRule, input: &str) -> (String, bool) {
        let compiled = compile_rules(&[r]);
        let mut applied = AppliedRules::new();
        apply_text_rules(
            input,
            &compiled.text,
            RulePhase::Request,
            "/x",
            "http://h/x",
            &mut applied,
        )
    }

    #[test]
    fn test_between_replaces_anchors_inclusive() {
        let (out, changed) = apply_one(
            rule("\"user\":\"", "\"", "\"user\":\"admin\""),
            r#"{"user":"guest","n":1}"#,
        );
        assert!(changed);
        assert_eq!(out, r#"{"user":"admin","n":1}"#);
    }

    #[test]
    fn test_between_multiple_occurrences() {
        let (out, _) = apply_one(rule("<", ">", "#"), "a<b>c<d>e");
        assert_eq!(out, "a#c#e");
    }

    #[test]
    fn test_between_unterminated_tail_is_kept() {
        let (out, changed) = apply_one(rule("<", ">", "#"), "a<b>c<d");
        assert!(changed);
        assert_eq!(out, "a#c<d");
    }

    #[test]
    fn test_prefix_mode_replaces_every_start() {
        let (out, changed) = apply_one(rule("hello", "", "world"), "hello hello");
        assert!(changed);
        assert_eq!(out, "world world");
    }

    #[test]
    fn test_suffix_mode_replaces_every_end() {
        let (out, changed) = apply_one(rule("", "end", "X"), "the end of the end");
        assert!(changed);
        assert_eq!(out, "the X of the X");
    }

    #[test]
    fn test_case_insensitive_slices_original() {
        let (out, _) = apply_one(rule("HELLO", "", "bye"), "say Hello there");
        assert_eq!(out, "say bye there");
    }

    #[test]
    fn test_case_sensitive_respected() {
        let mut r = rule("Hello", "", "bye");
        r.case_sensitive = true;
        let (out, changed) = apply_one(r.clone(), "say hello there");
        assert!(!changed);
        assert_eq!(out, "say hello there");
        let (out, changed) = apply_one(r, "say Hello there");
        assert!(changed);
        assert_eq!(out, "say bye there");
    }

    #[test]
    fn test_regex_global_replace() {
        let mut r = rule(r"\d+", "", "N");
        r.use_regex = true;
        let (out, changed) = apply_one(r, "a1 b22 c333");
        assert!(changed);
        assert_eq!(out, "aN bN cN");
    }

    #[test]
    fn test_rules_chain_in_order() {
        let compiled = compile_rules(&[rule("a", "", "b"), rule("b", "", "c")]);
        let mut applied = AppliedRules::new();
        let (out, _) = apply_text_rules(
            "a",
            &compiled.text,
            RulePhase::Request,
            "",
            "",
            &mut applied,
        );
        // rule 2 sees rule 1's output
        assert_eq!(out, "c");
        assert_eq!(applied.len(), 2);
    }

    #[test]
    fn test_url_pattern_scopes_rule() {
        let mut r = rule("x", "", "y");
        r.url = "/api/users".into();
        let compiled = compile_rules(&[r]);
        let mut applied = AppliedRules::new();
        let (_, changed) = apply_text_rules(
            "x",
            &compiled.text,
            RulePhase::Request,
            "/other",
            "http://h/other",
            &mut applied,
        );
        assert!(!changed);
        let (_, changed) = apply_text_rules(
            "x",
            &compiled.text,
            RulePhase::Request,
            "/api/users",
            "http://h/api/users",
            &mut applied,
        );
        assert!(changed);
    }

    #[test]
    fn test_phase_scoping() {
        let mut r = rule("x", "", "y");
        r.target = Some(RuleTarget::Response);
        let compiled = compile_rules(&[r]);
        let mut applied = AppliedRules::new();
        let (_, changed) =
            apply_text_rules("x", &compiled.text, RulePhase::Request, "", "", &mut applied);
        assert!(!changed);
    }
}
