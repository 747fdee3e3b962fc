//! Rule compilation.
//!
//! Rules are compiled once per mutation into flat lookup shapes; flows read
//! a snapshot of the compiled set and never touch the raw rule structs.

use crate::rules::{
    BlockRule, EditRule, FilterMode, FilterRule, RuleKind, RuleTarget, ValueType,
};
use tracing::debug;

/// Compiled form of a text rule — one of three scan modes, or a regex.
#[derive(Debug)]
pub enum TextMatcher {
    /// Both anchors present: replace `[start..end]` inclusive.
    Between { start: String, end: String },
    /// Start only: replace every occurrence of `start`.
    Prefix { start: String },
    /// End only: replace every occurrence of `end`.
    Suffix { end: String },
    /// Pre-built regex, global replace.
    Regex(regex::Regex),
}

#[derive(Debug)]
pub struct CompiledTextRule {
    pub id: String,
    pub name: String,
    pub target: RuleTarget,
    /// Lowercased URL pattern; empty matches everything.
    pub url_pattern: String,
    pub replacement: String,
    pub case_sensitive: bool,
    pub matcher: TextMatcher,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone)]
pub struct CompiledJsonPathRule {
    pub id: String,
    pub name: String,
    pub target: RuleTarget,
    /// Lowercased URL pattern — required; rules with an empty pattern are
    /// never compiled.
    pub url_pattern: String,
    pub segments: Vec<PathSegment>,
    pub value: serde_json::Value,
    pub value_type: ValueType,
}

#[derive(Debug, Default)]
pub struct CompiledRules {
    pub text: Vec<CompiledTextRule>,
    pub jsonpath: Vec<CompiledJsonPathRule>,
}

impl CompiledRules {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.jsonpath.is_empty()
    }
}

/// Compile the full rule set. Disabled, anchorless, or malformed rules are
/// dropped here (inert) so the hot path never re-validates.
pub fn compile_rules(rules: &[EditRule]) -> CompiledRules {
    let mut compiled = CompiledRules::default();

    for rule in rules.iter().filter(|r| r.enabled) {
        match rule.kind {
            RuleKind::Text => {
                if let Some(text) = compile_text_rule(rule) {
                    compiled.text.push(text);
                }
            }
            RuleKind::JsonPath => {
                if let Some(jp) = compile_jsonpath_rule(rule) {
                    compiled.jsonpath.push(jp);
                }
            }
        }
    }

    compiled
}

fn compile_text_rule(rule: &EditRule) -> Option<CompiledTextRule> {
    let start = rule.start.clone();
    let end = rule.end.clone();
    if start.is_empty() && end.is_empty() {
        debug!("rules: text rule has no anchors, skipping, id={}", rule.id);
        return None;
    }

    let matcher = if rule.use_regex {
        let pattern = if !start.is_empty() && !end.is_empty() {
            format!("{}[\\s\\S]*?{}", start, end)
        } else if !start.is_empty() {
            start.clone()
        } else {
            end.clone()
        };
        let pattern = if rule.case_sensitive {
            pattern
        } else {
            format!("(?i){}", pattern)
        };
        match regex::Regex::new(&pattern) {
            Ok(re) => TextMatcher::Regex(re),
            Err(e) => {
                debug!(
                    "rules: text rule regex failed to compile, skipping, id={}, error={}",
                    rule.id, e
                );
                return None;
            }
        }
    } else if !start.is_empty() && !end.is_empty() {
        TextMatcher::Between { start, end }
    } else if !start.is_empty() {
        TextMatcher::Prefix { start }
    } else {
        TextMatcher::Suffix { end }
    };

    Some(CompiledTextRule {
        id: rule.id.clone(),
        name: rule.name.clone(),
        target: rule.resolved_target(),
        url_pattern: rule.url.to_lowercase(),
        replacement: rule.replacement.clone(),
        case_sensitive: rule.case_sensitive,
        matcher,
    })
}

fn compile_jsonpath_rule(rule: &EditRule) -> Option<CompiledJsonPathRule> {
    if rule.url.is_empty() {
        debug!(
            "rules: jsonPath rule has no url pattern, skipping, id={}",
            rule.id
        );
        return None;
    }
    let segments = parse_path(&rule.path)?;
    if segments.is_empty() {
        return None;
    }

    Some(CompiledJsonPathRule {
        id: rule.id.clone(),
        name: rule.name.clone(),
        target: rule.resolved_target(),
        url_pattern: rule.url.to_lowercase(),
        segments,
        value: rule.value.clone(),
        value_type: rule.value_type,
    })
}

/// Parse the dotted/`[i]` path dialect. An optional `root.` or `$.` prefix
/// is stripped. Returns `None` for empty or malformed paths.
pub fn parse_path(path: &str) -> Option<Vec<PathSegment>> {
    let mut rest = path.trim();
    for prefix in ["$.", "root."] {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = stripped;
            break;
        }
    }
    if rest == "$" || rest == "root" || rest.is_empty() {
        return None;
    }

    let mut segments = Vec::new();
    for part in rest.split('.') {
        if part.is_empty() {
            return None;
        }
        // A part may carry trailing indices: `items[0][1]`.
        let (key, mut idx_rest) = match part.find('[') {
            Some(bracket) => (&part[..bracket], &part[bracket..]),
            None => (part, ""),
        };
        if !key.is_empty() {
            if key.contains(']') {
                return None;
            }
            segments.push(PathSegment::Key(key.to_string()));
        } else if idx_rest.is_empty() {
            return None;
        }
        while !idx_rest.is_empty() {
            let close = idx_rest.find(']')?;
            let inner = &idx_rest[1..close];
            let index: usize = inner.parse().ok()?;
            segments.push(PathSegment::Index(index));
            idx_rest = &idx_rest[close + 1..];
            if !idx_rest.is_empty() && !idx_rest.starts_with('[') {
                return None;
            }
        }
    }

    if segments.is_empty() {
        None
    } else {
        Some(segments)
    }
}

/// Bidirectional contains-match: the rule fires when either the candidate
/// contains the pattern or the pattern contains the candidate, compared
/// lowercase against both the request path and the resolved full URL.
pub fn url_matches(pattern_lower: &str, request_path: &str, full_url: &str) -> bool {
    if pattern_lower.is_empty() {
        return true;
    }
    for candidate in [request_path, full_url] {
        if candidate.is_empty() {
            continue;
        }
        let c = candidate.to_lowercase();
        if c.contains(pattern_lower) || pattern_lower.contains(c.as_str()) {
            return true;
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Block + filter matchers
// ---------------------------------------------------------------------------

/// Derived block pattern sets. `active` short-circuits requests to 204;
/// `noise` mutes matches from the default log view regardless of `enabled`.
#[derive(Debug, Default)]
pub struct BlockMatchers {
    pub active: Vec<String>,
    pub noise: Vec<String>,
}

pub fn compile_block_rules(rules: &[BlockRule]) -> BlockMatchers {
    let mut matchers = BlockMatchers::default();
    for rule in rules {
        if rule.url.is_empty() {
            continue;
        }
        let pattern = rule.url.to_lowercase();
        if rule.enabled {
            matchers.active.push(pattern.clone());
        }
        matchers.noise.push(pattern);
    }
    matchers
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherKind {
    Host,
    Path,
}

#[derive(Debug, Clone)]
pub struct FilterMatcher {
    pub kind: MatcherKind,
    pub pattern: String,
}

/// Matchers are pre-split by mode so a filter-mode flip needs no rebuild.
#[derive(Debug, Default)]
pub struct FilterMatchers {
    pub ignore: Vec<FilterMatcher>,
    pub focus: Vec<FilterMatcher>,
}

impl FilterMatchers {
    pub fn for_mode(&self, mode: FilterMode) -> &[FilterMatcher] {
        match mode {
            FilterMode::Ignore => &self.ignore,
            FilterMode::Focus => &self.focus,
        }
    }
}

/// A pattern containing `.` but no `/` or `:` is a host pattern;
/// everything else matches against path/URL candidates as a substring.
pub fn classify_pattern(pattern: &str) -> MatcherKind {
    if pattern.contains('.') && !pattern.contains('/') && !pattern.contains(':') {
        MatcherKind::Host
    } else {
        MatcherKind::Path
    }
}

pub fn compile_filter_rules(rules: &[FilterRule]) -> FilterMatchers {
    let mut matchers = FilterMatchers::default();
    for rule in rules.iter().filter(|r| r.enabled && !r.url.is_empty()) {
        let pattern = rule.url.to_lowercase();
        let matcher = FilterMatcher {
            kind: classify_pattern(&pattern),
            pattern,
        };
        match rule.mode {
            FilterMode::Ignore => matchers.ignore.push(matcher),
            FilterMode::Focus => matchers.focus.push(matcher),
        }
    }
    matchers
}

/// Host matcher semantics: exact, dotted-suffix (`example.com` matches
/// `api.example.com`), or strict suffix for `.`-prefixed patterns.
pub fn host_pattern_matches(pattern: &str, host: &str) -> bool {
    if pattern.starts_with('.') {
        return host.ends_with(pattern);
    }
    host == pattern || host.ends_with(&format!(".{}", pattern))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleKind;

    fn text_rule(start: &str, end: &str, use_regex: bool) -> EditRule {
        EditRule {
            id: "t1".into(),
            name: "test".into(),
            enabled: true,
            kind: RuleKind::Text,
            start: start.into(),
            end: end.into(),
            replacement: "X".into(),
            use_regex,
            case_sensitive: false,
            path: String::new(),
            value: serde_json::Value::Null,
            value_type: ValueType::String,
            url: String::new(),
            target: None,
        }
    }

    #[test]
    fn test_text_rule_modes() {
        let compiled = compile_rules(&[
            text_rule("a", "b", false),
            text_rule("a", "", false),
            text_rule("", "b", false),
            text_rule("", "", false), // inert: no anchors
        ]);
        assert_eq!(compiled.text.len(), 3);
        assert!(matches!(compiled.text[0].matcher, TextMatcher::Between { .. }));
        assert!(matches!(compiled.text[1].matcher, TextMatcher::Prefix { .. }));
        assert!(matches!(compiled.text[2].matcher, TextMatcher::Suffix { .. }));
    }

    #[test]
    fn test_disabled_rules_are_not_compiled() {
        let mut rule = text_rule("a", "", false);
        rule.enabled = false;
        assert!(compile_rules(&[rule]).is_empty());
    }

    #[test]
    fn test_bad_regex_is_inert() {
        let compiled = compile_rules(&[text_rule("[unclosed", "", true)]);
        assert!(compiled.text.is_empty());
    }

    #[test]
    fn test_parse_path() {
        assert_eq!(
            parse_path("root.f2").unwrap(),
            vec![PathSegment::Key("f2".into())]
        );
        assert_eq!(
            parse_path("$.a.b[3].c").unwrap(),
            vec![
                PathSegment::Key("a".into()),
                PathSegment::Key("b".into()),
                PathSegment::Index(3),
                PathSegment::Key("c".into()),
            ]
        );
        assert_eq!(
            parse_path("items[0][1]").unwrap(),
            vec![
                PathSegment::Key("items".into()),
                PathSegment::Index(0),
                PathSegment::Index(1),
            ]
        );
        assert!(parse_path("").is_none());
        assert!(parse_path("root.").is_none());
        assert!(parse_path("a..b").is_none());
        assert!(parse_path("a[x]").is_none());
        assert!(parse_path("$").is_none());
    }

    #[test]
    fn test_jsonpath_requires_url_pattern() {
        let rule = EditRule {
            kind: RuleKind::JsonPath,
            path: "root.f1".into(),
            value: serde_json::json!("v"),
            url: String::new(),
            ..text_rule("", "", false)
        };
        assert!(compile_rules(&[rule]).jsonpath.is_empty());
    }

    #[test]
    fn test_url_matches_bidirectional() {
        assert!(url_matches("/svc/method", "/svc/method", ""));
        // pattern is a full URL, candidate only a path
        assert!(url_matches(
            "http://api.example.com/svc/method",
            "/svc/method",
            ""
        ));
        // candidate full URL contains the pattern
        assert!(url_matches(
            "/svc/method",
            "",
            "http://api.example.com/svc/method?x=1"
        ));
        assert!(!url_matches("/other", "/svc", "http://h/svc"));
        assert!(url_matches("", "/anything", ""));
    }

    #[test]
    fn test_block_matchers_split_active_and_noise() {
        let rules = vec![
            BlockRule {
                id: "1".into(),
                enabled: true,
                name: String::new(),
                url: "Ads.example.com".into(),
            },
            BlockRule {
                id: "2".into(),
                enabled: false,
                name: String::new(),
                url: "tracker.io".into(),
            },
        ];
        let matchers = compile_block_rules(&rules);
        assert_eq!(matchers.active, vec!["ads.example.com"]);
        assert_eq!(matchers.noise.len(), 2);
    }

    #[test]
    fn test_classify_pattern() {
        assert_eq!(classify_pattern("images.cdn.com"), MatcherKind::Host);
        assert_eq!(classify_pattern(".cdn.com"), MatcherKind::Host);
        assert_eq!(classify_pattern("/api/v1"), MatcherKind::Path);
        assert_eq!(classify_pattern("cdn.com:8080"), MatcherKind::Path);
        assert_eq!(classify_pattern("plain"), MatcherKind::Path);
    }

    #[test]
    fn test_host_pattern_matches() {
        assert!(host_pattern_matches("example.com", "example.com"));
        assert!(host_pattern_matches("example.com", "api.example.com"));
        assert!(!host_pattern_matches("example.com", "notexample.com"));
        assert!(host_pattern_matches(".example.com", "api.example.com"));
        assert!(!host_pattern_matches(".example.com", "example.com"));
    }

    #[test]
    fn test_filter_matchers_split_by_mode() {
        let rules = vec![
            FilterRule {
                id: "1".into(),
                enabled: true,
                name: String::new(),
                url: "cdn.com".into(),
                mode: FilterMode::Ignore,
            },
            FilterRule {
                id: "2".into(),
                enabled: true,
                name: String::new(),
                url: "app.example.com".into(),
                mode: FilterMode::Focus,
            },
        ];
        let matchers = compile_filter_rules(&rules);
        assert_eq!(matchers.ignore.len(), 1);
        assert_eq!(matchers.focus.len(), 1);
        assert_eq!(matchers.for_mode(FilterMode::Focus).len(), 1);
    }
}
