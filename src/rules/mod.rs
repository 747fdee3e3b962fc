//! Rule data model.
//!
//! Edit rules (text + jsonPath) are persisted as one JSON array
//! disambiguated by `kind`. Block and filter rules are separate stores.
//! Every rule passes through a normaliser on load or mutation that fills
//! defaults, generates missing ids, and clamps enums.

pub mod compiler;
pub mod store;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleKind {
    Text,
    JsonPath,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleTarget {
    Request,
    Response,
    Both,
}

impl RuleTarget {
    /// Whether a rule with this target applies in the given phase.
    pub fn applies_to(&self, phase: RulePhase) -> bool {
        matches!(
            (self, phase),
            (RuleTarget::Both, _)
                | (RuleTarget::Request, RulePhase::Request)
                | (RuleTarget::Response, RulePhase::Response)
        )
    }
}

/// Which direction of a flow a rewrite is being applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RulePhase {
    Request,
    Response,
}

impl RulePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RulePhase::Request => "request",
            RulePhase::Response => "response",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    #[default]
    String,
    Number,
    Boolean,
    Null,
}

/// A user-configured edit rule, persisted verbatim (after normalisation).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditRule {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_kind")]
    pub kind: RuleKind,

    // -- text rule fields --
    #[serde(default)]
    pub start: String,

    #[serde(default)]
    pub end: String,

    #[serde(default)]
    pub replacement: String,

    #[serde(default)]
    pub use_regex: bool,

    #[serde(default)]
    pub case_sensitive: bool,

    // -- jsonPath rule fields --
    #[serde(default)]
    pub path: String,

    #[serde(default)]
    pub value: serde_json::Value,

    #[serde(default)]
    pub value_type: ValueType,

    // -- shared --
    /// URL pattern, contains-match in both directions. Optional for text
    /// rules; a jsonPath rule with an empty pattern is inert.
    #[serde(default)]
    pub url: String,

    /// Defaults to `both` for text rules and `request` for jsonPath rules.
    #[serde(default)]
    pub target: Option<RuleTarget>,
}

fn default_enabled() -> bool {
    true
}

fn default_kind() -> RuleKind {
    RuleKind::Text
}

impl EditRule {
    /// Fill defaults and clamp fields. Applied to every rule on load and on
    /// each create/update before the compiled cache is rebuilt.
    pub fn normalize(mut self) -> Self {
        if self.id.trim().is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        self.name = self.name.trim().to_string();
        if self.target.is_none() {
            self.target = Some(match self.kind {
                RuleKind::Text => RuleTarget::Both,
                RuleKind::JsonPath => RuleTarget::Request,
            });
        }
        self.path = self.path.trim().to_string();
        self.url = self.url.trim().to_string();
        self
    }

    pub fn resolved_target(&self) -> RuleTarget {
        self.target.unwrap_or(match self.kind {
            RuleKind::Text => RuleTarget::Both,
            RuleKind::JsonPath => RuleTarget::Request,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRule {
    #[serde(default)]
    pub id: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub url: String,
}

impl BlockRule {
    pub fn normalize(mut self) -> Self {
        if self.id.trim().is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        self.url = self.url.trim().to_string();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    #[default]
    Ignore,
    Focus,
}

impl FilterMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterMode::Ignore => "ignore",
            FilterMode::Focus => "focus",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterRule {
    #[serde(default)]
    pub id: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub mode: FilterMode,
}

impl FilterRule {
    pub fn normalize(mut self) -> Self {
        if self.id.trim().is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        self.url = self.url.trim().to_string();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_generates_id_and_target() {
        let rule: EditRule = serde_json::from_str(
            r#"{"kind":"text","start":"a","replacement":"b"}"#,
        )
        .unwrap();
        let rule = rule.normalize();
        assert!(!rule.id.is_empty());
        assert!(rule.enabled);
        assert_eq!(rule.resolved_target(), RuleTarget::Both);
    }

    #[test]
    fn test_jsonpath_defaults_to_request_target() {
        let rule: EditRule = serde_json::from_str(
            r#"{"kind":"jsonPath","path":"root.f2","value":"x","url":"/svc"}"#,
        )
        .unwrap();
        assert_eq!(rule.normalize().resolved_target(), RuleTarget::Request);
    }

    #[test]
    fn test_target_applies_to_phase() {
        assert!(RuleTarget::Both.applies_to(RulePhase::Request));
        assert!(RuleTarget::Both.applies_to(RulePhase::Response));
        assert!(RuleTarget::Request.applies_to(RulePhase::Request));
        assert!(!RuleTarget::Request.applies_to(RulePhase::Response));
        assert!(!RuleTarget::Response.applies_to(RulePhase::Request));
    }

    #[test]
    fn test_persisted_shape_is_camel_case() {
        let rule = EditRule {
            id: "r1".into(),
            name: "n".into(),
            enabled: true,
            kind: RuleKind::JsonPath,
            start: String::new(),
            end: String::new(),
            replacement: String::new(),
            use_regex: false,
            case_sensitive: true,
            path: "root.f1".into(),
            value: serde_json::json!("v"),
            value_type: ValueType::String,
            url: "/x".into(),
            target: Some(RuleTarget::Request),
        };
        let json = serde_json::to_string(&rule).unwrap();
        assert!(json.contains("\"caseSensitive\":true"));
        assert!(json.contains("\"valueType\":\"string\""));
        assert!(json.contains("\"kind\":\"jsonPath\""));
    }

    #[test]
    fn test_filter_mode_serde() {
        let rule: FilterRule =
            serde_json::from_str(r#"{"url":"cdn.com","mode":"focus"}"#).unwrap();
        assert_eq!(rule.mode, FilterMode::Focus);
        let rule: FilterRule = serde_json::from_str(r#"{"url":"cdn.com"}"#).unwrap();
        assert_eq!(rule.mode, FilterMode::Ignore);
    }
}
