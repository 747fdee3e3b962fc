//! End-to-end flows through the routing and rewrite engines, wired the way
//! the pipelines drive them.

use periscope::codec;
use periscope::protowire::envelope::{build_frames, split_frames, EnvelopeFrame};
use periscope::protowire::{encode_message, parse_message, Field, WireValue};
use periscope::rewrite::connect::{process_connect_body, ConnectLimits};
use periscope::rewrite::text::apply_text_rules;
use periscope::rewrite::websocket::rewrite_ws_text;
use periscope::rewrite::AppliedRules;
use periscope::routing::{decide, RouteContext, RouteDecision, RoutingModes};
use periscope::rules::compiler::{
    compile_block_rules, compile_filter_rules, compile_rules, FilterMatchers,
};
use periscope::rules::{
    BlockRule, EditRule, FilterMode, FilterRule, RuleKind, RulePhase, RuleTarget, ValueType,
};

fn text_rule(start: &str, end: &str, replacement: &str, target: RuleTarget) -> EditRule {
    EditRule {
        id: String::new(),
        name: "test rule".into(),
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
        target: Some(target),
    }
    .normalize()
}

fn modes(filter_mode: FilterMode) -> RoutingModes {
    RoutingModes {
        interactive_mode_enabled: true,
        blocked_rules_enabled: true,
        filter_rules_enabled: true,
        filter_mode,
    }
}

#[test]
fn block_rule_short_circuits() {
    let block = compile_block_rules(&[BlockRule {
        id: "b1".into(),
        enabled: true,
        name: "ads".into(),
        url: "ads.example.com".into(),
    }]);

    let ctx = RouteContext {
        method: "GET",
        request_url: "http://ads.example.com/tag.js",
        full_url: "http://ads.example.com/tag.js",
        host: "ads.example.com",
    };
    assert_eq!(
        decide(&ctx, &modes(FilterMode::Ignore), &block, &FilterMatchers::default(), 8080),
        RouteDecision::Block
    );
}

#[test]
fn ignore_mode_bypasses_cdn() {
    let filters = compile_filter_rules(&[FilterRule {
        id: "f1".into(),
        enabled: true,
        name: String::new(),
        url: "images.cdn.com".into(),
        mode: FilterMode::Ignore,
    }]);

    let ctx = RouteContext {
        method: "GET",
        request_url: "http://images.cdn.com/a.png",
        full_url: "http://images.cdn.com/a.png",
        host: "images.cdn.com",
    };
    assert_eq!(
        decide(
            &ctx,
            &modes(FilterMode::Ignore),
            &compile_block_rules(&[]),
            &filters,
            8080
        ),
        RouteDecision::Direct
    );
}

#[test]
fn focus_mode_mediates_only_matches() {
    let filters = compile_filter_rules(&[FilterRule {
        id: "f1".into(),
        enabled: true,
        name: String::new(),
        url: "images.cdn.com".into(),
        mode: FilterMode::Focus,
    }]);
    let block = compile_block_rules(&[]);

    let other = RouteContext {
        method: "GET",
        request_url: "http://other.host/x",
        full_url: "http://other.host/x",
        host: "other.host",
    };
    assert_eq!(
        decide(&other, &modes(FilterMode::Focus), &block, &filters, 8080),
        RouteDecision::Direct
    );

    let focused = RouteContext {
        method: "GET",
        request_url: "http://images.cdn.com/y",
        full_url: "http://images.cdn.com/y",
        host: "images.cdn.com",
    };
    assert_eq!(
        decide(&focused, &modes(FilterMode::Focus), &block, &filters, 8080),
        RouteDecision::Proxy
    );
}

#[test]
fn json_request_body_rewrite() {
    let rule = text_rule("\"user\":\"", "\"", "\"user\":\"admin\"", RuleTarget::Request);
    let compiled = compile_rules(&[rule]);

    let mut applied = AppliedRules::new();
    let (out, changed) = apply_text_rules(
        r#"{"user":"guest","n":1}"#,
        &compiled.text,
        RulePhase::Request,
        "/login",
        "http://app.example.com/login",
        &mut applied,
    );

    assert!(changed);
    assert_eq!(out, r#"{"user":"admin","n":1}"#);
    assert_eq!(applied.len(), 1);
    let tag = &applied.tags()[0];
    assert_eq!(tag.kind, RuleKind::Text);
    assert_eq!(tag.target, RulePhase::Request);
}

#[test]
fn jsonpath_rewrites_connect_frame_preserving_envelope() {
    // Single-frame envelope, payload = protobuf with field 2 = "alpha".
    let message = encode_message(&[Field {
        number: 2,
        value: WireValue::LengthDelimited(b"alpha".to_vec()),
    }]);
    let plain_envelope = build_frames(&[EnvelopeFrame {
        flags: 0,
        payload: message,
    }]);
    let body = codec::compress("gzip", &plain_envelope).unwrap();

    let rule = EditRule {
        id: String::new(),
        name: "field 2".into(),
        enabled: true,
        kind: RuleKind::JsonPath,
        start: String::new(),
        end: String::new(),
        replacement: String::new(),
        use_regex: false,
        case_sensitive: false,
        path: "root.f2".into(),
        value: serde_json::json!("beta"),
        value_type: ValueType::String,
        url: "/svc/Method".into(),
        target: Some(RuleTarget::Request),
    }
    .normalize();
    let compiled = compile_rules(&[rule]);

    let mut applied = AppliedRules::new();
    let outcome = process_connect_body(
        &body,
        Some("gzip"),
        None,
        None,
        &compiled,
        RulePhase::Request,
        "/svc/Method",
        "https://api.example.com/svc/Method",
        &ConnectLimits::default(),
        &mut applied,
    );

    assert!(outcome.changed);
    assert_eq!(applied.len(), 1);

    // Content-encoding preserved: output is still gzip.
    let decoded = codec::decompress("gzip", &outcome.body).unwrap();
    let frames = split_frames(&decoded).unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].flags, 0);
    let fields = parse_message(&frames[0].payload).unwrap();
    assert_eq!(fields[0].number, 2);
    assert_eq!(fields[0].value, WireValue::LengthDelimited(b"beta".to_vec()));

    let view = outcome.view.unwrap();
    assert!(view.envelope);
    assert_eq!(view.frame_count, 1);
}

#[test]
fn connect_passthrough_round_trips_exactly() {
    let message = encode_message(&[
        Field {
            number: 1,
            value: WireValue::Varint(1),
        },
        Field {
            number: 2,
            value: WireValue::LengthDelimited(b"payload".to_vec()),
        },
    ]);
    let body = build_frames(&[
        EnvelopeFrame {
            flags: 0,
            payload: message,
        },
        EnvelopeFrame {
            flags: 2,
            payload: Vec::new(),
        },
    ]);

    let mut applied = AppliedRules::new();
    let outcome = process_connect_body(
        &body,
        None,
        None,
        None,
        &compile_rules(&[]),
        RulePhase::Request,
        "/svc/Method",
        "https://h/svc/Method",
        &ConnectLimits::default(),
        &mut applied,
    );
    assert!(!outcome.changed);
    assert_eq!(outcome.body, body);
    assert!(applied.is_empty());
}

#[test]
fn websocket_prefix_rewrite_with_json_views() {
    let rule = text_rule("hello", "", "world", RuleTarget::Both);
    let compiled = compile_rules(&[rule]);

    let mut applied = AppliedRules::new();
    let outcome = rewrite_ws_text(
        r#"42/ws/channel,["msg","hello"]"#,
        &compiled,
        RulePhase::Request,
        "/ws/channel",
        "ws://app.example.com/ws/channel",
        256 * 1024,
        &mut applied,
    );

    assert!(outcome.changed);
    assert_eq!(outcome.text, r#"42/ws/channel,["msg","world"]"#);
    assert_eq!(
        outcome.json_before.unwrap(),
        serde_json::json!(["msg", "hello"])
    );
    assert_eq!(
        outcome.json_after.unwrap(),
        serde_json::json!(["msg", "world"])
    );
    assert_eq!(applied.len(), 1);
}

#[test]
fn rule_chain_feeds_forward_across_kinds() {
    // A text rule changes a value that a jsonPath rule then reads: the
    // jsonPath rule sees rule 1's output, matching pipeline order.
    let text = text_rule("guest", "", "intermediate", RuleTarget::Request);
    let jsonpath = EditRule {
        id: String::new(),
        name: "role".into(),
        enabled: true,
        kind: RuleKind::JsonPath,
        start: String::new(),
        end: String::new(),
        replacement: String::new(),
        use_regex: false,
        case_sensitive: false,
        path: "role".into(),
        value: serde_json::json!("admin"),
        value_type: ValueType::String,
        url: "/login".into(),
        target: Some(RuleTarget::Request),
    }
    .normalize();
    let compiled = compile_rules(&[text, jsonpath]);

    let mut applied = AppliedRules::new();
    let (after_text, _) = apply_text_rules(
        r#"{"role":"guest"}"#,
        &compiled.text,
        RulePhase::Request,
        "/login",
        "http://h/login",
        &mut applied,
    );
    let mut json: serde_json::Value = serde_json::from_str(&after_text).unwrap();
    periscope::rewrite::jsonpath::apply_jsonpath_rules(
        &mut json,
        &compiled.jsonpath,
        RulePhase::Request,
        "/login",
        "http://h/login",
        &mut applied,
    );

    assert_eq!(json["role"], serde_json::json!("admin"));
    assert_eq!(applied.len(), 2);
}
