//! Connect / gRPC body rewrites.
//!
//! Bodies are detected as Connect either by content type (proto/grpc
//! variants) or by the envelope heuristic. The pipeline decompresses at the
//! HTTP layer, splits the envelope, optionally decompresses each frame with
//! the Connect-level codec, applies text rules to UTF-8-looking
//! length-delimited fields and JSONPath rules to the `fN` projection, then
//! reassembles everything with the original encodings. Frames that exceed
//! limits or fail any codec step are preserved verbatim with a note.

use crate::codec;
use crate::protowire::envelope::{build_frames, looks_like_envelope, split_frames, EnvelopeFrame};
use crate::protowire::projection::{project_message, ProjectionLimits, MAX_PROJECTION_DEPTH};
use crate::protowire::{encode_message, parse_message, Field, WireValue};
use crate::rewrite::jsonpath::coerce_value;
use crate::rewrite::text::apply_text_rules;
use crate::rewrite::AppliedRules;
use crate::rules::compiler::{url_matches, CompiledJsonPathRule, CompiledRules, PathSegment};
use crate::rules::{RuleKind, RulePhase, ValueType};
use base64::Engine;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct ConnectLimits {
    pub max_frames: usize,
    pub max_frame_bytes: usize,
    pub preview_max_bytes: usize,
    pub projection: ProjectionLimits,
}

impl Default for ConnectLimits {
    fn default() -> Self {
        Self {
            max_frames: 64,
            max_frame_bytes: 1 << 20,
            preview_max_bytes: 4096,
            projection: ProjectionLimits::default(),
        }
    }
}

/// Decoded view of one envelope frame, attached to log entries.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameView {
    pub index: usize,
    pub length: usize,
    pub compressed: bool,
    pub end_stream: bool,
    pub frame_decompressed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_base64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectView {
    pub envelope: bool,
    pub frame_count: usize,
    pub frames: Vec<FrameView>,
    pub original_frames: Vec<FrameView>,
}

#[derive(Debug)]
pub struct ConnectOutcome {
    /// The on-wire body to forward — identical to the input when unchanged.
    pub body: Vec<u8>,
    pub changed: bool,
    pub view: Option<ConnectView>,
}

/// Whether a body should take the Connect path.
pub fn is_connect_content(content_type: &str, decompressed_body: &[u8]) -> bool {
    let ct = content_type.to_ascii_lowercase();
    if ct.contains("proto") || ct.contains("grpc") || ct.contains("connect") {
        return true;
    }
    looks_like_envelope(decompressed_body)
}

/// Run the full Connect rewrite pipeline over a buffered body.
#[allow(clippy::too_many_arguments)]
pub fn process_connect_body(
    body: &[u8],
    http_encoding: Option<&str>,
    connect_encoding: Option<&str>,
    predecompressed: Option<Vec<u8>>,
    compiled: &CompiledRules,
    phase: RulePhase,
    request_path: &str,
    full_url: &str,
    limits: &ConnectLimits,
    applied: &mut AppliedRules,
) -> ConnectOutcome {
    let unchanged = |view: Option<ConnectView>| ConnectOutcome {
        body: body.to_vec(),
        changed: false,
        view,
    };

    // HTTP-layer decompression. A logging-side decode is reused when the
    // caller already produced one.
    let decoded: Vec<u8> = match (predecompressed, http_encoding) {
        (Some(buf), _) => buf,
        (None, Some(enc)) if codec::is_supported_encoding(enc) => {
            match codec::decompress(enc, body) {
                Ok(buf) => buf,
                Err(e) => {
                    debug!("rewrite: connect body http decompress failed, error={}", e);
                    return unchanged(None);
                }
            }
        }
        (None, Some(enc)) => {
            debug!("rewrite: connect body has unsupported encoding, encoding={}", enc);
            return unchanged(None);
        }
        (None, None) => body.to_vec(),
    };

    if !looks_like_envelope(&decoded) {
        return process_single_blob(
            body,
            &decoded,
            http_encoding,
            connect_encoding,
            compiled,
            phase,
            request_path,
            full_url,
            limits,
            applied,
        );
    }

    let frames = match split_frames(&decoded) {
        Some(f) => f,
        None => return unchanged(None),
    };

    let mut original_views = Vec::with_capacity(frames.len());
    let mut updated_frames: Vec<EnvelopeFrame> = Vec::with_capacity(frames.len());
    let mut updated_views = Vec::with_capacity(frames.len());
    let mut any_changed = false;

    for (index, frame) in frames.iter().enumerate() {
        let over_limit = index >= limits.max_frames
            || frame.payload.len() > limits.max_frame_bytes;
        if over_limit {
            let note = if index >= limits.max_frames {
                format!("frame skipped: frame count exceeds {}", limits.max_frames)
            } else {
                format!(
                    "frame skipped: payload of {} bytes exceeds {}",
                    frame.payload.len(),
                    limits.max_frame_bytes
                )
            };
            let view = opaque_view(index, frame, Some(note), limits);
            original_views.push(view.clone());
            updated_views.push(view);
            updated_frames.push(frame.clone());
            continue;
        }

        // Connect-level decompression for compressed frames.
        let (plain, frame_decompressed, codec_note) = if frame.compressed() {
            match connect_encoding {
                Some(enc) if codec::is_supported_encoding(enc) => {
                    match codec::decompress(enc, &frame.payload) {
                        Ok(buf) => (Some(buf), true, None),
                        Err(e) => (None, false, Some(format!("frame decompress failed: {}", e))),
                    }
                }
                Some(enc) => (
                    None,
                    false,
                    Some(format!("unsupported connect encoding: {}", enc)),
                ),
                None => (None, false, Some("compressed frame without encoding header".into())),
            }
        } else {
            (Some(frame.payload.clone()), false, None)
        };

        let Some(plain) = plain else {
            // Codec unavailable — frame is left intact.
            let view = opaque_view(index, frame, codec_note, limits);
            original_views.push(view.clone());
            updated_views.push(view);
            updated_frames.push(frame.clone());
            continue;
        };

        original_views.push(payload_view(index, frame, &plain, frame_decompressed, None, limits));

        let rewritten = rewrite_frame_payload(
            &plain,
            compiled,
            phase,
            request_path,
            full_url,
            applied,
        );

        match rewritten {
            Some(new_plain) => {
                // Recompress at the Connect level when the frame came in
                // compressed; failure reverts to the original frame.
                let new_payload = if frame.compressed() {
                    match connect_encoding.map(|enc| codec::compress(enc, &new_plain)) {
                        Some(Ok(buf)) => Some(buf),
                        _ => None,
                    }
                } else {
                    Some(new_plain.clone())
                };
                match new_payload {
                    Some(payload) => {
                        let new_frame = EnvelopeFrame {
                            flags: frame.flags,
                            payload,
                        };
                        updated_views.push(payload_view(
                            index,
                            &new_frame,
                            &new_plain,
                            frame_decompressed,
                            None,
                            limits,
                        ));
                        updated_frames.push(new_frame);
                        any_changed = true;
                    }
                    None => {
                        let view = opaque_view(
                            index,
                            frame,
                            Some("frame recompress failed, left intact".into()),
                            limits,
                        );
                        updated_views.push(view);
                        updated_frames.push(frame.clone());
                    }
                }
            }
            None => {
                updated_views.push(payload_view(
                    index,
                    frame,
                    &plain,
                    frame_decompressed,
                    None,
                    limits,
                ));
                updated_frames.push(frame.clone());
            }
        }
    }

    let view = ConnectView {
        envelope: true,
        frame_count: frames.len(),
        frames: updated_views,
        original_frames: original_views,
    };

    if !any_changed {
        return ConnectOutcome {
            body: body.to_vec(),
            changed: false,
            view: Some(view),
        };
    }

    let rebuilt = build_frames(&updated_frames);
    let out_body = match http_encoding {
        Some(enc) if codec::is_supported_encoding(enc) => match codec::compress(enc, &rebuilt) {
            Ok(buf) => buf,
            Err(e) => {
                debug!("rewrite: connect body http recompress failed, error={}", e);
                return ConnectOutcome {
                    body: body.to_vec(),
                    changed: false,
                    view: Some(view),
                };
            }
        },
        _ => rebuilt,
    };

    ConnectOutcome {
        body: out_body,
        changed: true,
        view: Some(view),
    }
}

/// Envelope handling failed — treat the body as a single (optionally
/// Connect-compressed) blob and apply text rewrites only.
#[allow(clippy::too_many_arguments)]
fn process_single_blob(
    original_body: &[u8],
    decoded: &[u8],
    http_encoding: Option<&str>,
    connect_encoding: Option<&str>,
    compiled: &CompiledRules,
    phase: RulePhase,
    request_path: &str,
    full_url: &str,
    limits: &ConnectLimits,
    applied: &mut AppliedRules,
) -> ConnectOutcome {
    let (plain, connect_compressed) = match connect_encoding {
        Some(enc) if codec::is_supported_encoding(enc) => {
            match codec::decompress(enc, decoded) {
                Ok(buf) => (buf, true),
                Err(_) => (decoded.to_vec(), false),
            }
        }
        _ => (decoded.to_vec(), false),
    };

    let pseudo = EnvelopeFrame {
        flags: 0,
        payload: plain.clone(),
    };
    let view_frame = payload_view(0, &pseudo, &plain, connect_compressed, None, limits);
    let mut view = ConnectView {
        envelope: false,
        frame_count: 0,
        frames: vec![view_frame.clone()],
        original_frames: vec![view_frame],
    };

    if codec::printable_ratio(&plain) < codec::BINARY_SKIP_RATIO {
        return ConnectOutcome {
            body: original_body.to_vec(),
            changed: false,
            view: Some(view),
        };
    }
    let Ok(text) = std::str::from_utf8(&plain) else {
        return ConnectOutcome {
            body: original_body.to_vec(),
            changed: false,
            view: Some(view),
        };
    };

    let (rewritten, changed) = apply_text_rules(
        text,
        &compiled.text,
        phase,
        request_path,
        full_url,
        applied,
    );
    if !changed {
        return ConnectOutcome {
            body: original_body.to_vec(),
            changed: false,
            view: Some(view),
        };
    }

    let mut out = rewritten.into_bytes();
    if connect_compressed {
        match connect_encoding.map(|enc| codec::compress(enc, &out)) {
            Some(Ok(buf)) => out = buf,
            _ => {
                return ConnectOutcome {
                    body: original_body.to_vec(),
                    changed: false,
                    view: Some(view),
                }
            }
        }
    }
    if let Some(enc) = http_encoding {
        if codec::is_supported_encoding(enc) {
            match codec::compress(enc, &out) {
                Ok(buf) => out = buf,
                Err(_) => {
                    return ConnectOutcome {
                        body: original_body.to_vec(),
                        changed: false,
                        view: Some(view),
                    }
                }
            }
        }
    }

    let updated = EnvelopeFrame {
        flags: 0,
        payload: out.clone(),
    };
    view.frames = vec![payload_view(0, &updated, &out, false, None, limits)];

    ConnectOutcome {
        body: out,
        changed: true,
        view: Some(view),
    }
}

/// Rewrite one decompressed frame payload. Returns `None` when nothing
/// changed.
fn rewrite_frame_payload(
    plain: &[u8],
    compiled: &CompiledRules,
    phase: RulePhase,
    request_path: &str,
    full_url: &str,
    applied: &mut AppliedRules,
) -> Option<Vec<u8>> {
    if let Some(mut fields) = parse_message(plain) {
        if !fields.is_empty() {
            let mut changed = rewrite_text_in_fields(
                &mut fields,
                0,
                compiled,
                phase,
                request_path,
                full_url,
                applied,
            );
            changed |= apply_jsonpath_to_fields(
                &mut fields,
                &compiled.jsonpath,
                phase,
                request_path,
                full_url,
                applied,
            );
            return changed.then(|| encode_message(&fields));
        }
    }

    // Not a protobuf message — connect+json frames land here.
    if codec::printable_ratio(plain) < codec::BINARY_SKIP_RATIO {
        return None;
    }
    let text = std::str::from_utf8(plain).ok()?;
    let (mut working, mut changed) = apply_text_rules(
        text,
        &compiled.text,
        phase,
        request_path,
        full_url,
        applied,
    );
    if !compiled.jsonpath.is_empty() {
        if let Ok(mut json) = serde_json::from_str::<Value>(&working) {
            let outcome = crate::rewrite::jsonpath::apply_jsonpath_rules(
                &mut json,
                &compiled.jsonpath,
                phase,
                request_path,
                full_url,
                applied,
            );
            if outcome.changed {
                if let Ok(serialized) = serde_json::to_string(&json) {
                    working = serialized;
                    changed = true;
                }
            }
        }
    }
    changed.then(|| working.into_bytes())
}

/// Recursively apply text rules to UTF-8-looking length-delimited fields.
fn rewrite_text_in_fields(
    fields: &mut [Field],
    depth: usize,
    compiled: &CompiledRules,
    phase: RulePhase,
    request_path: &str,
    full_url: &str,
    applied: &mut AppliedRules,
) -> bool {
    if compiled.text.is_empty() {
        return false;
    }
    let mut changed = false;

    for field in fields.iter_mut() {
        let WireValue::LengthDelimited(bytes) = &field.value else {
            continue;
        };

        // Nested messages are recursed into before being considered text.
        if depth + 1 < MAX_PROJECTION_DEPTH && !bytes.is_empty() {
            if let Some(mut nested) = parse_message(bytes).filter(|f| !f.is_empty()) {
                if rewrite_text_in_fields(
                    &mut nested,
                    depth + 1,
                    compiled,
                    phase,
                    request_path,
                    full_url,
                    applied,
                ) {
                    field.value = WireValue::LengthDelimited(encode_message(&nested));
                    changed = true;
                }
                continue;
            }
        }

        if codec::printable_ratio(bytes) < codec::TEXT_FIELD_RATIO {
            continue;
        }
        let Ok(text) = std::str::from_utf8(bytes) else {
            continue;
        };
        let (rewritten, did) = apply_text_rules(
            text,
            &compiled.text,
            phase,
            request_path,
            full_url,
            applied,
        );
        if did {
            field.value = WireValue::LengthDelimited(rewritten.into_bytes());
            changed = true;
        }
    }

    changed
}

/// Apply JSONPath rules directly to protobuf fields via their `fN`
/// projection keys. Only `fN` key segments navigate; an index segment or a
/// missing field skips the rule.
fn apply_jsonpath_to_fields(
    fields: &mut Vec<Field>,
    rules: &[CompiledJsonPathRule],
    phase: RulePhase,
    request_path: &str,
    full_url: &str,
    applied: &mut AppliedRules,
) -> bool {
    let mut changed = false;

    for rule in rules {
        if !rule.target.applies_to(phase) {
            continue;
        }
        if !url_matches(&rule.url_pattern, request_path, full_url) {
            continue;
        }
        let Some(numbers) = segments_as_field_numbers(&rule.segments) else {
            continue;
        };
        if write_proto_path(fields, &numbers, &rule.value, rule.value_type, 0) == Some(true) {
            applied.record(&rule.id, &rule.name, RuleKind::JsonPath, phase, full_url);
            changed = true;
        }
    }

    changed
}

fn segments_as_field_numbers(segments: &[PathSegment]) -> Option<Vec<u32>> {
    segments
        .iter()
        .map(|seg| match seg {
            PathSegment::Key(k) if k.starts_with('f') => k[1..].parse::<u32>().ok(),
            _ => None,
        })
        .collect()
}

/// Walk `numbers` through nested messages and overwrite the leaf.
/// `Some(true)` = changed, `Some(false)` = identity write, `None` = missing.
fn write_proto_path(
    fields: &mut Vec<Field>,
    numbers: &[u32],
    raw_value: &Value,
    value_type: ValueType,
    depth: usize,
) -> Option<bool> {
    let (first, rest) = numbers.split_first()?;
    let field = fields.iter_mut().rev().find(|f| f.number == *first)?;

    if rest.is_empty() {
        let coerced = coerce_value(raw_value, value_type)?;
        return write_proto_leaf(field, &coerced);
    }

    if depth + 1 >= MAX_PROJECTION_DEPTH {
        return None;
    }
    let WireValue::LengthDelimited(bytes) = &field.value else {
        return None;
    };
    let mut nested = parse_message(bytes).filter(|f| !f.is_empty())?;
    let result = write_proto_path(&mut nested, rest, raw_value, value_type, depth + 1)?;
    if result {
        field.value = WireValue::LengthDelimited(encode_message(&nested));
    }
    Some(result)
}

fn write_proto_leaf(field: &mut Field, coerced: &Value) -> Option<bool> {
    match (&field.value, coerced) {
        (WireValue::LengthDelimited(current), Value::String(s)) => {
            if current == s.as_bytes() {
                return Some(false);
            }
            field.value = WireValue::LengthDelimited(s.clone().into_bytes());
            Some(true)
        }
        (WireValue::Varint(current), Value::Number(n)) => {
            let v = n.as_u64()?;
            if *current == v {
                return Some(false);
            }
            field.value = WireValue::Varint(v);
            Some(true)
        }
        (WireValue::Varint(current), Value::Bool(b)) => {
            let v = u64::from(*b);
            if *current == v {
                return Some(false);
            }
            field.value = WireValue::Varint(v);
            Some(true)
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Frame views
// ---------------------------------------------------------------------------

fn opaque_view(
    index: usize,
    frame: &EnvelopeFrame,
    note: Option<String>,
    limits: &ConnectLimits,
) -> FrameView {
    FrameView {
        index,
        length: frame.payload.len(),
        compressed: frame.compressed(),
        end_stream: frame.end_stream(),
        frame_decompressed: false,
        preview: None,
        json: None,
        data_base64: small_base64(&frame.payload, limits.preview_max_bytes),
        note,
    }
}

fn payload_view(
    index: usize,
    frame: &EnvelopeFrame,
    plain: &[u8],
    frame_decompressed: bool,
    note: Option<String>,
    limits: &ConnectLimits,
) -> FrameView {
    let json = project_message(plain, &limits.projection)
        .or_else(|| serde_json::from_slice::<Value>(plain).ok().filter(Value::is_object));

    let preview = if codec::printable_ratio(plain) >= codec::PREVIEW_KEEP_RATIO {
        Some(truncate_utf8(
            &String::from_utf8_lossy(plain),
            limits.preview_max_bytes,
        ))
    } else {
        json.as_ref()
            .map(|j| truncate_utf8(&j.to_string(), limits.preview_max_bytes))
    };

    let data_base64 = if preview.is_none() && json.is_none() {
        small_base64(plain, limits.preview_max_bytes)
    } else {
        None
    };

    FrameView {
        index,
        length: frame.payload.len(),
        compressed: frame.compressed(),
        end_stream: frame.end_stream(),
        frame_decompressed,
        preview,
        json,
        data_base64,
        note,
    }
}

fn small_base64(bytes: &[u8], max: usize) -> Option<String> {
    (bytes.len() <= max)
        .then(|| base64::engine::general_purpose::STANDARD.encode(bytes))
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protowire::envelope::FLAG_COMPRESSED;
    use crate::rules::compiler::compile_rules;
    use crate::rules::{EditRule, RuleKind, RuleTarget};

    fn text_rule(start: &str, end: &str, replacement: &str) -> EditRule {
        EditRule {
            id: "t1".into(),
            name: "swap".into(),
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

    fn jsonpath_rule(path: &str, value: serde_json::Value, vt: ValueType) -> EditRule {
        EditRule {
            id: "j1".into(),
            name: "field".into(),
            enabled: true,
            kind: RuleKind::JsonPath,
            start: String::new(),
            end: String::new(),
            replacement: String::new(),
            use_regex: false,
            case_sensitive: false,
            path: path.into(),
            value,
            value_type: vt,
            url: "/svc/Method".into(),
            target: Some(RuleTarget::Request),
        }
    }

    fn single_frame_body(payload: &[u8], flags: u8) -> Vec<u8> {
        build_frames(&[EnvelopeFrame {
            flags,
            payload: payload.to_vec(),
        }])
    }

    fn message_with_field2(text: &str) -> Vec<u8> {
        encode_message(&[
            Field {
                number: 1,
                value: WireValue::Varint(7),
            },
            Field {
                number: 2,
                value: WireValue::LengthDelimited(text.as_bytes().to_vec()),
            },
        ])
    }

    #[test]
    fn test_passthrough_round_trips_bytes() {
        let body = single_frame_body(&message_with_field2("alpha"), 0);
        let compiled = CompiledRules::default();
        let mut applied = AppliedRules::new();
        let outcome = process_connect_body(
            &body,
            None,
            None,
            None,
            &compiled,
            RulePhase::Request,
            "/svc/Method",
            "http://h/svc/Method",
            &ConnectLimits::default(),
            &mut applied,
        );
        assert!(!outcome.changed);
        assert_eq!(outcome.body, body);
        let view = outcome.view.unwrap();
        assert!(view.envelope);
        assert_eq!(view.frame_count, 1);
    }

    #[test]
    fn test_jsonpath_rewrites_proto_field() {
        let body = single_frame_body(&message_with_field2("alpha"), 0);
        let compiled = compile_rules(&[jsonpath_rule("root.f2", serde_json::json!("beta"), ValueType::String)]);
        let mut applied = AppliedRules::new();
        let outcome = process_connect_body(
            &body,
            None,
            None,
            None,
            &compiled,
            RulePhase::Request,
            "/svc/Method",
            "http://h/svc/Method",
            &ConnectLimits::default(),
            &mut applied,
        );
        assert!(outcome.changed);
        assert_eq!(applied.len(), 1);

        let frames = split_frames(&outcome.body).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].flags, 0);
        let fields = parse_message(&frames[0].payload).unwrap();
        assert_eq!(
            fields[1].value,
            WireValue::LengthDelimited(b"beta".to_vec())
        );
        // untouched sibling survives re-encoding
        assert_eq!(fields[0].value, WireValue::Varint(7));
    }

    #[test]
    fn test_gzip_envelope_encoding_preserved() {
        let inner = single_frame_body(&message_with_field2("alpha"), 0);
        let body = codec::compress("gzip", &inner).unwrap();
        let compiled = compile_rules(&[jsonpath_rule("root.f2", serde_json::json!("beta"), ValueType::String)]);
        let mut applied = AppliedRules::new();
        let outcome = process_connect_body(
            &body,
            Some("gzip"),
            None,
            None,
            &compiled,
            RulePhase::Request,
            "/svc/Method",
            "http://h/svc/Method",
            &ConnectLimits::default(),
            &mut applied,
        );
        assert!(outcome.changed);
        // Output is still gzip at the HTTP layer.
        let decoded = codec::decompress("gzip", &outcome.body).unwrap();
        let frames = split_frames(&decoded).unwrap();
        let fields = parse_message(&frames[0].payload).unwrap();
        assert_eq!(
            fields[1].value,
            WireValue::LengthDelimited(b"beta".to_vec())
        );
    }

    #[test]
    fn test_compressed_frame_round_trips_connect_codec() {
        let msg = message_with_field2("alpha");
        let packed = codec::compress("gzip", &msg).unwrap();
        let body = single_frame_body(&packed, FLAG_COMPRESSED);
        let compiled = compile_rules(&[text_rule("alpha", "", "omega")]);
        let mut applied = AppliedRules::new();
        let outcome = process_connect_body(
            &body,
            None,
            Some("gzip"),
            None,
            &compiled,
            RulePhase::Request,
            "/svc/Method",
            "http://h/svc/Method",
            &ConnectLimits::default(),
            &mut applied,
        );
        assert!(outcome.changed);
        let frames = split_frames(&outcome.body).unwrap();
        assert!(frames[0].compressed());
        let plain = codec::decompress("gzip", &frames[0].payload).unwrap();
        let fields = parse_message(&plain).unwrap();
        assert_eq!(
            fields[1].value,
            WireValue::LengthDelimited(b"omega".to_vec())
        );
    }

    #[test]
    fn test_compressed_frame_without_codec_left_intact() {
        let msg = message_with_field2("alpha");
        let packed = codec::compress("gzip", &msg).unwrap();
        let body = single_frame_body(&packed, FLAG_COMPRESSED);
        let compiled = compile_rules(&[text_rule("alpha", "", "omega")]);
        let mut applied = AppliedRules::new();
        // No connect encoding header — the frame cannot be decoded.
        let outcome = process_connect_body(
            &body,
            None,
            None,
            None,
            &compiled,
            RulePhase::Request,
            "/svc/Method",
            "http://h/svc/Method",
            &ConnectLimits::default(),
            &mut applied,
        );
        assert!(!outcome.changed);
        assert_eq!(outcome.body, body);
        let view = outcome.view.unwrap();
        assert!(view.frames[0].note.is_some());
    }

    #[test]
    fn test_oversize_frame_preserved_with_note() {
        let body = single_frame_body(&message_with_field2("alpha"), 0);
        let limits = ConnectLimits {
            max_frame_bytes: 4,
            ..Default::default()
        };
        let compiled = compile_rules(&[text_rule("alpha", "", "omega")]);
        let mut applied = AppliedRules::new();
        let outcome = process_connect_body(
            &body,
            None,
            None,
            None,
            &compiled,
            RulePhase::Request,
            "/svc/Method",
            "http://h/svc/Method",
            &limits,
            &mut applied,
        );
        assert!(!outcome.changed);
        let view = outcome.view.unwrap();
        assert!(view.frames[0].note.as_ref().unwrap().contains("exceeds"));
    }

    #[test]
    fn test_text_rewrite_in_nested_field() {
        let inner = encode_message(&[Field {
            number: 1,
            value: WireValue::LengthDelimited(b"hello world".to_vec()),
        }]);
        let outer = encode_message(&[Field {
            number: 3,
            value: WireValue::LengthDelimited(inner),
        }]);
        let body = single_frame_body(&outer, 0);
        let compiled = compile_rules(&[text_rule("world", "", "there")]);
        let mut applied = AppliedRules::new();
        let outcome = process_connect_body(
            &body,
            None,
            None,
            None,
            &compiled,
            RulePhase::Request,
            "/",
            "http://h/",
            &ConnectLimits::default(),
            &mut applied,
        );
        assert!(outcome.changed);
        let frames = split_frames(&outcome.body).unwrap();
        let fields = parse_message(&frames[0].payload).unwrap();
        let WireValue::LengthDelimited(nested) = &fields[0].value else {
            panic!("expected nested message");
        };
        let nested_fields = parse_message(nested).unwrap();
        assert_eq!(
            nested_fields[0].value,
            WireValue::LengthDelimited(b"hello there".to_vec())
        );
    }

    #[test]
    fn test_non_envelope_blob_falls_back_to_text() {
        let body = br#"{"user":"guest"}"#.to_vec();
        let compiled = compile_rules(&[text_rule("guest", "", "admin")]);
        let mut applied = AppliedRules::new();
        let outcome = process_connect_body(
            &body,
            None,
            None,
            None,
            &compiled,
            RulePhase::Request,
            "/",
            "http://h/",
            &ConnectLimits::default(),
            &mut applied,
        );
        assert!(outcome.changed);
        assert_eq!(outcome.body, br#"{"user":"admin"}"#.to_vec());
        assert!(!outcome.view.unwrap().envelope);
    }

    #[test]
    fn test_identity_jsonpath_write_is_skipped() {
        let body = single_frame_body(&message_with_field2("beta"), 0);
        let compiled = compile_rules(&[jsonpath_rule("root.f2", serde_json::json!("beta"), ValueType::String)]);
        let mut applied = AppliedRules::new();
        let outcome = process_connect_body(
            &body,
            None,
            None,
            None,
            &compiled,
            RulePhase::Request,
            "/svc/Method",
            "http://h/svc/Method",
            &ConnectLimits::default(),
            &mut applied,
        );
        assert!(!outcome.changed);
        assert!(applied.is_empty());
    }
}
