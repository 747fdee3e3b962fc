//! Header sanitisation and header-value rewrites.

use crate::rewrite::text::apply_text_rules;
use crate::rewrite::AppliedRules;
use crate::rules::compiler::CompiledTextRule;
use crate::rules::RulePhase;
use http::header::{HeaderMap, HeaderName, HeaderValue};

/// Headers never forwarded upstream: hop-by-hop plus conditionals (the
/// proxy must see full bodies, not 304s).
const FORWARD_DROP: &[&str] = &[
    "connection",
    "proxy-connection",
    "transfer-encoding",
    "if-none-match",
    "if-modified-since",
    "if-match",
    "if-unmodified-since",
];

/// Build the header set forwarded upstream. Removes exactly the
/// `FORWARD_DROP` names (case-insensitive) and nothing else; applying it
/// twice yields the same result as once.
pub fn create_forward_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    for name in FORWARD_DROP {
        out.remove(*name);
    }
    out
}

/// Strip identifying tracing headers from actively processed flows:
/// exact names `baggage` and `sentry-trace`, plus any `sentry-*` prefix.
/// Bypassed flows keep these untouched.
pub fn strip_identifying_headers(headers: &mut HeaderMap) {
    let doomed: Vec<HeaderName> = headers
        .keys()
        .filter(|name| {
            let n = name.as_str();
            n == "baggage" || n == "sentry-trace" || n.starts_with("sentry-")
        })
        .cloned()
        .collect();
    for name in doomed {
        headers.remove(name);
    }
}

/// Responses forwarded to the client from processed flows are never
/// cacheable, and carry a tag naming where the body came from.
pub fn apply_cache_busting(headers: &mut HeaderMap, proxy_source: &'static str) {
    headers.insert(
        http::header::CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-cache, must-revalidate, proxy-revalidate"),
    );
    headers.insert(
        HeaderName::from_static("pragma"),
        HeaderValue::from_static("no-cache"),
    );
    headers.insert(http::header::EXPIRES, HeaderValue::from_static("0"));
    headers.insert(
        HeaderName::from_static("x-proxy-source"),
        HeaderValue::from_static(proxy_source),
    );
}

/// Apply text rules to every header value (including each value of
/// list-valued headers). Values that stop being valid header strings after
/// rewriting are left unchanged.
pub fn apply_header_rules(
    headers: &mut HeaderMap,
    rules: &[CompiledTextRule],
    phase: RulePhase,
    request_path: &str,
    full_url: &str,
    applied: &mut AppliedRules,
) -> bool {
    if rules.is_empty() {
        return false;
    }

    let mut changed = false;
    let names: Vec<HeaderName> = headers.keys().cloned().collect();

    for name in names {
        let values: Vec<HeaderValue> = headers.get_all(&name).iter().cloned().collect();
        let mut rewritten: Vec<HeaderValue> = Vec::with_capacity(values.len());
        let mut any = false;

        for value in &values {
            let Ok(text) = value.to_str() else {
                rewritten.push(value.clone());
                continue;
            };
            let (out, did) =
                apply_text_rules(text, rules, phase, request_path, full_url, applied);
            if did {
                match HeaderValue::from_str(&out) {
                    Ok(v) => {
                        rewritten.push(v);
                        any = true;
                    }
                    Err(_) => rewritten.push(value.clone()),
                }
            } else {
                rewritten.push(value.clone());
            }
        }

        if any {
            headers.remove(&name);
            for v in rewritten {
                headers.append(name.clone(), v);
            }
            changed = true;
        }
    }

    changed
}
