//! Routing decisions.
//!
//! Every flow is classified before any pipeline work:
//!
//! 1. Internal-request guard — traffic addressed to the proxy itself is
//!    always handled locally (control endpoints must never be bypassed).
//! 2. Block decision — enabled block patterns short-circuit to 204.
//! 3. Filter decision — ignore mode bypasses matches, focus mode bypasses
//!    everything else.
//!
//! All comparisons are lowercase, so decisions are stable under case
//! changes in host and URL.

use crate::rules::compiler::{host_pattern_matches, BlockMatchers, FilterMatchers, MatcherKind};
use crate::rules::FilterMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// Short-circuit with 204, no upstream attempt.
    Block,
    /// Forward opaquely — no rewrites, no header stripping.
    Direct,
    /// Actively mediate: decode, rewrite, log.
    Proxy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsRouteDecision {
    Block,
    Direct,
    Mitm,
}

/// Request facts the router looks at; all borrowed from the flow context.
#[derive(Debug, Clone, Copy)]
pub struct RouteContext<'a> {
    pub method: &'a str,
    pub request_url: &'a str,
    pub full_url: &'a str,
    /// Host without port.
    pub host: &'a str,
}

/// Mode flags relevant to routing, snapshotted from the runtime config.
#[derive(Debug, Clone, Copy)]
pub struct RoutingModes {
    pub interactive_mode_enabled: bool,
    pub blocked_rules_enabled: bool,
    pub filter_rules_enabled: bool,
    pub filter_mode: FilterMode,
}

pub fn decide(
    ctx: &RouteContext<'_>,
    modes: &RoutingModes,
    block: &BlockMatchers,
    filters: &FilterMatchers,
    listen_port: u16,
) -> RouteDecision {
    if is_internal_request(ctx, listen_port) {
        return RouteDecision::Proxy;
    }

    // Interactive mode off — the proxy degrades to a pass-through.
    if !modes.interactive_mode_enabled {
        return RouteDecision::Direct;
    }

    if modes.blocked_rules_enabled && matches_block(ctx, block) {
        return RouteDecision::Block;
    }

    if !modes.filter_rules_enabled {
        return RouteDecision::Proxy;
    }

    let matched = matches_filter(ctx, filters, modes.filter_mode);
    match modes.filter_mode {
        FilterMode::Ignore => {
            if matched {
                RouteDecision::Direct
            } else {
                RouteDecision::Proxy
            }
        }
        FilterMode::Focus => {
            if matched {
                RouteDecision::Proxy
            } else {
                RouteDecision::Direct
            }
        }
    }
}

/// Whether the flow would be forwarded without mediation.
pub fn should_bypass(
    ctx: &RouteContext<'_>,
    modes: &RoutingModes,
    block: &BlockMatchers,
    filters: &FilterMatchers,
    listen_port: u16,
) -> bool {
    decide(ctx, modes, block, filters, listen_port) == RouteDecision::Direct
}

/// WebSocket upgrades map the HTTP decision onto the socket pipelines.
pub fn decide_websocket(decision: RouteDecision) -> WsRouteDecision {
    match decision {
        RouteDecision::Block => WsRouteDecision::Block,
        RouteDecision::Direct => WsRouteDecision::Direct,
        RouteDecision::Proxy => WsRouteDecision::Mitm,
    }
}

fn is_internal_request(ctx: &RouteContext<'_>, listen_port: u16) -> bool {
    let host = ctx.host.to_lowercase();
    if host == "localhost" || host == "127.0.0.1" {
        return true;
    }
    let own = [
        format!("localhost:{}", listen_port),
        format!("127.0.0.1:{}", listen_port),
    ];
    for candidate in [ctx.request_url, ctx.full_url] {
        let candidate = candidate.to_lowercase();
        if own.iter().any(|needle| candidate.contains(needle)) {
            return true;
        }
    }
    false
}

fn matches_block(ctx: &RouteContext<'_>, block: &BlockMatchers) -> bool {
    if block.active.is_empty() {
        return false;
    }
    let request_url = ctx.request_url.to_lowercase();
    let full_url = ctx.full_url.to_lowercase();
    block
        .active
        .iter()
        .any(|pattern| request_url.contains(pattern) || full_url.contains(pattern))
}

fn matches_filter(ctx: &RouteContext<'_>, filters: &FilterMatchers, mode: FilterMode) -> bool {
    let matchers = filters.for_mode(mode);
    if matchers.is_empty() {
        return false;
    }

    let host = ctx.host.to_lowercase();
    let request_url = ctx.request_url.to_lowercase();
    let full_url = ctx.full_url.to_lowercase();

    matchers.iter().any(|matcher| match matcher.kind {
        MatcherKind::Host => host_pattern_matches(&matcher.pattern, &host),
        MatcherKind::Path => {
            request_url.contains(&matcher.pattern) || full_url.contains(&matcher.pattern)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::compiler::{compile_block_rules, compile_filter_rules};
    use crate::rules::{BlockRule, FilterRule};

    fn ctx<'a>(host: &'a str, url: &'a str, full: &'a str) -> RouteContext<'a> {
        RouteContext {
            method: "GET",
            request_url: url,
            full_url: full,
            host,
        }
    }

    fn modes() -> RoutingModes {
        RoutingModes {
            interactive_mode_enabled: true,
            blocked_rules_enabled: true,
            filter_rules_enabled: true,
            filter_mode: FilterMode::Ignore,
        }
    }

    fn block(patterns: &[&str]) -> BlockMatchers {
        compile_block_rules(
            &patterns
                .iter()
                .map(|p| BlockRule {
                    id: String::new(),
                    enabled: true,
                    name: String::new(),
                    url: (*p).to_string(),
                })
                .collect::<Vec<_>>(),
        )
    }

    fn filters(entries: &[(&str, FilterMode)]) -> FilterMatchers {
        compile_filter_rules(
            &entries
                .iter()
                .map(|(p, m)| FilterRule {
                    id: String::new(),
                    enabled: true,
                    name: String::new(),
                    url: (*p).to_string(),
                    mode: *m,
                })
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn test_internal_requests_are_never_bypassed() {
        let f = filters(&[("localhost", FilterMode::Ignore)]);
        let decision = decide(
            &ctx("localhost", "/api/logs", "http://localhost:8080/api/logs"),
            &modes(),
            &block(&[]),
            &f,
            8080,
        );
        assert_eq!(decision, RouteDecision::Proxy);

        // Internal by candidate URL even when the host header differs.
        let decision = decide(
            &ctx("proxy.lan", "http://127.0.0.1:8080/api/logs", ""),
            &modes(),
            &block(&[]),
            &f,
            8080,
        );
        assert_eq!(decision, RouteDecision::Proxy);
    }

    #[test]
    fn test_block_decision() {
        let decision = decide(
            &ctx(
                "ads.example.com",
                "http://ads.example.com/tag.js",
                "http://ads.example.com/tag.js",
            ),
            &modes(),
            &block(&["ads.example.com"]),
            &filters(&[]),
            8080,
        );
        assert_eq!(decision, RouteDecision::Block);
    }

    #[test]
    fn test_block_disabled_mode_passes() {
        let mut m = modes();
        m.blocked_rules_enabled = false;
        let decision = decide(
            &ctx(
                "ads.example.com",
                "http://ads.example.com/tag.js",
                "http://ads.example.com/tag.js",
            ),
            &m,
            &block(&["ads.example.com"]),
            &filters(&[]),
            8080,
        );
        assert_eq!(decision, RouteDecision::Proxy);
    }

    #[test]
    fn test_ignore_mode_bypasses_matches() {
        let f = filters(&[("images.cdn.com", FilterMode::Ignore)]);
        let decision = decide(
            &ctx(
                "images.cdn.com",
                "http://images.cdn.com/a.png",
                "http://images.cdn.com/a.png",
            ),
            &modes(),
            &block(&[]),
            &f,
            8080,
        );
        assert_eq!(decision, RouteDecision::Direct);

        let decision = decide(
            &ctx("other.host", "http://other.host/x", "http://other.host/x"),
            &modes(),
            &block(&[]),
            &f,
            8080,
        );
        assert_eq!(decision, RouteDecision::Proxy);
    }

    #[test]
    fn test_focus_mode_inverts() {
        let mut m = modes();
        m.filter_mode = FilterMode::Focus;
        let f = filters(&[("images.cdn.com", FilterMode::Focus)]);

        let decision = decide(
            &ctx("other.host", "http://other.host/x", "http://other.host/x"),
            &m,
            &block(&[]),
            &f,
            8080,
        );
        assert_eq!(decision, RouteDecision::Direct);

        let decision = decide(
            &ctx(
                "images.cdn.com",
                "http://images.cdn.com/y",
                "http://images.cdn.com/y",
            ),
            &m,
            &block(&[]),
            &f,
            8080,
        );
        assert_eq!(decision, RouteDecision::Proxy);
    }

    #[test]
    fn test_host_matcher_suffix_semantics() {
        let f = filters(&[("cdn.com", FilterMode::Ignore)]);
        assert!(should_bypass(
            &ctx("images.cdn.com", "/a.png", "http://images.cdn.com/a.png"),
            &modes(),
            &block(&[]),
            &f,
            8080,
        ));
        assert!(!should_bypass(
            &ctx("notcdn.com", "/a.png", "http://notcdn.com/a.png"),
            &modes(),
            &block(&[]),
            &f,
            8080,
        ));
    }

    #[test]
    fn test_decision_stable_under_case_changes() {
        let f = filters(&[("images.cdn.com", FilterMode::Ignore)]);
        for host in ["images.cdn.com", "IMAGES.CDN.COM", "Images.Cdn.Com"] {
            let url = format!("http://{}/A.PNG", host);
            assert!(should_bypass(
                &ctx(host, &url, &url),
                &modes(),
                &block(&[]),
                &f,
                8080,
            ));
        }
    }

    #[test]
    fn test_interactive_mode_off_bypasses_everything() {
        let mut m = modes();
        m.interactive_mode_enabled = false;
        let decision = decide(
            &ctx(
                "ads.example.com",
                "http://ads.example.com/tag.js",
                "http://ads.example.com/tag.js",
            ),
            &m,
            &block(&["ads.example.com"]),
            &filters(&[]),
            8080,
        );
        assert_eq!(decision, RouteDecision::Direct);
    }

    #[test]
    fn test_filters_disabled_means_proxy() {
        let mut m = modes();
        m.filter_rules_enabled = false;
        let f = filters(&[("images.cdn.com", FilterMode::Ignore)]);
        let decision = decide(
            &ctx(
                "images.cdn.com",
                "http://images.cdn.com/a.png",
                "http://images.cdn.com/a.png",
            ),
            &m,
            &block(&[]),
            &f,
            8080,
        );
        assert_eq!(decision, RouteDecision::Proxy);
    }

    #[test]
    fn test_websocket_mapping() {
        assert_eq!(decide_websocket(RouteDecision::Block), WsRouteDecision::Block);
        assert_eq!(decide_websocket(RouteDecision::Direct), WsRouteDecision::Direct);
        assert_eq!(decide_websocket(RouteDecision::Proxy), WsRouteDecision::Mitm);
    }
}
