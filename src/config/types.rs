use crate::rules::FilterMode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_true() -> bool {
    true
}

/// Static process settings — sourced from the config file with environment
/// variable overrides, fixed for the process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_port")]
    pub port: u16,

    /// Root directory for persisted rules, resources, and config.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Defaults to `{storage_dir}/logs`.
    #[serde(default)]
    pub logs_dir: Option<PathBuf>,

    /// Defaults to `{storage_dir}/certs`.
    #[serde(default)]
    pub certs_dir: Option<PathBuf>,

    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: usize,

    /// Cap on body previews stored in log entries.
    #[serde(default = "default_log_preview_max_bytes")]
    pub log_preview_max_bytes: usize,

    /// Bodies above this size are not decompressed just for logging.
    #[serde(default = "default_log_decompress_max_bytes")]
    pub log_decompress_max_bytes: usize,

    /// When false, MITM flows are decoded and logged but never rewritten.
    #[serde(default = "default_true")]
    pub mitm_bypass_rewrites_enabled: bool,

    #[serde(default)]
    pub debug_log_enabled: bool,

    /// Verify upstream certificates. Off by default — the proxy is a local
    /// debugging tool, not a trust anchor.
    #[serde(default)]
    pub strict_tls_enabled: bool,

    /// Extra root CA bundle for strict mode.
    #[serde(default)]
    pub strict_tls_ca_file: Option<PathBuf>,

    /// Buffered request/response bodies above this are refused.
    #[serde(default = "default_body_limit")]
    pub body_limit: usize,

    #[serde(default = "default_protobuf_max_fields")]
    pub protobuf_max_fields: usize,

    #[serde(default = "default_protobuf_max_bytes")]
    pub protobuf_max_bytes: usize,

    #[serde(default = "default_connect_max_frames")]
    pub connect_max_frames: usize,

    #[serde(default = "default_connect_max_frame_bytes")]
    pub connect_max_frame_bytes: usize,

    #[serde(default = "default_ws_max_text_bytes")]
    pub ws_max_text_bytes: usize,

    #[serde(default = "default_upstream_headers_timeout_ms")]
    pub upstream_headers_timeout_ms: u64,

    #[serde(default = "default_upstream_body_timeout_ms")]
    pub upstream_body_timeout_ms: u64,

    /// Stream upstream responses straight to the client when no rule could
    /// touch them and the content is not inspectable.
    #[serde(default = "default_true")]
    pub stream_uninspected_responses: bool,

    /// Capture per-message WebSocket bodies in log entries.
    #[serde(default = "default_true")]
    pub ws_log_body_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: default_port(),
            storage_dir: default_storage_dir(),
            logs_dir: None,
            certs_dir: None,
            max_log_entries: default_max_log_entries(),
            log_preview_max_bytes: default_log_preview_max_bytes(),
            log_decompress_max_bytes: default_log_decompress_max_bytes(),
            mitm_bypass_rewrites_enabled: true,
            debug_log_enabled: false,
            strict_tls_enabled: false,
            strict_tls_ca_file: None,
            body_limit: default_body_limit(),
            protobuf_max_fields: default_protobuf_max_fields(),
            protobuf_max_bytes: default_protobuf_max_bytes(),
            connect_max_frames: default_connect_max_frames(),
            connect_max_frame_bytes: default_connect_max_frame_bytes(),
            ws_max_text_bytes: default_ws_max_text_bytes(),
            upstream_headers_timeout_ms: default_upstream_headers_timeout_ms(),
            upstream_body_timeout_ms: default_upstream_body_timeout_ms(),
            stream_uninspected_responses: true,
            ws_log_body_enabled: true,
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("./storage")
}

fn default_max_log_entries() -> usize {
    500
}

fn default_log_preview_max_bytes() -> usize {
    64 * 1024
}

fn default_log_decompress_max_bytes() -> usize {
    2 * 1024 * 1024
}

fn default_body_limit() -> usize {
    10 * 1024 * 1024
}

fn default_protobuf_max_fields() -> usize {
    512
}

fn default_protobuf_max_bytes() -> usize {
    1024 * 1024
}

fn default_connect_max_frames() -> usize {
    64
}

fn default_connect_max_frame_bytes() -> usize {
    1024 * 1024
}

fn default_ws_max_text_bytes() -> usize {
    256 * 1024
}

fn default_upstream_headers_timeout_ms() -> u64 {
    30_000
}

fn default_upstream_body_timeout_ms() -> u64 {
    60_000
}

impl Settings {
    pub fn logs_dir(&self) -> PathBuf {
        self.logs_dir
            .clone()
            .unwrap_or_else(|| self.storage_dir.join("logs"))
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.certs_dir
            .clone()
            .unwrap_or_else(|| self.storage_dir.join("certs"))
    }

    pub fn resources_dir(&self) -> PathBuf {
        self.storage_dir.join("resources")
    }
}

/// User-togglable modes, persisted as `config.json` and mutated over the
/// control surface.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeModes {
    #[serde(default = "default_true")]
    pub interactive_mode_enabled: bool,

    #[serde(default = "default_true")]
    pub edit_rules_enabled: bool,

    #[serde(default = "default_true")]
    pub local_resources_enabled: bool,

    #[serde(default = "default_true")]
    pub filter_rules_enabled: bool,

    #[serde(default = "default_true")]
    pub blocked_rules_enabled: bool,

    #[serde(default)]
    pub filter_mode: FilterMode,
}

impl Default for RuntimeModes {
    fn default() -> Self {
        Self {
            interactive_mode_enabled: true,
            edit_rules_enabled: true,
            local_resources_enabled: true,
            filter_rules_enabled: true,
            blocked_rules_enabled: true,
            filter_mode: FilterMode::Ignore,
        }
    }
}
