pub mod types;


pub use types::*;

use anyhow::Result;
use std::path::Path;

impl Settings {
    /// Load settings from a file (if it exists) and apply environment
    /// variable overrides. A missing file means built-in defaults, so the
    /// proxy starts with zero configuration.
    pub fn load(path: &Path) -> Result<Self> {
        let mut settings: Settings = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            Settings::default()
        };

        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        env_parse("PORT", &mut self.port);
        if let Ok(v) = std::env::var("STORAGE_DIR") {
            self.storage_dir = v.into();
        }
        if let Ok(v) = std::env::var("LOGS_DIR") {
            self.logs_dir = Some(v.into());
        }
        if let Ok(v) = std::env::var("CERTS_DIR") {
            self.certs_dir = Some(v.into());
        }
        env_parse("MAX_LOG_ENTRIES", &mut self.max_log_entries);
        env_parse("LOG_PREVIEW_MAX_BYTES", &mut self.log_preview_max_bytes);
        env_parse(
            "LOG_DECOMPRESS_MAX_BYTES",
            &mut self.log_decompress_max_bytes,
        );
        env_bool(
            "MITM_BYPASS_REWRITES_ENABLED",
            &mut self.mitm_bypass_rewrites_enabled,
        );
        env_bool("DEBUG_LOG_ENABLED", &mut self.debug_log_enabled);
        env_bool("STRICT_TLS_ENABLED", &mut self.strict_tls_enabled);
        if let Ok(v) = std::env::var("STRICT_TLS_CA_FILE") {
            if !v.is_empty() {
                self.strict_tls_ca_file = Some(v.into());
            }
        }
        env_parse("BODY_LIMIT", &mut self.body_limit);
        env_parse("PROTOBUF_MAX_FIELDS", &mut self.protobuf_max_fields);
        env_parse("PROTOBUF_MAX_BYTES", &mut self.protobuf_max_bytes);
        env_parse("CONNECT_MAX_FRAMES", &mut self.connect_max_frames);
        env_parse(
            "CONNECT_MAX_FRAME_BYTES",
            &mut self.connect_max_frame_bytes,
        );
        env_parse("WS_MAX_TEXT_BYTES", &mut self.ws_max_text_bytes);
        env_parse(
            "UPSTREAM_HEADERS_TIMEOUT_MS",
            &mut self.upstream_headers_timeout_ms,
        );
        env_parse(
            "UPSTREAM_BODY_TIMEOUT_MS",
            &mut self.upstream_body_timeout_ms,
        );
        env_bool(
            "STREAM_UNINSPECTED_RESPONSES",
            &mut self.stream_uninspected_responses,
        );
        env_bool("WS_LOG_BODY_ENABLED", &mut self.ws_log_body_enabled);
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_log_entries == 0 {
            anyhow::bail!("MAX_LOG_ENTRIES must be at least 1");
        }
        if self.body_limit == 0 {
            anyhow::bail!("BODY_LIMIT must be at least 1");
        }
        if let Some(ref ca) = self.strict_tls_ca_file {
            if self.strict_tls_enabled && !ca.exists() {
                anyhow::bail!("STRICT_TLS_CA_FILE does not exist: {}", ca.display());
            }
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, slot: &mut T) {
    if let Ok(v) = std::env::var(name) {
        if let Ok(parsed) = v.trim().parse::<T>() {
            *slot = parsed;
        }
    }
}

fn env_bool(name: &str, slot: &mut bool) {
    if let Ok(v) = std::env::var(name) {
        *slot = v == "true" || v == "1";
    }
}
