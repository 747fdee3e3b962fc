//! Disk persistence for rules, resources, and mode config.
//!
//! Mutations never write synchronously: they mark a store dirty and wake a
//! single background writer, which debounces so a burst of edits collapses
//! into one write per file. Write failures are logged and never crash the
//! process.

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

pub const EDIT_RULES_FILE: &str = "edit-rules.json";
pub const BLOCK_RULES_FILE: &str = "blocked-rules.json";
pub const FILTER_RULES_FILE: &str = "filter-rules.json";
/// Pre-rename filter rules file, read once when the canonical file is
/// absent and rewritten under the new name.
pub const LEGACY_FILTER_RULES_FILE: &str = "bypass-rules.json";
pub const RESOURCES_FILE: &str = "resources.json";
pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    EditRules,
    BlockRules,
    FilterRules,
    Resources,
    Config,
}

impl StoreKind {
    pub fn file_name(&self) -> &'static str {
        match self {
            StoreKind::EditRules => EDIT_RULES_FILE,
            StoreKind::BlockRules => BLOCK_RULES_FILE,
            StoreKind::FilterRules => FILTER_RULES_FILE,
            StoreKind::Resources => RESOURCES_FILE,
            StoreKind::Config => CONFIG_FILE,
        }
    }
}

/// Queued-writer handle. `mark` is cheap and non-blocking; the flush loop
/// (owned by bootstrap) drains the dirty set.
pub struct StoreWriter {
    storage_dir: PathBuf,
    dirty: Mutex<HashSet<StoreKind>>,
    notify: Notify,
}

impl StoreWriter {
    pub fn new(storage_dir: PathBuf) -> Self {
        Self {
            storage_dir,
            dirty: Mutex::new(HashSet::new()),
            notify: Notify::new(),
        }
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn mark(&self, kind: StoreKind) {
        self.dirty.lock().unwrap().insert(kind);
        self.notify.notify_one();
    }

    pub async fn wait_dirty(&self) {
        self.notify.notified().await;
    }

    pub fn drain(&self) -> Vec<StoreKind> {
        self.dirty.lock().unwrap().drain().collect()
    }

    pub fn path_for(&self, kind: StoreKind) -> PathBuf {
        self.storage_dir.join(kind.file_name())
    }

    /// Serialize and write one store. Errors are reported to the caller,
    /// which logs and moves on.
    pub fn write_json<T: Serialize>(&self, kind: StoreKind, value: &T) -> Result<()> {
        std::fs::create_dir_all(&self.storage_dir)?;
        let path = self.path_for(kind);
        let json = serde_json::to_string_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        debug!("persist: wrote {}", path.display());
        Ok(())
    }
}

/// Read a persisted JSON file, returning the default on absence and logging
/// (not failing) on corruption.
pub fn load_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    "persist: failed to parse {}, using defaults, error={}",
                    path.display(),
                    e
                );
                T::default()
            }
        },
        Err(_) => T::default(),
    }
}

/// Filter rules load with a one-time legacy-filename fallback.
pub fn load_filter_rules_file<T: DeserializeOwned + Default>(storage_dir: &Path) -> (T, bool) {
    let canonical = storage_dir.join(FILTER_RULES_FILE);
    if canonical.exists() {
        return (load_json_or_default(&canonical), false);
    }
    let legacy = storage_dir.join(LEGACY_FILTER_RULES_FILE);
    if legacy.exists() {
        debug!("persist: reading legacy filter rules, path={}", legacy.display());
        return (load_json_or_default(&legacy), true);
    }
    (T::default(), false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_storage(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "periscope_persist_{}_{}",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_mark_and_drain_collapse_bursts() {
        let writer = StoreWriter::new(temp_storage("burst"));
        writer.mark(StoreKind::EditRules);
        writer.mark(StoreKind::EditRules);
        writer.mark(StoreKind::Config);
        let mut drained = writer.drain();
        drained.sort_by_key(|k| k.file_name());
        assert_eq!(drained.len(), 2);
        assert!(writer.drain().is_empty());
        std::fs::remove_dir_all(writer.storage_dir()).ok();
    }

    #[test]
    fn test_write_and_load_round_trip() {
        let writer = StoreWriter::new(temp_storage("roundtrip"));
        writer
            .write_json(StoreKind::Config, &serde_json::json!({"a": 1}))
            .unwrap();
        let loaded: serde_json::Value =
            load_json_or_default(&writer.path_for(StoreKind::Config));
        assert_eq!(loaded["a"], 1);
        std::fs::remove_dir_all(writer.storage_dir()).ok();
    }

    #[test]
    fn test_corrupt_file_falls_back_to_default() {
        let dir = temp_storage("corrupt");
        let path = dir.join(CONFIG_FILE);
        std::fs::write(&path, "{not json").unwrap();
        let loaded: Vec<String> = load_json_or_default(&path);
        assert!(loaded.is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_legacy_filter_fallback() {
        let dir = temp_storage("legacy");
        std::fs::write(dir.join(LEGACY_FILTER_RULES_FILE), r#"["x"]"#).unwrap();
        let (rules, from_legacy): (Vec<String>, bool) = load_filter_rules_file(&dir);
        assert!(from_legacy);
        assert_eq!(rules, vec!["x"]);

        // Canonical file wins once present.
        std::fs::write(dir.join(FILTER_RULES_FILE), r#"["y"]"#).unwrap();
        let (rules, from_legacy): (Vec<String>, bool) = load_filter_rules_file(&dir);
        assert!(!from_legacy);
        assert_eq!(rules, vec!["y"]);
        std::fs::remove_dir_all(&dir).ok();
    }
}
