//! Local resource overrides.
//!
//! A resource is keyed by a URL substring; matching flows are answered from
//! disk instead of upstream. The metadata map lives in memory behind an
//! ArcSwap snapshot; body bytes are owned by the filesystem.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    File,
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalResource {
    pub kind: ResourceKind,
    /// On-disk file name under the resources directory.
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    pub created_at: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

pub struct LocalResourceStore {
    map: ArcSwap<HashMap<String, LocalResource>>,
    dir: PathBuf,
    write_mu: Mutex<()>,
}

impl LocalResourceStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            map: ArcSwap::new(Arc::new(HashMap::new())),
            dir,
            write_mu: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn load(&self, resources: HashMap<String, LocalResource>) {
        self.map.store(Arc::new(resources));
    }

    pub fn snapshot(&self) -> Arc<HashMap<String, LocalResource>> {
        self.map.load_full()
    }

    pub fn len(&self) -> usize {
        self.map.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find the enabled resource whose key is a substring of either URL
    /// candidate. Longest key wins when several match.
    pub fn lookup(&self, request_url: &str, full_url: &str) -> Option<(String, LocalResource)> {
        let map = self.map.load();
        let url = request_url.to_lowercase();
        let full = full_url.to_lowercase();

        map.iter()
            .filter(|(key, resource)| {
                resource.enabled && {
                    let k = key.to_lowercase();
                    url.contains(&k) || full.contains(&k)
                }
            })
            .max_by_key(|(key, _)| key.len())
            .map(|(key, resource)| (key.clone(), resource.clone()))
    }

    /// Store a new resource: bytes to disk, metadata into the map.
    /// Replaces any existing resource under the same key.
    pub fn create(
        &self,
        key: String,
        kind: ResourceKind,
        original_filename: Option<String>,
        content_type: String,
        bytes: &[u8],
    ) -> std::io::Result<LocalResource> {
        std::fs::create_dir_all(&self.dir)?;
        let filename = format!("{}-{}", Uuid::new_v4(), sanitize_filename(original_filename));
        std::fs::write(self.dir.join(&filename), bytes)?;

        let resource = LocalResource {
            kind,
            filename,
            content_type,
            size: bytes.len() as u64,
            created_at: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default(),
            enabled: true,
        };

        let _guard = self.write_mu.lock().unwrap();
        let mut map = (**self.map.load()).clone();
        if let Some(old) = map.insert(key, resource.clone()) {
            let _ = std::fs::remove_file(self.dir.join(&old.filename));
        }
        self.map.store(Arc::new(map));
        Ok(resource)
    }

    /// Flip the enabled flag. Returns the new state, or `None` for an
    /// unknown key.
    pub fn toggle(&self, key: &str) -> Option<bool> {
        let _guard = self.write_mu.lock().unwrap();
        let mut map = (**self.map.load()).clone();
        let resource = map.get_mut(key)?;
        resource.enabled = !resource.enabled;
        let enabled = resource.enabled;
        self.map.store(Arc::new(map));
        Some(enabled)
    }

    /// Remove the resource and its bytes. Returns whether it existed.
    pub fn remove(&self, key: &str) -> bool {
        let _guard = self.write_mu.lock().unwrap();
        let mut map = (**self.map.load()).clone();
        let Some(resource) = map.remove(key) else {
            return false;
        };
        self.map.store(Arc::new(map));
        let _ = std::fs::remove_file(self.dir.join(&resource.filename));
        true
    }

    pub async fn read_body(&self, resource: &LocalResource) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(self.dir.join(&resource.filename)).await
    }
}

fn sanitize_filename(name: Option<String>) -> String {
    let name = name.unwrap_or_else(|| "resource".to_string());
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "resource".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(name: &str) -> LocalResourceStore {
        let dir = std::env::temp_dir().join(format!(
            "periscope_resources_{}_{}",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        LocalResourceStore::new(dir)
    }

    #[test]
    fn test_create_lookup_toggle_remove() {
        let store = store("lifecycle");
        store
            .create(
                "/api/flags".into(),
                ResourceKind::Text,
                None,
                "application/json".into(),
                br#"{"beta":true}"#,
            )
            .unwrap();

        let (key, resource) = store
            .lookup("/api/flags", "http://app.example.com/api/flags?x=1")
            .unwrap();
        assert_eq!(key, "/api/flags");
        assert_eq!(resource.size, 13);
        assert!(resource.enabled);

        assert_eq!(store.toggle("/api/flags"), Some(false));
        assert!(store.lookup("/api/flags", "").is_none());
        assert_eq!(store.toggle("/api/flags"), Some(true));
        assert_eq!(store.toggle("/missing"), None);

        assert!(store.remove("/api/flags"));
        assert!(!store.remove("/api/flags"));
        assert!(store.is_empty());
        std::fs::remove_dir_all(store.dir()).ok();
    }

    #[test]
    fn test_longest_key_wins() {
        let store = store("longest");
        store
            .create("/api".into(), ResourceKind::Text, None, "text/plain".into(), b"a")
            .unwrap();
        store
            .create(
                "/api/users".into(),
                ResourceKind::Text,
                None,
                "text/plain".into(),
                b"b",
            )
            .unwrap();

        let (key, _) = store
            .lookup("/api/users/42", "http://h/api/users/42")
            .unwrap();
        assert_eq!(key, "/api/users");
        std::fs::remove_dir_all(store.dir()).ok();
    }

    #[test]
    fn test_filename_sanitised() {
        assert_eq!(sanitize_filename(Some("../../etc/passwd".into())), ".._.._etc_passwd");
        assert_eq!(sanitize_filename(None), "resource");
        assert_eq!(sanitize_filename(Some("ok-file.json".into())), "ok-file.json");
    }

    #[tokio::test]
    async fn test_read_body_round_trip() {
        let store = store("body");
        let created = store
            .create(
                "/data".into(),
                ResourceKind::File,
                Some("payload.bin".into()),
                "application/octet-stream".into(),
                &[1, 2, 3],
            )
            .unwrap();
        let bytes = store.read_body(&created).await.unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
        std::fs::remove_dir_all(store.dir()).ok();
    }
}
