//! Directory-backed configuration store.
//!
//! Each `*.toml` file in the directory is one [`ListenConfig`]. Timestamps
//! are RFC 3339 strings:
//!
//! ```toml
//! id = "primary"
//! created_at = "2024-01-01T00:00:00Z"
//! enabled = true
//! mode = "acme"
//! domains = ["example.com"]
//! terms_accepted = ["auto"]
//! ```
//!
//! A missing `id` defaults to the file stem.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{ConfigEvent, ConfigStore, ListenConfig, StoreError};

#[derive(Debug, Clone)]
struct Entry {
    path: PathBuf,
    config: ListenConfig,
}

/// A store over a directory of TOML documents.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    known: RwLock<HashMap<String, Entry>>,
}

impl FileStore {
    /// Open (creating if needed) the directory and load its documents.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(root)?;
        let store = Self {
            root: root.to_path_buf(),
            known: RwLock::new(HashMap::new()),
        };
        let loaded = store.refresh()?;
        tracing::info!(path = %root.display(), configs = loaded.len(), "Listen config store opened");
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rescan the directory and return an event for everything that changed.
    ///
    /// Files that fail to decode are skipped and keep their last good
    /// contents, so a half-written edit never deletes a configuration.
    pub fn refresh(&self) -> Result<Vec<ConfigEvent>, StoreError> {
        let mut scanned: HashMap<String, Entry> = HashMap::new();
        let previous = self.known.read().clone();

        for dir_entry in fs::read_dir(&self.root)? {
            let path = dir_entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            match read_config(&path) {
                Ok(config) => {
                    scanned.insert(config.id.clone(), Entry { path, config });
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable listen config");
                    if let Some(old) = previous.values().find(|entry| entry.path == path) {
                        scanned.insert(old.config.id.clone(), old.clone());
                    }
                }
            }
        }

        let mut events = Vec::new();
        for (id, entry) in &scanned {
            if previous.get(id).map(|old| &old.config) != Some(&entry.config) {
                events.push(ConfigEvent::changed(entry.config.clone()));
            }
        }
        for (id, entry) in &previous {
            if !scanned.contains_key(id) {
                let mut tombstone = entry.config.clone();
                tombstone.deleted_at = Some(chrono::Utc::now());
                events.push(ConfigEvent::changed(tombstone));
                events.push(ConfigEvent::removed(id.clone()));
            }
        }

        *self.known.write() = scanned;
        Ok(events)
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.known
            .read()
            .get(id)
            .map(|entry| entry.path.clone())
            .unwrap_or_else(|| self.root.join(format!("{}.toml", id)))
    }
}

fn read_config(path: &Path) -> Result<ListenConfig, StoreError> {
    let content = fs::read_to_string(path)?;
    let mut config: ListenConfig = toml::from_str(&content).map_err(|source| StoreError::Decode {
        path: path.display().to_string(),
        source,
    })?;
    if config.id.is_empty() {
        config.id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
    }
    Ok(config)
}

#[async_trait]
impl ConfigStore for FileStore {
    async fn get(&self, id: &str) -> Result<Option<ListenConfig>, StoreError> {
        Ok(self.known.read().get(id).map(|entry| entry.config.clone()))
    }

    async fn list(&self) -> Result<Vec<ListenConfig>, StoreError> {
        let mut all: Vec<_> = self
            .known
            .read()
            .values()
            .map(|entry| entry.config.clone())
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn update(&self, config: ListenConfig) -> Result<ListenConfig, StoreError> {
        if !self.known.read().contains_key(&config.id) {
            return Err(StoreError::NotFound(config.id));
        }
        let path = self.path_for(&config.id);
        let content = toml::to_string_pretty(&config)?;

        // Write-then-rename so the watcher never reads a partial document.
        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &path)?;

        self.known.write().insert(
            config.id.clone(),
            Entry {
                path,
                config: config.clone(),
            },
        );
        tracing::debug!(id = %config.id, "Listen config written");
        Ok(config)
    }
}
