//! User preferences persistence with change notification.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

/// Feature toggles. Every toggle defaults to on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "default_true", deserialize_with = "bool_or_default")]
    pub enable_page_snapshot_page_button: bool,
    #[serde(default = "default_true", deserialize_with = "bool_or_default")]
    pub enable_page_snapshot_panel_button: bool,
    #[serde(default = "default_true", deserialize_with = "bool_or_default")]
    pub enable_page_snapshot_context_menu: bool,
    #[serde(default = "default_true", deserialize_with = "bool_or_default")]
    pub enable_quote_text_context_menu: bool,
}

fn default_true() -> bool {
    true
}

/// Non-boolean values normalize to the default instead of failing the load.
fn bool_or_default<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<bool, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(value.as_bool().unwrap_or(true))
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enable_page_snapshot_page_button: true,
            enable_page_snapshot_panel_button: true,
            enable_page_snapshot_context_menu: true,
            enable_quote_text_context_menu: true,
        }
    }
}

impl Settings {
    /// Normalize arbitrary JSON into settings; anything unusable becomes the default.
    pub fn normalize(value: &serde_json::Value) -> Self {
        if !value.is_object() {
            return Self::default();
        }
        Self::deserialize(value).unwrap_or_default()
    }
}

/// Handle returned by [`SettingsProvider::on_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&Settings) + Send + Sync>;

/// What the relay needs from a preferences backend.
pub trait SettingsProvider: Send + Sync {
    fn current(&self) -> Settings;
    fn on_change(&self, listener: Box<dyn Fn(&Settings) + Send + Sync>) -> ListenerId;
}

/// JSON-file settings store (`data/settings.json`).
pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<Settings>,
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
}

impl SettingsStore {
    /// Load settings from a JSON file, or start from defaults.
    pub fn load(path: &Path) -> Self {
        let current = std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
            .map(|v| Settings::normalize(&v))
            .unwrap_or_default();

        debug!("Settings loaded from {}: {:?}", path.display(), current);

        Self {
            path: path.to_path_buf(),
            current: RwLock::new(current),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    /// Merge a partial update, persist it and notify listeners.
    pub fn update(&self, partial: &serde_json::Value) -> Result<Settings> {
        let next = {
            let current = self.current.read();
            let mut merged = serde_json::to_value(*current)?;
            if let (Some(target), Some(updates)) = (merged.as_object_mut(), partial.as_object()) {
                for (key, value) in updates {
                    target.insert(key.clone(), value.clone());
                }
            }
            Settings::normalize(&merged)
        };

        self.save(&next)?;
        *self.current.write() = next;
        self.notify(&next);
        Ok(next)
    }

    /// Stop notifying a listener. Unknown ids are ignored.
    pub fn remove_listener(&self, id: ListenerId) {
        self.listeners.write().retain(|(lid, _)| *lid != id);
    }

    fn save(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(settings)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    fn notify(&self, settings: &Settings) {
        // Clone out so a listener may register or remove listeners.
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener(settings))).is_err() {
                warn!("Settings listener panicked; ignoring");
            }
        }
    }
}

impl SettingsProvider for SettingsStore {
    fn current(&self) -> Settings {
        *self.current.read()
    }

    fn on_change(&self, listener: Box<dyn Fn(&Settings) + Send + Sync>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Arc::from(listener)));
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_normalize_fills_missing_and_bad_keys() {
        let settings = Settings::normalize(&json!({
            "enablePageSnapshotPageButton": false,
            "enableQuoteTextContextMenu": "nope",
        }));
        assert!(!settings.enable_page_snapshot_page_button);
        assert!(settings.enable_page_snapshot_panel_button);
        assert!(settings.enable_quote_text_context_menu);

        assert_eq!(Settings::normalize(&json!(null)), Settings::default());
    }

    #[test]
    fn test_load_missing_or_corrupt_file_gives_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = SettingsStore::load(&tmp.path().join("settings.json"));
        assert_eq!(missing.current(), Settings::default());

        let corrupt = tmp.path().join("corrupt.json");
        std::fs::write(&corrupt, "{not json").unwrap();
        assert_eq!(SettingsStore::load(&corrupt).current(), Settings::default());
    }

    #[test]
    fn test_update_persists_and_notifies() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("settings.json");
        let store = SettingsStore::load(&path);

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let id = store.on_change(Box::new(move |s| {
            assert!(!s.enable_page_snapshot_context_menu);
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        let next = store
            .update(&json!({"enablePageSnapshotContextMenu": false}))
            .unwrap();
        assert!(!next.enable_page_snapshot_context_menu);
        assert!(next.enable_page_snapshot_page_button);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let reloaded = SettingsStore::load(&path);
        assert_eq!(reloaded.current(), next);

        store.remove_listener(id);
        store.update(&json!({})).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
