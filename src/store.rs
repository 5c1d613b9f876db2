//! Persisted shell settings: download destination, output format and download history.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::ShellError;

const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub book_id: String,
    /// Anything else the front end attached (title, timestamps, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl HistoryEntry {
    pub fn new(book_id: impl Into<String>) -> Self {
        Self {
            book_id: book_id.into(),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub download_path: PathBuf,
    pub file_type: String,
    pub history: Vec<HistoryEntry>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_path: dirs::download_dir().unwrap_or_else(|| PathBuf::from("downloads")),
            file_type: "txt".to_string(),
            history: Vec::new(),
        }
    }
}

/// Partial update accepted by `set_config`; absent keys stay untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    pub download_path: Option<PathBuf>,
    pub file_type: Option<String>,
    pub history: Option<Vec<HistoryEntry>>,
}

pub struct SettingsStore {
    path: PathBuf,
    settings: Mutex<Settings>,
}

impl SettingsStore {
    /// Open the store under `data_dir`. Unreadable content falls back to defaults.
    pub fn open(data_dir: &Path) -> Self {
        let path = data_dir.join(SETTINGS_FILE);
        let settings = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|err| {
                warn!("settings file {} is corrupt, using defaults: {err}", path.display());
                Settings::default()
            }),
            Err(_) => Settings::default(),
        };

        Self {
            path,
            settings: Mutex::new(settings),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Settings {
        self.settings.lock().clone()
    }

    pub fn download_path(&self) -> PathBuf {
        self.settings.lock().download_path.clone()
    }

    pub fn file_type(&self) -> String {
        self.settings.lock().file_type.clone()
    }

    pub fn apply(&self, patch: SettingsPatch) -> Result<(), ShellError> {
        self.update(|settings| {
            if let Some(download_path) = patch.download_path {
                settings.download_path = download_path;
            }
            if let Some(file_type) = patch.file_type {
                settings.file_type = file_type;
            }
            if let Some(history) = patch.history {
                settings.history = history;
            }
        })
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.settings.lock().history.clone()
    }

    /// Most recent first; an older entry for the same book is dropped.
    pub fn add_history(&self, entry: HistoryEntry) -> Result<(), ShellError> {
        self.update(|settings| {
            settings.history.retain(|existing| existing.book_id != entry.book_id);
            settings.history.insert(0, entry);
        })
    }

    pub fn clear_history(&self) -> Result<(), ShellError> {
        self.update(|settings| settings.history.clear())
    }

    /// Apply `change` to a copy and keep it only once it is on disk.
    fn update(&self, change: impl FnOnce(&mut Settings)) -> Result<(), ShellError> {
        let mut settings = self.settings.lock();
        let mut next = settings.clone();
        change(&mut next);
        self.persist(&next)?;
        *settings = next;
        Ok(())
    }

    fn persist(&self, settings: &Settings) -> Result<(), ShellError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|err| ShellError::Store(err.to_string()))?;
        }
        let json = serde_json::to_string_pretty(settings)
            .map_err(|err| ShellError::Store(err.to_string()))?;
        fs::write(&self.path, json).map_err(|err| {
            ShellError::Store(format!("failed to write '{}': {err}", self.path.display()))
        })
    }
}
