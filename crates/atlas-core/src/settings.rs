use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Default upper bound on a single message, in characters.
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 2048;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Settings {
    #[serde(default = "default_true")]
    pub marks_messages_as_read: bool,
    #[serde(default)]
    pub placeholder_avatar: Option<String>,
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
    #[serde(default = "default_true")]
    pub show_status_labels: bool,
}

fn default_true() -> bool {
    true
}

fn default_max_message_length() -> usize {
    DEFAULT_MAX_MESSAGE_LENGTH
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            marks_messages_as_read: true,
            placeholder_avatar: None,
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            show_status_labels: true,
        }
    }
}

pub struct SettingsStore {
    settings: Mutex<Settings>,
    file_path: PathBuf,
}

impl SettingsStore {
    pub fn new(data_dir: &str) -> Self {
        let file_path = PathBuf::from(data_dir).join("settings.json");
        let settings = Self::load(&file_path);
        Self {
            settings: Mutex::new(settings),
            file_path,
        }
    }

    pub fn get(&self) -> Settings {
        self.settings.lock().unwrap().clone()
    }

    pub fn set_marks_messages_as_read(&self, enabled: bool) {
        self.settings.lock().unwrap().marks_messages_as_read = enabled;
        self.save();
    }

    pub fn set_placeholder_avatar(&self, avatar: Option<String>) {
        self.settings.lock().unwrap().placeholder_avatar = avatar;
        self.save();
    }

    pub fn set_max_message_length(&self, max: usize) {
        self.settings.lock().unwrap().max_message_length = max;
        self.save();
    }

    pub fn set_show_status_labels(&self, enabled: bool) {
        self.settings.lock().unwrap().show_status_labels = enabled;
        self.save();
    }

    fn save(&self) {
        let settings = self.settings.lock().unwrap().clone();
        if let Some(parent) = self.file_path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!("settings: cannot create {}: {e}", parent.display());
                return;
            }
        }
        match serde_json::to_string_pretty(&settings) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.file_path, json) {
                    tracing::warn!("settings: write failed: {e}");
                }
            }
            Err(e) => tracing::warn!("settings: serialize failed: {e}"),
        }
    }

    fn load(path: &PathBuf) -> Settings {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("settings: ignoring unreadable {}: {e}", path.display());
                Settings::default()
            }),
            Err(_) => Settings::default(),
        }
    }
}
