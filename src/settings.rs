use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::DEFAULT_BACKEND_URL;
use crate::streaming::{ClientConfig, StreamerConfig, DEFAULT_SOCKET_URL};

const APP_DIR_NAME: &str = "scout-voice";
const SETTINGS_FILE_NAME: &str = "settings.json";

/// Overrides the REST backend base URL
pub const BACKEND_URL_ENV: &str = "SCOUT_BACKEND_URL";

/// Overrides the session socket base URL
pub const SOCKET_URL_ENV: &str = "SCOUT_SOCKET_URL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Base URL for sessions, calls and stored conversations.
    pub backend_url: String,

    /// Base URL for the session socket; `/api/ws/{session_id}` is appended.
    pub socket_url: String,

    /// Start the microphone as soon as the call is authenticated.
    /// When disabled, calls start text-only and `/mic` turns capture on.
    pub auto_start_voice: bool,

    /// Duration of each outbound audio frame.
    pub capture_chunk_ms: u32,

    pub connect_timeout_secs: u64,

    /// How long to wait for `auth_success` after sending the token.
    pub auth_timeout_secs: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            socket_url: DEFAULT_SOCKET_URL.to_string(),
            auto_start_voice: true,
            capture_chunk_ms: 100,
            connect_timeout_secs: 10,
            auth_timeout_secs: 5,
        }
    }
}

impl AppSettings {
    /// Apply `SCOUT_BACKEND_URL` / `SCOUT_SOCKET_URL` from the environment
    pub fn with_env_overrides(mut self) -> Self {
        self.apply_overrides(
            std::env::var(BACKEND_URL_ENV).ok(),
            std::env::var(SOCKET_URL_ENV).ok(),
        );
        self
    }

    fn apply_overrides(&mut self, backend_url: Option<String>, socket_url: Option<String>) {
        if let Some(url) = backend_url.filter(|u| !u.trim().is_empty()) {
            log::debug!("Settings: backend URL overridden from environment");
            self.backend_url = url;
        }
        if let Some(url) = socket_url.filter(|u| !u.trim().is_empty()) {
            log::debug!("Settings: socket URL overridden from environment");
            self.socket_url = url;
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            socket_url: self.socket_url.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
            auth_timeout: Duration::from_secs(self.auth_timeout_secs.max(1)),
        }
    }

    pub fn streamer_config(&self) -> StreamerConfig {
        StreamerConfig {
            chunk_duration_ms: self.capture_chunk_ms.max(10),
            ..StreamerConfig::default()
        }
    }
}

pub fn settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or("Could not determine config directory")?;
    Ok(dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings() -> AppSettings {
    match settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            log::warn!("Settings: {}", e);
            AppSettings::default()
        }
    }
}

pub fn load_settings_from(path: &Path) -> AppSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AppSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                AppSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            AppSettings::default()
        }
    }
}

pub fn save_settings(settings: &AppSettings) -> Result<(), String> {
    save_settings_to(&settings_path()?, settings)
}

pub fn save_settings_to(path: &Path, settings: &AppSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write to a sibling temp file, then rename over the real one
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // Windows rename fails if the destination exists
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}
