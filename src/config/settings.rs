//! Server settings
//!
//! Process-level settings persisted as JSON in the platform data directory.
//! Session parameters are not stored here; they arrive with every setup call.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable overriding the bind address
pub const ADDR_ENV: &str = "GPT_SERVICE_ADDR";

const DEFAULT_ADDR: &str = "0.0.0.0:50051";

/// Settings-related errors
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to access data directory: {0}")]
    DataDirError(String),
    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Address the HTTP listener binds to
    pub bind_address: String,
    /// Relative model paths in setup requests are resolved against this directory
    pub models_directory: PathBuf,
    /// GPU layers used when a setup request does not specify any
    pub gpu_layers: u32,
    /// Events buffered between the generation worker and a streaming response
    pub channel_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_ADDR.to_string(),
            models_directory: get_data_dir()
                .ok()
                .map(|d| d.join("models"))
                .unwrap_or_else(|| PathBuf::from("./models")),
            gpu_layers: 0,
            channel_capacity: 64,
        }
    }
}

impl ServerSettings {
    /// Clamps values into usable ranges
    pub fn validate(&mut self) {
        if self.bind_address.parse::<SocketAddr>().is_err() {
            tracing::warn!("Invalid bind address '{}', using default", self.bind_address);
            self.bind_address = DEFAULT_ADDR.to_string();
        }

        self.channel_capacity = self.channel_capacity.clamp(1, 4096);
    }

    /// Applies `GPT_SERVICE_ADDR` if set
    pub fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var(ADDR_ENV) {
            self.bind_address = addr;
        }
    }

    /// Parsed bind address; `validate` guarantees it parses
    pub fn socket_addr(&self) -> SocketAddr {
        self.bind_address
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 50051)))
    }

    /// Resolves a model path from a setup request
    pub fn resolve_model_path(&self, model: &str) -> PathBuf {
        let path = Path::new(model);
        if path.is_absolute() || path.exists() {
            path.to_path_buf()
        } else {
            self.models_directory.join(path)
        }
    }
}

/// Get the application data directory
pub fn get_data_dir() -> Result<PathBuf, SettingsError> {
    directories::ProjectDirs::from("com", "GptService", "GptService")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| SettingsError::DataDirError("Could not determine data directory".to_string()))
}

fn get_settings_path() -> Result<PathBuf, SettingsError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from the data directory
///
/// Returns default settings if the file doesn't exist or is corrupted,
/// and writes the defaults out on first start so they can be edited.
pub fn load_settings() -> ServerSettings {
    let mut settings = match get_settings_path().and_then(|p| load_or_init_settings(&p)) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            ServerSettings::default()
        }
    };
    settings.apply_env();
    settings.validate();
    settings
}

/// Loads `path`, creating it with default settings if it does not exist
pub fn load_or_init_settings(path: &Path) -> Result<ServerSettings, SettingsError> {
    if path.exists() {
        return load_settings_from(path);
    }

    let settings = ServerSettings::default();
    if let Err(e) = save_settings_to(&settings, path) {
        tracing::warn!("Could not write default settings to {}: {}", path.display(), e);
    }
    Ok(settings)
}

/// Load settings from a specific file
pub fn load_settings_from(path: &Path) -> Result<ServerSettings, SettingsError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(ServerSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: ServerSettings = serde_json::from_str(&json)?;
    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to a specific file
pub fn save_settings_to(settings: &ServerSettings, path: &Path) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = ServerSettings::default();
        assert_eq!(settings.bind_address, "0.0.0.0:50051");
        assert_eq!(settings.gpu_layers, 0);
        assert_eq!(settings.channel_capacity, 64);
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = ServerSettings::default();

        settings.bind_address = "not an address".to_string();
        settings.channel_capacity = 0;
        settings.validate();

        assert_eq!(settings.bind_address, "0.0.0.0:50051");
        assert_eq!(settings.channel_capacity, 1);
        assert_eq!(settings.socket_addr().port(), 50051);
    }

    #[test]
    fn test_settings_roundtrip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut settings = ServerSettings::default();
        settings.bind_address = "127.0.0.1:9000".to_string();
        settings.gpu_layers = 33;
        save_settings_to(&settings, &path).unwrap();

        let loaded = load_settings_from(&path).unwrap();
        assert_eq!(loaded.bind_address, "127.0.0.1:9000");
        assert_eq!(loaded.gpu_layers, 33);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_settings_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(loaded.channel_capacity, 64);
    }

    #[test]
    fn test_first_start_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("settings.json");

        let settings = load_or_init_settings(&path).unwrap();
        assert_eq!(settings.channel_capacity, 64);
        assert!(path.exists());

        let on_disk = load_settings_from(&path).unwrap();
        assert_eq!(on_disk.bind_address, settings.bind_address);
        assert_eq!(on_disk.models_directory, settings.models_directory);
    }

    #[test]
    fn test_existing_file_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut settings = ServerSettings::default();
        settings.gpu_layers = 7;
        save_settings_to(&settings, &path).unwrap();

        assert_eq!(load_or_init_settings(&path).unwrap().gpu_layers, 7);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            load_settings_from(&path),
            Err(SettingsError::JsonError(_))
        ));
    }

    #[test]
    fn test_resolve_model_path() {
        let mut settings = ServerSettings::default();
        settings.models_directory = PathBuf::from("/srv/models");
        assert_eq!(
            settings.resolve_model_path("7B/model.gguf"),
            PathBuf::from("/srv/models/7B/model.gguf")
        );
        assert_eq!(
            settings.resolve_model_path("/abs/model.gguf"),
            PathBuf::from("/abs/model.gguf")
        );
    }
}
