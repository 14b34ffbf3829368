//! Configuration management for the room mesh
//!
//! This crate handles loading, saving and accessing application
//! configuration, plus the local canvas cache.

use log::{debug, info};
use room_core::Error;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub mod canvas_cache;

pub use canvas_cache::CanvasCache;

/// Prefix of environment variables that override the settings file
pub const ENV_PREFIX: &str = "MESH";

const APP_DIR: &str = "room_mesh";

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// User's display name
    pub username: String,

    /// Address of the rendezvous relay
    pub relay_address: String,

    /// Base of the shareable join address
    pub join_base_url: String,

    /// Canvas slots on each of the four walls
    pub slots_per_wall: usize,

    /// Keep canvases on disk between runs
    pub canvas_cache: bool,

    /// Where cached canvases live (platform cache directory if unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            username: "Anonymous".to_string(),
            relay_address: "127.0.0.1:7878".to_string(),
            join_base_url: "room://join".to_string(),
            slots_per_wall: 4,
            canvas_cache: true,
            cache_dir: None,
        }
    }
}

impl Settings {
    /// Directory for cached canvases, if caching is enabled
    pub fn canvas_cache_dir(&self) -> Option<PathBuf> {
        if !self.canvas_cache {
            return None;
        }
        self.cache_dir
            .clone()
            .or_else(|| dirs::cache_dir().map(|dir| dir.join(APP_DIR).join("canvases")))
    }
}

/// Configuration manager
pub struct ConfigManager {
    settings: Settings,
    config_file: PathBuf,
}

impl ConfigManager {
    /// Load settings from the user's config directory
    pub fn new() -> Result<Self, Error> {
        let mut config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Failed to determine config directory".to_string()))?;
        config_dir.push(APP_DIR);

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .map_err(|e| Error::Config(format!("Failed to create config directory: {}", e)))?;
        }

        Self::with_file(config_dir.join("config.toml"))
    }

    /// Create a ConfigManager with a custom file path
    pub fn with_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let config_file = path.as_ref().to_path_buf();
        let settings = Self::load(&config_file, None)?;

        Ok(Self {
            settings,
            config_file,
        })
    }

    /// Layer the file (if any) under `MESH_*` environment variables.
    /// `env` replaces the process environment when given.
    fn load(path: &Path, env: Option<HashMap<String, String>>) -> Result<Settings, Error> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .source(env),
            )
            .build()
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?
            .try_deserialize::<Settings>()
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;

        if settings.slots_per_wall == 0 {
            return Err(Error::Config("slots_per_wall must be at least 1".to_string()));
        }
        Ok(settings)
    }

    /// Save settings to the config file
    pub fn save(&self) -> Result<(), Error> {
        let toml = toml::to_string_pretty(&self.settings)
            .map_err(|e| Error::Config(format!("Failed to serialize settings: {}", e)))?;

        if let Some(parent) = self.config_file.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    Error::Config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        fs::write(&self.config_file, toml)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        info!("Saved config to {:?}", self.config_file);
        Ok(())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.username, "Anonymous");
        assert_eq!(settings.slots_per_wall, 4);
        assert!(settings.canvas_cache);
        assert!(settings.cache_dir.is_none());
    }

    #[test]
    fn save_and_load() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("test_config.toml");

        let mut config = ConfigManager::with_file(&config_path).unwrap();
        config.settings_mut().username = "TestUser".to_string();
        config.settings_mut().relay_address = "10.0.0.2:9000".to_string();
        config.settings_mut().cache_dir = Some(temp_dir.path().join("cache"));
        config.save().unwrap();
        assert!(config_path.exists());

        let loaded = ConfigManager::with_file(&config_path).unwrap();
        assert_eq!(loaded.settings(), config.settings());
    }

    #[test]
    fn file_not_found_uses_defaults() {
        let temp_dir = tempdir().unwrap();
        let nonexistent_path = temp_dir.path().join("nonexistent.toml");

        let config = ConfigManager::with_file(&nonexistent_path).unwrap();
        assert_eq!(config.settings().username, "Anonymous");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("partial.toml");
        fs::write(&path, "username = \"Ada\"\n").unwrap();

        let config = ConfigManager::with_file(&path).unwrap();
        assert_eq!(config.settings().username, "Ada");
        assert_eq!(config.settings().join_base_url, "room://join");
    }

    #[test]
    fn environment_overrides_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "username = \"FromFile\"\nslots_per_wall = 2\n").unwrap();

        let env = HashMap::from([
            ("MESH_USERNAME".to_string(), "FromEnv".to_string()),
            ("MESH_SLOTS_PER_WALL".to_string(), "3".to_string()),
        ]);
        let settings = ConfigManager::load(&path, Some(env)).unwrap();
        assert_eq!(settings.username, "FromEnv");
        assert_eq!(settings.slots_per_wall, 3);
    }

    #[test]
    fn invalid_file_is_a_config_error() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("broken.toml");
        fs::write(&path, "slots_per_wall = \"many\"\n").unwrap();

        assert!(matches!(
            ConfigManager::with_file(&path),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn disabled_cache_has_no_directory() {
        let settings = Settings {
            canvas_cache: false,
            ..Settings::default()
        };
        assert!(settings.canvas_cache_dir().is_none());

        let settings = Settings {
            cache_dir: Some(PathBuf::from("/tmp/canvases")),
            ..Settings::default()
        };
        assert_eq!(
            settings.canvas_cache_dir(),
            Some(PathBuf::from("/tmp/canvases"))
        );
    }
}
