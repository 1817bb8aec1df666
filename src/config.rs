//! Manager configuration and persisted settings
//!
//! `Settings` is what the user edits, stored as JSON under
//! `~/.config/retrodock/settings.json`. `ManagerConfig` is the resolved,
//! validated form passed explicitly to whichever component needs it.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// User settings, persisted between runs. Empty strings mean "use default".
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Root directory emulators are installed under
    #[serde(default)]
    pub install_root: String,

    /// Directory scanned for game ROMs
    #[serde(default)]
    pub rom_dir: String,

    /// Cache directory (index + downloaded blobs)
    #[serde(default)]
    pub cache_dir: String,
}

impl Settings {
    fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("retrodock");
        Ok(config_dir)
    }

    fn settings_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("settings.json"))
    }

    /// Load settings from disk, or return defaults if not found.
    pub fn load() -> Self {
        match Self::try_load() {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("Could not load settings: {}. Using defaults.", e);
                Self::default()
            }
        }
    }

    fn try_load() -> Result<Self> {
        let path = Self::settings_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {:?}", path))?;
        let settings: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {:?}", path))?;
        Ok(settings)
    }

    /// Save settings to disk.
    pub fn save(&self) -> Result<()> {
        let config_dir = Self::config_dir()?;
        std::fs::create_dir_all(&config_dir)
            .with_context(|| format!("Failed to create {:?}", config_dir))?;
        let path = Self::settings_path()?;
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(&path, content).with_context(|| format!("Failed to write {:?}", path))?;
        Ok(())
    }
}

/// Resolved configuration for the emulator manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Emulators are installed under `<install_root>/<emulator id>/`
    pub install_root: PathBuf,

    /// Directory scanned for game ROMs, if configured
    pub rom_dir: Option<PathBuf>,

    /// Root of the artifact cache (index.json + files/)
    pub cache_dir: PathBuf,
}

impl ManagerConfig {
    /// Resolve settings against platform defaults
    /// (`~/.local/share/retrodock/emulators`, `~/.cache/retrodock`).
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let install_root = if settings.install_root.is_empty() {
            dirs::data_dir()
                .context("Could not determine data directory")?
                .join("retrodock")
                .join("emulators")
        } else {
            PathBuf::from(&settings.install_root)
        };
        let cache_dir = if settings.cache_dir.is_empty() {
            dirs::cache_dir()
                .context("Could not determine cache directory")?
                .join("retrodock")
        } else {
            PathBuf::from(&settings.cache_dir)
        };
        let rom_dir = if settings.rom_dir.is_empty() {
            None
        } else {
            Some(PathBuf::from(&settings.rom_dir))
        };
        Ok(Self {
            install_root,
            rom_dir,
            cache_dir,
        })
    }

    /// Validate the configuration before any operation starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.install_root.exists() && !self.install_root.is_dir() {
            return Err(ConfigError::InstallRootNotADirectory(
                self.install_root.clone(),
            ));
        }
        if let Some(rom_dir) = &self.rom_dir {
            if !rom_dir.is_dir() {
                return Err(ConfigError::RomDirNotFound(rom_dir.clone()));
            }
        }
        Ok(())
    }

    /// ROM directory, required for game scanning.
    pub fn rom_dir(&self) -> Result<&Path> {
        self.rom_dir
            .as_deref()
            .context("No ROM directory configured (set rom_dir in settings or pass --roms)")
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Install root exists but is not a directory: {0}")]
    InstallRootNotADirectory(PathBuf),

    #[error("ROM directory not found: {0}")]
    RomDirNotFound(PathBuf),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_settings_roundtrip() {
        let settings = Settings {
            install_root: "/home/user/emulators".into(),
            rom_dir: "/home/user/roms".into(),
            cache_dir: String::new(),
        };
        let json = serde_json::to_string(&settings).unwrap();
        let loaded: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.install_root, settings.install_root);
        assert_eq!(loaded.rom_dir, settings.rom_dir);
    }

    #[test]
    fn test_resolve_uses_explicit_paths() {
        let settings = Settings {
            install_root: "/opt/emulators".into(),
            rom_dir: "/srv/roms".into(),
            cache_dir: "/var/cache/retrodock".into(),
        };
        let config = ManagerConfig::from_settings(&settings).unwrap();
        assert_eq!(config.install_root, PathBuf::from("/opt/emulators"));
        assert_eq!(config.rom_dir.as_deref(), Some(Path::new("/srv/roms")));
        assert_eq!(config.cache_dir, PathBuf::from("/var/cache/retrodock"));
    }

    #[test]
    fn test_validate_rejects_missing_rom_dir() {
        let dir = TempDir::new().unwrap();
        let config = ManagerConfig {
            install_root: dir.path().join("emulators"),
            rom_dir: Some(dir.path().join("no-such-roms")),
            cache_dir: dir.path().join("cache"),
        };
        match config.validate() {
            Err(ConfigError::RomDirNotFound(path)) => {
                assert_eq!(path, dir.path().join("no-such-roms"));
            }
            other => panic!("expected RomDirNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_file_as_install_root() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();
        let config = ManagerConfig {
            install_root: file,
            rom_dir: None,
            cache_dir: dir.path().join("cache"),
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InstallRootNotADirectory(_))
        ));
    }
}
