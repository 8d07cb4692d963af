//! Persisted engine configuration.
//!
//! A flat key/value store the engine reads and writes; the embedding
//! application owns when to load and save it. Saves go through a temp
//! file and an atomic rename so a crash never leaves a half-written
//! settings file behind.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::errors::{SyncError, SyncResult};

pub const DEFAULT_VIDEO_EXTENSIONS: &str = "wmv|avi|mpg|3gp|mov|m4v|mts|mp4";
pub const DEFAULT_PHOTO_EXTENSIONS: &str = "dof|arw|raw|jpg|jpeg|png|nef";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Directories
    pub source_dir: PathBuf,
    pub dest_dir: PathBuf,

    // Classification
    pub video_extensions: String,
    pub photo_extensions: String,
    #[serde(default)]
    pub media_only: bool,

    // Copy policy
    pub overwrite_destination: bool,
    pub delete_source_after_copy: bool,

    // Transcode policy
    pub reencode_videos: bool,
    pub delete_copy_after_transcode: bool,
    pub codec_index: usize,
    pub encoder_path: String,

    // Display
    pub show_media_info: bool,

    // Bucket overrides applied by the mapping editor; key is the
    // date-derived bucket, value the actual destination sub-path.
    #[serde(default)]
    pub path_overrides: BTreeMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            source_dir: home.clone(),
            dest_dir: home,
            video_extensions: DEFAULT_VIDEO_EXTENSIONS.to_string(),
            photo_extensions: DEFAULT_PHOTO_EXTENSIONS.to_string(),
            media_only: false,
            overwrite_destination: false,
            delete_source_after_copy: false,
            reencode_videos: false,
            delete_copy_after_transcode: false,
            codec_index: 0,
            encoder_path: "ffmpeg".to_string(),
            show_media_info: false,
            path_overrides: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Load settings from a file, falling back to defaults if it does
    /// not exist yet.
    pub fn load(path: &Path) -> SyncResult<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let settings: Self = serde_json::from_str(&contents)?;
            Ok(settings)
        } else {
            Ok(Self::default())
        }
    }

    /// Save settings, writing to a temp file first and renaming over
    /// the target.
    pub fn save(&self, path: &Path) -> SyncResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let temp = path.with_extension("tmp");
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&temp, json)?;
        std::fs::rename(&temp, path)?;
        Ok(())
    }

    /// Default settings file location under the user config directory.
    pub fn default_path() -> SyncResult<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| SyncError::Internal("Could not determine config directory".into()))?;
        Ok(config_dir.join("mediasync").join("settings.json"))
    }

    /// Load from the default location or start fresh.
    pub fn load_or_default() -> SyncResult<Self> {
        Self::load(&Self::default_path()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_extension_sets() {
        let settings = Settings::default();
        assert!(settings.video_extensions.contains("mp4"));
        assert!(settings.photo_extensions.contains("jpg"));
        assert_eq!(settings.codec_index, 0);
        assert_eq!(settings.encoder_path, "ffmpeg");
        assert!(!settings.overwrite_destination);
    }

    #[test]
    fn save_and_reload_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");

        let mut settings = Settings::default();
        settings.overwrite_destination = true;
        settings.codec_index = 2;
        settings
            .path_overrides
            .insert("2023/2023-05-01".into(), "trips/rome".into());
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert!(loaded.overwrite_destination);
        assert_eq!(loaded.codec_index, 2);
        assert_eq!(
            loaded.path_overrides.get("2023/2023-05-01").unwrap(),
            "trips/rome"
        );
    }

    #[test]
    fn load_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings.video_extensions, DEFAULT_VIDEO_EXTENSIONS);
    }
}
