//! Settings Persistence
//!
//! Persistent engine settings with:
//! - Atomic file writes (temp file + rename)
//! - Schema validation with defaults
//! - Migration support for schema changes
//!
//! Storage location: {config_dir}/clipforge/settings.json

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::TaskResult;

/// Settings schema version for migration support
pub const SETTINGS_VERSION: u32 = 1;

/// Settings file name
pub const SETTINGS_FILE: &str = "settings.json";

/// Engine settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EngineSettings {
    /// Schema version for migrations
    #[serde(default = "default_version")]
    pub version: u32,

    /// External tool locations
    #[serde(default)]
    pub tools: ToolSettings,

    /// Encode scheduling
    #[serde(default)]
    pub encoding: EncodingSettings,

    /// Cache root directory; derived artifacts (thumbnails, audio level
    /// files, proxies) live underneath
    #[serde(default = "default_cache_root")]
    pub cache_root: PathBuf,
}

fn default_version() -> u32 {
    SETTINGS_VERSION
}

fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("clipforge")
}

/// Paths to external binaries the engine may spawn
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolSettings {
    /// ffmpeg binary
    pub ffmpeg_path: PathBuf,
    /// ffprobe binary
    pub ffprobe_path: PathBuf,
    /// The host engine's command-line renderer (reports progress as
    /// "percentage: N" on stderr)
    pub renderer_path: PathBuf,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            renderer_path: PathBuf::from("melt"),
        }
    }
}

/// Encode pool and default parameter settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EncodingSettings {
    /// Number of simultaneous proxy/transcode encodes. Changing it takes
    /// effect for subsequently submitted tasks.
    pub encode_concurrency: usize,
    /// Default ffmpeg parameters for proxy generation; `%width` is
    /// replaced with `proxy_resize`
    pub proxy_params: String,
    /// Proxy target width in pixels
    pub proxy_resize: u32,
}

impl Default for EncodingSettings {
    fn default() -> Self {
        Self {
            encode_concurrency: 2,
            proxy_params: "-vf scale=%width:-2 -c:v libx264 -preset ultrafast -crf 28 -c:a aac"
                .to_string(),
            proxy_resize: 960,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            tools: ToolSettings::default(),
            encoding: EncodingSettings::default(),
            cache_root: default_cache_root(),
        }
    }
}

impl EngineSettings {
    /// Loads settings from the given file, falling back to defaults when
    /// the file is missing or unreadable.
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<EngineSettings>(&raw) {
                Ok(mut settings) => {
                    if settings.version < SETTINGS_VERSION {
                        info!(
                            "Migrating settings from version {} to {}",
                            settings.version, SETTINGS_VERSION
                        );
                        settings.version = SETTINGS_VERSION;
                    }
                    settings
                }
                Err(e) => {
                    warn!("Failed to parse settings at {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Saves settings atomically (write to temp file, then rename).
    pub fn save(&self, path: &Path) -> TaskResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Default on-disk location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("clipforge")
            .join(SETTINGS_FILE)
    }
}
