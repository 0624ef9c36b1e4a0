//! Process-wide settings for the harvester.
//!
//! User settings live at `~/.broll-harvester/settings.json`.
//! Missing fields fall back to defaults; unknown keys are ignored.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{HarvesterError, Result};

/// Default settings file name.
const SETTINGS_FILE_NAME: &str = "settings.json";

/// Default settings directory name under the user's home.
const SETTINGS_DIR_NAME: &str = ".broll-harvester";

// ---------------------------------------------------------------------------
// Settings structs (matching settings.json schema)
// ---------------------------------------------------------------------------

/// Whisper model size used for transcription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WhisperModel {
    Tiny,
    #[default]
    Base,
    Small,
    Medium,
    Large,
}

impl WhisperModel {
    /// Model name as passed to the whisper CLI.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tiny => "tiny",
            Self::Base => "base",
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }
}

impl std::fmt::Display for WhisperModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level settings, deserialized from `settings.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub whisper_model: WhisperModel,

    /// Images requested per selected concept.
    #[serde(default = "default_images_per_concept")]
    pub images_per_concept: usize,

    /// Maximum concepts selected from one transcript.
    #[serde(default = "default_max_concepts")]
    pub max_concepts_per_srt: usize,

    /// Hard ceiling on images saved for one job.
    #[serde(default = "default_max_total_images")]
    pub max_total_images: usize,

    /// How far the browser helper scrolls a result page per search.
    #[serde(default = "default_max_scrolls")]
    pub max_scrolls_per_keyword: u32,

    #[serde(default = "default_true")]
    pub use_visible_browser: bool,

    #[serde(default)]
    pub use_existing_chrome_profile: bool,

    /// Chrome user-data directory; required when `use_existing_chrome_profile` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chrome_profile_dir: Option<PathBuf>,

    /// Generate subtitles for YouTube jobs.
    #[serde(default)]
    pub srt_youtube_enabled: bool,

    /// Generate subtitles for jobs on other platforms.
    #[serde(default)]
    pub srt_other_enabled: bool,

    /// Retry a short concept search as "<concept> Wikipedia".
    #[serde(default = "default_true")]
    pub wikipedia_fallback: bool,

    /// Root directory for job bundles.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// External tool commands.
    #[serde(default)]
    pub tools: ToolSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            whisper_model: WhisperModel::default(),
            images_per_concept: default_images_per_concept(),
            max_concepts_per_srt: default_max_concepts(),
            max_total_images: default_max_total_images(),
            max_scrolls_per_keyword: default_max_scrolls(),
            use_visible_browser: true,
            use_existing_chrome_profile: false,
            chrome_profile_dir: None,
            srt_youtube_enabled: false,
            srt_other_enabled: false,
            wikipedia_fallback: true,
            output_dir: default_output_dir(),
            tools: ToolSettings::default(),
        }
    }
}

fn default_images_per_concept() -> usize {
    3
}
fn default_max_concepts() -> usize {
    15
}
fn default_max_total_images() -> usize {
    50
}
fn default_max_scrolls() -> u32 {
    6
}
fn default_true() -> bool {
    true
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

/// `tools` section: how the external collaborators are invoked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSettings {
    /// yt-dlp executable.
    #[serde(default = "default_yt_dlp")]
    pub yt_dlp: String,

    /// whisper CLI executable.
    #[serde(default = "default_whisper")]
    pub whisper: String,

    /// Spoken language passed to whisper. Unset lets whisper detect it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whisper_language: Option<String>,

    /// Tagger bridge argv. Empty uses the built-in frequency tagger.
    #[serde(default)]
    pub tagger: Vec<String>,

    /// Browser-automation bridge argv. Empty uses plain HTML image search.
    #[serde(default)]
    pub browser_bridge: Vec<String>,

    /// Search endpoint for HTML image search; `{query}` is replaced.
    #[serde(default = "default_image_search_url")]
    pub image_search_url: String,

    /// Upper bound on a single download or transcription call.
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_secs: u64,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            yt_dlp: default_yt_dlp(),
            whisper: default_whisper(),
            whisper_language: None,
            tagger: Vec::new(),
            browser_bridge: Vec::new(),
            image_search_url: default_image_search_url(),
            stage_timeout_secs: default_stage_timeout(),
        }
    }
}

fn default_yt_dlp() -> String {
    "yt-dlp".into()
}
fn default_whisper() -> String {
    "whisper".into()
}
fn default_image_search_url() -> String {
    "https://www.bing.com/images/search?q={query}&form=HDRSC2".into()
}
fn default_stage_timeout() -> u64 {
    1800
}

// ---------------------------------------------------------------------------
// Runtime views
// ---------------------------------------------------------------------------

/// Image caps applied by the image-fetch stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageCaps {
    /// Images requested per concept.
    pub per_concept: usize,
    /// Global ceiling for the whole job.
    pub total: usize,
}

/// Options handed to the image search session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrowserOptions {
    pub visible: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_dir: Option<PathBuf>,
    pub max_scrolls: u32,
}

impl Settings {
    /// Check cap and profile constraints.
    pub fn validate(&self) -> Result<()> {
        if self.images_per_concept == 0 {
            return Err(HarvesterError::config("images_per_concept must be positive"));
        }
        if self.max_concepts_per_srt == 0 {
            return Err(HarvesterError::config("max_concepts_per_srt must be positive"));
        }
        if self.max_total_images == 0 {
            return Err(HarvesterError::config("max_total_images must be positive"));
        }
        if self.max_total_images < self.images_per_concept {
            return Err(HarvesterError::config(format!(
                "max_total_images ({}) must be at least images_per_concept ({})",
                self.max_total_images, self.images_per_concept
            )));
        }
        if self.use_existing_chrome_profile
            && self
                .chrome_profile_dir
                .as_ref()
                .is_none_or(|p| p.as_os_str().is_empty())
        {
            return Err(HarvesterError::config(
                "chrome_profile_dir is required when use_existing_chrome_profile is set",
            ));
        }
        Ok(())
    }

    pub fn image_caps(&self) -> ImageCaps {
        ImageCaps {
            per_concept: self.images_per_concept,
            total: self.max_total_images,
        }
    }

    pub fn browser_options(&self) -> BrowserOptions {
        let profile_dir = if self.use_existing_chrome_profile {
            self.chrome_profile_dir.clone()
        } else {
            None
        };
        BrowserOptions {
            visible: self.use_visible_browser,
            profile_dir,
            max_scrolls: self.max_scrolls_per_keyword,
        }
    }
}

// ---------------------------------------------------------------------------
// Settings store
// ---------------------------------------------------------------------------

/// Get the path to the settings directory (`~/.broll-harvester/`).
pub fn settings_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| HarvesterError::config("could not determine home directory"))?;
    Ok(home.join(SETTINGS_DIR_NAME))
}

/// Get the path to the settings file (`~/.broll-harvester/settings.json`).
pub fn settings_file_path() -> Result<PathBuf> {
    Ok(settings_dir()?.join(SETTINGS_FILE_NAME))
}

/// Load settings from the default location.
pub fn load_settings() -> Result<Settings> {
    load_settings_from(&settings_file_path()?)
}

/// Load settings from a specific file. Returns defaults if the file does not exist.
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    if !path.exists() {
        tracing::debug!(?path, "settings file not found, using defaults");
        return Ok(Settings::default());
    }

    let content = std::fs::read_to_string(path).map_err(|e| HarvesterError::io(path, e))?;
    let settings: Settings = serde_json::from_str(&content).map_err(|e| {
        HarvesterError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    settings.validate()?;
    Ok(settings)
}

/// Load settings, logging and falling back to defaults on any error.
pub fn load_settings_or_default(path: Option<&Path>) -> Settings {
    let loaded = match path {
        Some(p) => load_settings_from(p),
        None => load_settings(),
    };
    loaded.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "settings unusable, falling back to defaults");
        Settings::default()
    })
}

/// Validate and persist settings. Writes a sibling temp file, then renames it
/// over the target so a crash never leaves a half-written file behind.
pub fn save_settings_to(path: &Path, settings: &Settings) -> Result<()> {
    settings.validate()?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| HarvesterError::io(parent, e))?;
    }

    let content = serde_json::to_string_pretty(settings)
        .map_err(|e| HarvesterError::config(e.to_string()))?;

    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);

    std::fs::write(&temp, content).map_err(|e| HarvesterError::io(&temp, e))?;
    std::fs::rename(&temp, path).map_err(|e| HarvesterError::io(path, e))?;
    tracing::info!(?path, "settings saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("harvester-settings-{}", uuid::Uuid::now_v7()))
            .join(name)
    }

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().expect("defaults validate");
        assert_eq!(settings.whisper_model, WhisperModel::Base);
        assert_eq!(settings.image_caps(), ImageCaps { per_concept: 3, total: 50 });
    }

    #[test]
    fn partial_file_merges_with_defaults() {
        let json = r#"{ "whisper_model": "small", "max_total_images": 9, "legacy_key": 1 }"#;
        let parsed: Settings = serde_json::from_str(json).expect("parse");
        assert_eq!(parsed.whisper_model, WhisperModel::Small);
        assert_eq!(parsed.max_total_images, 9);
        assert_eq!(parsed.images_per_concept, 3);
        assert_eq!(parsed.tools.yt_dlp, "yt-dlp");
        assert_eq!(parsed.tools.whisper_language, None);

        let json = r#"{ "tools": { "whisper_language": "de" } }"#;
        let parsed: Settings = serde_json::from_str(json).expect("parse");
        assert_eq!(parsed.tools.whisper_language.as_deref(), Some("de"));
        assert_eq!(parsed.tools.whisper, "whisper");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let path = temp_path("settings.json");
        let settings = load_settings_from(&path).expect("load");
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn malformed_file_is_config_error() {
        let path = temp_path("settings.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{ not json").unwrap();

        let err = load_settings_from(&path).unwrap_err();
        assert!(matches!(err, HarvesterError::Config { .. }));

        let fallback = load_settings_or_default(Some(&path));
        assert_eq!(fallback, Settings::default());

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn save_then_load_keeps_changes() {
        let path = temp_path("settings.json");
        let settings = Settings {
            whisper_model: WhisperModel::Medium,
            srt_youtube_enabled: true,
            ..Settings::default()
        };

        save_settings_to(&path, &settings).expect("save");
        let parent = path.parent().unwrap();
        assert!(!parent.join("settings.json.tmp").exists());

        let loaded = load_settings_from(&path).expect("load");
        assert_eq!(loaded, settings);

        let _ = std::fs::remove_dir_all(parent);
    }

    #[test]
    fn invalid_settings_are_not_saved() {
        let path = temp_path("settings.json");
        let settings = Settings {
            images_per_concept: 10,
            max_total_images: 5,
            ..Settings::default()
        };
        assert!(save_settings_to(&path, &settings).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn profile_dir_required_when_enabled() {
        let mut settings = Settings {
            use_existing_chrome_profile: true,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());

        settings.chrome_profile_dir = Some(PathBuf::from("/home/me/.config/google-chrome"));
        settings.validate().expect("valid with profile dir");
        assert_eq!(
            settings.browser_options().profile_dir,
            Some(PathBuf::from("/home/me/.config/google-chrome"))
        );
    }
}
