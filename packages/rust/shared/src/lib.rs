//! Shared types, error model, and settings for the b-roll harvester.
//!
//! This crate is the foundation depended on by all other harvester crates.
//! It provides:
//! - [`HarvesterError`], the unified error type
//! - Domain types ([`JobRecord`], [`JobId`], [`Platform`], [`Stage`], [`StageOutcome`])
//! - Settings ([`Settings`], the settings store load/save functions)

pub mod error;
pub mod settings;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use error::{HarvesterError, Result};
pub use settings::{
    BrowserOptions, ImageCaps, Settings, ToolSettings, WhisperModel, load_settings,
    load_settings_from, load_settings_or_default, save_settings_to, settings_dir,
    settings_file_path,
};
pub use types::{
    Concept, JobId, JobRecord, JobStatus, Platform, Stage, StageOutcome, safe_folder_name,
};
