//! Core domain types: jobs, platforms, stages, and stage outcomes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{HarvesterError, Result};

// ---------------------------------------------------------------------------
// JobId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for job identifiers (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a new time-sortable job identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

/// Where the submitted links come from. Drives per-stage defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Tiktok,
    Instagram,
    Youtube,
    Other,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tiktok => "tiktok",
            Self::Instagram => "instagram",
            Self::Youtube => "youtube",
            Self::Other => "other",
        }
    }

    fn domains(&self) -> &'static [&'static str] {
        match self {
            Self::Tiktok => &["tiktok.com", "vm.tiktok.com"],
            Self::Instagram => &["instagram.com"],
            Self::Youtube => &["youtube.com", "youtu.be"],
            Self::Other => &[],
        }
    }

    /// Whether the source reference belongs to this platform. `Other` accepts anything.
    pub fn matches(&self, source: &str) -> bool {
        if *self == Self::Other {
            return true;
        }
        match url::Url::parse(source.trim()) {
            Ok(url) => {
                let host = url.host_str().unwrap_or("").to_ascii_lowercase();
                self.domains()
                    .iter()
                    .any(|d| host == *d || host.ends_with(&format!(".{d}")))
            }
            Err(_) => self.domains().iter().any(|d| source.contains(d)),
        }
    }

    /// Best-effort guess of the platform from a source reference.
    pub fn detect(source: &str) -> Self {
        [Self::Tiktok, Self::Instagram, Self::Youtube]
            .into_iter()
            .find(|p| p.matches(source))
            .unwrap_or(Self::Other)
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Platform {
    type Err = HarvesterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tiktok" => Ok(Self::Tiktok),
            "instagram" => Ok(Self::Instagram),
            "youtube" => Ok(Self::Youtube),
            "other" => Ok(Self::Other),
            other => Err(HarvesterError::validation(format!(
                "unknown platform '{other}' (expected tiktok, instagram, youtube, or other)"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Lifecycle of a job: `queued → running → {completed, completed-with-errors, failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed-with-errors",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::CompletedWithErrors | Self::Failed
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Stage / StageOutcome
// ---------------------------------------------------------------------------

/// The four pipeline stages. `Ord` follows pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Download,
    Transcribe,
    ConceptExtract,
    ImageFetch,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Stage; 4] = [
        Stage::Download,
        Stage::Transcribe,
        Stage::ConceptExtract,
        Stage::ImageFetch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Transcribe => "transcribe",
            Self::ConceptExtract => "concept-extract",
            Self::ImageFetch => "image-fetch",
        }
    }

    /// Position in the pipeline (0-based).
    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recorded result of running one stage for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "StageRecord", from = "StageRecord")]
pub enum StageOutcome {
    /// Not attempted; the reason says why.
    Skipped { reason: String },
    /// Attempted and succeeded.
    Succeeded { artifacts: Vec<String> },
    /// Attempted and failed, possibly after producing some artifacts.
    Failed {
        error: String,
        artifacts: Vec<String>,
    },
}

impl StageOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }

    pub fn attempted(&self) -> bool {
        !matches!(self, Self::Skipped { .. })
    }

    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn artifacts(&self) -> &[String] {
        match self {
            Self::Succeeded { artifacts } | Self::Failed { artifacts, .. } => artifacts,
            Self::Skipped { .. } => &[],
        }
    }
}

/// Flat on-disk shape of a [`StageOutcome`] inside `job.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StageRecord {
    attempted: bool,
    succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default)]
    artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    skip_reason: Option<String>,
}

impl From<StageOutcome> for StageRecord {
    fn from(outcome: StageOutcome) -> Self {
        match outcome {
            StageOutcome::Skipped { reason } => Self {
                attempted: false,
                succeeded: false,
                error: None,
                artifacts: Vec::new(),
                skip_reason: Some(reason),
            },
            StageOutcome::Succeeded { artifacts } => Self {
                attempted: true,
                succeeded: true,
                error: None,
                artifacts,
                skip_reason: None,
            },
            StageOutcome::Failed { error, artifacts } => Self {
                attempted: true,
                succeeded: false,
                error: Some(error),
                artifacts,
                skip_reason: None,
            },
        }
    }
}

impl From<StageRecord> for StageOutcome {
    fn from(record: StageRecord) -> Self {
        match (record.attempted, record.succeeded) {
            (false, _) => Self::Skipped {
                reason: record.skip_reason.unwrap_or_default(),
            },
            (true, true) => Self::Succeeded {
                artifacts: record.artifacts,
            },
            (true, false) => Self::Failed {
                error: record.error.unwrap_or_else(|| "unknown error".into()),
                artifacts: record.artifacts,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// JobRecord
// ---------------------------------------------------------------------------

/// The persisted unit of work (`job.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// Source references in submission order; duplicates kept.
    pub sources: Vec<String>,
    pub platform: Platform,
    pub topic: String,
    pub notes: String,
    pub status: JobStatus,
    /// Outcomes keyed by stage, in pipeline order.
    #[serde(default)]
    pub stage_results: BTreeMap<Stage, StageOutcome>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// `<output_root>/<topic>_<id>`, created lazily by the engine.
    pub output_dir: PathBuf,
}

impl JobRecord {
    /// Create a queued job. Sources are kept as submitted; at least one must
    /// be non-blank.
    pub fn new(
        sources: Vec<String>,
        platform: Platform,
        topic: impl Into<String>,
        notes: impl Into<String>,
        output_root: &Path,
    ) -> Result<Self> {
        if sources.iter().all(|s| s.trim().is_empty()) {
            return Err(HarvesterError::validation(
                "a job needs at least one source reference",
            ));
        }

        let id = JobId::new();
        let topic = topic.into();
        let folder_stem = if topic.trim().is_empty() {
            safe_folder_name(platform.as_str())
        } else {
            safe_folder_name(&topic)
        };

        Ok(Self {
            id,
            sources,
            platform,
            topic,
            notes: notes.into(),
            status: JobStatus::Queued,
            stage_results: BTreeMap::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            output_dir: output_root.join(format!("{folder_stem}_{id}")),
        })
    }

    /// Move to `to`, rejecting anything but `queued → running → terminal`.
    pub fn transition(&mut self, to: JobStatus) -> Result<()> {
        let allowed = match (self.status, to) {
            (JobStatus::Queued, JobStatus::Running) => true,
            (JobStatus::Running, next) => next.is_terminal(),
            _ => false,
        };

        if !allowed {
            return Err(HarvesterError::validation(format!(
                "job {}: illegal status change {} -> {}",
                self.id, self.status, to
            )));
        }

        match to {
            JobStatus::Running => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.finished_at = Some(Utc::now()),
            _ => {}
        }
        self.status = to;
        Ok(())
    }

    /// Record a stage outcome. Stages must be recorded once each, in pipeline order.
    pub fn record_stage(&mut self, stage: Stage, outcome: StageOutcome) -> Result<()> {
        if self.stage_results.contains_key(&stage) {
            return Err(HarvesterError::validation(format!(
                "job {}: stage {stage} already recorded",
                self.id
            )));
        }
        if self.stage_results.len() != stage.index() {
            return Err(HarvesterError::validation(format!(
                "job {}: stage {stage} recorded before its predecessors",
                self.id
            )));
        }
        self.stage_results.insert(stage, outcome);
        Ok(())
    }

    pub fn outcome(&self, stage: Stage) -> Option<&StageOutcome> {
        self.stage_results.get(&stage)
    }

    /// Final status from recorded outcomes: `failed` iff download produced
    /// nothing, `completed` iff every attempted stage succeeded.
    pub fn derive_status(&self) -> JobStatus {
        let downloaded = self
            .outcome(Stage::Download)
            .is_some_and(|o| !o.artifacts().is_empty());

        if !downloaded {
            return JobStatus::Failed;
        }

        let clean = self
            .stage_results
            .values()
            .filter(|o| o.attempted())
            .all(StageOutcome::succeeded);

        if clean {
            JobStatus::Completed
        } else {
            JobStatus::CompletedWithErrors
        }
    }
}

// ---------------------------------------------------------------------------
// Concept
// ---------------------------------------------------------------------------

/// A ranked term selected from a transcript to drive image search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Concept {
    pub text: String,
    /// Raw frequency reported by the tagger.
    pub frequency: u32,
    /// Byte offset of the first occurrence in the transcript, if found literally.
    pub first_seen: Option<usize>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

static UNSAFE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9_\- ]+").expect("valid regex"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Filesystem-friendly directory name: lowercase `[a-z0-9_-]`, spaces to `_`, at most 80 chars.
pub fn safe_folder_name(s: &str) -> String {
    let lowered = s.trim().to_lowercase();
    let kept = UNSAFE_CHARS.replace_all(&lowered, "");
    let joined = WHITESPACE.replace_all(kept.trim(), "_");
    let name: String = joined.chars().take(80).collect();
    if name.is_empty() {
        "untitled".to_string()
    } else {
        name
    }
}
