//! A job's output directory.
//!
//! Layout under `<output_root>/<topic>_<job_id>/`:
//!
//! ```text
//! links.txt        one source reference per line
//! notes.txt        the job notes, verbatim
//! download.log     append-only stage trace
//! job.json         the Job Record, rewritten after every stage
//! video[_NN].*     downloaded videos
//! transcript*.srt  subtitles, plus transcript.txt
//! images/<concept>/NNN.jpg
//! ```
//!
//! Every write failure here is fatal for the job: the bundle is the only
//! place results go.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::debug;

use harvester_shared::{HarvesterError, JobRecord, Result, Stage};

pub const RECORD_FILE: &str = "job.json";
pub const LOG_FILE: &str = "download.log";
pub const LINKS_FILE: &str = "links.txt";
pub const NOTES_FILE: &str = "notes.txt";

/// Handle to one job's output directory.
#[derive(Debug, Clone)]
pub struct JobBundle {
    dir: PathBuf,
}

impl JobBundle {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Absolute path for a bundle-relative artifact path.
    pub fn path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.dir.join(relative)
    }

    /// Bundle-relative form of `path`, as stored in `stage_results`.
    pub fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.dir)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    /// Create the directory and write `links.txt` and `notes.txt`.
    pub fn prepare(&self, record: &JobRecord) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| fatal_io(&self.dir, e))?;

        let mut links = record.sources.join("\n");
        links.push('\n');
        self.write_text(LINKS_FILE, &links)?;
        self.write_text(NOTES_FILE, &record.notes)?;

        debug!(path = %self.dir.display(), "bundle prepared");
        Ok(())
    }

    /// Write a text artifact, replacing any previous content.
    pub fn write_text(&self, relative: &str, content: &str) -> Result<()> {
        let path = self.path(relative);
        std::fs::write(&path, content).map_err(|e| fatal_io(&path, e))
    }

    /// Append one timestamped line to `download.log`. `stage` of `None` marks job-level events.
    pub fn log(&self, stage: Option<Stage>, message: &str) -> Result<()> {
        let scope = stage.map_or("job", |s| s.as_str());
        let mut entry = String::new();
        for line in message.lines().filter(|l| !l.trim().is_empty()) {
            entry.push_str(&format!(
                "{} [{scope}] {}\n",
                Utc::now().format("%Y-%m-%d %H:%M:%S"),
                line.trim_end()
            ));
        }
        if entry.is_empty() {
            return Ok(());
        }

        let path = self.path(LOG_FILE);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| fatal_io(&path, e))?;
        file.write_all(entry.as_bytes())
            .map_err(|e| fatal_io(&path, e))
    }

    /// Persist `record` as `job.json` via temp file and rename.
    pub fn write_record(&self, record: &JobRecord) -> Result<()> {
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| HarvesterError::fatal(format!("job record serialization failed: {e}")))?;

        let target = self.path(RECORD_FILE);
        let temp = self.path(format!(".{RECORD_FILE}.tmp"));
        std::fs::write(&temp, json).map_err(|e| fatal_io(&temp, e))?;
        std::fs::rename(&temp, &target).map_err(|e| fatal_io(&target, e))?;

        debug!(path = %target.display(), status = %record.status, "job record written");
        Ok(())
    }
}

/// Read a persisted Job Record from a bundle directory or a `job.json` path.
pub fn read_record(path: &Path) -> Result<JobRecord> {
    let file = if path.is_dir() {
        path.join(RECORD_FILE)
    } else {
        path.to_path_buf()
    };
    let content = std::fs::read_to_string(&file).map_err(|e| HarvesterError::io(&file, e))?;
    serde_json::from_str(&content)
        .map_err(|e| HarvesterError::parse(format!("invalid {}: {e}", file.display())))
}

fn fatal_io(path: &Path, e: std::io::Error) -> HarvesterError {
    HarvesterError::fatal(format!("{}: {e}", path.display()))
}
