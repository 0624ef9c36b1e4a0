//! Video download via `yt-dlp`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, instrument};

use harvester_shared::{HarvesterError, Result};

use crate::tool::run_tool;

/// Extensions recognised as finished video files.
pub const VIDEO_EXTS: &[&str] = &["mp4", "mkv", "webm", "mov", "m4v"];

/// A video saved to disk, plus the tool's output for the job log.
#[derive(Debug, Clone)]
pub struct DownloadedVideo {
    pub path: PathBuf,
    pub log: String,
}

/// Fetches one source reference into `dest_dir`, naming the file `<stem>.<ext>`.
#[async_trait]
pub trait VideoDownloader: Send + Sync {
    async fn download(&self, source: &str, dest_dir: &Path, stem: &str)
    -> Result<DownloadedVideo>;
}

/// [`VideoDownloader`] backed by the `yt-dlp` command-line tool.
#[derive(Debug, Clone)]
pub struct YtDlp {
    program: String,
    timeout: Duration,
}

impl YtDlp {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    fn args(source: &str, dest_dir: &Path, stem: &str) -> Vec<String> {
        let template = dest_dir.join(format!("{stem}.%(ext)s"));
        vec![
            "--no-progress".into(),
            "--newline".into(),
            "--no-playlist".into(),
            "--restrict-filenames".into(),
            "--merge-output-format".into(),
            "mp4".into(),
            "-o".into(),
            template.to_string_lossy().into_owned(),
            source.to_string(),
        ]
    }
}

#[async_trait]
impl VideoDownloader for YtDlp {
    #[instrument(skip_all, fields(source))]
    async fn download(
        &self,
        source: &str,
        dest_dir: &Path,
        stem: &str,
    ) -> Result<DownloadedVideo> {
        let args = Self::args(source, dest_dir, stem);
        let output = run_tool(&self.program, &args, Some(dest_dir), self.timeout).await?;

        let path = find_video(dest_dir, stem)?.ok_or_else(|| {
            HarvesterError::Tool(format!("no video file named {stem}.* after downloading {source}"))
        })?;

        info!(path = %path.display(), "video downloaded");
        Ok(DownloadedVideo {
            path,
            log: output.output,
        })
    }
}

/// Find `<stem>.<video ext>` in `dir`, ignoring partial downloads.
pub fn find_video(dir: &Path, stem: &str) -> Result<Option<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| HarvesterError::io(dir, e))?;

    let mut found: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            let stem_matches = p.file_stem().and_then(|s| s.to_str()) == Some(stem);
            let ext_ok = p
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| VIDEO_EXTS.contains(&e.to_ascii_lowercase().as_str()));
            stem_matches && ext_ok
        })
        .collect();

    found.sort();
    Ok(found.into_iter().next())
}
