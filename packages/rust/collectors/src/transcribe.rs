//! Speech-to-text via the `whisper` CLI.
//!
//! Whisper is asked for its JSON output so both artifacts come from one run:
//! the SRT is rendered from the timed segments, the plain transcript is the
//! top-level `text` field.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};

use harvester_shared::{HarvesterError, Result, WhisperModel};

use crate::tool::run_tool;

/// Output of one transcription.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    /// SRT-formatted subtitles.
    pub srt: String,
    /// Plain transcript text.
    pub text: String,
}

/// Transcribes a local video file.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, video: &Path, model: WhisperModel) -> Result<Transcript>;
}

/// A timed segment from whisper's JSON output.
#[derive(Debug, Clone, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

#[derive(Debug, Deserialize)]
struct WhisperJson {
    #[serde(default)]
    text: String,
    #[serde(default)]
    segments: Vec<Segment>,
}

/// [`Transcriber`] backed by the openai-whisper command-line tool.
#[derive(Debug, Clone)]
pub struct WhisperCli {
    program: String,
    timeout: Duration,
    language: Option<String>,
}

impl WhisperCli {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
            language: None,
        }
    }

    /// Pin the spoken language instead of letting whisper detect it.
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub(crate) fn args(&self, video: &Path, model: WhisperModel, out_dir: &Path) -> Vec<String> {
        let mut args = vec![
            video.to_string_lossy().into_owned(),
            "--model".into(),
            model.as_str().into(),
            "--output_format".into(),
            "json".into(),
            "--output_dir".into(),
            out_dir.to_string_lossy().into_owned(),
            "--fp16".into(),
            "False".into(),
        ];
        if let Some(lang) = &self.language {
            args.push("--language".into());
            args.push(lang.clone());
        }
        args
    }
}

#[async_trait]
impl Transcriber for WhisperCli {
    #[instrument(skip_all, fields(video = %video.display(), model = %model))]
    async fn transcribe(&self, video: &Path, model: WhisperModel) -> Result<Transcript> {
        let scratch: PathBuf =
            std::env::temp_dir().join(format!("harvester-whisper-{}", uuid::Uuid::now_v7()));
        tokio::fs::create_dir_all(&scratch)
            .await
            .map_err(|e| HarvesterError::io(&scratch, e))?;

        let result = async {
            run_tool(&self.program, &self.args(video, model, &scratch), None, self.timeout)
                .await?;

            let stem = video
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| HarvesterError::parse("video path has no file stem"))?;
            let json_path = scratch.join(format!("{stem}.json"));
            let raw = tokio::fs::read_to_string(&json_path)
                .await
                .map_err(|e| HarvesterError::io(&json_path, e))?;
            parse_whisper_json(&raw)
        }
        .await;

        let _ = tokio::fs::remove_dir_all(&scratch).await;
        if let Ok(t) = &result {
            debug!(chars = t.text.len(), "transcription finished");
        }
        result
    }
}

/// Turn whisper's JSON output into a [`Transcript`].
pub fn parse_whisper_json(raw: &str) -> Result<Transcript> {
    let parsed: WhisperJson = serde_json::from_str(raw)
        .map_err(|e| HarvesterError::parse(format!("invalid whisper output: {e}")))?;

    let text = if parsed.text.trim().is_empty() {
        parsed
            .segments
            .iter()
            .map(|s| s.text.trim())
            .collect::<Vec<_>>()
            .join(" ")
    } else {
        parsed.text.trim().to_string()
    };

    Ok(Transcript {
        srt: segments_to_srt(&parsed.segments),
        text,
    })
}

/// Render segments as numbered SRT cues.
pub fn segments_to_srt(segments: &[Segment]) -> String {
    let mut out = String::new();
    for (i, seg) in segments.iter().enumerate() {
        let _ = write!(
            out,
            "{}\n{} --> {}\n{}\n\n",
            i + 1,
            format_srt_time(seg.start),
            format_srt_time(seg.end),
            seg.text.trim()
        );
    }
    out
}

/// Format seconds as `HH:MM:SS,mmm`.
pub fn format_srt_time(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let h = total_ms / 3_600_000;
    let m = (total_ms % 3_600_000) / 60_000;
    let s = (total_ms % 60_000) / 1000;
    let ms = total_ms % 1000;
    format!("{h:02}:{m:02}:{s:02},{ms:03}")
}
