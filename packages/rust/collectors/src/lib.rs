//! Adapters to the external collaborators the pipeline drives.
//!
//! This crate provides:
//! - [`download`]: video download through `yt-dlp`
//! - [`transcribe`]: speech-to-text through the `whisper` CLI
//! - [`tagger`]: term-frequency extraction (built-in or an NLP helper process)
//! - [`images`]: image search sessions and HTTP image download
//! - [`bridge`]: the JSON-lines protocol used to talk to helper processes
//!
//! Every collaborator sits behind an object-safe async trait, so the engine
//! can hold them as `Arc<dyn ...>` and tests can substitute fakes.

pub mod bridge;
pub mod download;
pub mod images;
pub mod tagger;
pub mod tool;
pub mod transcribe;

use std::sync::Arc;
use std::time::Duration;

use harvester_shared::{Result, ToolSettings};

pub use bridge::JsonLinesBridge;
pub use download::{DownloadedVideo, VideoDownloader, YtDlp, find_video};
pub use images::{
    BrowserBridge, HtmlImageSearch, HttpImageDownloader, ImageDownloader, ImageSearchProvider,
    ImageSearchSession, extract_image_urls, image_relative_path,
};
pub use tagger::{BridgeTagger, FrequencyTagger, TermCount, TermTagger};
pub use tool::{ToolOutput, run_tool};
pub use transcribe::{Transcriber, Transcript, WhisperCli, format_srt_time, segments_to_srt};

/// Per-request bound for helper-process round trips and search page loads.
const SEARCH_TIMEOUT: Duration = Duration::from_secs(120);

/// The four collaborators one engine run needs.
#[derive(Clone)]
pub struct Collaborators {
    pub downloader: Arc<dyn VideoDownloader>,
    pub transcriber: Arc<dyn Transcriber>,
    pub tagger: Arc<dyn TermTagger>,
    pub image_search: Arc<dyn ImageSearchProvider>,
    pub image_downloader: Arc<dyn ImageDownloader>,
}

impl Collaborators {
    /// Build the production collaborators described by the `tools` settings.
    pub fn from_tools(tools: &ToolSettings) -> Result<Self> {
        let stage_timeout = Duration::from_secs(tools.stage_timeout_secs);

        let tagger: Arc<dyn TermTagger> = if tools.tagger.is_empty() {
            Arc::new(FrequencyTagger)
        } else {
            Arc::new(BridgeTagger::new(tools.tagger.clone(), stage_timeout))
        };

        let image_search: Arc<dyn ImageSearchProvider> = if tools.browser_bridge.is_empty() {
            Arc::new(HtmlImageSearch::new(
                tools.image_search_url.clone(),
                SEARCH_TIMEOUT,
            )?)
        } else {
            Arc::new(BrowserBridge::new(
                tools.browser_bridge.clone(),
                SEARCH_TIMEOUT,
            ))
        };

        Ok(Self {
            downloader: Arc::new(YtDlp::new(tools.yt_dlp.clone(), stage_timeout)),
            transcriber: Arc::new(whisper_cli(tools)),
            tagger,
            image_search,
            image_downloader: Arc::new(HttpImageDownloader::new()?),
        })
    }
}

fn whisper_cli(tools: &ToolSettings) -> WhisperCli {
    let cli = WhisperCli::new(
        tools.whisper.clone(),
        Duration::from_secs(tools.stage_timeout_secs),
    );
    match &tools.whisper_language {
        Some(language) if !language.trim().is_empty() => cli.with_language(language.trim()),
        _ => cli,
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
