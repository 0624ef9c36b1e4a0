//! In-memory collaborators for engine and scheduler tests.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use harvester_collectors::{
    Collaborators, DownloadedVideo, ImageDownloader, ImageSearchProvider, ImageSearchSession,
    TermCount, TermTagger, Transcriber, Transcript, VideoDownloader,
};
use harvester_shared::{BrowserOptions, HarvesterError, Result, Settings, WhisperModel};

pub fn temp_root() -> PathBuf {
    std::env::temp_dir().join(format!("harvester-core-{}", uuid::Uuid::now_v7()))
}

pub fn settings(root: &Path) -> Settings {
    Settings {
        output_dir: root.to_path_buf(),
        ..Settings::default()
    }
}

#[derive(Default)]
pub struct FakeDownloader {
    pub failing: HashSet<String>,
    pub calls: Mutex<Vec<String>>,
}

#[async_trait]
impl VideoDownloader for FakeDownloader {
    async fn download(&self, source: &str, dest_dir: &Path, stem: &str) -> Result<DownloadedVideo> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(source.to_string());
        if self.failing.contains(source) {
            return Err(HarvesterError::Tool("HTTP Error 404: Not Found".into()));
        }
        let path = dest_dir.join(format!("{stem}.mp4"));
        std::fs::write(&path, b"video").map_err(|e| HarvesterError::io(&path, e))?;
        Ok(DownloadedVideo {
            path,
            log: format!("[download] Destination: {stem}.mp4"),
        })
    }
}

pub struct FakeTranscriber {
    pub text: String,
    pub fail: bool,
}

impl FakeTranscriber {
    pub fn saying(text: &str) -> Self {
        Self {
            text: text.to_string(),
            fail: false,
        }
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, _video: &Path, _model: WhisperModel) -> Result<Transcript> {
        if self.fail {
            return Err(HarvesterError::Tool("`whisper` exited with code 1".into()));
        }
        Ok(Transcript {
            srt: format!("1\n00:00:00,000 --> 00:00:02,000\n{}\n\n", self.text),
            text: self.text.clone(),
        })
    }
}

#[derive(Default)]
pub struct FakeTagger {
    pub terms: Vec<TermCount>,
    pub fail: bool,
    pub seen_text: Mutex<Vec<String>>,
}

impl FakeTagger {
    pub fn with(terms: &[(&str, u32)]) -> Self {
        Self {
            terms: terms.iter().map(|(t, c)| TermCount::new(*t, *c)).collect(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl TermTagger for FakeTagger {
    async fn term_frequencies(&self, text: &str) -> Result<Vec<TermCount>> {
        self.seen_text
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(text.to_string());
        if self.fail {
            return Err(HarvesterError::Tool("tagger bridge: model missing".into()));
        }
        Ok(self.terms.clone())
    }
}

/// Search results keyed by query. Each URL is listed twice to exercise dedup.
#[derive(Default)]
pub struct FakeSearch {
    /// Number of distinct results per query; queries not listed get `default_results`.
    pub results: Vec<(String, usize)>,
    pub default_results: usize,
    pub fail_open: bool,
    pub opens: Arc<AtomicUsize>,
    pub closes: Arc<AtomicUsize>,
    pub queries: Arc<Mutex<Vec<String>>>,
}

impl FakeSearch {
    pub fn plenty() -> Self {
        Self {
            default_results: 20,
            ..Self::default()
        }
    }
}

#[async_trait]
impl ImageSearchProvider for FakeSearch {
    async fn open(&self, _options: &BrowserOptions) -> Result<Box<dyn ImageSearchSession>> {
        if self.fail_open {
            return Err(HarvesterError::Tool("failed to spawn browser bridge".into()));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            results: self.results.clone(),
            default_results: self.default_results,
            closes: self.closes.clone(),
            queries: self.queries.clone(),
        }))
    }
}

struct FakeSession {
    results: Vec<(String, usize)>,
    default_results: usize,
    closes: Arc<AtomicUsize>,
    queries: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ImageSearchSession for FakeSession {
    async fn search(&mut self, query: &str, limit: usize) -> Result<Vec<String>> {
        self.queries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(query.to_string());
        let n = self
            .results
            .iter()
            .find(|(q, _)| q == query)
            .map_or(self.default_results, |(_, n)| *n);
        let slug = query.replace(' ', "-");
        let mut urls = Vec::new();
        for i in 0..n {
            let url = format!("https://img.test/{slug}/{i}.jpg");
            urls.push(url.clone());
            urls.push(url);
        }
        urls.truncate(limit);
        Ok(urls)
    }

    async fn close(&mut self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeImageDownloader {
    pub failing: HashSet<String>,
    pub fetched: Arc<Mutex<Vec<String>>>,
}

impl FakeImageDownloader {
    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl ImageDownloader for FakeImageDownloader {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        self.fetched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(url.to_string());
        if self.failing.contains(url) {
            return Err(HarvesterError::Network(format!("GET {url}: HTTP 403")));
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| HarvesterError::io(parent, e))?;
        }
        std::fs::write(dest, vec![0u8; 2048]).map_err(|e| HarvesterError::io(dest, e))
    }
}

/// Handles to the fakes, kept alongside the [`Collaborators`] built from them.
pub struct Fakes {
    pub downloader: Arc<FakeDownloader>,
    pub transcriber: Arc<FakeTranscriber>,
    pub tagger: Arc<FakeTagger>,
    pub search: Arc<FakeSearch>,
    pub images: Arc<FakeImageDownloader>,
}

impl Fakes {
    pub fn new(tagger: FakeTagger) -> Self {
        Self {
            downloader: Arc::new(FakeDownloader::default()),
            transcriber: Arc::new(FakeTranscriber::saying("lava lava crater")),
            tagger: Arc::new(tagger),
            search: Arc::new(FakeSearch::plenty()),
            images: Arc::new(FakeImageDownloader::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            downloader: self.downloader.clone(),
            transcriber: self.transcriber.clone(),
            tagger: self.tagger.clone(),
            image_search: self.search.clone(),
            image_downloader: self.images.clone(),
        }
    }
}
