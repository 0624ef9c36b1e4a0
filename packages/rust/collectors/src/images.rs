//! Image search and image download collaborators.
//!
//! Searching happens inside a session that lives for one job: it is opened
//! on the first concept, reused for the rest, and closed when the stage ends.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use harvester_shared::{BrowserOptions, HarvesterError, Result};

use crate::bridge::JsonLinesBridge;

/// Browser-like User-Agent; image hosts commonly refuse unknown clients.
const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Bodies at or below this size are placeholders or error pages.
const MIN_IMAGE_BYTES: usize = 1000;

/// Opens job-scoped image search sessions.
#[async_trait]
pub trait ImageSearchProvider: Send + Sync {
    async fn open(&self, options: &BrowserOptions) -> Result<Box<dyn ImageSearchSession>>;
}

/// An open search surface returning candidate full-size image URLs.
#[async_trait]
pub trait ImageSearchSession: Send {
    async fn search(&mut self, query: &str, limit: usize) -> Result<Vec<String>>;

    async fn close(&mut self) -> Result<()>;
}

/// Saves the image at `url` to `dest`.
#[async_trait]
pub trait ImageDownloader: Send + Sync {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Browser automation bridge
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum BrowserRequest<'a> {
    Open {
        visible: bool,
        profile_dir: Option<&'a Path>,
        max_scrolls: u32,
    },
    Search {
        query: &'a str,
        limit: usize,
    },
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    urls: Vec<String>,
}

/// Provider that drives a real browser through a JSON-lines helper process.
///
/// The helper gets one `open` request carrying the [`BrowserOptions`], then
/// one `search` request per query answered with `{"urls": [...]}`.
#[derive(Debug, Clone)]
pub struct BrowserBridge {
    command: Vec<String>,
    timeout: Duration,
}

impl BrowserBridge {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

#[async_trait]
impl ImageSearchProvider for BrowserBridge {
    #[instrument(skip_all, fields(visible = options.visible))]
    async fn open(&self, options: &BrowserOptions) -> Result<Box<dyn ImageSearchSession>> {
        let mut bridge = JsonLinesBridge::spawn("browser", &self.command, self.timeout).await?;
        let opened: Result<serde_json::Value> = bridge
            .request(&BrowserRequest::Open {
                visible: options.visible,
                profile_dir: options.profile_dir.as_deref(),
                max_scrolls: options.max_scrolls,
            })
            .await;
        if let Err(e) = opened {
            let _ = bridge.shutdown().await;
            return Err(e);
        }
        Ok(Box::new(BrowserSession {
            bridge: Some(bridge),
        }))
    }
}

struct BrowserSession {
    bridge: Option<JsonLinesBridge>,
}

#[async_trait]
impl ImageSearchSession for BrowserSession {
    async fn search(&mut self, query: &str, limit: usize) -> Result<Vec<String>> {
        let bridge = self
            .bridge
            .as_mut()
            .ok_or_else(|| HarvesterError::Tool("browser session already closed".into()))?;
        let response: SearchResponse = bridge
            .request(&BrowserRequest::Search { query, limit })
            .await?;
        Ok(dedup_http(response.urls, limit))
    }

    async fn close(&mut self) -> Result<()> {
        match self.bridge.take() {
            Some(bridge) => bridge.shutdown().await,
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// HTML results page scraping
// ---------------------------------------------------------------------------

/// Provider that fetches a search results page over HTTP and scrapes it.
#[derive(Debug, Clone)]
pub struct HtmlImageSearch {
    client: Client,
    url_template: String,
}

impl HtmlImageSearch {
    /// `url_template` must contain `{query}`, replaced by the form-encoded query.
    pub fn new(url_template: impl Into<String>, timeout: Duration) -> Result<Self> {
        let url_template = url_template.into();
        if !url_template.contains("{query}") {
            return Err(HarvesterError::config(format!(
                "image search url `{url_template}` has no {{query}} placeholder"
            )));
        }
        let client = Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(timeout)
            .build()
            .map_err(|e| HarvesterError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url_template,
        })
    }

    fn search_url(&self, query: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
        self.url_template.replace("{query}", &encoded)
    }
}

#[async_trait]
impl ImageSearchProvider for HtmlImageSearch {
    async fn open(&self, _options: &BrowserOptions) -> Result<Box<dyn ImageSearchSession>> {
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl ImageSearchSession for HtmlImageSearch {
    #[instrument(skip(self))]
    async fn search(&mut self, query: &str, limit: usize) -> Result<Vec<String>> {
        let url = self.search_url(query);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| HarvesterError::Network(format!("image search failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(HarvesterError::Network(format!(
                "image search returned HTTP {status}"
            )));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| HarvesterError::Network(format!("failed to read search page: {e}")))?;

        let urls = extract_image_urls(&body)?;
        debug!(found = urls.len(), "scraped search results");
        Ok(dedup_http(urls, limit))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| HarvesterError::parse(format!("bad selector `{css}`: {e}")))
}

#[derive(Debug, Deserialize)]
struct IuscMeta {
    murl: Option<String>,
}

/// Pull full-size image URLs out of a results page, best candidates first.
///
/// Order: `a.iusc[m]` metadata `murl`, then `img` `src`/`data-src` links,
/// then gstatic-hosted thumbnails as a last resort.
pub fn extract_image_urls(html: &str) -> Result<Vec<String>> {
    let doc = Html::parse_document(html);
    let mut primary = Vec::new();
    let mut thumbs = Vec::new();

    let iusc = selector("a.iusc[m]")?;
    for el in doc.select(&iusc) {
        let murl = el
            .value()
            .attr("m")
            .and_then(|m| serde_json::from_str::<IuscMeta>(m).ok())
            .and_then(|meta| meta.murl);
        if let Some(murl) = murl {
            primary.push(murl);
        }
    }

    let img = selector("img")?;
    for el in doc.select(&img) {
        for attr in ["src", "data-src"] {
            let Some(src) = el.value().attr(attr) else {
                continue;
            };
            if !src.starts_with("http") {
                continue;
            }
            if src.contains("gstatic.com") {
                thumbs.push(src.to_string());
            } else {
                primary.push(src.to_string());
            }
        }
    }

    primary.extend(thumbs);
    Ok(primary)
}

/// Keep http(s) URLs, drop repeats, stop at `limit`.
fn dedup_http(urls: Vec<String>, limit: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    urls.into_iter()
        .filter(|u| u.starts_with("http://") || u.starts_with("https://"))
        .filter(|u| seen.insert(u.clone()))
        .take(limit)
        .collect()
}

// ---------------------------------------------------------------------------
// HTTP image download
// ---------------------------------------------------------------------------

/// [`ImageDownloader`] over plain HTTP GET.
#[derive(Debug, Clone)]
pub struct HttpImageDownloader {
    client: Client,
}

impl HttpImageDownloader {
    pub fn new() -> Result<Self> {
        Self::with_timeout(Duration::from_secs(15))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(timeout)
            .build()
            .map_err(|e| HarvesterError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ImageDownloader for HttpImageDownloader {
    #[instrument(skip(self, dest), fields(dest = %dest.display()))]
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| HarvesterError::Network(format!("GET {url}: {e}")))?;

        if resp.status() != reqwest::StatusCode::OK {
            return Err(HarvesterError::Network(format!(
                "GET {url}: HTTP {}",
                resp.status()
            )));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| HarvesterError::Network(format!("GET {url}: {e}")))?;
        if bytes.len() <= MIN_IMAGE_BYTES {
            return Err(HarvesterError::Network(format!(
                "GET {url}: body too small ({} bytes)",
                bytes.len()
            )));
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| HarvesterError::io(parent, e))?;
        }
        tokio::fs::write(dest, &bytes)
            .await
            .map_err(|e| HarvesterError::io(dest, e))?;

        info!(bytes = bytes.len(), "image saved");
        Ok(())
    }
}

/// Where image `n` (1-based) of a concept goes, relative to the job directory.
pub fn image_relative_path(concept_dir: &str, n: usize) -> PathBuf {
    PathBuf::from("images")
        .join(concept_dir)
        .join(format!("{n:03}.jpg"))
}
