//! The four stage executors.
//!
//! Each executor turns collaborator failures into a recorded [`StageOutcome`]
//! and hands its output to the next stage. The only error an executor returns
//! is fatal: the job bundle could not be written. It comes back as a
//! [`StageAbort`] carrying whatever the stage had already saved.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use harvester_collectors::{
    ImageDownloader, ImageSearchProvider, ImageSearchSession, TermTagger, Transcriber,
    VideoDownloader, image_relative_path,
};
use harvester_shared::{
    Concept, HarvesterError, Result, Stage, StageOutcome, safe_folder_name,
};

use crate::bundle::JobBundle;
use crate::concepts::select_concepts;
use crate::plan::JobPlan;

/// Multiplier on the number of images still needed when asking for candidates.
/// Many result URLs fail to download.
const CANDIDATE_FACTOR: usize = 4;

/// A fatal error raised while a stage was running.
#[derive(Debug)]
pub struct StageAbort {
    pub error: HarvesterError,
    /// Artifacts saved before the error.
    pub artifacts: Vec<String>,
}

pub type StageResult<T> = std::result::Result<T, StageAbort>;

fn abort_with(artifacts: Vec<String>) -> impl FnOnce(HarvesterError) -> StageAbort {
    move |error| StageAbort { error, artifacts }
}

/// `base` for a single item, `base_NN` when there are several.
fn numbered(base: &str, index: usize, count: usize) -> String {
    if count == 1 {
        base.to_string()
    } else {
        format!("{base}_{:02}", index + 1)
    }
}

fn outcome_from(artifacts: Vec<String>, errors: Vec<String>) -> StageOutcome {
    if errors.is_empty() {
        StageOutcome::Succeeded { artifacts }
    } else {
        StageOutcome::Failed {
            error: errors.join("; "),
            artifacts,
        }
    }
}

// ---------------------------------------------------------------------------
// Download
// ---------------------------------------------------------------------------

pub struct DownloadStage {
    downloader: Arc<dyn VideoDownloader>,
}

impl DownloadStage {
    pub fn new(downloader: Arc<dyn VideoDownloader>) -> Self {
        Self { downloader }
    }

    /// Download every source; one failing source does not stop the others.
    /// Returns the absolute paths of the saved videos.
    #[instrument(skip_all, fields(sources = sources.len()))]
    pub async fn run(
        &self,
        sources: &[String],
        bundle: &JobBundle,
    ) -> StageResult<(StageOutcome, Vec<PathBuf>)> {
        let mut artifacts = Vec::new();
        let result = self.download_all(sources, bundle, &mut artifacts).await;
        match result {
            Ok((videos, errors)) => Ok((outcome_from(artifacts, errors), videos)),
            Err(error) => Err(StageAbort { error, artifacts }),
        }
    }

    async fn download_all(
        &self,
        sources: &[String],
        bundle: &JobBundle,
        artifacts: &mut Vec<String>,
    ) -> Result<(Vec<PathBuf>, Vec<String>)> {
        let mut videos = Vec::new();
        let mut errors = Vec::new();

        for (i, source) in sources.iter().enumerate() {
            let stem = numbered("video", i, sources.len());
            bundle.log(Some(Stage::Download), &format!("downloading {source}"))?;

            match self.downloader.download(source, bundle.dir(), &stem).await {
                Ok(video) => {
                    let rel = bundle.relative(&video.path);
                    info!(%source, file = %rel, "source downloaded");
                    artifacts.push(rel.clone());
                    videos.push(video.path);
                    bundle.log(Some(Stage::Download), &video.log)?;
                    bundle.log(Some(Stage::Download), &format!("saved {rel}"))?;
                }
                Err(e) => {
                    warn!(%source, error = %e, "source failed to download");
                    bundle.log(Some(Stage::Download), &format!("failed {source}: {e}"))?;
                    errors.push(format!("{source}: {e}"));
                }
            }
        }

        Ok((videos, errors))
    }
}

// ---------------------------------------------------------------------------
// Transcribe
// ---------------------------------------------------------------------------

pub struct TranscribeStage {
    transcriber: Arc<dyn Transcriber>,
}

impl TranscribeStage {
    pub fn new(transcriber: Arc<dyn Transcriber>) -> Self {
        Self { transcriber }
    }

    /// Transcribe each video into `transcript[_NN].srt`; the combined text
    /// goes to `transcript.txt`. Returns the combined text, empty if every
    /// video failed.
    #[instrument(skip_all, fields(videos = videos.len(), model = %plan.whisper_model))]
    pub async fn run(
        &self,
        videos: &[PathBuf],
        plan: &JobPlan,
        bundle: &JobBundle,
    ) -> StageResult<(StageOutcome, String)> {
        let mut artifacts = Vec::new();
        let result = self.transcribe_all(videos, plan, bundle, &mut artifacts).await;
        match result {
            Ok((combined, errors)) => Ok((outcome_from(artifacts, errors), combined)),
            Err(error) => Err(StageAbort { error, artifacts }),
        }
    }

    async fn transcribe_all(
        &self,
        videos: &[PathBuf],
        plan: &JobPlan,
        bundle: &JobBundle,
        artifacts: &mut Vec<String>,
    ) -> Result<(String, Vec<String>)> {
        let mut texts = Vec::new();
        let mut errors = Vec::new();

        for (i, video) in videos.iter().enumerate() {
            let rel_video = bundle.relative(video);
            bundle.log(
                Some(Stage::Transcribe),
                &format!("transcribing {rel_video} with whisper {}", plan.whisper_model),
            )?;

            match self.transcriber.transcribe(video, plan.whisper_model).await {
                Ok(transcript) => {
                    let srt_name = format!("{}.srt", numbered("transcript", i, videos.len()));
                    bundle.write_text(&srt_name, &transcript.srt)?;
                    bundle.log(Some(Stage::Transcribe), &format!("saved {srt_name}"))?;
                    artifacts.push(srt_name);
                    if !transcript.text.trim().is_empty() {
                        texts.push(transcript.text);
                    }
                }
                Err(e) => {
                    warn!(video = %rel_video, error = %e, "transcription failed");
                    bundle.log(
                        Some(Stage::Transcribe),
                        &format!("failed {rel_video}: {e}"),
                    )?;
                    errors.push(format!("{rel_video}: {e}"));
                }
            }
        }

        let combined = texts.join("\n\n");
        if !artifacts.is_empty() {
            bundle.write_text("transcript.txt", &combined)?;
            artifacts.push("transcript.txt".to_string());
        }

        Ok((combined, errors))
    }
}

// ---------------------------------------------------------------------------
// Concept-Extract
// ---------------------------------------------------------------------------

pub struct ConceptStage {
    tagger: Arc<dyn TermTagger>,
}

impl ConceptStage {
    pub fn new(tagger: Arc<dyn TermTagger>) -> Self {
        Self { tagger }
    }

    /// Ask the tagger for term counts and keep the top `max_concepts`.
    /// Artifacts are the selected concept texts in rank order.
    #[instrument(skip_all, fields(chars = transcript.len(), cap = plan.max_concepts))]
    pub async fn run(
        &self,
        transcript: &str,
        plan: &JobPlan,
        bundle: &JobBundle,
    ) -> StageResult<(StageOutcome, Vec<Concept>)> {
        match self.tagger.term_frequencies(transcript).await {
            Ok(terms) => {
                let concepts = select_concepts(&terms, transcript, plan.max_concepts);
                let artifacts: Vec<String> = concepts.iter().map(|c| c.text.clone()).collect();
                bundle
                    .log(
                        Some(Stage::ConceptExtract),
                        &format!(
                            "{} candidate terms, selected {}: {}",
                            terms.len(),
                            artifacts.len(),
                            artifacts.join(", ")
                        ),
                    )
                    .map_err(abort_with(artifacts.clone()))?;
                Ok((StageOutcome::Succeeded { artifacts }, concepts))
            }
            Err(e) => {
                warn!(error = %e, "tagger failed");
                bundle
                    .log(Some(Stage::ConceptExtract), &format!("tagger failed: {e}"))
                    .map_err(abort_with(Vec::new()))?;
                Ok((
                    StageOutcome::Failed {
                        error: e.to_string(),
                        artifacts: Vec::new(),
                    },
                    Vec::new(),
                ))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Image-Fetch
// ---------------------------------------------------------------------------

pub struct ImageStage {
    search: Arc<dyn ImageSearchProvider>,
    downloader: Arc<dyn ImageDownloader>,
}

/// Running totals for one image-fetch stage.
#[derive(Default)]
struct ImageTally {
    artifacts: Vec<String>,
    errors: Vec<String>,
}

impl ImageTally {
    fn saved(&self) -> usize {
        self.artifacts.len()
    }
}

impl ImageStage {
    pub fn new(
        search: Arc<dyn ImageSearchProvider>,
        downloader: Arc<dyn ImageDownloader>,
    ) -> Self {
        Self { search, downloader }
    }

    /// Fetch images for each concept in order under the per-concept and job caps.
    ///
    /// The search session opens on the first concept and is closed before
    /// returning, whatever happened in between.
    #[instrument(skip_all, fields(concepts = concepts.len()))]
    pub async fn run(
        &self,
        concepts: &[Concept],
        plan: &JobPlan,
        bundle: &JobBundle,
    ) -> StageResult<StageOutcome> {
        if concepts.is_empty() {
            bundle
                .log(Some(Stage::ImageFetch), "no concepts, nothing to fetch")
                .map_err(abort_with(Vec::new()))?;
            return Ok(StageOutcome::Succeeded {
                artifacts: Vec::new(),
            });
        }

        let mut session: Option<Box<dyn ImageSearchSession>> = None;
        let mut tally = ImageTally::default();
        let result = self
            .fetch_all(&mut session, &mut tally, concepts, plan, bundle)
            .await;

        if let Some(mut open) = session {
            if let Err(e) = open.close().await {
                warn!(error = %e, "closing image search session failed");
            }
        }

        match result {
            Ok(()) => Ok(outcome_from(tally.artifacts, tally.errors)),
            Err(error) => Err(StageAbort {
                error,
                artifacts: tally.artifacts,
            }),
        }
    }

    async fn fetch_all(
        &self,
        session: &mut Option<Box<dyn ImageSearchSession>>,
        tally: &mut ImageTally,
        concepts: &[Concept],
        plan: &JobPlan,
        bundle: &JobBundle,
    ) -> Result<()> {
        let caps = plan.caps;
        let mut used_dirs: HashSet<String> = HashSet::new();

        for concept in concepts {
            if tally.saved() >= caps.total {
                bundle.log(
                    Some(Stage::ImageFetch),
                    &format!("job image cap of {} reached, stopping", caps.total),
                )?;
                break;
            }

            let dir_name = unique_dir(&mut used_dirs, &concept.text);
            let mut queries = vec![concept.text.clone()];
            if plan.wikipedia_fallback {
                queries.push(format!("{} Wikipedia", concept.text));
            }

            let mut seen: HashSet<String> = HashSet::new();
            let mut saved_here = 0usize;

            for (attempt, query) in queries.iter().enumerate() {
                let want = caps
                    .per_concept
                    .saturating_sub(saved_here)
                    .min(caps.total.saturating_sub(tally.saved()));
                if want == 0 {
                    break;
                }
                if attempt > 0 {
                    bundle.log(
                        Some(Stage::ImageFetch),
                        &format!("'{}' short by {want}, trying '{query}'", concept.text),
                    )?;
                }

                if session.is_none() {
                    match self.search.open(&plan.browser).await {
                        Ok(opened) => *session = Some(opened),
                        Err(e) => {
                            warn!(error = %e, "image search session failed to open");
                            bundle.log(
                                Some(Stage::ImageFetch),
                                &format!("search session failed to open: {e}"),
                            )?;
                            tally.errors.push(format!("image search unavailable: {e}"));
                            return Ok(());
                        }
                    }
                }
                let Some(open) = session.as_mut() else {
                    return Ok(());
                };

                let urls = match open.search(query, want * CANDIDATE_FACTOR).await {
                    Ok(urls) => urls,
                    Err(e) => {
                        warn!(%query, error = %e, "image search failed");
                        bundle.log(
                            Some(Stage::ImageFetch),
                            &format!("search '{query}' failed: {e}"),
                        )?;
                        tally.errors.push(format!("{}: {e}", concept.text));
                        continue;
                    }
                };
                debug!(%query, candidates = urls.len(), "search returned");

                for url in urls {
                    if saved_here >= caps.per_concept || tally.saved() >= caps.total {
                        break;
                    }
                    if !seen.insert(url.clone()) {
                        continue;
                    }

                    let rel = image_relative_path(&dir_name, saved_here + 1);
                    let dest = bundle.path(&rel);
                    match self.downloader.fetch(&url, &dest).await {
                        Ok(()) => {
                            saved_here += 1;
                            let rel = bundle.relative(&dest);
                            bundle.log(Some(Stage::ImageFetch), &format!("saved {rel} <- {url}"))?;
                            tally.artifacts.push(rel);
                        }
                        Err(e) => {
                            debug!(%url, error = %e, "image download skipped");
                            bundle.log(Some(Stage::ImageFetch), &format!("skipped {url}: {e}"))?;
                        }
                    }
                }
            }

            info!(
                concept = %concept.text,
                saved = saved_here,
                total = tally.saved(),
                "concept done"
            );
        }

        Ok(())
    }
}

/// Folder name for a concept, suffixed when two concepts sanitize alike.
fn unique_dir(used: &mut HashSet<String>, text: &str) -> String {
    let base = safe_folder_name(text);
    let mut candidate = base.clone();
    let mut n = 2;
    while !used.insert(candidate.clone()) {
        candidate = format!("{base}_{n}");
        n += 1;
    }
    candidate
}
