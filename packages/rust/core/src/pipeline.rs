//! Pipeline engine: Download → Transcribe → Concept-Extract → Image-Fetch for one job.

use std::time::Instant;

use tracing::{error, info, instrument, warn};

use harvester_collectors::Collaborators;
use harvester_shared::{
    HarvesterError, JobId, JobRecord, JobStatus, Result, Settings, Stage, StageOutcome,
};

use crate::bundle::JobBundle;
use crate::plan::JobPlan;
use crate::stages::{ConceptStage, DownloadStage, ImageStage, StageAbort, TranscribeStage};

/// Progress callbacks for front ends.
pub trait JobObserver: Send + Sync {
    /// Called when a job enters the queue.
    fn job_queued(&self, record: &JobRecord);
    /// Called when a job starts running.
    fn job_started(&self, record: &JobRecord);
    /// Called before a stage executes (not for skipped stages).
    fn stage_started(&self, id: JobId, stage: Stage);
    /// Called after a stage outcome has been recorded and persisted.
    fn stage_finished(&self, record: &JobRecord, stage: Stage);
    /// Called once the job has its terminal status.
    fn job_finished(&self, record: &JobRecord);
}

/// No-op observer for headless/test usage.
pub struct SilentObserver;

impl JobObserver for SilentObserver {
    fn job_queued(&self, _record: &JobRecord) {}
    fn job_started(&self, _record: &JobRecord) {}
    fn stage_started(&self, _id: JobId, _stage: Stage) {}
    fn stage_finished(&self, _record: &JobRecord, _stage: Stage) {}
    fn job_finished(&self, _record: &JobRecord) {}
}

/// Why a job stopped early: a fatal error, and the stage it interrupted with
/// whatever that stage had saved.
struct JobAbort {
    error: HarvesterError,
    in_flight: Option<(Stage, Vec<String>)>,
}

impl JobAbort {
    fn during(stage: Stage) -> impl FnOnce(StageAbort) -> JobAbort {
        move |abort| JobAbort {
            in_flight: Some((stage, abort.artifacts)),
            ..JobAbort::from(abort.error)
        }
    }
}

impl From<HarvesterError> for JobAbort {
    fn from(error: HarvesterError) -> Self {
        let error = if error.is_fatal() {
            error
        } else {
            HarvesterError::fatal(error.to_string())
        };
        Self {
            error,
            in_flight: None,
        }
    }
}

/// Runs the four stages for one job at a time.
pub struct Engine {
    download: DownloadStage,
    transcribe: TranscribeStage,
    concepts: ConceptStage,
    images: ImageStage,
}

impl Engine {
    pub fn new(collaborators: Collaborators) -> Self {
        Self {
            download: DownloadStage::new(collaborators.downloader),
            transcribe: TranscribeStage::new(collaborators.transcriber),
            concepts: ConceptStage::new(collaborators.tagger),
            images: ImageStage::new(collaborators.image_search, collaborators.image_downloader),
        }
    }

    /// Run every stage for `record` and return its terminal status.
    ///
    /// Stage failures are recorded, never returned. A fatal bundle error
    /// records the interrupted stage as failed with its partial artifacts,
    /// the remaining stages as skipped, and yields `failed`.
    /// `record` must be `queued` or `running`.
    #[instrument(skip_all, fields(job = %record.id, platform = %record.platform))]
    pub async fn run(
        &self,
        record: &mut JobRecord,
        settings: &Settings,
        observer: &dyn JobObserver,
    ) -> JobStatus {
        let start = Instant::now();
        if record.status == JobStatus::Queued {
            if let Err(e) = record.transition(JobStatus::Running) {
                warn!(error = %e, "could not mark job running");
            }
        }
        observer.job_started(record);

        let plan = JobPlan::new(settings, record.platform);
        let bundle = JobBundle::new(record.output_dir.clone());

        let status = match self.run_stages(record, &plan, &bundle, observer).await {
            Ok(()) => record.derive_status(),
            Err(abort) => {
                let e = abort.error;
                error!(error = %e, "job aborted");
                if let Some((stage, artifacts)) = abort.in_flight {
                    let failed = StageOutcome::Failed {
                        error: e.to_string(),
                        artifacts,
                    };
                    let _ = record.record_stage(stage, failed);
                }
                for stage in Stage::ALL {
                    if record.outcome(stage).is_none() {
                        let skipped = StageOutcome::skipped(format!("job aborted: {e}"));
                        let _ = record.record_stage(stage, skipped);
                    }
                }
                JobStatus::Failed
            }
        };

        if let Err(e) = record.transition(status) {
            warn!(error = %e, "could not set final status");
        }

        let _ = bundle.log(None, &format!("job finished: {status}"));
        if let Err(e) = bundle.write_record(record) {
            error!(error = %e, "final job record could not be written");
            // An unpersisted job counts as failed.
            record.status = JobStatus::Failed;
        }

        info!(
            status = %record.status,
            elapsed_ms = start.elapsed().as_millis(),
            "job complete"
        );
        observer.job_finished(record);
        record.status
    }

    async fn run_stages(
        &self,
        record: &mut JobRecord,
        plan: &JobPlan,
        bundle: &JobBundle,
        observer: &dyn JobObserver,
    ) -> std::result::Result<(), JobAbort> {
        bundle.prepare(record)?;
        bundle.log(
            None,
            &format!(
                "job {} started: {} source(s), platform {}",
                record.id,
                record.sources.len(),
                record.platform
            ),
        )?;
        bundle.write_record(record)?;

        // Download
        observer.stage_started(record.id, Stage::Download);
        let (outcome, videos) = self
            .download
            .run(&record.sources, bundle)
            .await
            .map_err(JobAbort::during(Stage::Download))?;
        finish(record, bundle, observer, Stage::Download, outcome)?;

        if videos.is_empty() {
            for stage in [Stage::Transcribe, Stage::ConceptExtract, Stage::ImageFetch] {
                let skipped = StageOutcome::skipped("no video downloaded");
                finish(record, bundle, observer, stage, skipped)?;
            }
            return Ok(());
        }

        // Transcribe
        if !plan.subtitles {
            let skipped =
                StageOutcome::skipped(format!("subtitles disabled for {}", plan.platform));
            finish(record, bundle, observer, Stage::Transcribe, skipped)?;
            for stage in [Stage::ConceptExtract, Stage::ImageFetch] {
                finish(record, bundle, observer, stage, StageOutcome::skipped("no transcript"))?;
            }
            return Ok(());
        }
        observer.stage_started(record.id, Stage::Transcribe);
        let (outcome, transcript) = self
            .transcribe
            .run(&videos, plan, bundle)
            .await
            .map_err(JobAbort::during(Stage::Transcribe))?;
        finish(record, bundle, observer, Stage::Transcribe, outcome)?;

        // Concept-Extract
        observer.stage_started(record.id, Stage::ConceptExtract);
        let (outcome, concepts) = self
            .concepts
            .run(&transcript, plan, bundle)
            .await
            .map_err(JobAbort::during(Stage::ConceptExtract))?;
        finish(record, bundle, observer, Stage::ConceptExtract, outcome)?;

        // Image-Fetch
        observer.stage_started(record.id, Stage::ImageFetch);
        let outcome = self
            .images
            .run(&concepts, plan, bundle)
            .await
            .map_err(JobAbort::during(Stage::ImageFetch))?;
        finish(record, bundle, observer, Stage::ImageFetch, outcome)?;

        Ok(())
    }
}

/// Record, log, persist and announce one stage outcome.
fn finish(
    record: &mut JobRecord,
    bundle: &JobBundle,
    observer: &dyn JobObserver,
    stage: Stage,
    outcome: StageOutcome,
) -> Result<()> {
    let summary = match &outcome {
        StageOutcome::Skipped { reason } => format!("skipped: {reason}"),
        StageOutcome::Succeeded { artifacts } => format!("ok, {} artifact(s)", artifacts.len()),
        StageOutcome::Failed { error, artifacts } => {
            format!("failed with {} artifact(s): {error}", artifacts.len())
        }
    };
    info!(%stage, result = %summary, "stage finished");

    record.record_stage(stage, outcome)?;
    bundle.log(Some(stage), &summary)?;
    bundle.write_record(record)?;
    observer.stage_finished(record, stage);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    use async_trait::async_trait;
    use harvester_collectors::{DownloadedVideo, Transcriber, Transcript, VideoDownloader};
    use harvester_shared::{Platform, WhisperModel};

    use super::*;
    use crate::bundle::read_record;
    use crate::testing::*;

    /// Replace a job folder with a plain file so every later bundle write fails.
    fn clobber(dir: &Path) -> Result<()> {
        std::fs::remove_dir_all(dir).map_err(|e| HarvesterError::io(dir, e))?;
        std::fs::write(dir, b"gone").map_err(|e| HarvesterError::io(dir, e))
    }

    /// Saves the video, then loses the job folder.
    struct ClobberingDownloader;

    #[async_trait]
    impl VideoDownloader for ClobberingDownloader {
        async fn download(
            &self,
            _source: &str,
            dest_dir: &Path,
            stem: &str,
        ) -> Result<DownloadedVideo> {
            let path = dest_dir.join(format!("{stem}.mp4"));
            std::fs::write(&path, b"video").map_err(|e| HarvesterError::io(&path, e))?;
            clobber(dest_dir)?;
            Ok(DownloadedVideo {
                path,
                log: String::new(),
            })
        }
    }

    /// Loses the job folder, then reports a transcript.
    struct ClobberingTranscriber;

    #[async_trait]
    impl Transcriber for ClobberingTranscriber {
        async fn transcribe(&self, video: &Path, _model: WhisperModel) -> Result<Transcript> {
            if let Some(dir) = video.parent() {
                clobber(dir)?;
            }
            Ok(Transcript {
                srt: String::new(),
                text: "lava".into(),
            })
        }
    }

    fn job(root: &Path, platform: Platform, sources: &[&str]) -> JobRecord {
        JobRecord::new(
            sources.iter().map(|s| s.to_string()).collect(),
            platform,
            "Volcano Facts",
            "for the intro",
            root,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn one_failed_source_completes_with_errors() {
        let root = temp_root();
        let mut fakes = Fakes::new(FakeTagger::default());
        fakes.downloader = Arc::new(FakeDownloader {
            failing: HashSet::from(["https://youtu.be/B".to_string()]),
            ..FakeDownloader::default()
        });
        let engine = Engine::new(fakes.collaborators());
        let mut record = job(
            &root,
            Platform::Youtube,
            &["https://youtu.be/A", "https://youtu.be/B"],
        );

        let status = engine.run(&mut record, &settings(&root), &SilentObserver).await;

        assert_eq!(status, JobStatus::CompletedWithErrors);
        let download = record.outcome(Stage::Download).unwrap();
        assert_eq!(download.artifacts(), ["video_01.mp4".to_string()]);
        assert!(download.error().unwrap().starts_with("https://youtu.be/B: "));
        assert_eq!(
            *fakes.downloader.calls.lock().unwrap(),
            vec!["https://youtu.be/A", "https://youtu.be/B"]
        );
        // YouTube subtitles are off by default.
        assert!(!record.outcome(Stage::Transcribe).unwrap().attempted());
        assert!(!record.outcome(Stage::ImageFetch).unwrap().attempted());

        let persisted = read_record(&record.output_dir).unwrap();
        assert_eq!(persisted.status, JobStatus::CompletedWithErrors);
        assert_eq!(persisted.stage_results.len(), 4);
        let log = std::fs::read_to_string(record.output_dir.join("download.log")).unwrap();
        assert!(log.contains("failed https://youtu.be/B"));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn all_sources_failing_fails_the_job() {
        let root = temp_root();
        let mut fakes = Fakes::new(FakeTagger::default());
        fakes.downloader = Arc::new(FakeDownloader {
            failing: HashSet::from(["https://vm.tiktok.com/x".to_string()]),
            ..FakeDownloader::default()
        });
        let engine = Engine::new(fakes.collaborators());
        let mut record = job(&root, Platform::Tiktok, &["https://vm.tiktok.com/x"]);

        let status = engine.run(&mut record, &settings(&root), &SilentObserver).await;

        assert_eq!(status, JobStatus::Failed);
        for stage in [Stage::Transcribe, Stage::ConceptExtract, Stage::ImageFetch] {
            assert!(!record.outcome(stage).unwrap().attempted(), "{stage}");
        }
        assert_eq!(fakes.search.opens.load(Ordering::SeqCst), 0);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn clean_tiktok_job_completes() {
        let root = temp_root();
        let fakes = Fakes::new(FakeTagger::with(&[("lava", 2), ("crater", 1)]));
        let engine = Engine::new(fakes.collaborators());
        let mut record = job(&root, Platform::Tiktok, &["https://www.tiktok.com/@a/video/1"]);

        let status = engine.run(&mut record, &settings(&root), &SilentObserver).await;

        assert_eq!(status, JobStatus::Completed);
        assert_eq!(
            record.outcome(Stage::Download).unwrap().artifacts(),
            ["video.mp4".to_string()]
        );
        assert_eq!(
            record.outcome(Stage::Transcribe).unwrap().artifacts(),
            ["transcript.srt".to_string(), "transcript.txt".to_string()]
        );
        assert_eq!(
            record.outcome(Stage::ConceptExtract).unwrap().artifacts(),
            ["lava".to_string(), "crater".to_string()]
        );
        let images = record.outcome(Stage::ImageFetch).unwrap().artifacts();
        assert_eq!(images.len(), 6);
        assert_eq!(images[0], "images/lava/001.jpg");
        assert_eq!(images[5], "images/crater/003.jpg");
        assert!(record.output_dir.join("images/crater/003.jpg").exists());
        assert!(record.output_dir.join("transcript.srt").exists());
        assert_eq!(fakes.search.opens.load(Ordering::SeqCst), 1);
        assert_eq!(fakes.search.closes.load(Ordering::SeqCst), 1);
        assert!(record.started_at.is_some() && record.finished_at.is_some());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn global_image_cap_stops_fetching() {
        let root = temp_root();
        let fakes = Fakes::new(FakeTagger::with(&[("a", 2), ("b", 1)]));
        let engine = Engine::new(fakes.collaborators());
        let settings = Settings {
            images_per_concept: 3,
            max_total_images: 5,
            ..settings(&root)
        };
        let mut record = job(&root, Platform::Instagram, &["https://instagram.com/p/1"]);

        let status = engine.run(&mut record, &settings, &SilentObserver).await;

        assert_eq!(status, JobStatus::Completed);
        let images = record.outcome(Stage::ImageFetch).unwrap().artifacts();
        assert_eq!(images.len(), 5);
        assert_eq!(images.iter().filter(|p| p.starts_with("images/b/")).count(), 2);
        // No fetch is issued once the cap is hit, and nothing is fetched twice.
        let fetched = fakes.images.fetched();
        assert_eq!(fetched.len(), 5);
        assert_eq!(fetched.iter().collect::<HashSet<_>>().len(), 5);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn duplicate_and_broken_urls_are_skipped() {
        let root = temp_root();
        let mut fakes = Fakes::new(FakeTagger::with(&[("lava", 1)]));
        fakes.images = Arc::new(FakeImageDownloader {
            failing: HashSet::from(["https://img.test/lava/0.jpg".to_string()]),
            ..FakeImageDownloader::default()
        });
        let engine = Engine::new(fakes.collaborators());
        let mut record = job(&root, Platform::Tiktok, &["https://tiktok.com/v/1"]);

        let status = engine.run(&mut record, &settings(&root), &SilentObserver).await;

        assert_eq!(status, JobStatus::Completed);
        assert_eq!(
            fakes.images.fetched(),
            vec![
                "https://img.test/lava/0.jpg",
                "https://img.test/lava/1.jpg",
                "https://img.test/lava/2.jpg",
                "https://img.test/lava/3.jpg",
            ]
        );
        assert_eq!(
            record.outcome(Stage::ImageFetch).unwrap().artifacts(),
            [
                "images/lava/001.jpg".to_string(),
                "images/lava/002.jpg".to_string(),
                "images/lava/003.jpg".to_string(),
            ]
        );

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn wikipedia_query_fills_shortfall() {
        let root = temp_root();
        let mut fakes = Fakes::new(FakeTagger::with(&[("obsidian", 1)]));
        fakes.search = Arc::new(FakeSearch {
            results: vec![("obsidian".into(), 1)],
            default_results: 10,
            ..FakeSearch::default()
        });
        let engine = Engine::new(fakes.collaborators());
        let mut record = job(&root, Platform::Tiktok, &["https://tiktok.com/v/1"]);

        engine.run(&mut record, &settings(&root), &SilentObserver).await;

        assert_eq!(record.outcome(Stage::ImageFetch).unwrap().artifacts().len(), 3);
        assert_eq!(
            *fakes.search.queries.lock().unwrap(),
            vec!["obsidian", "obsidian Wikipedia"]
        );

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn fallback_can_be_disabled() {
        let root = temp_root();
        let mut fakes = Fakes::new(FakeTagger::with(&[("obsidian", 1)]));
        fakes.search = Arc::new(FakeSearch {
            results: vec![("obsidian".into(), 1)],
            ..FakeSearch::default()
        });
        let engine = Engine::new(fakes.collaborators());
        let settings = Settings {
            wikipedia_fallback: false,
            ..settings(&root)
        };
        let mut record = job(&root, Platform::Tiktok, &["https://tiktok.com/v/1"]);

        let status = engine.run(&mut record, &settings, &SilentObserver).await;

        assert_eq!(status, JobStatus::Completed);
        assert_eq!(record.outcome(Stage::ImageFetch).unwrap().artifacts().len(), 1);
        assert_eq!(*fakes.search.queries.lock().unwrap(), vec!["obsidian"]);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn tagger_failure_leaves_images_with_nothing_to_do() {
        let root = temp_root();
        let fakes = Fakes::new(FakeTagger {
            fail: true,
            ..FakeTagger::default()
        });
        let engine = Engine::new(fakes.collaborators());
        let mut record = job(&root, Platform::Tiktok, &["https://tiktok.com/v/1"]);

        let status = engine.run(&mut record, &settings(&root), &SilentObserver).await;

        assert_eq!(status, JobStatus::CompletedWithErrors);
        let concepts = record.outcome(Stage::ConceptExtract).unwrap();
        assert!(concepts.attempted() && !concepts.succeeded());
        let images = record.outcome(Stage::ImageFetch).unwrap();
        assert!(images.succeeded());
        assert!(images.artifacts().is_empty());
        assert_eq!(fakes.search.opens.load(Ordering::SeqCst), 0);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn transcription_failure_still_runs_concepts_on_empty_text() {
        let root = temp_root();
        let mut fakes = Fakes::new(FakeTagger::default());
        fakes.transcriber = Arc::new(FakeTranscriber {
            text: String::new(),
            fail: true,
        });
        let engine = Engine::new(fakes.collaborators());
        let mut record = job(&root, Platform::Tiktok, &["https://tiktok.com/v/1"]);

        let status = engine.run(&mut record, &settings(&root), &SilentObserver).await;

        assert_eq!(status, JobStatus::CompletedWithErrors);
        assert!(!record.outcome(Stage::Transcribe).unwrap().succeeded());
        assert_eq!(*fakes.tagger.seen_text.lock().unwrap(), vec![String::new()]);
        assert!(record.outcome(Stage::ConceptExtract).unwrap().succeeded());
        assert!(record.outcome(Stage::ImageFetch).unwrap().succeeded());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn unavailable_search_fails_only_image_stage() {
        let root = temp_root();
        let mut fakes = Fakes::new(FakeTagger::with(&[("lava", 1), ("ash", 1)]));
        fakes.search = Arc::new(FakeSearch {
            fail_open: true,
            ..FakeSearch::default()
        });
        let engine = Engine::new(fakes.collaborators());
        let mut record = job(&root, Platform::Tiktok, &["https://tiktok.com/v/1"]);

        let status = engine.run(&mut record, &settings(&root), &SilentObserver).await;

        assert_eq!(status, JobStatus::CompletedWithErrors);
        let images = record.outcome(Stage::ImageFetch).unwrap();
        assert!(images.error().unwrap().contains("image search unavailable"));
        assert!(record.outcome(Stage::ConceptExtract).unwrap().succeeded());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn unusable_output_dir_is_fatal() {
        let root = temp_root();
        std::fs::create_dir_all(&root).unwrap();
        let blocker = root.join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let fakes = Fakes::new(FakeTagger::default());
        let engine = Engine::new(fakes.collaborators());
        let mut record = job(&blocker, Platform::Tiktok, &["https://tiktok.com/v/1"]);

        let status = engine.run(&mut record, &settings(&root), &SilentObserver).await;

        assert_eq!(status, JobStatus::Failed);
        assert_eq!(record.status, JobStatus::Failed);
        for stage in Stage::ALL {
            let outcome = record.outcome(stage).unwrap();
            assert!(!outcome.attempted(), "{stage}");
        }
        assert!(fakes.downloader.calls.lock().unwrap().is_empty());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn fatal_error_mid_stage_keeps_partial_artifacts() {
        let root = temp_root();
        let fakes = Fakes::new(FakeTagger::with(&[("lava", 1)]));
        let mut collaborators = fakes.collaborators();
        collaborators.downloader = Arc::new(ClobberingDownloader);
        let engine = Engine::new(collaborators);
        let mut record = job(&root, Platform::Tiktok, &["https://tiktok.com/v/1"]);

        let status = engine.run(&mut record, &settings(&root), &SilentObserver).await;

        assert_eq!(status, JobStatus::Failed);
        let download = record.outcome(Stage::Download).unwrap();
        assert!(download.attempted());
        assert!(!download.succeeded());
        assert_eq!(download.artifacts(), ["video.mp4".to_string()]);
        assert!(download.error().unwrap().starts_with("fatal job error"));
        for stage in [Stage::Transcribe, Stage::ConceptExtract, Stage::ImageFetch] {
            assert!(!record.outcome(stage).unwrap().attempted(), "{stage}");
        }

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn fatal_error_after_download_still_fails_the_job() {
        let root = temp_root();
        let fakes = Fakes::new(FakeTagger::with(&[("lava", 1)]));
        let mut collaborators = fakes.collaborators();
        collaborators.transcriber = Arc::new(ClobberingTranscriber);
        let engine = Engine::new(collaborators);
        let mut record = job(&root, Platform::Tiktok, &["https://tiktok.com/v/1"]);

        let status = engine.run(&mut record, &settings(&root), &SilentObserver).await;

        assert_eq!(status, JobStatus::Failed);
        assert_eq!(record.status, JobStatus::Failed);
        let download = record.outcome(Stage::Download).unwrap();
        assert!(download.succeeded());
        assert_eq!(download.artifacts(), ["video.mp4".to_string()]);
        let transcribe = record.outcome(Stage::Transcribe).unwrap();
        assert!(transcribe.attempted() && !transcribe.succeeded());
        assert!(transcribe.artifacts().is_empty());
        for stage in [Stage::ConceptExtract, Stage::ImageFetch] {
            assert!(!record.outcome(stage).unwrap().attempted(), "{stage}");
        }
        assert!(fakes.tagger.seen_text.lock().unwrap().is_empty());

        let _ = std::fs::remove_dir_all(&root);
    }
}
