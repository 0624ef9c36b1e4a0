//! Per-job snapshot of the settings the stages read.

use harvester_shared::{BrowserOptions, ImageCaps, Platform, Settings, WhisperModel};

/// Everything the four stages need from [`Settings`], fixed when the job starts.
#[derive(Debug, Clone, PartialEq)]
pub struct JobPlan {
    pub platform: Platform,
    /// Whether transcription runs for this job.
    pub subtitles: bool,
    pub whisper_model: WhisperModel,
    pub max_concepts: usize,
    pub caps: ImageCaps,
    pub browser: BrowserOptions,
    pub wikipedia_fallback: bool,
}

impl JobPlan {
    pub fn new(settings: &Settings, platform: Platform) -> Self {
        Self {
            platform,
            subtitles: subtitles_enabled(settings, platform),
            whisper_model: settings.whisper_model,
            max_concepts: settings.max_concepts_per_srt,
            caps: settings.image_caps(),
            browser: settings.browser_options(),
            wikipedia_fallback: settings.wikipedia_fallback,
        }
    }
}

/// TikTok and Instagram always get subtitles; YouTube and everything else
/// only when switched on.
pub fn subtitles_enabled(settings: &Settings, platform: Platform) -> bool {
    match platform {
        Platform::Tiktok | Platform::Instagram => true,
        Platform::Youtube => settings.srt_youtube_enabled,
        Platform::Other => settings.srt_other_enabled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_form_platforms_always_transcribe() {
        let settings = Settings::default();
        assert!(subtitles_enabled(&settings, Platform::Tiktok));
        assert!(subtitles_enabled(&settings, Platform::Instagram));
        assert!(!subtitles_enabled(&settings, Platform::Youtube));
        assert!(!subtitles_enabled(&settings, Platform::Other));
    }

    #[test]
    fn youtube_and_other_follow_their_flags() {
        let settings = Settings {
            srt_youtube_enabled: true,
            srt_other_enabled: true,
            ..Settings::default()
        };
        assert!(subtitles_enabled(&settings, Platform::Youtube));
        assert!(subtitles_enabled(&settings, Platform::Other));
    }

    #[test]
    fn plan_copies_caps() {
        let settings = Settings {
            images_per_concept: 2,
            max_total_images: 7,
            max_concepts_per_srt: 4,
            ..Settings::default()
        };
        let plan = JobPlan::new(&settings, Platform::Tiktok);
        assert_eq!(plan.caps.per_concept, 2);
        assert_eq!(plan.caps.total, 7);
        assert_eq!(plan.max_concepts, 4);
        assert!(plan.subtitles);
    }
}
