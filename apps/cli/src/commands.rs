//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use harvester_collectors::Collaborators;
use harvester_core::{Engine, JobObserver, Scheduler, read_record};
use harvester_shared::{
    JobId, JobRecord, JobStatus, Platform, Settings, Stage, StageOutcome,
    load_settings_or_default, load_settings_from, save_settings_to, settings_file_path,
};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// harvester: turn video links into transcripts and b-roll image folders.
#[derive(Parser)]
#[command(
    name = "harvester",
    version,
    about = "Download videos, transcribe them, and collect b-roll images for their key concepts.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Settings file (defaults to ~/.broll-harvester/settings.json).
    #[arg(long, env = "HARVESTER_SETTINGS", global = true)]
    pub settings: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Queue video links and process them until the queue is empty.
    Run {
        /// Video URLs.
        urls: Vec<String>,

        /// File with one URL per line (`#` starts a comment).
        #[arg(long)]
        links_file: Option<PathBuf>,

        /// tiktok, instagram, youtube or other (detected from the first URL if omitted).
        #[arg(short, long, value_parser = parse_platform)]
        platform: Option<Platform>,

        /// Topic used for the output folder name.
        #[arg(short, long, default_value = "")]
        topic: String,

        /// Free-form notes saved as notes.txt.
        #[arg(short, long, default_value = "")]
        notes: String,

        /// One job per URL instead of one job for all of them.
        #[arg(long)]
        split: bool,

        /// Output root (overrides the settings file).
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Show a finished or running job from its folder or job.json.
    Status {
        /// Job folder or path to job.json.
        path: PathBuf,

        /// Print the raw job.json.
        #[arg(long)]
        json: bool,
    },

    /// Settings management.
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

/// Settings subcommands.
#[derive(Subcommand)]
pub(crate) enum SettingsAction {
    /// Print the effective settings.
    Show,
    /// Write a settings file with defaults.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Print the settings file path.
    Path,
    /// Change one setting, e.g. `images_per_concept 5` or `tools.yt_dlp /opt/yt-dlp`.
    Set { key: String, value: String },
}

fn parse_platform(s: &str) -> std::result::Result<Platform, String> {
    s.parse::<Platform>().map_err(|e| e.to_string())
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "harvester=info",
        1 => "harvester=debug",
        _ => "harvester=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let settings_path = match cli.settings {
        Some(p) => p,
        None => settings_file_path()?,
    };

    match cli.command {
        Command::Run {
            urls,
            links_file,
            platform,
            topic,
            notes,
            split,
            out,
        } => {
            let request = RunRequest {
                urls,
                links_file,
                platform,
                topic,
                notes,
                split,
                out,
            };
            cmd_run(&settings_path, request).await
        }
        Command::Status { path, json } => cmd_status(&path, json),
        Command::Settings { action } => match action {
            SettingsAction::Show => cmd_settings_show(&settings_path),
            SettingsAction::Init { force } => cmd_settings_init(&settings_path, force),
            SettingsAction::Path => {
                println!("{}", settings_path.display());
                Ok(())
            }
            SettingsAction::Set { key, value } => cmd_settings_set(&settings_path, &key, &value),
        },
    }
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

struct RunRequest {
    urls: Vec<String>,
    links_file: Option<PathBuf>,
    platform: Option<Platform>,
    topic: String,
    notes: String,
    split: bool,
    out: Option<PathBuf>,
}

/// One job to enqueue.
#[derive(Debug, PartialEq)]
struct JobSpec {
    sources: Vec<String>,
    topic: String,
}

async fn cmd_run(settings_path: &Path, request: RunRequest) -> Result<()> {
    let mut sources = request.urls;
    if let Some(file) = &request.links_file {
        let content = std::fs::read_to_string(file)
            .map_err(|e| eyre!("cannot read links file '{}': {e}", file.display()))?;
        sources.extend(parse_links(&content));
    }
    let first = sources
        .iter()
        .find(|s| !s.trim().is_empty())
        .ok_or_else(|| eyre!("no URLs given: pass them as arguments or with --links-file"))?;

    let platform = request.platform.unwrap_or_else(|| Platform::detect(first));
    let sources = filter_platform(sources, platform);
    if sources.is_empty() {
        return Err(eyre!("none of the URLs belong to {platform}"));
    }

    let mut settings = load_settings_or_default(Some(settings_path));
    if let Some(out) = request.out {
        settings.output_dir = out;
    }

    let collaborators = Collaborators::from_tools(&settings.tools)?;
    let progress = Arc::new(CliProgress::new());
    let scheduler = Arc::new(Scheduler::new(
        Engine::new(collaborators),
        settings,
        progress.clone(),
    ));

    let mut ids: Vec<JobId> = Vec::new();
    for spec in plan_jobs(sources, &request.topic, request.split) {
        ids.push(scheduler.enqueue(spec.sources, platform, &spec.topic, &request.notes)?);
    }
    info!(jobs = ids.len(), %platform, "jobs queued");

    let stopper = scheduler.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current job");
            stopper.stop();
        }
    });

    scheduler.run_until_idle().await;
    ctrl_c.abort();
    progress.finish();

    let records = scheduler.jobs();
    println!();
    for record in &records {
        print_record(record);
    }

    let failed = records
        .iter()
        .filter(|r| r.status == JobStatus::Failed)
        .count();
    let unstarted = records
        .iter()
        .filter(|r| r.status == JobStatus::Queued)
        .count();
    if unstarted > 0 {
        println!("  {unstarted} job(s) not started (stopped).");
    }
    if failed > 0 {
        return Err(eyre!("{failed} of {} job(s) failed", records.len()));
    }
    Ok(())
}

/// Non-empty, non-comment lines of a links file.
fn parse_links(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(String::from)
        .collect()
}

/// Keep URLs belonging to `platform`, warning about the rest.
fn filter_platform(sources: Vec<String>, platform: Platform) -> Vec<String> {
    sources
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .filter(|s| {
            let keep = platform.matches(s);
            if !keep {
                warn!(url = %s, %platform, "skipping URL from another platform");
            }
            keep
        })
        .collect()
}

/// One job for all sources, or one per source with the topic numbered.
fn plan_jobs(sources: Vec<String>, topic: &str, split: bool) -> Vec<JobSpec> {
    if !split {
        return vec![JobSpec {
            sources,
            topic: topic.to_string(),
        }];
    }
    sources
        .into_iter()
        .enumerate()
        .map(|(i, source)| JobSpec {
            sources: vec![source],
            topic: if topic.trim().is_empty() {
                String::new()
            } else {
                format!("{topic} - {}", i + 1)
            },
        })
        .collect()
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

fn cmd_status(path: &Path, json: bool) -> Result<()> {
    let record = read_record(path)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        print_record(&record);
    }
    Ok(())
}

fn print_record(record: &JobRecord) {
    let title = if record.topic.is_empty() {
        record.platform.to_string()
    } else {
        record.topic.clone()
    };
    println!("  {title} [{}]", record.status);
    println!("    ID:      {}", record.id);
    println!("    Sources: {}", record.sources.len());
    println!("    Path:    {}", record.output_dir.display());
    for stage in Stage::ALL {
        let line = match record.outcome(stage) {
            None => "pending".to_string(),
            Some(outcome) => describe(outcome),
        };
        println!("    {:<16} {line}", format!("{stage}:"));
    }
    if let (Some(start), Some(end)) = (record.started_at, record.finished_at) {
        let secs = (end - start).num_milliseconds() as f64 / 1000.0;
        println!("    Time:    {secs:.1}s");
    }
    println!();
}

fn describe(outcome: &StageOutcome) -> String {
    match outcome {
        StageOutcome::Skipped { reason } => format!("skipped ({reason})"),
        StageOutcome::Succeeded { artifacts } => format!("ok, {} artifact(s)", artifacts.len()),
        StageOutcome::Failed { error, artifacts } => {
            format!("failed, {} artifact(s): {error}", artifacts.len())
        }
    }
}

// ---------------------------------------------------------------------------
// settings
// ---------------------------------------------------------------------------

fn cmd_settings_show(path: &Path) -> Result<()> {
    let settings = load_settings_or_default(Some(path));
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}

fn cmd_settings_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        println!(
            "Settings already exist at: {} (use --force to reset)",
            path.display()
        );
        return Ok(());
    }
    save_settings_to(path, &Settings::default())?;
    println!("Settings initialized at: {}", path.display());
    Ok(())
}

fn cmd_settings_set(path: &Path, key: &str, value: &str) -> Result<()> {
    let current = load_settings_from(path)?;
    let updated = apply_setting(&current, key, value)?;
    save_settings_to(path, &updated)?;
    println!("{key} updated in {}", path.display());
    Ok(())
}

/// Set a dotted `key` to `value`, parsed as JSON when possible, else as a string.
fn apply_setting(settings: &Settings, key: &str, value: &str) -> Result<Settings> {
    if !key_is_known(key) {
        return Err(eyre!("unknown setting '{key}'"));
    }
    let parsed: serde_json::Value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));

    let mut doc = serde_json::to_value(settings)?;
    let (section, field) = match key.split_once('.') {
        Some((section, field)) => (Some(section), field),
        None => (None, key),
    };
    let target = match section {
        Some(section) => doc.get_mut(section),
        None => Some(&mut doc),
    }
    .and_then(serde_json::Value::as_object_mut)
    .ok_or_else(|| eyre!("'{key}' does not name a setting"))?;
    target.insert(field.to_string(), parsed);

    let updated: Settings =
        serde_json::from_value(doc).map_err(|e| eyre!("invalid value for '{key}': {e}"))?;
    updated.validate()?;
    Ok(updated)
}

fn key_is_known(key: &str) -> bool {
    const KEYS: &[&str] = &[
        "whisper_model",
        "images_per_concept",
        "max_concepts_per_srt",
        "max_total_images",
        "max_scrolls_per_keyword",
        "use_visible_browser",
        "use_existing_chrome_profile",
        "chrome_profile_dir",
        "srt_youtube_enabled",
        "srt_other_enabled",
        "wikipedia_fallback",
        "output_dir",
        "tools.yt_dlp",
        "tools.whisper",
        "tools.whisper_language",
        "tools.tagger",
        "tools.browser_bridge",
        "tools.image_search_url",
        "tools.stage_timeout_secs",
    ];
    KEYS.contains(&key)
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Job progress on an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

fn short_id(id: JobId) -> String {
    let full = id.to_string();
    full[full.len().saturating_sub(8)..].to_string()
}

impl JobObserver for CliProgress {
    fn job_queued(&self, record: &JobRecord) {
        self.spinner.set_message(format!(
            "Queued {} ({} source(s))",
            short_id(record.id),
            record.sources.len()
        ));
    }

    fn job_started(&self, record: &JobRecord) {
        self.spinner.set_message(format!("[{}] starting", short_id(record.id)));
    }

    fn stage_started(&self, id: JobId, stage: Stage) {
        self.spinner.set_message(format!("[{}] {stage}...", short_id(id)));
    }

    fn stage_finished(&self, record: &JobRecord, stage: Stage) {
        if let Some(outcome) = record.outcome(stage) {
            self.spinner.println(format!(
                "  [{}] {stage}: {}",
                short_id(record.id),
                describe(outcome)
            ));
        }
    }

    fn job_finished(&self, record: &JobRecord) {
        self.spinner.println(format!(
            "  [{}] {} -> {}",
            short_id(record.id),
            record.status,
            record.output_dir.display()
        ));
    }
}
