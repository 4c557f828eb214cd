//! Bounded-concurrency caption fetching with classified retries.
//!
//! Each video becomes one [`FetchTask`]. A fixed pool of workers (a
//! semaphore over spawned tasks) downloads caption streams into the
//! staging directory; results flow back over a channel to a single
//! collector, so no worker ever touches shared mutable state. A task that
//! exhausts its retries is reported and never aborts its siblings.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, warn};

use crate::error::{FailureKind, FetchError, diagnostic_guidance};

/// One unit of work: download captions for one video. Lives only for the
/// duration of a batch; nothing here is ever persisted.
#[derive(Debug, Clone)]
pub struct FetchTask {
    pub video_id: String,
    pub video_url: String,
    pub language: String,
    pub attempt: u32,
    pub last_error: Option<FailureKind>,
}

impl FetchTask {
    pub fn new(video_id: &str, language: &str) -> Self {
        Self {
            video_id: video_id.to_owned(),
            video_url: format!("https://www.youtube.com/watch?v={video_id}"),
            language: language.to_owned(),
            attempt: 0,
            last_error: None,
        }
    }
}

/// Minimal per-video metadata fetched alongside the caption stream.
#[derive(Debug, Clone)]
pub struct VideoMeta {
    pub title: String,
    pub upload_date: Option<String>,
    pub channel_id: Option<String>,
}

/// A successfully staged caption stream plus its metadata sidecar.
#[derive(Debug, Clone)]
pub struct FetchedCaptions {
    pub caption_path: PathBuf,
    pub meta: VideoMeta,
}

/// The caption/metadata retrieval capability. The production
/// implementation shells out to yt-dlp; tests substitute scripted fakes.
#[async_trait]
pub trait CaptionSource: Send + Sync {
    /// Downloads the task's caption stream and metadata into `staging`.
    /// `Ok(None)` means the video legitimately has no captions; that is
    /// not a failure and consumes no retry budget.
    async fn fetch(
        &self,
        task: &FetchTask,
        staging: &Path,
    ) -> Result<Option<FetchedCaptions>, FetchError>;
}

/// Retry/backoff knobs. Defaults follow the platform's tolerance: three
/// attempts, exponential backoff from two seconds, rate limits waiting
/// five times as long as ordinary failures.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub rate_limit_factor: u32,
    pub attempt_timeout: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(2),
            rate_limit_factor: 5,
            attempt_timeout: Duration::from_secs(120),
        }
    }
}

/// Terminal state of one task after the pool has drained.
#[derive(Debug)]
pub enum TaskOutcome {
    /// Captions staged and ready for parsing.
    Fetched {
        task: FetchTask,
        captions: FetchedCaptions,
    },
    /// The video has no caption stream; recorded as skipped.
    NoCaptions { task: FetchTask },
    /// Retry budget exhausted; carries the last classified error.
    Failed {
        task: FetchTask,
        error: FetchError,
        guidance: Option<&'static str>,
    },
}

/// Fixed-size worker pool over a set of fetch tasks.
pub struct FetchPool {
    source: Arc<dyn CaptionSource>,
    jobs: usize,
    policy: FetchPolicy,
}

impl FetchPool {
    pub fn new(source: Arc<dyn CaptionSource>, jobs: usize, policy: FetchPolicy) -> Self {
        Self {
            source,
            jobs: jobs.max(1),
            policy,
        }
    }

    /// Runs every task to a terminal state and returns all outcomes. Tasks
    /// complete in arbitrary order; at most `jobs` fetches are in flight
    /// at any moment. Workers report through a channel to this single
    /// collector loop; the pool itself holds no locks.
    pub async fn run(&self, tasks: Vec<FetchTask>, staging: &Path) -> Vec<TaskOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.jobs));
        let (tx, mut rx) = mpsc::channel(self.jobs);
        let total = tasks.len();

        for mut task in tasks {
            let source = Arc::clone(&self.source);
            let policy = self.policy.clone();
            let staging = staging.to_path_buf();
            let semaphore = Arc::clone(&semaphore);
            let tx = tx.clone();

            tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                let outcome = run_task(source.as_ref(), &mut task, &staging, &policy).await;
                if tx.send(outcome).await.is_err() {
                    warn!("fetch collector dropped before all workers finished");
                }
            });
        }
        drop(tx);

        let mut outcomes = Vec::with_capacity(total);
        while let Some(outcome) = rx.recv().await {
            outcomes.push(outcome);
        }
        outcomes
    }
}

/// Drives one task through its bounded retry loop.
async fn run_task(
    source: &dyn CaptionSource,
    task: &mut FetchTask,
    staging: &Path,
    policy: &FetchPolicy,
) -> TaskOutcome {
    let mut delay = policy.base_delay;

    loop {
        task.attempt += 1;
        let attempt = tokio::time::timeout(policy.attempt_timeout, source.fetch(task, staging));
        let result = match attempt.await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Transient(format!(
                "attempt timed out after {:?}",
                policy.attempt_timeout
            ))),
        };

        match result {
            Ok(Some(captions)) => {
                debug!(video_id = %task.video_id, attempt = task.attempt, "captions staged");
                return TaskOutcome::Fetched {
                    task: task.clone(),
                    captions,
                };
            }
            Ok(None) => {
                debug!(video_id = %task.video_id, "no captions published");
                return TaskOutcome::NoCaptions { task: task.clone() };
            }
            Err(error) => {
                let kind = error.kind();
                task.last_error = Some(kind);

                if task.attempt >= policy.attempts {
                    warn!(
                        video_id = %task.video_id,
                        attempts = task.attempt,
                        %error,
                        "giving up on video"
                    );
                    return TaskOutcome::Failed {
                        task: task.clone(),
                        guidance: diagnostic_guidance(kind),
                        error,
                    };
                }

                let wait = match kind {
                    FailureKind::RateLimited => delay * policy.rate_limit_factor,
                    _ => delay,
                };
                warn!(
                    video_id = %task.video_id,
                    attempt = task.attempt,
                    wait_secs = wait.as_secs_f64(),
                    %error,
                    "fetch attempt failed; backing off"
                );
                tokio::time::sleep(wait).await;
                delay *= 2;
            }
        }
    }
}

/// Maps the retrieval tool's stderr onto the failure taxonomy. The tool
/// forwards the platform's HTTP status codes in its error text.
pub fn classify_failure(stderr: &str) -> FetchError {
    let message = stderr.trim().to_owned();
    if message.contains("429") || message.contains("Too Many Requests") {
        FetchError::RateLimited(message)
    } else if message.contains("403") || message.contains("Forbidden") {
        FetchError::AccessDenied(message)
    } else {
        FetchError::Transient(message)
    }
}

/// Subset of the retrieval tool's `.info.json` sidecar we actually read.
#[derive(Debug, Deserialize)]
struct InfoSidecar {
    title: Option<String>,
    upload_date: Option<String>,
    channel_id: Option<String>,
}

/// Production caption source: invokes `yt-dlp` once per attempt, staging
/// one `<id>.<lang>.vtt` caption file and one `<id>.info.json` sidecar.
pub struct YtDlpSource {
    program: PathBuf,
}

impl Default for YtDlpSource {
    fn default() -> Self {
        Self {
            program: PathBuf::from("yt-dlp"),
        }
    }
}

impl YtDlpSource {
    /// Points the source at a different executable. Tests use this to run
    /// against stub scripts instead of the real tool.
    pub fn with_program(program: PathBuf) -> Self {
        Self { program }
    }

    /// Flat-playlist id listing; discovery's enumeration goes through
    /// this so the whole external surface lives behind one executable.
    pub async fn list_ids(&self, listing_url: &str) -> Result<Vec<String>> {
        list_video_ids(&self.program, listing_url).await
    }

    /// Runs `<program> --version` to fail loudly before a batch starts
    /// when the retrieval tool is missing entirely.
    pub async fn ensure_available(&self) -> Result<()> {
        let status = Command::new(&self.program)
            .arg("--version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await;
        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(_) => anyhow::bail!(
                "{} is installed but returned a failure status",
                self.program.display()
            ),
            Err(err) => anyhow::bail!(
                "{} is not installed or not in PATH: {}",
                self.program.display(),
                err
            ),
        }
    }

    fn staged_caption_file(&self, task: &FetchTask, staging: &Path) -> Option<PathBuf> {
        let preferred = staging.join(format!("{}.{}.vtt", task.video_id, task.language));
        if preferred.exists() {
            return Some(preferred);
        }

        // Language variants (en-US, en-GB) land under their full tag.
        let prefix = format!("{}.", task.video_id);
        let entries = std::fs::read_dir(staging).ok()?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&prefix) && name.ends_with(".vtt") {
                return Some(entry.path());
            }
        }
        None
    }

    fn read_sidecar(&self, task: &FetchTask, staging: &Path) -> VideoMeta {
        let sidecar_path = staging.join(format!("{}.info.json", task.video_id));
        let sidecar = std::fs::read_to_string(&sidecar_path)
            .ok()
            .and_then(|raw| serde_json::from_str::<InfoSidecar>(&raw).ok());

        match sidecar {
            Some(info) => VideoMeta {
                title: info
                    .title
                    .filter(|title| !title.is_empty())
                    .unwrap_or_else(|| task.video_id.clone()),
                upload_date: info.upload_date.as_deref().and_then(upload_date_to_iso),
                channel_id: info.channel_id,
            },
            None => {
                warn!(video_id = %task.video_id, "metadata sidecar missing; using bare id");
                VideoMeta {
                    title: task.video_id.clone(),
                    upload_date: None,
                    channel_id: None,
                }
            }
        }
    }
}

#[async_trait]
impl CaptionSource for YtDlpSource {
    async fn fetch(
        &self,
        task: &FetchTask,
        staging: &Path,
    ) -> Result<Option<FetchedCaptions>, FetchError> {
        let output_template = staging.join("%(id)s");
        let sub_langs = format!("{},-live_chat", task.language);

        let output = Command::new(&self.program)
            .arg("--skip-download")
            .arg("--write-subs")
            .arg("--write-auto-subs")
            .arg("--sub-format")
            .arg("vtt")
            .arg("--sub-langs")
            .arg(&sub_langs)
            .arg("--write-info-json")
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg("--output")
            .arg(output_template.as_os_str())
            .arg(&task.video_url)
            .output()
            .await
            .map_err(|err| FetchError::Transient(format!("could not run retrieval tool: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(&stderr));
        }

        // A clean exit with no caption file on disk means the video simply
        // has none published in the requested language.
        let Some(caption_path) = self.staged_caption_file(task, staging) else {
            return Ok(None);
        };

        Ok(Some(FetchedCaptions {
            meta: self.read_sidecar(task, staging),
            caption_path,
        }))
    }
}

/// Converts the retrieval tool's `YYYYMMDD` upload date into `YYYY-MM-DD`.
/// Dates that already carry dashes pass through after validation.
pub fn upload_date_to_iso(value: &str) -> Option<String> {
    let format = if value.contains('-') { "%Y-%m-%d" } else { "%Y%m%d" };
    NaiveDate::parse_from_str(value, format)
        .ok()
        .map(|date| date.format("%Y-%m-%d").to_string())
}

/// Lists video ids under a channel tab or playlist URL via the retrieval
/// tool's flat-playlist mode. Discovery calls this once per listing.
pub async fn list_video_ids(program: &Path, listing_url: &str) -> Result<Vec<String>> {
    let output = Command::new(program)
        .arg("--flat-playlist")
        .arg("--get-id")
        .arg("--no-warnings")
        .arg(listing_url)
        .output()
        .await
        .with_context(|| format!("retrieving listing from {listing_url}"))?;

    if !output.status.success() {
        anyhow::bail!(
            "failed to list videos for {} (status: {})",
            listing_url,
            output.status
        );
    }

    let content = String::from_utf8_lossy(&output.stdout);
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|id| id.to_owned())
        .collect())
}
