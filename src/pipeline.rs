//! End-to-end orchestration of channel ingestion and refresh.
//!
//! One batch = resolve identity, enumerate the remote listing, reconcile
//! against local state, fetch what is missing through the bounded pool,
//! then parse and index sequentially. The staging directory is a
//! [`tempfile::TempDir`] owned by the batch, so it is removed on every
//! exit path. Re-running any batch is always safe: channel and video
//! inserts are idempotent and failed videos were never committed.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use crate::captions::parse_caption_stream;
use crate::discovery::{
    ChannelRef, DiscoverySession, VideoLister, enumerate_videos,
};
use crate::error::IngestError;
use crate::fetch::{CaptionSource, FetchPolicy, FetchPool, FetchTask, FetchedCaptions, TaskOutcome};
use crate::reconcile::plan_fetches;
use crate::store::{ChannelRecord, SubtitleStore, VideoRecord};

/// Batch-level knobs, resolved once by the caller.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub language: String,
    pub jobs: usize,
    pub policy: FetchPolicy,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            language: crate::config::DEFAULT_LANGUAGE.to_string(),
            jobs: crate::config::DEFAULT_JOBS,
            policy: FetchPolicy::default(),
        }
    }
}

/// Tri-count summary every batch ends with, successful or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub channel_id: String,
    /// Videos fetched, parsed, and committed this run.
    pub fetched: usize,
    /// Videos with no captions or with unparsable caption streams.
    pub skipped: usize,
    /// Videos whose retry budget ran out; eligible again on the next run.
    pub failed: usize,
}

impl IngestReport {
    fn empty(channel_id: &str) -> Self {
        Self {
            channel_id: channel_id.to_owned(),
            fetched: 0,
            skipped: 0,
            failed: 0,
        }
    }
}

enum IndexResult {
    Indexed,
    Unparsable,
}

/// The ingestion pipeline. Owns the store handle (it is the sole writer)
/// and shares the external capabilities behind trait objects so tests can
/// run it entirely offline.
pub struct IngestPipeline {
    store: SubtitleStore,
    session: DiscoverySession,
    captions: Arc<dyn CaptionSource>,
    lister: Arc<dyn VideoLister>,
    options: PipelineOptions,
}

impl IngestPipeline {
    pub fn new(
        store: SubtitleStore,
        session: DiscoverySession,
        captions: Arc<dyn CaptionSource>,
        lister: Arc<dyn VideoLister>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            store,
            session,
            captions,
            lister,
            options,
        }
    }

    pub fn store(&self) -> &SubtitleStore {
        &self.store
    }

    /// First-time ingestion of a channel or playlist reference. If the
    /// resolved channel is already indexed this silently becomes an
    /// update, so the command stays re-runnable.
    pub async fn ingest(&self, reference_input: &str) -> Result<IngestReport, IngestError> {
        let reference = ChannelRef::parse(reference_input)?;
        let resolved = self.session.resolve(&reference).await?;

        if self.store.channel_exists(&resolved.channel_id).await? {
            info!(
                channel = %resolved.channel_name,
                "channel already indexed; running an update instead"
            );
            return self.update(&resolved.channel_id).await;
        }

        let remote = enumerate_videos(self.lister.as_ref(), &resolved).await?;
        info!(
            channel = %resolved.channel_name,
            videos = remote.len(),
            "enumerated remote listing"
        );

        self.store
            .insert_channel(&ChannelRecord {
                channel_id: resolved.channel_id.clone(),
                channel_name: resolved.channel_name.clone(),
                channel_url: resolved.channel_url.clone(),
            })
            .await?;

        let plan = plan_fetches(&remote, &HashSet::new(), &self.options.language);
        self.run_batch(&resolved.channel_id, plan.tasks).await
    }

    /// Incremental refresh of an already-indexed channel. Computes the
    /// identifier-set difference against local state; an unchanged remote
    /// listing short-circuits to a zero report without fetching anything.
    pub async fn update(&self, channel_id: &str) -> Result<IngestReport, IngestError> {
        let Some(channel) = self.store.get_channel(channel_id).await? else {
            return Err(IngestError::ChannelNotFound(channel_id.to_owned()));
        };

        let reference = ChannelRef::parse(&channel.channel_url)?;
        let resolved = self.session.resolve(&reference).await?;
        if resolved.channel_name != channel.channel_name {
            self.store
                .refresh_channel_name(channel_id, &resolved.channel_name)
                .await?;
        }

        let remote = enumerate_videos(self.lister.as_ref(), &resolved).await?;
        let local = self.store.video_ids_for_channel(channel_id).await?;
        let plan = plan_fetches(&remote, &local, &self.options.language);

        for stale in &plan.missing_remotely {
            info!(video_id = %stale, "no longer listed remotely; keeping local copy");
        }

        if plan.is_empty() {
            info!(channel = %channel.channel_name, "no new videos to download");
            return Ok(IngestReport::empty(channel_id));
        }

        info!(
            channel = %channel.channel_name,
            videos = plan.tasks.len(),
            "found videos not yet in the database"
        );
        self.run_batch(channel_id, plan.tasks).await
    }

    /// Refreshes every stored channel in turn. One channel's failure is
    /// logged and does not stop the rest.
    pub async fn update_all(&self) -> Result<Vec<(ChannelRecord, IngestReport)>, IngestError> {
        let channels = self.store.list_channels().await?;
        let mut reports = Vec::with_capacity(channels.len());
        for channel in channels {
            match self.update(&channel.channel_id).await {
                Ok(report) => reports.push((channel, report)),
                Err(err) => {
                    warn!(channel = %channel.channel_name, %err, "channel update failed");
                }
            }
        }
        Ok(reports)
    }

    /// Fetches the planned tasks, then parses and indexes each staged
    /// caption stream. Indexing only ever starts for a video whose fetch
    /// fully succeeded; everything else lands in the skip/fail counts.
    async fn run_batch(
        &self,
        channel_id: &str,
        tasks: Vec<FetchTask>,
    ) -> Result<IngestReport, IngestError> {
        let mut report = IngestReport::empty(channel_id);
        if tasks.is_empty() {
            return Ok(report);
        }

        // The TempDir guard removes staged files on every exit path,
        // including the error returns below.
        let staging = tempfile::tempdir().context("creating staging directory")?;
        let pool = FetchPool::new(
            Arc::clone(&self.captions),
            self.options.jobs,
            self.options.policy.clone(),
        );
        let outcomes = pool.run(tasks, staging.path()).await;

        for outcome in outcomes {
            match outcome {
                TaskOutcome::Fetched { task, captions } => {
                    match self.index_fetched(channel_id, &task, &captions).await {
                        Ok(IndexResult::Indexed) => report.fetched += 1,
                        Ok(IndexResult::Unparsable) => report.skipped += 1,
                        Err(err) => {
                            warn!(video_id = %task.video_id, %err, "indexing failed");
                            report.failed += 1;
                        }
                    }
                }
                TaskOutcome::NoCaptions { task } => {
                    info!(video_id = %task.video_id, "no captions; skipped");
                    report.skipped += 1;
                }
                TaskOutcome::Failed {
                    task,
                    error,
                    guidance,
                } => {
                    warn!(video_id = %task.video_id, %error, "video permanently failed");
                    if let Some(guidance) = guidance {
                        info!(video_id = %task.video_id, "{guidance}");
                    }
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Parses one staged caption stream and commits the video with all of
    /// its segments in a single store transaction.
    async fn index_fetched(
        &self,
        channel_id: &str,
        task: &FetchTask,
        captions: &FetchedCaptions,
    ) -> Result<IndexResult, IngestError> {
        let raw = tokio::fs::read_to_string(&captions.caption_path)
            .await
            .with_context(|| {
                format!("reading staged captions {}", captions.caption_path.display())
            })?;

        let segments = parse_caption_stream(&raw);
        if segments.is_empty() {
            warn!(video_id = %task.video_id, "caption stream unparsable; contributes no segments");
            return Ok(IndexResult::Unparsable);
        }

        let record = VideoRecord {
            video_id: task.video_id.clone(),
            video_title: captions.meta.title.clone(),
            video_url: format!("https://youtu.be/{}", task.video_id),
            upload_date: captions.meta.upload_date.clone(),
            channel_id: channel_id.to_owned(),
        };

        self.store.index_video(&record, &segments).await?;
        info!(
            video_id = %task.video_id,
            segments = segments.len(),
            "video indexed"
        );
        Ok(IndexResult::Indexed)
    }
}
