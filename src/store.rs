//! Subtitle persistence layer backed by a local SQLite database.
//!
//! The store is the sole writer of channel, video, and segment rows. The
//! fetch workers never touch it; the pipeline feeds it sequentially after
//! downloads finish, which removes write contention by construction. A
//! contentless-synced FTS5 table over the segment text is maintained with
//! triggers so the (out-of-scope) search layer gets matching for free.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use libsql::{Builder, Connection, Row, params};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::captions::Segment;

/// One content publisher. `channel_id` is the platform-assigned identifier
/// and never changes; the display name may be refreshed on update runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub channel_id: String,
    pub channel_name: String,
    pub channel_url: String,
}

/// One indexed video. Inserted exactly once per identifier; later insert
/// attempts are absorbed without touching the existing row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoRecord {
    pub video_id: String,
    pub video_title: String,
    pub video_url: String,
    pub upload_date: Option<String>,
    pub channel_id: String,
}

/// One persisted caption line, as exposed to the search/export layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub subtitle_id: i64,
    pub video_id: String,
    pub start_time: String,
    pub stop_time: String,
    pub text: String,
}

/// Outcome of an [`SubtitleStore::index_video`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    /// Video and all of its segments were committed.
    Indexed,
    /// The video id was already present; nothing was written.
    AlreadyPresent,
}

async fn configure_connection(conn: &Connection) -> Result<()> {
    // `PRAGMA journal_mode=WAL` yields a result row (the active mode), which
    // `execute_batch` rejects in this libsql version; issue it via `query` so
    // the returned row is handled. The mode is still applied identically.
    conn.query("PRAGMA journal_mode=WAL;", ()).await?;
    conn.execute_batch(
        r#"
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS channels (
            channel_id TEXT PRIMARY KEY,
            channel_name TEXT NOT NULL,
            channel_url TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS videos (
            video_id TEXT PRIMARY KEY,
            video_title TEXT NOT NULL,
            video_url TEXT NOT NULL,
            upload_date TEXT,
            channel_id TEXT NOT NULL REFERENCES channels(channel_id)
        );

        CREATE TABLE IF NOT EXISTS subtitles (
            subtitle_id INTEGER PRIMARY KEY AUTOINCREMENT,
            video_id TEXT NOT NULL REFERENCES videos(video_id),
            start_time TEXT NOT NULL,
            stop_time TEXT NOT NULL,
            text TEXT NOT NULL CHECK (text <> '')
        );

        CREATE INDEX IF NOT EXISTS idx_videos_channel ON videos(channel_id);
        CREATE INDEX IF NOT EXISTS idx_subtitles_video ON subtitles(video_id);

        CREATE VIRTUAL TABLE IF NOT EXISTS subtitles_fts USING fts5(
            text,
            content='subtitles',
            content_rowid='subtitle_id'
        );

        CREATE TRIGGER IF NOT EXISTS subtitles_fts_insert
        AFTER INSERT ON subtitles BEGIN
            INSERT INTO subtitles_fts(rowid, text)
            VALUES (new.subtitle_id, new.text);
        END;

        CREATE TRIGGER IF NOT EXISTS subtitles_fts_delete
        AFTER DELETE ON subtitles BEGIN
            INSERT INTO subtitles_fts(subtitles_fts, rowid, text)
            VALUES ('delete', old.subtitle_id, old.text);
        END;
        "#,
    )
    .await?;
    Ok(())
}

/// Wrapper around the SQLite connection that performs all reads and writes.
pub struct SubtitleStore {
    conn: Connection,
}

impl std::fmt::Debug for SubtitleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubtitleStore").finish_non_exhaustive()
    }
}

impl SubtitleStore {
    /// Opens (and if necessary creates) the database and ensures the
    /// expected schema exists.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening subtitle DB {}", path.display()))?;

        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }

    /// Inserts a channel row. Re-inserting an existing identifier is a
    /// silent no-op; returns whether a row was actually created.
    pub async fn insert_channel(&self, channel: &ChannelRecord) -> Result<bool> {
        let inserted = self
            .conn
            .execute(
                r#"
                INSERT INTO channels (channel_id, channel_name, channel_url)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(channel_id) DO NOTHING
                "#,
                params![
                    channel.channel_id.as_str(),
                    channel.channel_name.as_str(),
                    channel.channel_url.as_str(),
                ],
            )
            .await?;
        if inserted == 0 {
            debug!(channel_id = %channel.channel_id, "channel already present; insert absorbed");
        }
        Ok(inserted > 0)
    }

    /// Display names drift over time; identifiers never do.
    pub async fn refresh_channel_name(&self, channel_id: &str, name: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE channels SET channel_name = ?2 WHERE channel_id = ?1",
                params![channel_id, name],
            )
            .await?;
        Ok(())
    }

    pub async fn channel_exists(&self, channel_id: &str) -> Result<bool> {
        Ok(self.get_channel(channel_id).await?.is_some())
    }

    pub async fn get_channel(&self, channel_id: &str) -> Result<Option<ChannelRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT channel_id, channel_name, channel_url FROM channels WHERE channel_id = ?1",
                [channel_id],
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        Ok(Some(row_to_channel(&row)?))
    }

    pub async fn list_channels(&self) -> Result<Vec<ChannelRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT channel_id, channel_name, channel_url FROM channels ORDER BY channel_name",
                params![],
            )
            .await?;
        let mut channels = Vec::new();
        while let Some(row) = rows.next().await? {
            channels.push(row_to_channel(&row)?);
        }
        Ok(channels)
    }

    /// Persists one video and all of its segments in a single transaction.
    ///
    /// Either everything commits or nothing does; a half-indexed video
    /// would silently poison search results. When the video id is already
    /// present the whole call is a no-op; its segments were committed by
    /// whichever run inserted it.
    pub async fn index_video(
        &self,
        video: &VideoRecord,
        segments: &[Segment],
    ) -> Result<IndexOutcome> {
        let tx = self.conn.transaction().await?;

        let inserted = tx
            .execute(
                r#"
                INSERT INTO videos (video_id, video_title, video_url, upload_date, channel_id)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(video_id) DO NOTHING
                "#,
                params![
                    video.video_id.as_str(),
                    video.video_title.as_str(),
                    video.video_url.as_str(),
                    video.upload_date.as_deref(),
                    video.channel_id.as_str(),
                ],
            )
            .await?;

        if inserted == 0 {
            debug!(video_id = %video.video_id, "video already indexed; insert absorbed");
            tx.commit().await?;
            return Ok(IndexOutcome::AlreadyPresent);
        }

        for segment in segments {
            tx.execute(
                r#"
                INSERT INTO subtitles (video_id, start_time, stop_time, text)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![
                    video.video_id.as_str(),
                    segment.start.as_str(),
                    segment.stop.as_str(),
                    segment.text.as_str(),
                ],
            )
            .await
            .with_context(|| format!("inserting segments for {}", video.video_id))?;
        }

        tx.commit().await?;
        Ok(IndexOutcome::Indexed)
    }

    /// Identifiers already indexed for a channel; the reconciler diffs
    /// this against the remote listing.
    pub async fn video_ids_for_channel(&self, channel_id: &str) -> Result<HashSet<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT video_id FROM videos WHERE channel_id = ?1",
                [channel_id],
            )
            .await?;
        let mut ids = HashSet::new();
        while let Some(row) = rows.next().await? {
            ids.insert(row.get::<String>(0)?);
        }
        Ok(ids)
    }

    pub async fn count_videos(&self, channel_id: &str) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM videos WHERE channel_id = ?1",
                [channel_id],
            )
            .await?;
        let row = rows.next().await?.context("missing count row")?;
        Ok(row.get::<i64>(0)? as u64)
    }

    pub async fn videos_for_channel(&self, channel_id: &str) -> Result<Vec<VideoRecord>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT video_id, video_title, video_url, upload_date, channel_id
                FROM videos
                WHERE channel_id = ?1
                ORDER BY upload_date DESC, rowid DESC
                "#,
                [channel_id],
            )
            .await?;
        let mut videos = Vec::new();
        while let Some(row) = rows.next().await? {
            videos.push(row_to_video(&row)?);
        }
        Ok(videos)
    }

    /// Segments for one video in chronological order.
    pub async fn segments_for_video(&self, video_id: &str) -> Result<Vec<SegmentRecord>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT subtitle_id, video_id, start_time, stop_time, text
                FROM subtitles
                WHERE video_id = ?1
                ORDER BY start_time, subtitle_id
                "#,
                [video_id],
            )
            .await?;
        let mut segments = Vec::new();
        while let Some(row) = rows.next().await? {
            segments.push(row_to_segment(&row)?);
        }
        Ok(segments)
    }

    /// Full-text match over segment text, optionally scoped to a channel.
    /// Exposed read-only for the search layer; no ranking happens here.
    pub async fn search_segments(
        &self,
        query: &str,
        channel_id: Option<&str>,
    ) -> Result<Vec<SegmentRecord>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT s.subtitle_id, s.video_id, s.start_time, s.stop_time, s.text
                FROM subtitles_fts
                JOIN subtitles s ON s.subtitle_id = subtitles_fts.rowid
                JOIN videos v ON v.video_id = s.video_id
                WHERE subtitles_fts MATCH ?1
                  AND (?2 IS NULL OR v.channel_id = ?2)
                ORDER BY s.video_id, s.start_time
                "#,
                params![query, channel_id],
            )
            .await?;
        let mut segments = Vec::new();
        while let Some(row) = rows.next().await? {
            segments.push(row_to_segment(&row)?);
        }
        Ok(segments)
    }

    /// Removes a channel and everything it owns. Segments go first, then
    /// videos, then the channel row, all in one transaction, so the
    /// foreign-key constraints hold at every step. Returns whether the
    /// channel existed.
    pub async fn delete_channel(&self, channel_id: &str) -> Result<bool> {
        let tx = self.conn.transaction().await?;
        tx.execute(
            r#"
            DELETE FROM subtitles
            WHERE video_id IN (SELECT video_id FROM videos WHERE channel_id = ?1)
            "#,
            [channel_id],
        )
        .await?;
        tx.execute("DELETE FROM videos WHERE channel_id = ?1", [channel_id])
            .await?;
        let removed = tx
            .execute("DELETE FROM channels WHERE channel_id = ?1", [channel_id])
            .await?;
        tx.commit().await?;
        Ok(removed > 0)
    }
}

fn row_to_channel(row: &Row) -> Result<ChannelRecord> {
    Ok(ChannelRecord {
        channel_id: row.get(0)?,
        channel_name: row.get(1)?,
        channel_url: row.get(2)?,
    })
}

fn row_to_video(row: &Row) -> Result<VideoRecord> {
    Ok(VideoRecord {
        video_id: row.get(0)?,
        video_title: row.get(1)?,
        video_url: row.get(2)?,
        upload_date: row.get(3)?,
        channel_id: row.get(4)?,
    })
}

fn row_to_segment(row: &Row) -> Result<SegmentRecord> {
    Ok(SegmentRecord {
        subtitle_id: row.get(0)?,
        video_id: row.get(1)?,
        start_time: row.get(2)?,
        stop_time: row.get(3)?,
        text: row.get(4)?,
    })
}
