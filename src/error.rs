//! Error taxonomy shared across the ingestion pipeline.
//!
//! Two layers: [`IngestError`] is what callers of the pipeline see, and is
//! fatal to the current operation. [`FetchError`] classifies per-video
//! download failures; those stay contained to their video and only surface
//! through the batch summary.

use thiserror::Error;

/// Operation-level failures. Only discovery problems (a reference that
/// cannot be resolved, a primary listing that cannot be enumerated) abort
/// a batch; everything else degrades to per-video accounting.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The channel reference did not match any recognized shape. Raised
    /// before any network traffic happens.
    #[error(
        "invalid channel reference `{0}`; expected a handle (@name), a channel id, \
         a playlist id, or a youtube.com URL for one of those"
    )]
    InvalidReferenceFormat(String),

    /// The reference looked valid but did not resolve to a channel.
    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    /// The primary video listing could not be enumerated.
    #[error("could not enumerate videos for {0}")]
    EnumerationFailed(String),

    /// Storage and other internal failures, propagated verbatim.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Broad classification of a failed fetch attempt. Drives the backoff
/// policy and the wording of the terminal diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// HTTP 429 or a platform throttling signal. Waits much longer than
    /// the standard backoff before the next attempt.
    RateLimited,
    /// HTTP 403 or an explicit block. Retried on the standard schedule;
    /// terminal failures carry guidance because these rarely fix themselves.
    AccessDenied,
    /// Timeouts, 5xx responses, connection resets.
    Transient,
}

/// A classified failure from one download attempt.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("{0}")]
    Transient(String),
}

impl FetchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::RateLimited(_) => FailureKind::RateLimited,
            FetchError::AccessDenied(_) => FailureKind::AccessDenied,
            FetchError::Transient(_) => FailureKind::Transient,
        }
    }
}

/// Hints attached to a video once its retry budget is exhausted. Mirrors
/// the advice the platform's error pages give for each failure class.
pub fn diagnostic_guidance(kind: FailureKind) -> Option<&'static str> {
    match kind {
        FailureKind::AccessDenied => Some(
            "the platform refused the request; try fewer parallel jobs, wait a few \
             minutes, or check whether the video is region-locked",
        ),
        FailureKind::RateLimited => {
            Some("rate limit exhausted; reduce --jobs or wait before re-running")
        }
        FailureKind::Transient => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_error_kinds_round_trip() {
        assert_eq!(
            FetchError::RateLimited("429".into()).kind(),
            FailureKind::RateLimited
        );
        assert_eq!(
            FetchError::AccessDenied("403".into()).kind(),
            FailureKind::AccessDenied
        );
        assert_eq!(
            FetchError::Transient("timeout".into()).kind(),
            FailureKind::Transient
        );
    }

    #[test]
    fn guidance_exists_for_terminal_blocks() {
        assert!(diagnostic_guidance(FailureKind::AccessDenied).is_some());
        assert!(diagnostic_guidance(FailureKind::RateLimited).is_some());
        assert!(diagnostic_guidance(FailureKind::Transient).is_none());
    }
}
