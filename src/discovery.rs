//! Resolves a channel or playlist reference to a stable identifier, a
//! display name, and the current video listing.
//!
//! Reference validation is pure and happens before any network traffic.
//! Resolution goes through the platform's public pages: the `og:url` meta
//! tag carries the canonical channel URL (and therefore the id), and the
//! channel's Atom feed carries the display name. Listings are enumerated
//! through the retrieval tool's flat-playlist mode.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use scraper::{Html, Selector};
use std::sync::OnceLock;
use tracing::{info, warn};
use url::Url;

use crate::error::IngestError;
use crate::fetch::YtDlpSource;

const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";

/// A validated channel or playlist reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRef {
    /// `@handle`, with the leading `@`.
    Handle(String),
    /// Platform-assigned channel id (`UC…`).
    ChannelId(String),
    /// Playlist id (`PL…` and friends).
    Playlist(String),
}

impl ChannelRef {
    /// Validates one of the recognized reference shapes. Anything else is
    /// rejected here, before the network layer is ever involved.
    pub fn parse(input: &str) -> Result<Self, IngestError> {
        let invalid = || IngestError::InvalidReferenceFormat(input.to_owned());
        let trimmed = input.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(invalid());
        }

        if let Some(handle) = trimmed.strip_prefix('@') {
            return if is_valid_handle(handle) {
                Ok(ChannelRef::Handle(format!("@{handle}")))
            } else {
                Err(invalid())
            };
        }
        if looks_like_channel_id(trimmed) {
            return Ok(ChannelRef::ChannelId(trimmed.to_owned()));
        }
        if looks_like_playlist_id(trimmed) {
            return Ok(ChannelRef::Playlist(trimmed.to_owned()));
        }

        let url = Url::parse(trimmed).map_err(|_| invalid())?;
        if !matches!(url.scheme(), "http" | "https") || !is_platform_host(&url) {
            return Err(invalid());
        }

        let segments: Vec<&str> = url
            .path_segments()
            .map(|segments| segments.filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        match segments.as_slice() {
            [handle, ..] if handle.starts_with('@') => {
                let name = handle.trim_start_matches('@');
                if is_valid_handle(name) {
                    Ok(ChannelRef::Handle(format!("@{name}")))
                } else {
                    Err(invalid())
                }
            }
            ["channel", id, ..] if looks_like_channel_id(id) => {
                Ok(ChannelRef::ChannelId((*id).to_owned()))
            }
            ["playlist"] => {
                let list = url
                    .query_pairs()
                    .find(|(key, _)| key == "list")
                    .map(|(_, value)| value.into_owned())
                    .filter(|id| looks_like_playlist_id(id));
                list.map(ChannelRef::Playlist).ok_or_else(invalid)
            }
            _ => Err(invalid()),
        }
    }

    /// Page fetched during resolution.
    pub fn page_url(&self) -> String {
        match self {
            ChannelRef::Handle(handle) => format!("https://www.youtube.com/{handle}"),
            ChannelRef::ChannelId(id) => format!("https://www.youtube.com/channel/{id}"),
            ChannelRef::Playlist(id) => format!("https://www.youtube.com/playlist?list={id}"),
        }
    }
}

fn is_valid_handle(handle: &str) -> bool {
    !handle.is_empty()
        && handle
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn looks_like_channel_id(value: &str) -> bool {
    value.len() == 24
        && value.starts_with("UC")
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
}

fn looks_like_playlist_id(value: &str) -> bool {
    let prefixed = ["PL", "UU", "FL", "OL"]
        .iter()
        .any(|prefix| value.starts_with(prefix));
    prefixed
        && value.len() >= 13
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
}

fn is_platform_host(url: &Url) -> bool {
    url.host_str()
        .is_some_and(|host| host == "youtube.com" || host.ends_with(".youtube.com"))
}

/// Output of a successful resolution: the identity persisted to the store
/// plus the listing URLs the enumeration step walks.
#[derive(Debug, Clone)]
pub struct ResolvedChannel {
    pub channel_id: String,
    pub channel_name: String,
    pub channel_url: String,
    pub primary_listing: String,
    /// Channels expose a secondary live/stream tab; playlists do not.
    pub streams_listing: Option<String>,
}

/// The list-enumeration capability. Production listing goes through the
/// retrieval tool; tests substitute fixed listings.
#[async_trait]
pub trait VideoLister: Send + Sync {
    async fn list(&self, listing_url: &str) -> Result<Vec<String>>;
}

#[async_trait]
impl VideoLister for YtDlpSource {
    async fn list(&self, listing_url: &str) -> Result<Vec<String>> {
        self.list_ids(listing_url).await
    }
}

fn consent_bl_regex() -> &'static Regex {
    static CONSENT_BL: OnceLock<Regex> = OnceLock::new();
    CONSENT_BL.get_or_init(|| {
        Regex::new(r#"<input type="hidden" name="bl" value="([^"]*)""#)
            .expect("consent form regex compiles")
    })
}

/// Pulls the consent form's opaque `bl` token out of the interstitial page.
fn consent_bl_value(body: &str) -> Option<String> {
    consent_bl_regex()
        .captures(body)
        .map(|captures| captures[1].to_owned())
}

fn is_consent_redirect(url: &Url) -> bool {
    url.host_str().is_some_and(|host| host.starts_with("consent."))
}

#[derive(Debug, Default)]
struct PageMeta {
    og_url: Option<String>,
    og_title: Option<String>,
}

/// Reads the `og:url` / `og:title` meta tags out of a channel page. Kept
/// synchronous: the parsed DOM must not live across an await point.
fn extract_page_meta(html: &str) -> PageMeta {
    let document = Html::parse_document(html);
    let meta_content = |property: &str| {
        let selector = Selector::parse(&format!(r#"meta[property="{property}"]"#))
            .expect("meta selector compiles");
        document
            .select(&selector)
            .next()
            .and_then(|element| element.value().attr("content"))
            .map(str::to_owned)
    };
    PageMeta {
        og_url: meta_content("og:url"),
        og_title: meta_content("og:title"),
    }
}

/// Last path segment of a canonical `…/channel/<id>` URL.
fn channel_id_from_canonical(canonical: &str) -> Option<String> {
    let url = Url::parse(canonical).ok()?;
    let id = url
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .next_back()?
        .to_owned();
    if looks_like_channel_id(&id) { Some(id) } else { None }
}

/// HTTP session used for first-party page and feed requests.
///
/// Regional deployments redirect the first request through a consent
/// interstitial; the session rejects it once, transparently, and keeps the
/// resulting cookie for the rest of its lifetime.
pub struct DiscoverySession {
    client: Client,
    consent_handled: AtomicBool,
}

impl DiscoverySession {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .cookie_store(true)
            .user_agent(USER_AGENT)
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("building discovery HTTP client")?;
        Ok(Self {
            client,
            consent_handled: AtomicBool::new(false),
        })
    }

    /// Resolves a validated reference into a stable identity. Network and
    /// lookup failures surface as [`IngestError::ChannelNotFound`].
    pub async fn resolve(&self, reference: &ChannelRef) -> Result<ResolvedChannel, IngestError> {
        let page_url = reference.page_url();
        let html = self.fetch_page(&page_url).await.map_err(|err| {
            warn!(%err, url = %page_url, "reference page could not be fetched");
            IngestError::ChannelNotFound(page_url.clone())
        })?;
        let meta = extract_page_meta(&html);

        match reference {
            ChannelRef::Playlist(id) => {
                let channel_name = meta.og_title.unwrap_or_else(|| id.clone());
                let channel_url = format!("https://www.youtube.com/playlist?list={id}");
                Ok(ResolvedChannel {
                    channel_id: id.clone(),
                    channel_name,
                    primary_listing: channel_url.clone(),
                    channel_url,
                    streams_listing: None,
                })
            }
            _ => {
                let canonical = meta
                    .og_url
                    .ok_or_else(|| IngestError::ChannelNotFound(page_url.clone()))?;
                let channel_id = channel_id_from_canonical(&canonical)
                    .ok_or_else(|| IngestError::ChannelNotFound(page_url.clone()))?;
                let channel_name = match self.channel_name_from_feed(&channel_id).await {
                    Some(name) => name,
                    None => meta.og_title.unwrap_or_else(|| channel_id.clone()),
                };
                Ok(ResolvedChannel {
                    channel_url: format!("https://www.youtube.com/channel/{channel_id}/videos"),
                    primary_listing: format!(
                        "https://www.youtube.com/channel/{channel_id}/videos"
                    ),
                    streams_listing: Some(format!(
                        "https://www.youtube.com/channel/{channel_id}/streams"
                    )),
                    channel_id,
                    channel_name,
                })
            }
        }
    }

    /// Fetches a page, detouring through the consent rejection flow at
    /// most once per session.
    async fn fetch_page(&self, url: &str) -> Result<String> {
        let response = self.client.get(url).send().await?;

        if is_consent_redirect(response.url())
            && !self.consent_handled.swap(true, Ordering::SeqCst)
        {
            info!("consent interstitial detected; rejecting once for this session");
            let body = response.text().await?;
            self.reject_consent(url, &body).await?;
            let retry = self.client.get(url).send().await?;
            return Ok(retry.error_for_status()?.text().await?);
        }

        Ok(response.error_for_status()?.text().await?)
    }

    /// Submits the interstitial's rejection form so subsequent requests
    /// reach the real pages.
    async fn reject_consent(&self, continue_url: &str, body: &str) -> Result<()> {
        let Some(bl) = consent_bl_value(body) else {
            // Unrecognized interstitial markup; the retry will tell us
            // whether the session cookie alone was enough.
            warn!("consent page had no recognizable form; continuing anyway");
            return Ok(());
        };
        let form = [
            ("gl", "DE"),
            ("pc", "yt"),
            ("continue", continue_url),
            ("x", "6"),
            ("bl", bl.as_str()),
            ("hl", "de"),
            ("set_eom", "true"),
        ];
        self.client
            .post("https://consent.youtube.com/save")
            .form(&form)
            .send()
            .await
            .context("submitting consent rejection")?;
        Ok(())
    }

    /// The channel's Atom feed carries a clean display name without any
    /// page scripting. Failures fall back to the page title.
    async fn channel_name_from_feed(&self, channel_id: &str) -> Option<String> {
        let feed_url =
            format!("https://www.youtube.com/feeds/videos.xml?channel_id={channel_id}");
        let bytes = self
            .client
            .get(&feed_url)
            .send()
            .await
            .ok()?
            .error_for_status()
            .ok()?
            .bytes()
            .await
            .ok()?;
        let feed = feed_rs::parser::parse(bytes.as_ref()).ok()?;
        feed.title.map(|title| title.content)
    }
}

/// Enumerates the complete current listing for a resolved channel: the
/// primary videos tab plus, where present, the live/stream tab, merged and
/// deduplicated with primary order preserved. Primary failure is fatal;
/// the secondary listing is best-effort.
pub async fn enumerate_videos(
    lister: &dyn VideoLister,
    channel: &ResolvedChannel,
) -> Result<Vec<String>, IngestError> {
    let mut ids = lister.list(&channel.primary_listing).await.map_err(|err| {
        warn!(%err, listing = %channel.primary_listing, "primary listing enumeration failed");
        IngestError::EnumerationFailed(channel.channel_id.clone())
    })?;

    let mut seen: HashSet<String> = ids.iter().cloned().collect();
    if let Some(streams_listing) = &channel.streams_listing {
        match lister.list(streams_listing).await {
            Ok(stream_ids) => {
                for id in stream_ids {
                    if seen.insert(id.clone()) {
                        ids.push(id);
                    }
                }
            }
            Err(err) => info!(%err, "no streams listing available"),
        }
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_references_parse() {
        for input in [
            "@TimDillonShow",
            "https://www.youtube.com/@TimDillonShow",
            "https://www.youtube.com/@TimDillonShow/videos",
            "https://www.youtube.com/@TimDillonShow/",
        ] {
            assert_eq!(
                ChannelRef::parse(input).unwrap(),
                ChannelRef::Handle("@TimDillonShow".into()),
                "failed for {input}"
            );
        }
    }

    #[test]
    fn channel_id_references_parse() {
        let id = "UCh7EqOZt7EvO2osuKbIlpGg";
        for input in [
            id.to_string(),
            format!("https://www.youtube.com/channel/{id}"),
            format!("https://www.youtube.com/channel/{id}/videos"),
        ] {
            assert_eq!(
                ChannelRef::parse(&input).unwrap(),
                ChannelRef::ChannelId(id.into()),
                "failed for {input}"
            );
        }
    }

    #[test]
    fn playlist_references_parse() {
        let id = "PLAEQD0ULngi69x_7JbQvSMprLRK_KSVLu";
        for input in [
            id.to_string(),
            format!("https://www.youtube.com/playlist?list={id}"),
        ] {
            assert_eq!(
                ChannelRef::parse(&input).unwrap(),
                ChannelRef::Playlist(id.into()),
                "failed for {input}"
            );
        }
    }

    #[test]
    fn unrecognized_references_are_rejected_without_network() {
        for input in [
            "",
            "just some words",
            "https://example.com/@NotTube",
            "https://vimeo.com/channel/UCh7EqOZt7EvO2osuKbIlpGg",
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://www.youtube.com/playlist",
            "UCtooShort",
            "@bad handle with spaces",
        ] {
            assert!(
                matches!(
                    ChannelRef::parse(input),
                    Err(IngestError::InvalidReferenceFormat(_))
                ),
                "expected rejection for {input:?}"
            );
        }
    }

    #[test]
    fn page_urls_match_reference_kind() {
        assert_eq!(
            ChannelRef::Handle("@chan".into()).page_url(),
            "https://www.youtube.com/@chan"
        );
        assert_eq!(
            ChannelRef::ChannelId("UCh7EqOZt7EvO2osuKbIlpGg".into()).page_url(),
            "https://www.youtube.com/channel/UCh7EqOZt7EvO2osuKbIlpGg"
        );
        assert_eq!(
            ChannelRef::Playlist("PLAEQD0ULngi69x_7".into()).page_url(),
            "https://www.youtube.com/playlist?list=PLAEQD0ULngi69x_7"
        );
    }

    #[test]
    fn page_meta_extraction_reads_og_tags() {
        let html = r#"
            <html><head>
            <meta property="og:title" content="Example Channel">
            <meta property="og:url" content="https://www.youtube.com/channel/UCh7EqOZt7EvO2osuKbIlpGg">
            </head><body></body></html>
        "#;
        let meta = extract_page_meta(html);
        assert_eq!(meta.og_title.as_deref(), Some("Example Channel"));
        assert_eq!(
            channel_id_from_canonical(meta.og_url.as_deref().unwrap()),
            Some("UCh7EqOZt7EvO2osuKbIlpGg".into())
        );
    }

    #[test]
    fn page_meta_extraction_tolerates_missing_tags() {
        let meta = extract_page_meta("<html><head></head></html>");
        assert!(meta.og_url.is_none());
        assert!(meta.og_title.is_none());
    }

    #[test]
    fn consent_form_token_is_extracted() {
        let body = r#"
            <form action="https://consent.youtube.com/save" method="POST">
            <input type="hidden" name="bl" value="boq_identityfrontend_20240101.00_p0">
            </form>
        "#;
        assert_eq!(
            consent_bl_value(body).as_deref(),
            Some("boq_identityfrontend_20240101.00_p0")
        );
        assert!(consent_bl_value("<html>no form here</html>").is_none());
    }

    #[test]
    fn consent_redirects_are_detected_by_host() {
        let consent = Url::parse("https://consent.youtube.com/m?continue=x").unwrap();
        let normal = Url::parse("https://www.youtube.com/@chan").unwrap();
        assert!(is_consent_redirect(&consent));
        assert!(!is_consent_redirect(&normal));
    }

    struct FixedLister {
        videos: Result<Vec<String>, String>,
        streams: Result<Vec<String>, String>,
    }

    #[async_trait]
    impl VideoLister for FixedLister {
        async fn list(&self, listing_url: &str) -> Result<Vec<String>> {
            let result = if listing_url.ends_with("/streams") {
                &self.streams
            } else {
                &self.videos
            };
            result
                .clone()
                .map_err(|message| anyhow::anyhow!("{message}"))
        }
    }

    fn resolved_channel() -> ResolvedChannel {
        ResolvedChannel {
            channel_id: "UCh7EqOZt7EvO2osuKbIlpGg".into(),
            channel_name: "Example".into(),
            channel_url: "https://www.youtube.com/channel/UCh7EqOZt7EvO2osuKbIlpGg/videos".into(),
            primary_listing: "https://www.youtube.com/channel/UCh7EqOZt7EvO2osuKbIlpGg/videos"
                .into(),
            streams_listing: Some(
                "https://www.youtube.com/channel/UCh7EqOZt7EvO2osuKbIlpGg/streams".into(),
            ),
        }
    }

    #[tokio::test]
    async fn listings_merge_and_deduplicate_preserving_primary_order() {
        let lister = FixedLister {
            videos: Ok(vec!["a".into(), "b".into(), "c".into()]),
            streams: Ok(vec!["b".into(), "d".into()]),
        };
        let ids = enumerate_videos(&lister, &resolved_channel()).await.unwrap();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn missing_streams_listing_is_not_an_error() {
        let lister = FixedLister {
            videos: Ok(vec!["a".into()]),
            streams: Err("no streams tab".into()),
        };
        let ids = enumerate_videos(&lister, &resolved_channel()).await.unwrap();
        assert_eq!(ids, vec!["a"]);
    }

    #[tokio::test]
    async fn primary_listing_failure_is_fatal() {
        let lister = FixedLister {
            videos: Err("blocked".into()),
            streams: Ok(vec![]),
        };
        let result = enumerate_videos(&lister, &resolved_channel()).await;
        assert!(matches!(result, Err(IngestError::EnumerationFailed(_))));
    }

    #[tokio::test]
    async fn playlists_have_no_streams_listing() {
        let lister = FixedLister {
            videos: Ok(vec!["a".into()]),
            streams: Ok(vec!["should-not-appear".into()]),
        };
        let mut channel = resolved_channel();
        channel.streams_listing = None;
        let ids = enumerate_videos(&lister, &channel).await.unwrap();
        assert_eq!(ids, vec!["a"]);
    }
}
