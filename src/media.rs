use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tracing::{info, warn};

use crate::cache::{CacheLayout, ContentCache};
use crate::config::Config;
use crate::lyrics::{LyricsEvent, LyricsHub};
use crate::osd::{HelperLocator, OsdSupervisor};
use crate::registry::{is_local_id, LocalFileRegistry};

/// Result value handed back to callers (UI bindings, control API).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl ServiceResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
        }
    }

    pub fn ok_with(message: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data.into()),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}

/// The media cache and lyrics subsystem, constructed once at startup and
/// shared by handle.
#[derive(Clone)]
pub struct MediaCore {
    pub layout: Arc<CacheLayout>,
    pub cache: Arc<ContentCache>,
    pub registry: Arc<LocalFileRegistry>,
    pub hub: LyricsHub,
    pub osd: Arc<OsdSupervisor>,
}

impl MediaCore {
    pub async fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let layout = Arc::new(CacheLayout::new(&cfg.cache_root, cfg.bind.port()));
        let locator = HelperLocator::new(cfg.osd_helper.clone());
        Self::build(layout, cfg.download_timeout, locator).await
    }

    pub async fn build(
        layout: Arc<CacheLayout>,
        download_timeout: std::time::Duration,
        locator: HelperLocator,
    ) -> anyhow::Result<Self> {
        let cache = ContentCache::new(layout.clone(), download_timeout)
            .context("failed to set up content cache")?;
        let registry = LocalFileRegistry::load(layout.clone()).await;
        Ok(Self {
            layout,
            cache: Arc::new(cache),
            registry: Arc::new(registry),
            hub: LyricsHub::new(),
            osd: Arc::new(OsdSupervisor::new(locator)),
        })
    }

    /// Caches a remote track from its mirror list and answers with the local URL.
    pub async fn cache_audio_file(&self, track_id: &str, urls: &[String]) -> ServiceResponse {
        if track_id.trim().is_empty() {
            return ServiceResponse::fail("track id must not be empty");
        }
        if urls.is_empty() {
            return ServiceResponse::fail("mirror url list must not be empty");
        }

        let mirrors: Vec<String> = urls
            .iter()
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .collect();
        if mirrors.is_empty() {
            return ServiceResponse::fail("no usable mirror urls");
        }

        match self.cache.ensure_cached(track_id, &mirrors).await {
            Ok(url) => ServiceResponse::ok_with("cached", url),
            Err(e) => {
                warn!("cache: giving up on {track_id}: {e:#}");
                ServiceResponse::fail(format!("cache failed: {e:#}"))
            }
        }
    }

    /// Local URL for an id if one can be produced without a download.
    pub async fn get_cached_url(&self, track_id: &str) -> ServiceResponse {
        if track_id.trim().is_empty() {
            return ServiceResponse::fail("track id must not be empty");
        }

        if is_local_id(track_id) {
            return match self.registry.materialize(track_id).await {
                Ok(url) => ServiceResponse::ok_with("local file ready", url),
                Err(e) => ServiceResponse::fail(format!("{e:#}")),
            };
        }

        if self.cache.is_cached(track_id) {
            ServiceResponse::ok_with("cached", self.cache.local_url(track_id))
        } else {
            ServiceResponse::fail("not cached")
        }
    }

    pub async fn register_local_music(&self, local_id: &str, path: &str) -> ServiceResponse {
        match self.registry.register(local_id, PathBuf::from(path)).await {
            Ok(()) => ServiceResponse::ok("local file registered"),
            Err(e) => {
                warn!("registry: register {local_id} failed: {e:#}");
                ServiceResponse::fail(format!("{e:#}"))
            }
        }
    }

    /// Pushes one lyric update to every stream subscriber. Always succeeds.
    pub fn update_current_lyrics(&self, text: &str, song_name: &str, artist: &str) -> ServiceResponse {
        let event = LyricsEvent::update(text, song_name, artist);
        if let LyricsEvent::LyricsUpdate { format, .. } = &event {
            info!("lyrics: {format:?} update for {song_name} - {artist}");
        }
        self.hub.broadcast(&event);
        ServiceResponse::ok("lyrics updated")
    }

    pub async fn set_osd_enabled(&self, enabled: bool) -> ServiceResponse {
        info!("osd: set enabled = {enabled}");
        match self.osd.set_enabled(enabled).await {
            Ok(()) if enabled => ServiceResponse::ok("desktop lyrics enabled"),
            Ok(()) => ServiceResponse::ok("desktop lyrics disabled"),
            Err(e) => {
                warn!("osd: failed to start helper: {e:#}");
                ServiceResponse::fail(format!("failed to start desktop lyrics: {e:#}"))
            }
        }
    }

    pub async fn is_osd_enabled(&self) -> bool {
        self.osd.is_enabled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::net::SocketAddr;
    use std::time::Duration;

    async fn core_in(dir: &std::path::Path) -> MediaCore {
        let layout = Arc::new(CacheLayout::new(dir, 18911));
        let locator = HelperLocator::with_bundled_dir(dir, "no-such-helper-9f3a");
        MediaCore::build(layout, Duration::from_secs(5), locator)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn cache_request_validation() {
        let dir = tempfile::tempdir().unwrap();
        let core = core_in(dir.path()).await;

        assert!(!core.cache_audio_file("", &["http://x".into()]).await.success);
        assert!(!core.cache_audio_file("abc", &[]).await.success);
        let blank = core.cache_audio_file("abc", &[" ".into(), "".into()]).await;
        assert_eq!(blank, ServiceResponse::fail("no usable mirror urls"));
    }

    #[tokio::test]
    async fn cached_url_for_remote_and_local_ids() {
        let dir = tempfile::tempdir().unwrap();
        let core = core_in(dir.path()).await;

        assert_eq!(core.get_cached_url("abc").await, ServiceResponse::fail("not cached"));

        core.layout.ensure_dirs().await.unwrap();
        std::fs::write(core.cache.cached_path("abc"), b"ID3").unwrap();
        let hit = core.get_cached_url("abc").await;
        assert!(hit.success);
        assert_eq!(hit.data, Some(core.cache.local_url("abc")));

        let song = dir.path().join("mine.ogg");
        std::fs::write(&song, b"OggS").unwrap();
        assert!(core
            .register_local_music("local-mine", &song.to_string_lossy())
            .await
            .success);
        let local = core.get_cached_url("local-mine").await;
        assert!(local.success);
        assert!(local.data.unwrap().ends_with(".ogg"));

        assert!(!core.get_cached_url("local-unknown").await.success);
    }

    #[tokio::test]
    async fn lyrics_update_reaches_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let core = core_in(dir.path()).await;
        let mut sub = core.hub.subscribe(SocketAddr::from(([127, 0, 0, 1], 5000)));
        sub.rx.recv().await; // connected

        let resp = core.update_current_lyrics("[00:01.00]hi", "Song", "Artist");
        assert!(resp.success);
        assert_eq!(
            sub.rx.recv().await,
            Some(LyricsEvent::update("[00:01.00]hi", "Song", "Artist"))
        );
    }

    #[tokio::test]
    async fn osd_failures_are_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let core = core_in(dir.path()).await;

        let resp = core.set_osd_enabled(true).await;
        assert!(!resp.success);
        assert!(resp.message.starts_with("failed to start desktop lyrics"));
        assert!(!core.is_osd_enabled().await);

        assert!(core.set_osd_enabled(false).await.success);
    }

    #[test]
    fn response_json_omits_missing_data() {
        let json = serde_json::to_string(&ServiceResponse::ok("x")).unwrap();
        assert_eq!(json, r#"{"success":true,"message":"x"}"#);
    }
}
