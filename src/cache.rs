use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{bail, Context};
use futures_util::StreamExt;
use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT, ACCEPT_ENCODING, ACCEPT_LANGUAGE, CACHE_CONTROL, USER_AGENT,
};
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Host used in every URL handed out for cached content.
pub const LOCAL_HOST: &str = "127.0.0.1";

/// Extension given to audio fetched from remote mirrors.
pub const REMOTE_AUDIO_EXT: &str = "mp3";

const REGISTRY_FILE: &str = "local_music_map.json";

// --- Cache layout -------------------------------------------------------------
//
// <root>/                        served as-is by the origin server
// <root>/cache/mp3/<hash>.mp3    remote tracks, keyed by sha256(track id)
// <root>/cache/mp3/<hash><ext>   local imports, keyed by sha256(file bytes)
// <root>/cache/local_music_map.json

#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
    audio_dir: PathBuf,
    port: u16,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>, port: u16) -> Self {
        let root = root.into();
        let audio_dir = root.join("cache").join("mp3");
        Self {
            root,
            audio_dir,
            port,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn audio_dir(&self) -> &Path {
        &self.audio_dir
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn registry_file(&self) -> PathBuf {
        self.root.join("cache").join(REGISTRY_FILE)
    }

    /// Creates the directory tree. Safe to call any number of times.
    pub async fn ensure_dirs(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.audio_dir)
            .await
            .with_context(|| format!("failed to create cache dir {}", self.audio_dir.display()))
    }

    /// URL under which the origin server exposes `file_name` from the audio dir.
    pub fn url_for(&self, file_name: &str) -> String {
        format!("http://{LOCAL_HOST}:{}/cache/mp3/{file_name}", self.port)
    }
}

/// Lower-case hex sha256 of `key`.
pub fn hash_key(key: &str) -> String {
    format!("{:x}", Sha256::digest(key.as_bytes()))
}

/// Sibling temp path for `final_path`. The random suffix keeps concurrent
/// writers of the same entry from sharing a temp file.
fn temp_path_for(final_path: &Path) -> PathBuf {
    let name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    final_path.with_file_name(format!("{name}.{:08x}.tmp", fastrand::u32(..)))
}

/// Temp file for an entry being written. Deleted on drop unless [`publish`]
/// moved it into place, so an abandoned write leaves nothing behind.
///
/// [`publish`]: PartFile::publish
pub(crate) struct PartFile {
    path: PathBuf,
    published: bool,
}

impl PartFile {
    pub(crate) fn beside(final_path: &Path) -> Self {
        Self {
            path: temp_path_for(final_path),
            published: false,
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically renames the temp file over `final_path`.
    pub(crate) async fn publish(mut self, final_path: &Path) -> std::io::Result<()> {
        tokio::fs::rename(&self.path, final_path).await?;
        self.published = true;
        Ok(())
    }
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if !self.published {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn browser_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_static("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36"),
    );
    headers.insert(ACCEPT, HeaderValue::from_static("audio/mpeg,audio/*,*/*"));
    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers
}

// --- Content cache store ------------------------------------------------------

/// Remote track cache. Entries are created once and never removed.
pub struct ContentCache {
    layout: Arc<CacheLayout>,
    client: Client,
    // One gate per id with a download in progress; later callers wait on it
    // and then find the file already published.
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ContentCache {
    pub fn new(layout: Arc<CacheLayout>, download_timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .default_headers(browser_headers())
            .timeout(download_timeout)
            .build()
            .context("failed to build http client")?;

        Ok(Self {
            layout,
            client,
            inflight: Mutex::new(HashMap::new()),
        })
    }

    pub fn layout(&self) -> &Arc<CacheLayout> {
        &self.layout
    }

    pub fn cached_path(&self, track_id: &str) -> PathBuf {
        self.layout
            .audio_dir()
            .join(format!("{}.{REMOTE_AUDIO_EXT}", hash_key(track_id)))
    }

    pub fn is_cached(&self, track_id: &str) -> bool {
        self.cached_path(track_id).is_file()
    }

    /// Pure function of the id and the configured port; touches no files.
    pub fn local_url(&self, track_id: &str) -> String {
        self.layout
            .url_for(&format!("{}.{REMOTE_AUDIO_EXT}", hash_key(track_id)))
    }

    /// Returns the local URL for `track_id`, downloading it from the first
    /// working mirror on a miss. Individual mirror failures are only logged.
    pub async fn ensure_cached(&self, track_id: &str, mirrors: &[String]) -> anyhow::Result<String> {
        if self.is_cached(track_id) {
            debug!("cache: hit for {track_id}");
            return Ok(self.local_url(track_id));
        }

        let entry = InflightEntry::acquire(self, track_id);
        let _held = entry.gate.lock().await;
        self.fetch_from_mirrors(track_id, mirrors).await
    }

    async fn fetch_from_mirrors(&self, track_id: &str, mirrors: &[String]) -> anyhow::Result<String> {
        // Another caller may have published the file while we waited on the gate.
        if self.is_cached(track_id) {
            return Ok(self.local_url(track_id));
        }

        self.layout.ensure_dirs().await?;
        let final_path = self.cached_path(track_id);
        let total = mirrors.len();

        for (i, url) in mirrors.iter().enumerate() {
            let url = url.trim();
            if url.is_empty() {
                continue;
            }
            info!("cache: fetching {track_id} ({}/{total}) from {url}", i + 1);
            match self.download_to(url, &final_path).await {
                Ok(bytes) => {
                    info!("cache: stored {track_id} ({bytes} bytes) at {}", final_path.display());
                    return Ok(self.local_url(track_id));
                }
                Err(e) => {
                    warn!("cache: mirror {}/{total} failed for {track_id}: {e:#}", i + 1);
                }
            }
        }

        bail!("all mirrors failed ({total} tried)")
    }

    /// Streams `url` into a temp file and renames it over `final_path` once the
    /// whole body is on disk.
    async fn download_to(&self, url: &str, final_path: &Path) -> anyhow::Result<u64> {
        let resp = self.client.get(url).send().await.context("request failed")?;
        let status = resp.status();
        if status != StatusCode::OK {
            bail!("unexpected HTTP status {status}");
        }

        let part = PartFile::beside(final_path);
        let written = write_body(resp, part.path()).await?;
        if written == 0 {
            bail!("empty response body");
        }
        part.publish(final_path)
            .await
            .with_context(|| format!("failed to publish {}", final_path.display()))?;
        Ok(written)
    }
}

/// Holds a track's slot in the in-flight map; the slot is cleared on drop
/// once no other caller shares it.
struct InflightEntry<'a> {
    cache: &'a ContentCache,
    track_id: &'a str,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> InflightEntry<'a> {
    fn acquire(cache: &'a ContentCache, track_id: &'a str) -> Self {
        let gate = cache
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(track_id.to_string())
            .or_default()
            .clone();
        Self {
            cache,
            track_id,
            gate,
        }
    }
}

impl Drop for InflightEntry<'_> {
    fn drop(&mut self) {
        let mut inflight = self.cache.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        let idle = inflight
            .get(self.track_id)
            .is_some_and(|g| Arc::ptr_eq(g, &self.gate) && Arc::strong_count(g) <= 2);
        if idle {
            inflight.remove(self.track_id);
        }
    }
}

async fn write_body(resp: reqwest::Response, path: &Path) -> anyhow::Result<u64> {
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("failed to create {}", path.display()))?;
    let mut body = resp.bytes_stream();
    let mut written: u64 = 0;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.context("body read failed")?;
        file.write_all(&chunk).await.context("write failed")?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}
