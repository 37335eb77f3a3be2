use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::cache::{CacheLayout, PartFile};

/// Namespace for ids of user-imported files.
pub const LOCAL_ID_PREFIX: &str = "local-";

pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

// --- Local file registry ------------------------------------------------------
//
// Maps synthetic ids to absolute paths of user-imported files. The whole map
// is rewritten (pretty JSON) after every mutation. Memory is updated first; a
// failed write leaves disk behind until the next successful one.

pub struct LocalFileRegistry {
    layout: Arc<CacheLayout>,
    file: PathBuf,
    entries: Mutex<BTreeMap<String, PathBuf>>,
}

impl LocalFileRegistry {
    /// Loads the persisted registry, dropping entries whose file is gone.
    pub async fn load(layout: Arc<CacheLayout>) -> Self {
        let file = layout.registry_file();
        let loaded = read_registry(&file).await;
        let loaded_count = loaded.len();

        let mut entries = BTreeMap::new();
        for (id, path) in loaded {
            if tokio::fs::metadata(&path).await.is_ok() {
                entries.insert(id, path);
            } else {
                info!("registry: dropping {id} -> {} (file missing)", path.display());
            }
        }

        let registry = Self {
            layout,
            file,
            entries: Mutex::new(entries),
        };

        let kept = registry.entries.lock().await.len();
        info!("registry: loaded {kept} local file(s)");
        if kept != loaded_count {
            let entries = registry.entries.lock().await;
            if let Err(e) = registry.persist(&entries).await {
                warn!("registry: failed to rewrite cleaned registry: {e:#}");
            }
        }

        registry
    }

    pub async fn register(&self, id: &str, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        if id.trim().is_empty() || path.as_os_str().is_empty() {
            bail!("id and path must not be empty");
        }

        let mut entries = self.entries.lock().await;
        entries.insert(id.to_string(), path.to_path_buf());
        info!("registry: {id} -> {}", path.display());
        self.persist(&entries).await
    }

    pub async fn resolve(&self, id: &str) -> Option<PathBuf> {
        self.entries.lock().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Copies the registered file into the audio cache (named by a hash of its
    /// bytes) and returns its local URL.
    pub async fn materialize(&self, id: &str) -> anyhow::Result<String> {
        let Some(src) = self.resolve(id).await else {
            bail!("no local file registered for {id}");
        };
        if !tokio::fs::metadata(&src).await.map(|m| m.is_file()).unwrap_or(false) {
            bail!("local file does not exist: {}", src.display());
        }

        let hash = hash_file(&src).await?;
        let ext = src
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_ascii_lowercase()))
            .unwrap_or_default();
        let file_name = format!("{hash}{ext}");
        let cached = self.layout.audio_dir().join(&file_name);

        if tokio::fs::metadata(&cached).await.is_err() {
            self.layout.ensure_dirs().await?;
            copy_into_cache(&src, &cached).await?;
            info!("registry: cached {} as {file_name}", src.display());
        }

        Ok(self.layout.url_for(&file_name))
    }

    async fn persist(&self, entries: &BTreeMap<String, PathBuf>) -> anyhow::Result<()> {
        if let Some(parent) = self.file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let data = serde_json::to_vec_pretty(entries).context("failed to encode registry")?;
        tokio::fs::write(&self.file, data)
            .await
            .with_context(|| format!("failed to write {}", self.file.display()))?;
        Ok(())
    }
}

/// Missing, empty and corrupt files all read as an empty registry.
async fn read_registry(file: &Path) -> BTreeMap<String, PathBuf> {
    let data = match tokio::fs::read(file).await {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
        Err(e) => {
            warn!("registry: failed to read {}: {e}", file.display());
            return BTreeMap::new();
        }
    };
    if data.iter().all(u8::is_ascii_whitespace) {
        return BTreeMap::new();
    }
    serde_json::from_slice(&data).unwrap_or_else(|e| {
        warn!("registry: ignoring unparseable {}: {e}", file.display());
        BTreeMap::new()
    })
}

async fn hash_file(path: &Path) -> anyhow::Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await.context("failed to hash local file")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

async fn copy_into_cache(src: &Path, dst: &Path) -> anyhow::Result<()> {
    let part = PartFile::beside(dst);
    tokio::fs::copy(src, part.path())
        .await
        .with_context(|| format!("failed to copy {} into cache", src.display()))?;
    part.publish(dst)
        .await
        .with_context(|| format!("failed to publish {}", dst.display()))
}
