//! Content-addressed blob store
//!
//! Artifacts live on the local filesystem under the cache root, fronted by a
//! bounded in-memory LRU for hot entries. Writers stage bytes at
//! `<target>.tmp` and atomically rename into place, so readers observe
//! either no file or the complete file — never a partial one. A `.tmp`
//! leftover from a crash is simply overwritten by the next producer and is
//! never served.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;

use crate::cache::LockMap;

/// Entries kept in the in-memory hot cache
const HOT_CACHE_ENTRIES: usize = 500;

/// Kill-on-timeout bound for the external optimizer
const OPTIMIZE_TIMEOUT: Duration = Duration::from_secs(30);

/// Filesystem blob store with an in-memory hot cache
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
    hot: Arc<Mutex<LruCache<String, Bytes>>>,
    locks: LockMap,
}

impl BlobStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("creating cache dir {}", root.display()))?;
        let cap = NonZeroUsize::new(HOT_CACHE_ENTRIES).expect("nonzero capacity");
        Ok(Self {
            root,
            hot: Arc::new(Mutex::new(LruCache::new(cap))),
            locks: LockMap::new(),
        })
    }

    fn path_for(&self, target: &str) -> Result<PathBuf> {
        // Targets are bare content-addressed filenames; anything that tries
        // to walk the tree is an attack or a bug.
        if target.is_empty()
            || target.contains('/')
            || target.contains('\\')
            || target.contains("..")
        {
            anyhow::bail!("invalid blob target: {target}");
        }
        Ok(self.root.join(target))
    }

    /// Read a complete artifact, promoting filesystem hits into the hot
    /// cache when their sniffed MIME is valid.
    pub async fn read(&self, target: &str) -> Result<Option<Bytes>> {
        if let Some(hit) = self.hot.lock().get(target).cloned() {
            return Ok(Some(hit));
        }
        let path = self.path_for(target)?;
        let data = match tokio::fs::read(&path).await {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context("reading blob"),
        };
        if sniff_mime(&data).is_some() {
            self.hot.lock().put(target.to_string(), data.clone());
        }
        Ok(Some(data))
    }

    pub async fn exists(&self, target: &str) -> bool {
        if self.hot.lock().contains(target) {
            return true;
        }
        match self.path_for(target) {
            Ok(path) => tokio::fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Atomic write: stage at `<target>.tmp`, rename into place
    pub async fn write(&self, target: &str, data: &[u8]) -> Result<()> {
        let path = self.path_for(target)?;
        let tmp = self.path_for(&format!("{target}.tmp"))?;
        tokio::fs::write(&tmp, data)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming into {}", path.display()))?;
        self.hot.lock().pop(target);
        Ok(())
    }

    pub async fn delete(&self, target: &str) -> Result<()> {
        self.hot.lock().pop(target);
        let path = self.path_for(target)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("deleting blob"),
        }
    }

    /// Run the external image optimizer against `target`, producing a
    /// `.webp` sibling that is cached and returned.
    ///
    /// The subprocess gets a hard 30 s deadline; on expiry it is killed and
    /// the caller sees a timeout error. Serialized per target so concurrent
    /// requests share one optimizer run.
    pub async fn optimize(&self, target: &str, opti_path: &str) -> Result<(String, Bytes)> {
        let webp_name = Path::new(target)
            .with_extension("webp")
            .to_string_lossy()
            .into_owned();
        let _guard = self.locks.lock(&format!("optim:{target}")).await;

        if let Some(existing) = self.read(&webp_name).await? {
            if sniff_mime(&existing).is_some() {
                return Ok((webp_name, existing));
            }
        }

        let source = self.path_for(target)?;
        let mut child = tokio::process::Command::new(opti_path)
            .arg(&source)
            .arg("-o")
            .arg(&self.root)
            .arg("--webp")
            .arg("--force")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("spawning optimizer")?;

        let waited = tokio::time::timeout(OPTIMIZE_TIMEOUT, child.wait()).await;
        match waited {
            Ok(status) => {
                let status = status.context("optimizer wait")?;
                if !status.success() {
                    anyhow::bail!("optimizer exited with {status}");
                }
            }
            Err(_) => {
                child.kill().await.ok();
                anyhow::bail!("optimizer timed out after {OPTIMIZE_TIMEOUT:?}");
            }
        }

        let data = self
            .read(&webp_name)
            .await?
            .context("optimizer produced no output")?;
        log::debug!("optimized {target} -> {webp_name} ({} bytes)", data.len());
        Ok((webp_name, data))
    }
}

/// Sniff a MIME type from magic bytes. `None` means the payload is not a
/// recognizable artifact and must not be served.
pub fn sniff_mime(data: &[u8]) -> Option<&'static str> {
    infer::get(data).map(|t| t.mime_type())
}
