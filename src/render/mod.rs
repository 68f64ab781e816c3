//! Render task pipeline
//!
//! A render fetches an external asset and lands it in the blob store under
//! a content-addressed filename `<prefix><xxh32-hex><suffix>`. The
//! synchronous half of [`RenderRunner::start_render`] computes the target
//! name, registers a completion event, and spawns the background task; the
//! caller gets the filename immediately and media fetches later await the
//! event.
//!
//! Concurrency: a per-target lock keeps producers exclusive, a global
//! semaphore caps active renders, and a 32 s deadline covers each download.
//! Passive registrations only record the URL in the durable KV for a lazy
//! first-consumer fetch; they never preempt an eager render for the same
//! target and never touch the active-event map.

pub mod parallel;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::blob::{BlobStore, sniff_mime};
use crate::cache::{LockMap, Memoize, TtlCache, fingerprint_str};
use crate::config::{PARALLEL_FETCH_LIMIT, RENDER_LIMIT, RENDER_TIMEOUT};
use crate::error::{ApiError, ApiResult};
use crate::kv::KvStore;

/// KV hash holding passive filename → URL registrations
const PASSIVE_NS: &str = "api_passive_url";

/// Passive registrations expire after a day
const PASSIVE_TTL: Duration = Duration::from_secs(86400);

/// Deadline for a lazy passive download
const PASSIVE_FETCH_TIMEOUT: Duration = Duration::from_secs(40);

/// Minimal JFIF substituted when an avatar URL has gone 410
const DEFAULT_AVATAR: &[u8] = &[
    0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46, 0x49, 0x46, 0x00, 0x01, 0x01, 0x00, 0x00,
    0x01, 0x00, 0x01, 0x00, 0x00, 0xFF, 0xD9,
];

/// Completion signal for one render target. Fires exactly once and stays
/// observable afterwards, so late waiters return immediately.
#[derive(Debug, Clone)]
pub struct RenderEvent {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for RenderEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderEvent {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // Only errors when the sender is gone, at which point the render
        // task has exited and set the flag or never will; borrow decides.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

/// Knobs for [`RenderRunner::start_render`]
#[derive(Debug, Clone, Default)]
pub struct RenderOptions {
    /// Seed for the filename hash; defaults to the URL's filename component
    pub prekey: Option<String>,
    /// Explicit target filename, bypassing the hash scheme
    pub filename: Option<String>,
    /// Explicit suffix; defaults to the URL's extension
    pub suffix: Option<String>,
    /// Re-download even when a valid artifact exists
    pub force: bool,
    /// Register for lazy fetch instead of downloading now
    pub passive: bool,
}

impl RenderOptions {
    pub fn suffix(suffix: &str) -> Self {
        Self {
            suffix: Some(suffix.to_string()),
            ..Self::default()
        }
    }

    pub fn passive_suffix(suffix: &str) -> Self {
        Self {
            suffix: Some(suffix.to_string()),
            passive: true,
            ..Self::default()
        }
    }
}

/// Last path segment of a URL, the hash seed for filename derivation
fn filename_from_url(url: &str) -> String {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string());
    path.rsplit('/').next().unwrap_or(&path).to_string()
}

/// Compute the stable content-addressed target filename for a source URL.
/// Stable across processes: same seed, same hash, same name.
pub fn target_filename(url: &str, prefix: &str, opts: &RenderOptions) -> String {
    let name = filename_from_url(url);
    let suffix = match &opts.suffix {
        Some(s) => s.clone(),
        None => {
            let ext = Path::new(&name)
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_default();
            if ext == ".heic" { ".jpg".to_string() } else { ext }
        }
    };
    let filename = match &opts.filename {
        Some(f) => f.clone(),
        None => {
            let prekey = opts.prekey.as_deref().unwrap_or(&name);
            format!("{prefix}{}{suffix}", fingerprint_str(prekey))
        }
    };
    filename.replace(".jpeg", ".jpg")
}

/// Background fetch/store workers with a global concurrency limit
#[derive(Clone)]
pub struct RenderRunner {
    blob: BlobStore,
    kv: KvStore,
    locks: LockMap,
    limiter: Arc<Semaphore>,
    parallel_sem: Arc<Semaphore>,
    active: Arc<DashMap<String, RenderEvent>>,
    client: reqwest::Client,
    fallback: reqwest::Client,
    passive_memo: Memoize<TtlCache>,
    debug: bool,
}

impl RenderRunner {
    pub fn new(
        blob: BlobStore,
        kv: KvStore,
        client: reqwest::Client,
        fallback: reqwest::Client,
        debug: bool,
    ) -> Self {
        Self {
            blob,
            kv,
            locks: LockMap::new(),
            limiter: Arc::new(Semaphore::new(RENDER_LIMIT)),
            parallel_sem: Arc::new(Semaphore::new(PARALLEL_FETCH_LIMIT)),
            active: Arc::new(DashMap::new()),
            client,
            fallback,
            passive_memo: Memoize::new(TtlCache::default()),
            debug,
        }
    }

    /// Completion event for a target with an in-flight (or completed) render
    pub fn active_event(&self, target: &str) -> Option<RenderEvent> {
        self.active.get(target).map(|e| e.clone())
    }

    /// Whether a passive registration exists for this target
    pub async fn passive_registered(&self, target: &str) -> bool {
        self.kv
            .hget(PASSIVE_NS, target)
            .await
            .ok()
            .flatten()
            .is_some()
    }

    /// Kick off a render. Returns the stable filename and the task handle;
    /// the artifact becomes observable once the completion event fires.
    pub fn start_render(
        &self,
        url: &str,
        prefix: &str,
        opts: RenderOptions,
    ) -> (String, JoinHandle<ApiResult<u64>>) {
        if url.is_empty() || url == "/None" {
            return ("None".to_string(), tokio::spawn(async { Ok(0) }));
        }
        let target = target_filename(url, prefix, &opts);

        let event = if opts.passive {
            None
        } else {
            let event = RenderEvent::new();
            self.active.insert(target.clone(), event.clone());
            Some(event)
        };

        let runner = self.clone();
        let url = url.to_string();
        let task_target = target.clone();
        let handle = tokio::spawn(async move {
            let result = runner
                .background_render(&url, &task_target, None, opts.force, opts.passive)
                .await;
            if let Some(event) = event {
                event.set();
            }
            if let Err(ref e) = result {
                warn!("render {task_target} failed: {e}");
            }
            result
        });
        (target, handle)
    }

    /// Render from caller-supplied bytes instead of a URL
    pub fn start_render_bytes(
        &self,
        data: Bytes,
        prefix: &str,
        opts: RenderOptions,
    ) -> (String, JoinHandle<ApiResult<u64>>) {
        let seed = opts
            .prekey
            .clone()
            .unwrap_or_else(|| format!("{}b", data.len()));
        let target = match &opts.filename {
            Some(f) => f.clone(),
            None => format!(
                "{prefix}{}{}",
                fingerprint_str(&seed),
                opts.suffix.as_deref().unwrap_or("")
            ),
        };
        let event = RenderEvent::new();
        self.active.insert(target.clone(), event.clone());

        let runner = self.clone();
        let task_target = target.clone();
        let handle = tokio::spawn(async move {
            let result = runner
                .background_render("", &task_target, Some(data), opts.force, false)
                .await;
            event.set();
            result
        });
        (target, handle)
    }

    async fn background_render(
        &self,
        url: &str,
        target: &str,
        payload: Option<Bytes>,
        force: bool,
        passive: bool,
    ) -> ApiResult<u64> {
        if passive {
            self.kv
                .hset(PASSIVE_NS, target, url.as_bytes(), Some(PASSIVE_TTL))
                .await?;
            return Ok(0);
        }

        let _guard = self.locks.lock(&format!("render_{target}")).await;
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| ApiError::Internal("render limiter closed".into()))?;

        tokio::time::timeout(RENDER_TIMEOUT, self.produce(url, target, payload, force))
            .await
            .map_err(|_| ApiError::Timeout(format!("render {target}")))?
    }

    async fn produce(
        &self,
        url: &str,
        target: &str,
        payload: Option<Bytes>,
        force: bool,
    ) -> ApiResult<u64> {
        if !force && !self.debug {
            if let Some(cached) = self.blob.read(target).await? {
                if sniff_mime(&cached).is_some() {
                    return Ok(cached.len() as u64);
                }
                warn!("invalid cached MIME for {target}, re-rendering");
            }
        }

        let data = match payload {
            Some(data) => data,
            None => self.fetch(url).await?,
        };
        if data.is_empty() {
            return Err(ApiError::upstream(502, format!("empty payload for {target}")));
        }
        if sniff_mime(&data).is_none() {
            return Err(ApiError::upstream(
                502,
                format!("unrecognizable payload for {target}"),
            ));
        }
        self.blob.write(target, &data).await?;
        debug!("rendered {target}: {} bytes", data.len());
        Ok(data.len() as u64)
    }

    async fn fetch(&self, url: &str) -> ApiResult<Bytes> {
        if wants_parallel(url) {
            return parallel::fetch_parallel(&self.client, &self.parallel_sem, url, PARALLEL_FETCH_LIMIT)
                .await
                .map_err(ApiError::from);
        }
        self.fetch_standard(url).await
    }

    /// Single-connection fetch with an alternate-stack fallback on
    /// transport errors and the default-avatar substitution on 410.
    pub async fn fetch_standard(&self, url: &str) -> ApiResult<Bytes> {
        match self.client.get(url).send().await {
            Ok(resp) => self.finish_fetch(url, resp).await,
            Err(e) if e.status().is_none() => {
                warn!("primary fetch failed for {url}: {e} - retrying on fallback stack");
                let resp = self.fallback.get(url).send().await.map_err(ApiError::from)?;
                self.finish_fetch(url, resp).await
            }
            Err(e) => Err(ApiError::from(e)),
        }
    }

    async fn finish_fetch(&self, url: &str, resp: reqwest::Response) -> ApiResult<Bytes> {
        if resp.status() == reqwest::StatusCode::GONE {
            warn!("HTTP GONE for {url} - substituting standard avatar");
            return Ok(Bytes::from_static(DEFAULT_AVATAR));
        }
        let resp = resp.error_for_status().map_err(ApiError::from)?;
        resp.bytes().await.map_err(ApiError::from)
    }

    /// Lazily fetch a passively registered target on its first media GET.
    /// Singleflighted per target with a short memo window so a burst of
    /// media requests performs one upstream fetch. An artifact already on
    /// disk answers with its sniffed MIME and never touches upstream.
    /// Returns `None` when nothing is on disk or registered.
    pub async fn download_passive(&self, target: &str) -> ApiResult<Option<String>> {
        let key_arg = target.to_string();
        let target_owned = target.to_string();
        self.passive_memo
            .get_or_compute(
                "passive_dl",
                &key_arg,
                Duration::from_secs(60),
                || async move {
                    if let Some(existing) = self.blob.read(&target_owned).await? {
                        if let Some(mime) = sniff_mime(&existing) {
                            return Ok(Some(mime.to_string()));
                        }
                    }
                    tokio::time::timeout(PASSIVE_FETCH_TIMEOUT, async {
                        let Some(raw) = self.kv.hget(PASSIVE_NS, &target_owned).await? else {
                            return Ok(None);
                        };
                        let url = String::from_utf8(raw)
                            .map_err(|_| ApiError::Internal("bad passive url".into()))?;
                        let data = self.fetch_standard(&url).await?;
                        let mime = sniff_mime(&data)
                            .ok_or_else(|| {
                                ApiError::upstream(502, format!("bad passive payload for {target_owned}"))
                            })?
                            .to_string();
                        self.blob.write(&target_owned, &data).await?;
                        Ok(Some(mime))
                    })
                    .await
                    .map_err(|_| ApiError::Timeout(format!("passive fetch {target_owned}")))?
                },
            )
            .await
    }
}

/// Large-media hosts go through the multi-connection ranged fetcher
fn wants_parallel(url: &str) -> bool {
    url.starts_with("https://scontent.cdninstagram.com/v/") && url.contains("mp4")
}
