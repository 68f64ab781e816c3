//! Extraction engines
//!
//! Each engine borrows a pooled page, captures the site's own XHR payloads
//! off the CDP network events, and hands every referenced media URL to the
//! render runner. Responses carry content-addressed filenames only; no
//! upstream URL ever leaves this module.

pub mod crypto;
pub mod instagram;
pub mod tiktok;
pub mod types;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchMouseEventParams, DispatchMouseEventType,
};
use chromiumoxide::cdp::browser_protocol::network::{
    EventResponseReceived, GetResponseBodyParams,
};
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::browser::SessionPool;
use crate::cache::Memoize;
use crate::kv::KvStore;
use crate::render::RenderRunner;

pub use types::media_url;

/// Shared handles the engines operate on
#[derive(Clone)]
pub struct Extractors {
    pub pool: Arc<SessionPool>,
    pub render: RenderRunner,
    pub memo: Memoize<KvStore>,
    pub http: reqwest::Client,
    /// Base URL of the mempool REST API, overridable for tests
    pub mempool_base: String,
}

/// Matching XHR bodies streamed off a page's network events.
///
/// The listener task resolves each matching response through
/// `Network.getResponseBody`; bodies arrive on a bounded channel in
/// arrival order. Dropped with the capture.
pub struct XhrCapture {
    rx: mpsc::Receiver<Bytes>,
    task: JoinHandle<()>,
}

impl XhrCapture {
    /// Attach to `page`, forwarding bodies of responses whose URL contains
    /// every fragment in `fragments`.
    pub async fn attach(page: &Page, fragments: &[&str]) -> Result<Self> {
        let mut events = page
            .event_listener::<EventResponseReceived>()
            .await
            .context("installing response listener")?;
        let (tx, rx) = mpsc::channel(64);
        let page = page.clone();
        let fragments: Vec<String> = fragments.iter().map(|f| f.to_string()).collect();

        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let url = &event.response.url;
                if !fragments.iter().all(|f| url.contains(f.as_str())) {
                    continue;
                }
                let params = GetResponseBodyParams::new(event.request_id.clone());
                let Ok(resp) = page.execute(params).await else {
                    continue;
                };
                let body = if resp.result.base64_encoded {
                    match BASE64.decode(resp.result.body.as_bytes()) {
                        Ok(decoded) => Bytes::from(decoded),
                        Err(_) => continue,
                    }
                } else {
                    Bytes::from(resp.result.body.clone().into_bytes())
                };
                debug!("captured {} byte payload from {url}", body.len());
                if tx.send(body).await.is_err() {
                    break;
                }
            }
        });
        Ok(Self { rx, task })
    }

    /// Next captured body, or `None` once `idle` elapses with nothing new
    pub async fn recv(&mut self, idle: Duration) -> Option<Bytes> {
        tokio::time::timeout(idle, self.rx.recv()).await.ok().flatten()
    }
}

impl Drop for XhrCapture {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Navigate and return at commit, before any load state
pub async fn navigate_commit(page: &Page, url: &str) -> Result<()> {
    page.execute(NavigateParams::new(url))
        .await
        .with_context(|| format!("navigating to {url}"))?;
    Ok(())
}

/// One mouse-wheel tick in the viewport, used to drive infinite feeds
pub async fn wheel_scroll(page: &Page, delta_y: f64) -> Result<()> {
    let cmd = DispatchMouseEventParams::builder()
        .r#type(DispatchMouseEventType::MouseWheel)
        .x(640.0)
        .y(400.0)
        .delta_x(0.0)
        .delta_y(delta_y)
        .build()
        .map_err(|e| anyhow!("building wheel event: {e}"))?;
    page.execute(cmd).await.context("dispatching wheel event")?;
    Ok(())
}

/// Find an embedded `<script>` JSON blob containing `needle` and return the
/// value stored under that key.
pub fn find_json_tag(html: &str, needle: &str) -> Option<serde_json::Value> {
    let mut rest = html;
    while let Some(open) = rest.find("<script") {
        let after_open = &rest[open..];
        let body_start = after_open.find('>')? + 1;
        let body_end = after_open.find("</script>")?;
        if body_end > body_start {
            let body = &after_open[body_start..body_end];
            if body.contains(needle) {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(body.trim()) {
                    if let Some(found) = find_key(&value, needle) {
                        return Some(found.clone());
                    }
                }
            }
        }
        rest = &after_open[body_end + "</script>".len()..];
    }
    None
}

fn find_key<'a>(value: &'a serde_json::Value, key: &str) -> Option<&'a serde_json::Value> {
    match value {
        serde_json::Value::Object(map) => {
            if let Some(found) = map.get(key) {
                return Some(found);
            }
            map.values().find_map(|v| find_key(v, key))
        }
        serde_json::Value::Array(items) => items.iter().find_map(|v| find_key(v, key)),
        _ => None,
    }
}

/// Candidates in an unservable still-image format are never rendered
pub fn is_heic_url(url: &str) -> bool {
    url::Url::parse(url)
        .map(|u| {
            Path::new(u.path())
                .extension()
                .is_some_and(|e| e.eq_ignore_ascii_case("heic"))
        })
        .unwrap_or(false)
}

/// Suffix for an avatar-style URL: the URL's own extension when it maps to
/// a known MIME type, `.jpg` otherwise.
pub fn suffix_for_url(url: &str) -> String {
    let ext = url::Url::parse(url)
        .ok()
        .and_then(|u| {
            Path::new(u.path())
                .extension()
                .map(|e| e.to_string_lossy().to_string())
        })
        .unwrap_or_default();
    if !ext.is_empty() && mime_guess::from_ext(&ext).first().is_some() {
        format!(".{ext}")
    } else {
        ".jpg".to_string()
    }
}
