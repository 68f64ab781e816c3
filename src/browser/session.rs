//! One authenticated browser session
//!
//! A session is a CDP connection to the remote browser service carrying a
//! named identity's cookies. Storage state is captured from a live page,
//! packed as JSON, and persisted to the durable KV so the identity
//! survives restarts.

use anyhow::{Context, Result};
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

/// Packed cookie + local storage snapshot for one session.
/// Cookies are kept as raw CDP JSON so protocol additions round-trip.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StorageState {
    #[serde(default)]
    pub cookies: Vec<serde_json::Value>,
}

impl StorageState {
    pub fn pack(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("packing storage state")
    }

    pub fn unpack(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).context("unpacking storage state")
    }

    /// Cookie params to replay into a fresh browser context. Entries that
    /// no longer deserialize against the current protocol are skipped.
    pub fn cookie_params(&self) -> Vec<CookieParam> {
        self.cookies
            .iter()
            .filter_map(|raw| match serde_json::from_value(raw.clone()) {
                Ok(param) => Some(param),
                Err(e) => {
                    warn!("skipping unreplayable cookie: {e}");
                    None
                }
            })
            .collect()
    }
}

/// Capture the session's storage state through one of its pages
pub async fn capture_state(page: &Page) -> Result<StorageState> {
    let cookies = page.get_cookies().await.context("reading cookies")?;
    let cookies = cookies
        .into_iter()
        .filter_map(|c| serde_json::to_value(c).ok())
        .collect();
    Ok(StorageState { cookies })
}

/// A connected browser session owning its event handler task
#[derive(Debug)]
pub struct BrowserSession {
    pub username: String,
    pub browser: Browser,
    handler_task: JoinHandle<()>,
}

impl BrowserSession {
    /// Connect to the browser service with this session's tracking identity
    pub async fn connect(browser_url: &str, username: &str) -> Result<Self> {
        let mut endpoint = Url::parse(browser_url)
            .with_context(|| format!("invalid browser url {browser_url}"))?;
        let tracking_id = format!("{username}_{}", uuid::Uuid::new_v4().simple());
        endpoint
            .query_pairs_mut()
            .append_pair("stealth", "true")
            .append_pair("blockAds", "true")
            .append_pair("trackingId", &tracking_id);

        let (browser, mut handler) = Browser::connect(endpoint.as_str())
            .await
            .with_context(|| format!("connecting session {username}"))?;

        let handler_user = username.to_string();
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
            debug!("cdp handler for {handler_user} ended");
        });

        Ok(Self {
            username: username.to_string(),
            browser,
            handler_task,
        })
    }

    /// Open one reusable page, replaying the persisted cookies
    pub async fn new_page(&self, state: &StorageState) -> Result<Page> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .with_context(|| format!("creating page for {}", self.username))?;
        let params = state.cookie_params();
        if !params.is_empty() {
            page.set_cookies(params)
                .await
                .with_context(|| format!("applying cookies for {}", self.username))?;
        }
        Ok(page)
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        self.handler_task.abort();
    }
}
