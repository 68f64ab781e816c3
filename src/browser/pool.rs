//! Browser context pool
//!
//! Long-lived authenticated sessions, each backing a small LIFO stack of
//! reusable pages. Extraction engines borrow a page for the scoped duration
//! of a request; the guard returns it to its session's stack on every exit
//! path. A global semaphore caps total concurrent borrows independently of
//! per-session stack sizes.
//!
//! Session state is loaded from the durable KV at build time and written
//! back periodically and at shutdown. A destroyed page is irrecoverable and
//! triggers the process drain sequence.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chromiumoxide::cdp::browser_protocol::target::EventTargetDestroyed;
use chromiumoxide::page::Page;
use futures::StreamExt;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{
    BORROW_LIMIT, BORROW_TIMEOUT, FLAG_TTL, InstagramCredential, PAGES_PER_SESSION, PROXY_PAGES,
    Settings,
};
use crate::error::{ApiError, ApiResult};
use crate::kv::KvStore;
use crate::shutdown::Shutdown;

use super::rotation::Rotation;
use super::session::{BrowserSession, StorageState, capture_state};

/// KV hash of username → packed storage state
pub const SESSIONS_NS: &str = "api_sessions_store2";

/// KV set of administratively disabled sessions
pub const DISABLED_NS: &str = "disabled_ctx";

/// KV string holding the proxy session's packed storage state
pub const PROXY_STATE_KEY: &str = "proxy_state";

/// Pinned identity of the proxy session's pages
const PROXY_USER: &str = "proxy";

struct SessionEntry {
    session: BrowserSession,
    pages: Arc<Mutex<Vec<Page>>>,
    listener_task: JoinHandle<()>,
}

impl Drop for SessionEntry {
    fn drop(&mut self) {
        self.listener_task.abort();
    }
}

/// Pool of persistent authenticated browser sessions
pub struct SessionPool {
    entries: HashMap<String, SessionEntry>,
    proxy: Option<SessionEntry>,
    rotation: Rotation,
    limiter: Arc<Semaphore>,
    save_lock: AsyncMutex<()>,
    relogin_lock: AsyncMutex<()>,
    credentials: HashMap<String, InstagramCredential>,
    kv: KvStore,
    shutdown: Shutdown,
    debug: bool,
    total_pages: usize,
}

/// Restore one session from packed state: connect, open `page_count`
/// pages, arm the destroyed-target listener. Any destroyed target under a
/// session means a page died; pages are non-recoverable, so the listener
/// drains the whole process.
async fn restore_session(
    settings: &Settings,
    shutdown: &Shutdown,
    username: &str,
    packed: &[u8],
    page_count: usize,
) -> Result<SessionEntry> {
    let state = match StorageState::unpack(packed) {
        Ok(state) => state,
        Err(e) => {
            warn!("corrupt storage state for {username}: {e:#}");
            StorageState::default()
        }
    };
    let session = BrowserSession::connect(&settings.browser_url, username)
        .await
        .with_context(|| format!("building session {username}"))?;

    let mut pages = Vec::with_capacity(page_count);
    for _ in 0..page_count {
        let page = session.new_page(&state).await?;
        info!("created page for session {username}");
        pages.push(page);
    }

    let mut destroyed = session
        .browser
        .event_listener::<EventTargetDestroyed>()
        .await
        .context("installing destroyed-target listener")?;
    let listener_shutdown = shutdown.clone();
    let listener_user = username.to_string();
    let listener_task = tokio::spawn(async move {
        if destroyed.next().await.is_some() {
            warn!("detected page close on session {listener_user}");
            listener_shutdown.trigger();
        }
    });

    Ok(SessionEntry {
        session,
        pages: Arc::new(Mutex::new(pages)),
        listener_task,
    })
}

impl SessionPool {
    /// One-time initialization: restore every persisted session plus the
    /// dedicated proxy session, and open their pages.
    pub async fn build(
        settings: &Settings,
        kv: KvStore,
        shutdown: Shutdown,
        credentials: HashMap<String, InstagramCredential>,
    ) -> Result<Arc<Self>> {
        let mut entries = HashMap::new();
        let mut total_pages = 0;

        for (username, packed) in kv.hgetall(SESSIONS_NS).await? {
            if !credentials.contains_key(&username)
                && !credentials.values().any(|c| c.alias == username)
            {
                warn!("no saved credential for user {username}");
            }
            let entry =
                restore_session(settings, &shutdown, &username, &packed, PAGES_PER_SESSION)
                    .await?;
            total_pages += PAGES_PER_SESSION;
            entries.insert(username, entry);

            if settings.debug {
                break;
            }
        }

        let proxy = match kv.get_string(PROXY_STATE_KEY).await? {
            Some(packed) => {
                let entry =
                    restore_session(settings, &shutdown, PROXY_USER, &packed, PROXY_PAGES)
                        .await?;
                info!("proxy session restored with {PROXY_PAGES} pages");
                Some(entry)
            }
            None => {
                warn!("no proxy state persisted, proxy borrows unavailable");
                None
            }
        };

        let usernames: Vec<String> = entries.keys().cloned().collect();
        info!(
            "session pool built: {} sessions, {} pages",
            usernames.len(),
            total_pages
        );
        Ok(Arc::new(Self {
            entries,
            proxy,
            rotation: Rotation::new(usernames),
            limiter: Arc::new(Semaphore::new(BORROW_LIMIT)),
            save_lock: AsyncMutex::new(()),
            relogin_lock: AsyncMutex::new(()),
            credentials,
            kv,
            shutdown,
            debug: settings.debug,
            total_pages,
        }))
    }

    pub fn number_free_pages(&self) -> usize {
        self.entries.values().map(|e| e.pages.lock().len()).sum()
    }

    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    /// Mark a session unusable for the flag TTL window
    pub async fn flag(&self, username: &str) -> ApiResult<()> {
        let key = format!("api_flagged_context:{username}");
        let stamp = chrono::Utc::now().timestamp().to_string();
        self.kv.set_ex(&key, stamp.as_bytes(), FLAG_TTL).await?;
        warn!(
            "FLAGGED CONTEXT - {username} disabled for {}s and discarded from rotation",
            FLAG_TTL.as_secs()
        );
        Ok(())
    }

    pub async fn is_flagged(&self, username: &str) -> bool {
        self.kv
            .exists(&format!("api_flagged_context:{username}"))
            .await
            .unwrap_or(false)
    }

    async fn is_disabled(&self, username: &str) -> bool {
        self.kv
            .sismember(DISABLED_NS, username)
            .await
            .unwrap_or(false)
    }

    fn try_pop(&self, username: &str) -> Option<Page> {
        self.entries
            .get(username)
            .and_then(|entry| entry.pages.lock().pop())
    }

    /// Borrow a page: from the dedicated proxy session when `proxy` is
    /// set, otherwise optionally pinned to a specific session for
    /// user-scoped cookies. Scoped: the guard returns the page on drop.
    pub async fn borrow_page(&self, proxy: bool, user: Option<&str>) -> ApiResult<PageGuard> {
        if self.shutdown.is_triggered() {
            return Err(ApiError::Internal("pool is closed".into()));
        }
        let permit = self
            .limiter
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ApiError::Internal("borrow limiter closed".into()))?;

        let (username, page, stack) = if proxy {
            let entry = self
                .proxy
                .as_ref()
                .ok_or_else(|| ApiError::Internal("no proxy session configured".into()))?;
            let page = tokio::time::timeout(BORROW_TIMEOUT, pop_wait(&entry.pages))
                .await
                .map_err(|_| ApiError::Timeout("no proxy page available within 90s".into()))?;
            (PROXY_USER.to_string(), page, Arc::clone(&entry.pages))
        } else {
            let page = tokio::time::timeout(BORROW_TIMEOUT, self.select_page(user))
                .await
                .map_err(|_| ApiError::Timeout("no page available within 90s".into()))?;
            let (username, page) = page?;
            let stack = self
                .entries
                .get(&username)
                .map(|e| Arc::clone(&e.pages))
                .ok_or_else(|| ApiError::Internal(format!("unknown session {username}")))?;
            (username, page, stack)
        };

        debug!(
            "obtained page from {username}: {}/{} borrowed",
            self.total_pages - self.number_free_pages(),
            self.total_pages
        );
        Ok(PageGuard {
            page: Some(page),
            username,
            stack,
            _permit: permit,
        })
    }

    async fn select_page(&self, user: Option<&str>) -> ApiResult<(String, Page)> {
        if let Some(user) = user {
            if !self.entries.contains_key(user) {
                return Err(ApiError::NotFound(format!("no session for {user}")));
            }
            loop {
                if let Some(page) = self.try_pop(user) {
                    return Ok((user.to_string(), page));
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        if self.rotation.is_empty() {
            return Err(ApiError::Internal("no sessions configured".into()));
        }
        loop {
            for _ in 0..self.rotation.len() {
                let Some(username) = self.rotation.next() else {
                    break;
                };
                // Flag TTL and disabled-set membership are independent
                // controls; a session must clear both.
                if self.is_flagged(username).await || self.is_disabled(username).await {
                    continue;
                }
                if let Some(page) = self.try_pop(username) {
                    return Ok((username.to_string(), page));
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Re-authenticate a session through the Instagram login form with its
    /// saved credential, then persist the refreshed storage state. A
    /// relogin already in flight makes this a no-op.
    pub async fn relogin(&self, username: &str) -> ApiResult<()> {
        if username == PROXY_USER {
            return Ok(());
        }
        let cred = self
            .credentials
            .get(username)
            .or_else(|| self.credentials.values().find(|c| c.alias == username))
            .ok_or_else(|| {
                ApiError::NotFound(format!("No saved credential for user {username}"))
            })?;

        let Ok(_guard) = self.relogin_lock.try_lock() else {
            debug!("relogin already in flight, skipping {username}");
            return Ok(());
        };

        let page = self.borrow_page(false, Some(username)).await?;
        page.goto("https://www.instagram.com/accounts/login/")
            .await
            .map_err(anyhow::Error::from)?;
        tokio::time::sleep(Duration::from_secs(2)).await;

        let field = page
            .find_element(r#"input[name="username"]"#)
            .await
            .map_err(anyhow::Error::from)?;
        field.click().await.map_err(anyhow::Error::from)?;
        field
            .type_str(&cred.username)
            .await
            .map_err(anyhow::Error::from)?;
        let pause = rand::rng().random_range(0.5..1.0);
        tokio::time::sleep(Duration::from_secs_f64(pause)).await;

        let field = page
            .find_element(r#"input[name="password"]"#)
            .await
            .map_err(anyhow::Error::from)?;
        field.click().await.map_err(anyhow::Error::from)?;
        field
            .type_str(&cred.password)
            .await
            .map_err(anyhow::Error::from)?;

        page.find_element(r#"button[type="submit"]"#)
            .await
            .map_err(anyhow::Error::from)?
            .click()
            .await
            .map_err(anyhow::Error::from)?;
        tokio::time::sleep(Duration::from_secs(5)).await;

        let landed = page.url().await.map_err(anyhow::Error::from)?;
        match landed {
            Some(url) if !url.contains("login") => info!("login success for {username}"),
            _ => {
                return Err(ApiError::upstream(
                    502,
                    format!("login for {username} did not leave the login page"),
                ));
            }
        }

        let state = capture_state(page.page()).await?;
        self.kv
            .hset(SESSIONS_NS, username, &state.pack()?, None)
            .await?;
        Ok(())
    }

    /// Snapshot every session's storage state into the durable KV.
    ///
    /// Waits for all borrows to drain so the snapshot is consistent; the
    /// caller bounds the wait (save loop jitter, shutdown budget).
    pub async fn save(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;
        while self.limiter.available_permits() != BORROW_LIMIT {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if let Some(entry) = &self.proxy {
            let page = entry.pages.lock().first().cloned();
            if let Some(page) = page {
                let state = capture_state(&page).await?;
                self.kv.set(PROXY_STATE_KEY, &state.pack()?).await?;
                debug!("saved proxy session state");
            }
        }
        for (username, entry) in &self.entries {
            let page = entry.pages.lock().first().cloned();
            let Some(page) = page else {
                warn!("session {username} has no resident page, skipping save");
                continue;
            };
            let state = capture_state(&page).await?;
            self.kv
                .hset(SESSIONS_NS, username, &state.pack()?, None)
                .await?;
            debug!("saved session state for {username}");
        }
        Ok(())
    }

    /// Periodic save with randomized 200-300 s spacing; disabled in debug
    pub async fn save_loop(self: Arc<Self>) {
        if self.debug {
            warn!("save loop disabled in debug mode");
            return;
        }
        tokio::time::sleep(Duration::from_secs(3)).await;
        loop {
            if let Err(e) = self.save().await {
                warn!("periodic session save failed: {e:#}");
            }
            let sleep_secs = rand::rng().random_range(200.0..300.0);
            tokio::time::sleep(Duration::from_secs_f64(sleep_secs)).await;
        }
    }
}

/// Poll a LIFO stack until a page frees up; the caller bounds the wait
async fn pop_wait(stack: &Arc<Mutex<Vec<Page>>>) -> Page {
    loop {
        if let Some(page) = stack.lock().pop() {
            return page;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Scoped page borrow; returns the page to its session's LIFO stack
/// exactly once, on drop.
#[derive(Debug)]
pub struct PageGuard {
    page: Option<Page>,
    username: String,
    stack: Arc<Mutex<Vec<Page>>>,
    _permit: OwnedSemaphorePermit,
}

impl PageGuard {
    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn page(&self) -> &Page {
        self.page.as_ref().expect("page present until drop")
    }
}

impl Deref for PageGuard {
    type Target = Page;

    fn deref(&self) -> &Self::Target {
        self.page()
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        if let Some(page) = self.page.take() {
            self.stack.lock().push(page);
            debug!("page restored to session {}", self.username);
        }
    }
}
