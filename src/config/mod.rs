//! Runtime configuration for the gateway
//!
//! Settings come from the environment (service URLs, key material, cache
//! directory) plus YAML credential files that ride alongside the binary:
//! `instagram_credentials.yaml` (fernet-encrypted passwords) and
//! `limited_api_users.yaml`. Service access tokens are loaded from
//! `service_tokens.yaml` and matched by their `common_name` claim during
//! JWT verification.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

/// Chrome user agent presented by pooled pages and HTTP clients
pub const CHROME_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.6834.160 Safari/537.36";

/// Pages created per browser session
pub const PAGES_PER_SESSION: usize = 2;

/// Pages kept on the dedicated proxy session
pub const PROXY_PAGES: usize = 5;

/// Global cap on concurrently borrowed pages
pub const BORROW_LIMIT: usize = 12;

/// Deadline for obtaining a page from the pool
pub const BORROW_TIMEOUT: Duration = Duration::from_secs(90);

/// Global cap on concurrently active renders
pub const RENDER_LIMIT: usize = 34;

/// Deadline for a single background render
pub const RENDER_TIMEOUT: Duration = Duration::from_secs(32);

/// Concurrent connections used by the parallel ranged fetcher
pub const PARALLEL_FETCH_LIMIT: usize = 16;

/// Idle deadline for feed scroll loops
pub const SCROLL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// TTL applied to a flagged browser session
pub const FLAG_TTL: Duration = Duration::from_secs(3600);

/// One credential entry from `instagram_credentials.yaml`.
/// `password` arrives fernet-encrypted and is decrypted at load time.
#[derive(Debug, Clone, Deserialize)]
pub struct InstagramCredential {
    pub alias: String,
    pub username: String,
    pub password: String,
}

/// Per-caller route allowances from `limited_api_users.yaml`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LimitedUsers {
    #[serde(default)]
    pub users: HashMap<String, Vec<String>>,
}

/// A known service access token, matched against the JWT `common_name`
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceToken {
    pub client_id: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// CDP websocket endpoint of the remote browser service
    pub browser_url: String,
    /// sqlx connection string for the KV store and audit table
    pub db_url: String,
    /// JWKS endpoint used to validate access JWTs
    pub jwks_url: String,
    /// Accepted `aud` claims
    pub audiences: Vec<String>,
    /// Accepted `iss` claims
    pub issuers: Vec<String>,
    /// Blob store root
    pub cache_dir: PathBuf,
    /// Base64 fernet key for credential decryption
    pub fernet_key: Option<String>,
    /// Path to the external image optimizer binary
    pub opti_path: Option<String>,
    /// Debug mode: sentinel identities accepted, save loop disabled
    pub debug: bool,
}

impl Settings {
    /// Build settings from environment variables, falling back to local
    /// defaults suitable for debug runs.
    pub fn from_env() -> Result<Self> {
        let browser_url = std::env::var("BROWSER_URL")
            .unwrap_or_else(|_| "ws://127.0.0.1:9222".to_string());
        let db_url =
            std::env::var("AUDIT_DB_URL").unwrap_or_else(|_| "sqlite::memory:".to_string());
        let jwks_url = std::env::var("JWKS_URL").unwrap_or_default();
        let audiences = split_env("ACCESS_AUDIENCES");
        let issuers = split_env("ACCESS_ISSUERS");
        let cache_dir =
            PathBuf::from(std::env::var("CACHE_DIR").unwrap_or_else(|_| "api-cache".to_string()));
        let fernet_key = std::env::var("FERNET_KEY").ok();
        let opti_path = std::env::var("OPTI_PATH").ok();
        let debug = std::env::var("DEBUG")
            .map(|v| v == "1" || v == "true")
            .unwrap_or(false);

        Ok(Self {
            browser_url,
            db_url,
            jwks_url,
            audiences,
            issuers,
            cache_dir,
            fernet_key,
            opti_path,
            debug,
        })
    }

    /// Load and decrypt `instagram_credentials.yaml`.
    ///
    /// Passwords are stored as fernet tokens; entries that fail to decrypt
    /// are dropped rather than aborting startup.
    pub async fn load_instagram_credentials(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<HashMap<String, InstagramCredential>> {
        let raw = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("reading {}", path.as_ref().display()))?;
        let parsed: HashMap<String, InstagramCredential> =
            serde_yaml::from_str(&raw).context("parsing instagram credentials")?;

        let Some(key) = self.fernet_key.as_deref() else {
            anyhow::bail!("FERNET_KEY is required to decrypt credentials");
        };
        let fernet = fernet::Fernet::new(key).context("invalid fernet key")?;

        let mut out = HashMap::with_capacity(parsed.len());
        for (name, mut cred) in parsed {
            match fernet.decrypt(&cred.password) {
                Ok(plain) => {
                    cred.password = String::from_utf8(plain).context("password not utf-8")?;
                    info!("decrypted password for {}", cred.alias);
                    out.insert(name, cred);
                }
                Err(_) => {
                    tracing::warn!("dropping credential {}: fernet decrypt failed", name);
                }
            }
        }
        Ok(out)
    }

    /// Load `limited_api_users.yaml`
    pub async fn load_limited_users(&self, path: impl AsRef<Path>) -> Result<LimitedUsers> {
        let raw = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("reading {}", path.as_ref().display()))?;
        serde_yaml::from_str(&raw).context("parsing limited users")
    }

    /// Load the known service token registry
    pub async fn load_service_tokens(&self, path: impl AsRef<Path>) -> Result<Vec<ServiceToken>> {
        let raw = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("reading {}", path.as_ref().display()))?;
        serde_yaml::from_str(&raw).context("parsing service tokens")
    }
}

fn split_env(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
