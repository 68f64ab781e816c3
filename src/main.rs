use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mediagate::browser::SessionPool;
use mediagate::cache::Memoize;
use mediagate::config::{CHROME_USER_AGENT, LimitedUsers, Settings};
use mediagate::extract::Extractors;
use mediagate::http::Context;
use mediagate::shutdown::{Shutdown, drain_and_exit};
use mediagate::{AuditLog, BlobStore, KvStore, RenderRunner, Verifier};

const LISTEN_ADDR: &str = "0.0.0.0:8091";
const MEMPOOL_BASE: &str = "https://mempool.space/api";
const SERVICE_TOKENS_FILE: &str = "service_tokens.yaml";
const LIMITED_USERS_FILE: &str = "limited_api_users.yaml";
const INSTAGRAM_CREDENTIALS_FILE: &str = "instagram_credentials.yaml";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env().context("loading settings")?;
    let kv = KvStore::connect(&settings.db_url).await?;
    let audit = AuditLog::new(kv.pool().clone()).await?;
    let blob = BlobStore::open(&settings.cache_dir).await?;

    let client = reqwest::Client::builder()
        .user_agent(CHROME_USER_AGENT)
        .timeout(Duration::from_secs(30))
        .build()?;
    let fallback = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;

    let render = RenderRunner::new(
        blob.clone(),
        kv.clone(),
        client.clone(),
        fallback,
        settings.debug,
    );

    let credentials = match settings
        .load_instagram_credentials(INSTAGRAM_CREDENTIALS_FILE)
        .await
    {
        Ok(credentials) => {
            info!("loaded {} instagram credentials", credentials.len());
            credentials
        }
        Err(e) => {
            warn!("no instagram credentials loaded: {e:#}");
            HashMap::new()
        }
    };

    let shutdown = Shutdown::new();
    let pool = SessionPool::build(&settings, kv.clone(), shutdown.clone(), credentials).await?;
    tokio::spawn(pool.clone().save_loop());

    let service_tokens = match settings.load_service_tokens(SERVICE_TOKENS_FILE).await {
        Ok(tokens) => tokens,
        Err(e) => {
            warn!("no service token registry loaded: {e:#}");
            Vec::new()
        }
    };
    let limited = match settings.load_limited_users(LIMITED_USERS_FILE).await {
        Ok(limited) => limited,
        Err(e) => {
            warn!("no limited-user registry loaded: {e:#}");
            LimitedUsers::default()
        }
    };
    let verifier = Verifier::from_jwks(
        &client,
        &settings.jwks_url,
        &settings.audiences,
        &settings.issuers,
        &service_tokens,
        settings.debug,
    )
    .await?;

    let extract = Extractors {
        pool: pool.clone(),
        render: render.clone(),
        memo: Memoize::new(kv.clone()),
        http: client,
        mempool_base: MEMPOOL_BASE.to_string(),
    };

    let ctx = Arc::new(Context {
        settings,
        kv,
        blob,
        render,
        pool: pool.clone(),
        extract,
        verifier,
        limited,
        audit,
        shutdown: shutdown.clone(),
    });

    let app = mediagate::router(ctx);
    let listener = tokio::net::TcpListener::bind(LISTEN_ADDR)
        .await
        .with_context(|| format!("binding {LISTEN_ADDR}"))?;
    info!("listening on {LISTEN_ADDR}");

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("server error")?;
        }
        _ = shutdown.wait() => {
            drain_and_exit(&pool).await;
        }
        _ = tokio::signal::ctrl_c() => {
            shutdown.trigger();
            drain_and_exit(&pool).await;
        }
    }
    Ok(())
}
