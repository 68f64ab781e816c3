//! API route handlers
//!
//! Thin shells over the extraction engines: decode inputs, apply the route
//! deadline, serialize the typed response.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::Html;
use axum::{Extension, Json};
use serde::Deserialize;
use tokio::time::timeout;
use tracing::info;

use crate::error::ApiResult;
use crate::extract::types::{BitcoinTransactionResponse, InstagramPostResponse, TikTokVideoList};

use super::{ApiUsername, Context};

const CRYPTO_DEADLINE: Duration = Duration::from_secs(30);
const INSTAGRAM_DEADLINE: Duration = Duration::from_secs(60);
const TIKTOK_DEADLINE: Duration = Duration::from_secs(120);

const DEFAULT_FEED_COUNT: usize = 10;

pub async fn crypto_transaction(
    State(ctx): State<Arc<Context>>,
    Path(txid): Path<String>,
) -> ApiResult<Json<BitcoinTransactionResponse>> {
    let tx = timeout(CRYPTO_DEADLINE, ctx.extract.crypto_transaction(&txid)).await??;
    Ok(Json(tx))
}

#[derive(Debug, Deserialize)]
pub struct InstagramPostQuery {
    pub url: String,
}

pub async fn instagram_post(
    State(ctx): State<Arc<Context>>,
    Extension(ApiUsername(caller)): Extension<ApiUsername>,
    Query(query): Query<InstagramPostQuery>,
) -> ApiResult<Json<InstagramPostResponse>> {
    info!("{caller} requested instagram post {}", query.url);
    let post = timeout(INSTAGRAM_DEADLINE, ctx.extract.instagram_post(&query.url)).await??;
    Ok(Json(post))
}

#[derive(Debug, Deserialize)]
pub struct CountQuery {
    pub count: Option<usize>,
}

pub async fn tiktok_user_videos(
    State(ctx): State<Arc<Context>>,
    Extension(ApiUsername(caller)): Extension<ApiUsername>,
    Path(username): Path<String>,
    Query(query): Query<CountQuery>,
) -> ApiResult<Json<TikTokVideoList>> {
    let count = query.count.unwrap_or(DEFAULT_FEED_COUNT);
    info!("{caller} requested {count} tiktok videos for {username}");
    let list = timeout(
        TIKTOK_DEADLINE,
        ctx.extract.tiktok_user_videos(&username, count),
    )
    .await??;
    Ok(Json(list))
}

pub async fn tiktok_feed(
    State(ctx): State<Arc<Context>>,
    Extension(ApiUsername(caller)): Extension<ApiUsername>,
    Query(query): Query<CountQuery>,
) -> ApiResult<Json<TikTokVideoList>> {
    let count = query.count.unwrap_or(DEFAULT_FEED_COUNT);
    info!("{caller} requested a {count}-item for-you sample");
    let list = timeout(TIKTOK_DEADLINE, ctx.extract.tiktok_for_you_feed(count)).await??;
    Ok(Json(list))
}

pub async fn docs() -> Html<&'static str> {
    Html(DOCS_HTML)
}

const DOCS_HTML: &str = r#"<!doctype html>
<html>
<head>
  <meta charset="utf-8">
  <title>mediagate</title>
  <style>
    body { font-family: ui-monospace, monospace; margin: 3rem auto; max-width: 46rem; }
    code { background: #f0f0f0; padding: 0.1rem 0.3rem; }
    td { padding: 0.25rem 0.75rem 0.25rem 0; vertical-align: top; }
  </style>
</head>
<body>
  <h1>mediagate</h1>
  <p>Centrally cached data-extraction gateway. All media responses reference
  content-addressed filenames served under <code>/media/</code>.</p>
  <table>
    <tr><td><code>GET /api/crypto/{txid}</code></td><td>Bitcoin transaction detail with a live USD quote</td></tr>
    <tr><td><code>GET /api/instagram/post?url=</code></td><td>Instagram post, reel, or carousel</td></tr>
    <tr><td><code>GET /api/tiktok/user/{username}/videos?count=</code></td><td>Recent videos for a TikTok user</td></tr>
    <tr><td><code>GET /api/tiktok/feed?count=</code></td><td>Current for-you feed sample</td></tr>
    <tr><td><code>GET /media/{filename}</code></td><td>Rendered media artifacts</td></tr>
  </table>
</body>
</html>
"#;
