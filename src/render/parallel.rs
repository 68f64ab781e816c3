//! Multi-connection ranged downloader for large media hosts
//!
//! Issues a two-byte ranged GET to learn the total size and the resolved
//! URL, splits the body into contiguous byte ranges, fetches each range
//! with bounded retries, and reassembles the parts in index order.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::sync::Semaphore;
use tracing::debug;

/// Retries per range part
const PART_RETRIES: usize = 3;

/// Pause between part retries
const PART_BACKOFF: Duration = Duration::from_millis(100);

/// Probe the total size via `Range: bytes=0-1`, returning the size and the
/// post-redirect URL so every part hits the same origin.
async fn pre_request(client: &reqwest::Client, url: &str) -> Result<(u64, String)> {
    let resp = client
        .get(url)
        .header(reqwest::header::RANGE, "bytes=0-1")
        .send()
        .await?
        .error_for_status()?;
    let resolved = resp.url().to_string();
    let content_range = resp
        .headers()
        .get(reqwest::header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .context("no Content-Range on ranged probe")?;
    let total: u64 = content_range
        .rsplit('/')
        .next()
        .and_then(|s| s.parse().ok())
        .with_context(|| format!("unparseable Content-Range: {content_range}"))?;
    Ok((total, resolved))
}

async fn fetch_part(
    client: &reqwest::Client,
    url: &str,
    index: usize,
    start: u64,
    end: u64,
) -> Result<(usize, Bytes)> {
    let mut last_err = None;
    for attempt in 0..PART_RETRIES {
        if attempt > 0 {
            tokio::time::sleep(PART_BACKOFF).await;
        }
        let result = async {
            let resp = client
                .get(url)
                .header(reqwest::header::RANGE, format!("bytes={start}-{end}"))
                .send()
                .await?
                .error_for_status()?;
            anyhow::Ok(resp.bytes().await?)
        }
        .await;
        match result {
            Ok(body) => return Ok((index, body)),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("range fetch failed")))
}

/// Fetch `url` over `limit` parallel range connections bounded by `sem`.
pub async fn fetch_parallel(
    client: &reqwest::Client,
    sem: &Arc<Semaphore>,
    url: &str,
    limit: usize,
) -> Result<Bytes> {
    let (total, resolved) = pre_request(client, url).await?;
    if total == 0 {
        anyhow::bail!("zero-length body for {url}");
    }
    let limit = limit.clamp(1, total as usize);
    let part_length = total / limit as u64;

    let mut tasks = Vec::with_capacity(limit);
    for i in 0..limit {
        let start = i as u64 * part_length;
        let end = if i + 1 < limit {
            (i as u64 + 1) * part_length - 1
        } else {
            total - 1
        };
        let client = client.clone();
        let sem = Arc::clone(sem);
        let resolved = resolved.clone();
        tasks.push(tokio::spawn(async move {
            let _permit = sem
                .acquire_owned()
                .await
                .context("part semaphore closed")?;
            fetch_part(&client, &resolved, i, start, end).await
        }));
    }
    debug!("fetching {url} as {limit} parts of ~{part_length} bytes");

    let mut parts = Vec::with_capacity(limit);
    for task in tasks {
        parts.push(task.await.context("part task panicked")??);
    }
    parts.sort_by_key(|(index, _)| *index);

    let mut final_body = Vec::with_capacity(total as usize);
    for (_, part) in parts {
        final_body.extend_from_slice(&part);
    }
    if final_body.len() as u64 != total {
        anyhow::bail!(
            "reassembled {} bytes, expected {total} for {url}",
            final_body.len()
        );
    }
    Ok(Bytes::from(final_body))
}
