//! TikTok feed extraction
//!
//! Both feeds are infinite-scroll surfaces: drive the mouse wheel until the
//! app has emitted enough `item_list` XHR payloads or the feed goes idle.

use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;

use crate::config::SCROLL_IDLE_TIMEOUT;
use crate::error::{ApiError, ApiResult};

use super::types::{TikTokVideoItem, TikTokVideoList};
use super::{Extractors, XhrCapture, navigate_commit, wheel_scroll};

const LIST_TTL: Duration = Duration::from_secs(2 * 3600);
const USER_FRAGMENT: &str = "/api/post/item_list/";
const FEED_FRAGMENT: &str = "/api/recommend/item_list";
const FOR_YOU_URL: &str = "https://www.tiktok.com/foryou?is_copy_url=1&is_from_webapp=v1";

/// Per-surface scroll tuning; the for-you feed loads far ahead of the
/// viewport and tolerates much larger jumps.
struct ScrollProfile {
    bursts: usize,
    min_delta: f64,
    max_delta: f64,
    settle: Duration,
}

const USER_SCROLL: ScrollProfile = ScrollProfile {
    bursts: 1,
    min_delta: 500.0,
    max_delta: 1200.0,
    settle: Duration::from_secs(1),
};

const FEED_SCROLL: ScrollProfile = ScrollProfile {
    bursts: 10,
    min_delta: 2000.0,
    max_delta: 3500.0,
    settle: Duration::from_millis(300),
};

/// TikTok handle rules: 24 chars max, alphanumerics plus `_` and `.`, no
/// trailing period. A leading `@` is accepted and stripped.
pub fn validate_username(name: &str) -> ApiResult<String> {
    let name = name.trim().trim_start_matches('@');
    if name.is_empty() || name.len() > 24 {
        return Err(ApiError::Validation(
            "usernames must be 1-24 characters".into(),
        ));
    }
    if name.ends_with('.') {
        return Err(ApiError::Validation(
            "usernames cannot end with a period".into(),
        ));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && *c != '_' && *c != '.')
    {
        return Err(ApiError::Validation(format!(
            "{c:?} is not allowed in TikTok usernames"
        )));
    }
    Ok(name.to_string())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawItemList {
    #[serde(default)]
    item_list: Vec<RawFeedItem>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFeedItem {
    #[serde(default)]
    id: String,
    #[serde(default)]
    desc: Option<String>,
    #[serde(default)]
    create_time: Option<i64>,
    #[serde(default)]
    author: Option<RawFeedAuthor>,
    #[serde(default)]
    stats: Option<RawFeedStats>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFeedAuthor {
    #[serde(default)]
    unique_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFeedStats {
    #[serde(default)]
    play_count: Option<i64>,
    #[serde(default)]
    comment_count: Option<i64>,
}

fn parse_item_list(body: &[u8]) -> Vec<TikTokVideoItem> {
    // Non-JSON or truncated bodies yield nothing; the scroll loop retries.
    let Ok(list) = serde_json::from_slice::<RawItemList>(body) else {
        return Vec::new();
    };
    list.item_list
        .into_iter()
        .filter(|item| !item.id.is_empty())
        .map(|item| {
            let author_id = item.author.and_then(|a| a.unique_id);
            let url = author_id
                .as_deref()
                .map(|a| format!("https://www.tiktok.com/@{a}/video/{}", item.id));
            TikTokVideoItem {
                id: item.id,
                title: item.desc,
                author_id,
                plays: item.stats.as_ref().and_then(|s| s.play_count),
                comments: item.stats.as_ref().and_then(|s| s.comment_count),
                date: item.create_time,
                url,
            }
        })
        .collect()
}

impl Extractors {
    pub async fn tiktok_user_videos(
        &self,
        username: &str,
        count: usize,
    ) -> ApiResult<TikTokVideoList> {
        let username = validate_username(username)?;
        let url = format!("https://www.tiktok.com/@{username}");
        self.memo
            .get_or_compute(
                "tiktok_user_videos",
                &(&username, count),
                LIST_TTL,
                || self.scroll_feed(&url, USER_FRAGMENT, count, &USER_SCROLL),
            )
            .await?
            .ok_or_else(|| {
                ApiError::NotFound("Invalid username or invalid TikTok response data".into())
            })
    }

    pub async fn tiktok_for_you_feed(&self, count: usize) -> ApiResult<TikTokVideoList> {
        self.memo
            .get_or_compute("tiktok_fyp", &count, LIST_TTL, || {
                self.scroll_feed(FOR_YOU_URL, FEED_FRAGMENT, count, &FEED_SCROLL)
            })
            .await?
            .ok_or_else(|| ApiError::NotFound("Rendered no tiktoks".into()))
    }

    async fn scroll_feed(
        &self,
        url: &str,
        fragment: &str,
        want: usize,
        profile: &ScrollProfile,
    ) -> ApiResult<Option<TikTokVideoList>> {
        let want = want.clamp(1, 500);
        let guard = self.pool.borrow_page(false, None).await?;
        let mut capture = XhrCapture::attach(guard.page(), &[fragment])
            .await
            .map_err(anyhow::Error::from)?;
        navigate_commit(guard.page(), url)
            .await
            .map_err(anyhow::Error::from)?;

        let mut items: Vec<TikTokVideoItem> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut last_payload = tokio::time::Instant::now();

        while items.len() < want {
            for _ in 0..profile.bursts {
                let delta =
                    rand::random_range(profile.min_delta..profile.max_delta);
                if let Err(e) = wheel_scroll(guard.page(), delta).await {
                    tracing::warn!("scroll failed on {url}: {e:#}");
                    break;
                }
            }
            match capture.recv(profile.settle).await {
                Some(body) => {
                    last_payload = tokio::time::Instant::now();
                    for item in parse_item_list(&body) {
                        if seen.insert(item.id.clone()) {
                            items.push(item);
                        }
                    }
                    tracing::debug!("feed at {}/{want} items", items.len());
                }
                None if last_payload.elapsed() > SCROLL_IDLE_TIMEOUT => break,
                None => {}
            }
        }
        drop(capture);
        drop(guard);

        if items.is_empty() {
            return Ok(None);
        }
        items.truncate(want);
        Ok(Some(TikTokVideoList {
            count: items.len(),
            items,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_rules() {
        assert_eq!(validate_username("@some.user_1").unwrap(), "some.user_1");
        assert!(validate_username("ends.").is_err());
        assert!(validate_username("has space").is_err());
        assert!(validate_username("waytoolongforatiktokhandle").is_err());
        assert!(validate_username("").is_err());
    }

    #[test]
    fn item_list_payload_maps_to_snake_case_items() {
        let body = br#"{
            "itemList": [{
                "id": "724",
                "desc": "a video",
                "createTime": 1700000000,
                "author": {"uniqueId": "someone"},
                "stats": {"playCount": 10, "commentCount": 2}
            }]
        }"#;
        let items = parse_item_list(body);
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.url.as_deref(), Some("https://www.tiktok.com/@someone/video/724"));
        assert_eq!(item.plays, Some(10));

        let json = serde_json::to_value(item).unwrap();
        assert!(json.get("author_id").is_some());
    }

    #[test]
    fn garbage_payload_yields_no_items() {
        assert!(parse_item_list(b"<html>block page</html>").is_empty());
        assert!(parse_item_list(b"{}").is_empty());
    }
}
