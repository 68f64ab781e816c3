//! Instagram post extraction
//!
//! The post payload is taken from the page's own `/api/v1/.../info` XHR
//! when the app fires one, falling back to the
//! `xdt_api__v1__media__shortcode__web_info` JSON tag embedded in the
//! served HTML. Both carry the same `items` shape.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{ApiError, ApiResult};
use crate::render::RenderOptions;

use super::types::{
    InstagramAuthor, InstagramPostItem, InstagramPostResponse, InstagramSidecar, media_url,
};
use super::{Extractors, XhrCapture, find_json_tag, is_heic_url, navigate_commit, suffix_for_url};

const POST_TTL: Duration = Duration::from_secs(12 * 86_400);
const FETCH_DEADLINE: Duration = Duration::from_secs(25);
const EMBED_TAG: &str = "xdt_api__v1__media__shortcode__web_info";
const BROKEN_LINK_MARKER: &str = "The link you followed may be broken";
const LOGIN_WALL_MARKER: &str = "Log in to see photos and videos";

#[derive(Debug, Default, Deserialize)]
struct RawPostInfo {
    #[serde(default)]
    items: Vec<RawItem>,
}

#[derive(Debug, Default, Deserialize)]
struct RawItem {
    #[serde(default)]
    pk: Option<serde_json::Value>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    user: Option<RawUser>,
    #[serde(default)]
    caption: Option<RawCaption>,
    #[serde(default)]
    like_count: Option<i64>,
    #[serde(default)]
    comment_count: Option<i64>,
    #[serde(default)]
    view_count: Option<i64>,
    #[serde(default)]
    play_count: Option<i64>,
    #[serde(default)]
    taken_at: Option<i64>,
    #[serde(default)]
    video_versions: Vec<RawMediaVersion>,
    #[serde(default)]
    image_versions2: Option<RawImageVersions>,
    #[serde(default)]
    carousel_media: Vec<RawItem>,
}

#[derive(Debug, Default, Deserialize)]
struct RawUser {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    full_name: Option<String>,
    #[serde(default)]
    is_private: Option<bool>,
    #[serde(default)]
    is_verified: Option<bool>,
    #[serde(default)]
    profile_pic_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCaption {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawMediaVersion {
    url: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawImageVersions {
    #[serde(default)]
    candidates: Vec<RawMediaVersion>,
}

impl RawItem {
    fn item_id(&self) -> Option<String> {
        let raw = match (&self.id, &self.pk) {
            (Some(id), _) => id.clone(),
            (None, Some(pk)) => pk.as_str().map(str::to_string).unwrap_or_else(|| pk.to_string()),
            _ => return None,
        };
        Some(raw.split('_').next().unwrap_or(&raw).to_string())
    }
}

impl Extractors {
    /// Fetch a post, memoized on the canonical URL
    pub async fn instagram_post(&self, url: &str) -> ApiResult<InstagramPostResponse> {
        let url = url.trim().trim_end_matches('/').to_string();
        if !url.contains("instagram.com") {
            return Err(ApiError::Validation("not an instagram url".into()));
        }
        self.memo
            .get_or_compute("instagram_post", &url, POST_TTL, || self.fetch_post(&url))
            .await?
            .ok_or_else(|| ApiError::NotFound("Post not found".into()))
    }

    async fn fetch_post(&self, url: &str) -> ApiResult<Option<InstagramPostResponse>> {
        let Some(raw) = self.fetch_post_payload(url).await? else {
            return Ok(None);
        };
        let info: RawPostInfo =
            serde_json::from_value(raw).map_err(|e| ApiError::Upstream {
                status: 502,
                detail: format!("unparseable post payload: {e}"),
            })?;
        Ok(self.map_post(info, url))
    }

    /// Page is borrowed only for the duration of payload capture; renders
    /// run after release.
    async fn fetch_post_payload(&self, url: &str) -> ApiResult<Option<serde_json::Value>> {
        let guard = self.pool.borrow_page(false, None).await?;
        let mut capture = XhrCapture::attach(guard.page(), &["instagram.com/api/v1/", "info"])
            .await
            .map_err(anyhow::Error::from)?;
        navigate_commit(guard.page(), url)
            .await
            .map_err(anyhow::Error::from)?;

        let started = tokio::time::Instant::now();
        loop {
            if let Some(body) = capture.recv(Duration::from_millis(800)).await {
                if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&body) {
                    return Ok(Some(value));
                }
            }
            let html = guard
                .page()
                .content()
                .await
                .map_err(anyhow::Error::from)?;
            if html.contains(BROKEN_LINK_MARKER) {
                return Ok(None);
            }
            // A logged-out wall means the session itself is burned, not
            // just this request; take it out of rotation for the TTL and
            // try to re-authenticate once the page is back.
            if html.contains(LOGIN_WALL_MARKER) {
                let username = guard.username().to_string();
                self.pool.flag(&username).await?;
                let pool = self.pool.clone();
                let relogin_user = username.clone();
                tokio::spawn(async move {
                    if let Err(e) = pool.relogin(&relogin_user).await {
                        tracing::warn!("relogin for {relogin_user} failed: {e}");
                    }
                });
                return Err(ApiError::upstream(
                    502,
                    format!("session {username} hit a login wall"),
                ));
            }
            if let Some(tag) = find_json_tag(&html, EMBED_TAG) {
                return Ok(Some(tag));
            }
            if started.elapsed() > FETCH_DEADLINE {
                return Err(ApiError::Timeout(format!("no post payload for {url}")));
            }
        }
    }

    fn map_post(&self, info: RawPostInfo, url: &str) -> Option<InstagramPostResponse> {
        if info.items.is_empty() {
            return None;
        }
        let mut final_resp = InstagramPostResponse {
            share_url: Some(url.to_string()),
            ..Default::default()
        };

        if let Some(user) = info.items.first().and_then(|i| i.user.as_ref()) {
            let mut author = InstagramAuthor {
                username: user.username.clone(),
                full_name: user.full_name.clone(),
                is_private: user.is_private,
                is_verified: user.is_verified,
                ..Default::default()
            };
            if let Some(pic) = &user.profile_pic_url {
                let (filename, _task) = self.render.start_render(
                    pic,
                    "Instagram",
                    RenderOptions::suffix(&suffix_for_url(pic)),
                );
                author.avatar_url = Some(media_url(&filename));
                author.avatar_filename = Some(filename);
            }
            final_resp.author = Some(author);
        }

        for item in &info.items {
            let mut out = InstagramPostItem {
                id: item.item_id(),
                caption: item.caption.as_ref().and_then(|c| c.text.clone()),
                like_count: item.like_count,
                comment_count: item.comment_count,
                view_count: item.view_count.or(item.play_count),
                taken_at: item.taken_at,
                ..Default::default()
            };

            if let Some(video) = item.video_versions.first() {
                let (filename, _task) =
                    self.render
                        .start_render(&video.url, "Instagram", RenderOptions::suffix(".mp4"));
                out.video_url = Some(media_url(&filename));
                out.video_filename = Some(filename);
                out.is_video = true;
            } else if let Some(iv) = &item.image_versions2 {
                if let Some(choice) = iv.candidates.iter().find(|c| !is_heic_url(&c.url)) {
                    let (filename, _task) = self.render.start_render(
                        &choice.url,
                        "Instagram",
                        RenderOptions::suffix(".jpg"),
                    );
                    out.image_url = Some(media_url(&filename));
                    out.image_filename = Some(filename);
                }
            }

            if let Some(iv) = &item.image_versions2 {
                let middle = iv.candidates.len() / 2;
                if let Some(preview) = iv.candidates.get(middle) {
                    let (filename, _task) = self.render.start_render(
                        &preview.url,
                        "Instagram",
                        RenderOptions::suffix(".jpg"),
                    );
                    out.preview_image_url = Some(media_url(&filename));
                    out.preview_image_filename = Some(filename);
                }
            }

            for cm in &item.carousel_media {
                out.sidecars.push(self.map_sidecar(cm));
            }
            out.sidecar_count = out.sidecars.len();
            final_resp.items.push(out);
        }

        final_resp.num_results = final_resp.items.len();
        Some(final_resp)
    }

    /// Non-primary carousel candidates are registered passively; the media
    /// route downloads them on first access.
    fn map_sidecar(&self, cm: &RawItem) -> InstagramSidecar {
        let mut out = InstagramSidecar::default();
        if let Some(video) = cm.video_versions.first() {
            let (filename, _task) =
                self.render
                    .start_render(&video.url, "Instagram", RenderOptions::suffix(".mp4"));
            out.url = Some(media_url(&filename));
            out.filename = Some(filename);
            out.is_video = true;
        } else if let Some(iv) = &cm.image_versions2 {
            if let Some(choice) = iv.candidates.iter().find(|c| !is_heic_url(&c.url)) {
                let (filename, _task) = self.render.start_render(
                    &choice.url,
                    "Instagram",
                    RenderOptions::passive_suffix(".jpg"),
                );
                out.url = Some(media_url(&filename));
                out.filename = Some(filename);
            }
        }
        if let Some(iv) = &cm.image_versions2 {
            let middle = (iv.candidates.len() / 2).min(7);
            if let Some(preview) = iv.candidates.get(middle) {
                let (filename, _task) = self.render.start_render(
                    &preview.url,
                    "Instagram",
                    RenderOptions::passive_suffix(".jpg"),
                );
                out.preview_image_url = Some(media_url(&filename));
                out.preview_image_filename = Some(filename);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_id_strips_composite_suffix() {
        let item = RawItem {
            id: Some("321_789".into()),
            ..Default::default()
        };
        assert_eq!(item.item_id().unwrap(), "321");

        let item = RawItem {
            pk: Some(serde_json::json!(12345)),
            ..Default::default()
        };
        assert_eq!(item.item_id().unwrap(), "12345");
    }

    #[test]
    fn raw_payload_parses_with_partial_fields() {
        let info: RawPostInfo = serde_json::from_str(
            r#"{
                "items": [{
                    "pk": "1_2",
                    "user": {"username": "someone", "is_verified": true},
                    "like_count": 7,
                    "image_versions2": {"candidates": [
                        {"url": "https://cdn.test/a.heic"},
                        {"url": "https://cdn.test/a.jpg"}
                    ]}
                }]
            }"#,
        )
        .unwrap();
        assert_eq!(info.items.len(), 1);
        let item = &info.items[0];
        assert_eq!(item.user.as_ref().unwrap().username.as_deref(), Some("someone"));
        assert!(item.video_versions.is_empty());
        assert_eq!(item.image_versions2.as_ref().unwrap().candidates.len(), 2);
    }
}
