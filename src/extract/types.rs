//! Response models for the extraction engines
//!
//! Every media reference in these models is a content-addressed filename
//! under the media route, never an upstream URL. Optional fields are
//! omitted from the JSON body when unset.

use serde::{Deserialize, Serialize};

/// Public media-route path for a rendered filename
pub fn media_url(filename: &str) -> String {
    format!("/media/{filename}")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstagramAuthor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_private: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstagramSidecar {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_image_filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_image_url: Option<String>,
    pub is_video: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstagramPostItem {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub is_video: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub like_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taken_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_image_filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sidecars: Vec<InstagramSidecar>,
    pub sidecar_count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstagramPostResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<InstagramAuthor>,
    pub items: Vec<InstagramPostItem>,
    pub num_results: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TikTokVideoItem {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plays: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comments: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TikTokVideoList {
    pub count: usize,
    pub items: Vec<TikTokVideoItem>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BitcoinTransactionResponse {
    pub txid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_height: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_time: Option<i64>,
    /// Blocks on top of the confirming block, inclusive; absent while
    /// unconfirmed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmations: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee: Option<i64>,
    /// sat/vB, derived from fee over vsize
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locktime: Option<i64>,
    /// Sum of output values in BTC
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usd_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_btc_market_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_fields_are_omitted() {
        let item = InstagramPostItem::default();
        let json = serde_json::to_value(&item).unwrap();
        let obj = json.as_object().unwrap();
        assert!(!obj.contains_key("video_filename"));
        assert!(!obj.contains_key("caption"));
        assert!(obj.contains_key("is_video"));
    }

    #[test]
    fn media_url_prefixes_route() {
        assert_eq!(media_url("Instagramabc123.jpg"), "/media/Instagramabc123.jpg");
    }
}
