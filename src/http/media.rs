//! Media serving
//!
//! The gateway never streams artifact bytes itself. It waits for any
//! in-flight render, resolves passive registrations on first access, and
//! answers with an `X-Accel-Redirect` header pointing the fronting server
//! at the artifact, plus the best MIME type it knows.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::Response;
use serde::Deserialize;

use crate::error::{ApiError, ApiResult};

use super::Context;

#[derive(Debug, Default, Deserialize)]
pub struct MediaQuery {
    /// Serve the optimized `.webp` sibling instead of the artifact itself
    #[serde(default)]
    pub opti: Option<bool>,
}

pub async fn media_fetch(
    State(ctx): State<Arc<Context>>,
    Path(file_path): Path<String>,
    Query(query): Query<MediaQuery>,
) -> ApiResult<Response> {
    // Same traversal rules as the blob store, checked before any waiting
    if file_path.contains('/') || file_path.contains("..") {
        return Err(ApiError::Validation("invalid media path".into()));
    }

    if let Some(event) = ctx.render.active_event(&file_path) {
        event.wait().await;
    }

    let mut mime = ctx.render.download_passive(&file_path).await?;

    if query.opti.unwrap_or(false) {
        if let Some(opti_path) = ctx.settings.opti_path.as_deref() {
            let (webp_name, _data) = ctx
                .blob
                .optimize(&file_path, opti_path)
                .await
                .map_err(|e| ApiError::Internal(format!("optimize failed: {e:#}")))?;
            return accel_redirect(&webp_name, Some("image/webp".to_string()));
        }
    }

    if mime.is_none() {
        mime = mime_guess::from_path(&file_path)
            .first()
            .map(|m| m.to_string());
    }
    accel_redirect(&file_path, mime)
}

/// The fronting server streams the bytes; we only answer with the artifact
/// name and the best MIME we know.
fn accel_redirect(target: &str, mime: Option<String>) -> ApiResult<Response> {
    let mut builder = Response::builder().status(StatusCode::OK).header(
        "X-Accel-Redirect",
        HeaderValue::from_str(target)
            .map_err(|_| ApiError::Validation("invalid media path".into()))?,
    );
    if let Some(mime) = mime {
        builder = builder.header(header::CONTENT_TYPE, mime);
    }
    builder
        .body(axum::body::Body::empty())
        .map_err(|e| ApiError::Internal(e.to_string()))
}
