//! HTTP surface
//!
//! One axum router over a shared [`Context`]. The access middleware
//! resolves the caller identity, enforces the user blocklist, emits the
//! access log line, and journals slow or failed requests.

pub mod media;
pub mod routes;

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::Body;
use axum::extract::{MatchedPath, Request, State};
use axum::http::Method;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::audit::{AUDIT_THRESHOLD, AuditLog, RequestRecord, client_ip};
use crate::auth::{Verifier, check_blacklist};
use crate::blob::BlobStore;
use crate::browser::SessionPool;
use crate::config::{LimitedUsers, Settings};
use crate::error::{ApiError, ErrorDetail};
use crate::extract::Extractors;
use crate::kv::KvStore;
use crate::render::RenderRunner;
use crate::shutdown::Shutdown;

/// Shared handles for every handler
pub struct Context {
    pub settings: Settings,
    pub kv: KvStore,
    pub blob: BlobStore,
    pub render: RenderRunner,
    pub pool: Arc<SessionPool>,
    pub extract: Extractors,
    pub verifier: Verifier,
    pub limited: LimitedUsers,
    pub audit: AuditLog,
    pub shutdown: Shutdown,
}

/// Resolved caller identity, attached to the request by the middleware
#[derive(Debug, Clone)]
pub struct ApiUsername(pub String);

pub fn router(ctx: Arc<Context>) -> Router {
    Router::new()
        .route("/", get(routes::docs))
        .route("/media/{*file_path}", get(media::media_fetch))
        .route("/api/crypto/{txid}", get(routes::crypto_transaction))
        .route("/api/instagram/post", get(routes::instagram_post))
        .route(
            "/api/tiktok/user/{username}/videos",
            get(routes::tiktok_user_videos),
        )
        .route("/api/tiktok/feed", get(routes::tiktok_feed))
        .layer(middleware::from_fn_with_state(ctx.clone(), access_layer))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

/// Routes that accept unauthenticated callers
fn is_public(path: &str) -> bool {
    path == "/" || path.starts_with("/media/")
}

/// Journaled bodies are capped; anything larger is dropped, not truncated
const AUDIT_BODY_LIMIT: usize = 64 * 1024;

/// Identity, blocklist, access log, and audit journaling around every
/// request.
async fn access_layer(
    State(ctx): State<Arc<Context>>,
    mut request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let request_id = uuid::Uuid::new_v4().to_string();
    let path = request.uri().path().to_string();
    let route_name = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| path.clone());
    let ip = client_ip(request.headers());

    let username = match ctx.verifier.identity(request.headers(), is_public(&path)) {
        Ok(username) => username,
        Err(e) => return e.into_response(),
    };
    if !is_public(&path) && !route_allowed(&ctx.limited, &username, &path) {
        return ApiError::Unauthorized(format!("{username} is not entitled to {path}"))
            .into_response();
    }

    let path_args = encode_path_args(&route_name, &path);
    let (args, mut user_id) = split_query(request.uri().query());

    // POST bodies are journaled; buffer, pull user_id if the query lacked
    // one, and hand the handler an equivalent request.
    let mut body_text = None;
    if request.method() == Method::POST {
        let (parts, body) = request.into_parts();
        let bytes = axum::body::to_bytes(body, AUDIT_BODY_LIMIT)
            .await
            .unwrap_or_default();
        if let Ok(mut parsed) =
            serde_json::from_slice::<serde_json::Map<String, serde_json::Value>>(&bytes)
        {
            if user_id.is_none() {
                user_id = parsed.remove("user_id").map(|v| match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                });
            }
            body_text = serde_json::to_string(&parsed).ok();
        }
        request = Request::from_parts(parts, Body::from(bytes));
    }

    if let Some(user_id) = &user_id {
        if let Err(e) = check_blacklist(&ctx.kv, user_id).await {
            return e.into_response();
        }
    }

    request
        .extensions_mut()
        .insert(ApiUsername(username.clone()));
    let response = next.run(request).await;

    let elapsed = started.elapsed();
    info!("{username}: {path} timed: {:.3}s", elapsed.as_secs_f64());

    if elapsed > AUDIT_THRESHOLD && !ctx.settings.debug {
        let error = response
            .extensions()
            .get::<ErrorDetail>()
            .map(|d| d.0.clone());
        ctx.audit.record(RequestRecord {
            request_id,
            created_at: chrono::Utc::now(),
            route_name,
            processing_time: elapsed.as_secs_f64(),
            username,
            user_id,
            args,
            path_args,
            body: body_text,
            failed: response.status().is_client_error() || response.status().is_server_error(),
            error,
            ip,
        });
    }
    response
}

/// Callers listed in `limited_api_users.yaml` may only hit the route
/// families named for them; everyone else is unrestricted.
fn route_allowed(limited: &LimitedUsers, username: &str, path: &str) -> bool {
    match limited.users.get(username) {
        Some(allowed) => allowed.iter().any(|family| path.contains(family.as_str())),
        None => true,
    }
}

/// Matched-path parameters as a JSON object, `None` for parameterless
/// routes. Derived by lining the request path up against the matched
/// route template; a `{*wildcard}` captures the whole remaining tail.
fn encode_path_args(route: &str, path: &str) -> Option<String> {
    let mut map = serde_json::Map::new();
    let mut actual = path.splitn(route.split('/').count(), '/');
    for segment in route.split('/') {
        let Some(value) = actual.next() else { break };
        if let Some(name) = segment
            .strip_prefix('{')
            .and_then(|s| s.strip_suffix('}'))
        {
            map.insert(
                name.trim_start_matches('*').to_string(),
                serde_json::Value::String(value.to_string()),
            );
        }
    }
    if map.is_empty() {
        None
    } else {
        serde_json::to_string(&map).ok()
    }
}

/// Query string as JSON with `user_id` split out for the blocklist check
fn split_query(query: Option<&str>) -> (Option<String>, Option<String>) {
    let Some(query) = query else {
        return (None, None);
    };
    let mut user_id = None;
    let mut rest = serde_json::Map::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if key == "user_id" {
            user_id = Some(value.to_string());
        } else {
            rest.insert(key.to_string(), serde_json::Value::String(value.to_string()));
        }
    }
    let args = if rest.is_empty() {
        None
    } else {
        serde_json::to_string(&rest).ok()
    };
    (args, user_id)
}
