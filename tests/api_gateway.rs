//! Router-level behavior: auth precedence, error shapes, media serving

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{JPEG_BYTES, build_gateway, signed_token, valid_claims};
use http_body_util::BodyExt;
use mediagate::http::router;
use tower::ServiceExt;

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn authed_get(uri: &str, email: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("Cf-Access-Authenticated-User-Email", email)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn docs_page_is_public() {
    let gw = build_gateway().await.unwrap();
    let app = router(gw.ctx.clone());
    let response = app.oneshot(get("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn api_routes_require_credentials() {
    let gw = build_gateway().await.unwrap();
    let app = router(gw.ctx.clone());
    let response = app
        .oneshot(get(&format!("/api/crypto/{}", "ab".repeat(32))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["code"], 403);
    assert!(body["detail"].is_string());
}

#[tokio::test]
async fn jwt_assertion_authenticates() {
    let mut gw = build_gateway().await.unwrap();
    mock_transaction(&mut gw.upstream, &"cd".repeat(32)).await;
    let app = router(gw.ctx.clone());

    let token = signed_token(valid_claims("svc@example.com"));
    let request = Request::builder()
        .uri(format!("/api/crypto/{}", "cd".repeat(32)))
        .header("cf-access-jwt-assertion", token)
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

async fn mock_transaction(server: &mut mockito::ServerGuard, txid: &str) {
    server
        .mock("GET", format!("/tx/{txid}").as_str())
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            serde_json::json!({
                "txid": txid,
                "version": 2,
                "locktime": 0,
                "size": 225,
                "weight": 900,
                "fee": 1500,
                "status": {"confirmed": true, "block_height": 800_000, "block_time": 1_700_000_000},
                "vout": [{"value": 150_000_000u64}, {"value": 50_000_000u64}],
            })
            .to_string(),
        )
        .create_async()
        .await;
    server
        .mock("GET", "/v1/prices")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"USD": 50000.0}"#)
        .create_async()
        .await;
    server
        .mock("GET", "/blocks/tip/height")
        .with_status(200)
        .with_body("800100")
        .create_async()
        .await;
}

#[tokio::test]
async fn crypto_lookup_combines_price_and_transaction() {
    let mut gw = build_gateway().await.unwrap();
    let txid = "ab".repeat(32);
    mock_transaction(&mut gw.upstream, &txid).await;
    let app = router(gw.ctx.clone());

    let response = app
        .oneshot(authed_get(&format!("/api/crypto/{txid}"), "ops@example.com"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["txid"], txid);
    assert_eq!(body["total_value"], 2.0);
    assert_eq!(body["usd_value"], 100_000.0);
    assert_eq!(body["current_btc_market_rate"], 50_000.0);
    assert_eq!(body["confirmed"], true);
    // tip 800100 over block 800000, inclusive
    assert_eq!(body["confirmations"], 101);
    // fee 1500 over vsize 225
    let fee_rate = body["fee_rate"].as_f64().unwrap();
    assert!((fee_rate - 1500.0 / 225.0).abs() < 1e-9);
}

#[tokio::test]
async fn unknown_transaction_is_not_found() {
    let mut gw = build_gateway().await.unwrap();
    let txid = "ee".repeat(32);
    gw.upstream
        .mock("GET", format!("/tx/{txid}").as_str())
        .with_status(404)
        .with_body("Transaction not found")
        .create_async()
        .await;
    gw.upstream
        .mock("GET", "/v1/prices")
        .with_status(200)
        .with_body(r#"{"USD": 50000.0}"#)
        .create_async()
        .await;
    let app = router(gw.ctx.clone());

    let response = app
        .oneshot(authed_get(&format!("/api/crypto/{txid}"), "ops@example.com"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["detail"], "Transaction not found");
    assert_eq!(body["code"], 404);
}

#[tokio::test]
async fn malformed_txid_is_rejected() {
    let gw = build_gateway().await.unwrap();
    let app = router(gw.ctx.clone());
    let response = app
        .oneshot(authed_get("/api/crypto/nothex", "ops@example.com"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn blacklisted_user_is_rejected_on_any_route() {
    let mut gw = build_gateway().await.unwrap();
    let txid = "ab".repeat(32);
    mock_transaction(&mut gw.upstream, &txid).await;
    gw.kv.sadd("global_blacklist", "777").await.unwrap();
    let app = router(gw.ctx.clone());

    let response = app
        .clone()
        .oneshot(authed_get(
            &format!("/api/crypto/{txid}?user_id=777"),
            "ops@example.com",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // other users pass
    let response = app
        .oneshot(authed_get(
            &format!("/api/crypto/{txid}?user_id=778"),
            "ops@example.com",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn limited_caller_is_scoped_to_allowed_routes() {
    let mut gw = build_gateway().await.unwrap();
    let txid = "ab".repeat(32);
    mock_transaction(&mut gw.upstream, &txid).await;
    let app = router(gw.ctx.clone());

    let response = app
        .clone()
        .oneshot(authed_get(
            &format!("/api/crypto/{txid}"),
            "partner@example.com",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(authed_get("/api/tiktok/feed", "partner@example.com"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn non_instagram_url_is_a_validation_error() {
    let gw = build_gateway().await.unwrap();
    let app = router(gw.ctx.clone());
    let response = app
        .oneshot(authed_get(
            "/api/instagram/post?url=https://example.com/p/abc",
            "ops@example.com",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn invalid_tiktok_username_is_a_validation_error() {
    let gw = build_gateway().await.unwrap();
    let app = router(gw.ctx.clone());
    let response = app
        .oneshot(authed_get(
            "/api/tiktok/user/ends./videos?count=3",
            "ops@example.com",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn media_serves_passive_artifact_via_accel_redirect() {
    let mut gw = build_gateway().await.unwrap();
    gw.upstream
        .mock("GET", "/lazy.jpg")
        .with_status(200)
        .with_body(JPEG_BYTES)
        .create_async()
        .await;

    let target = "Instagramdeadbeef.jpg";
    let url = format!("{}/lazy.jpg", gw.upstream.url());
    gw.kv
        .hset("api_passive_url", target, url.as_bytes(), None)
        .await
        .unwrap();

    let app = router(gw.ctx.clone());
    let response = app.oneshot(get(&format!("/media/{target}"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("X-Accel-Redirect").unwrap(),
        target
    );
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "image/jpeg"
    );
    assert!(gw.blob.exists(target).await);
}

#[tokio::test]
async fn media_without_registration_still_redirects() {
    let gw = build_gateway().await.unwrap();
    let app = router(gw.ctx.clone());
    let response = app
        .oneshot(get("/media/Knownfile123.png"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "image/png"
    );
}

#[cfg(unix)]
#[tokio::test]
async fn media_opti_serves_the_webp_sibling() {
    let gw = build_gateway().await.unwrap();
    gw.blob.write("Avatar1.jpg", JPEG_BYTES).await.unwrap();

    let app = router(gw.ctx.clone());
    let response = app
        .oneshot(get("/media/Avatar1.jpg?opti=true"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("X-Accel-Redirect").unwrap(),
        "Avatar1.webp"
    );
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "image/webp"
    );
    assert!(gw.blob.exists("Avatar1.webp").await);
}

#[tokio::test]
async fn slow_requests_are_journaled_with_path_details() {
    let mut gw = build_gateway().await.unwrap();
    let txid = "fa".repeat(32);
    let tx_body = serde_json::json!({
        "txid": txid,
        "fee": 1500,
        "weight": 900,
        "status": {"confirmed": true, "block_height": 800_000},
        "vout": [{"value": 150_000_000u64}],
    })
    .to_string();
    // response held back long enough to cross the journaling threshold
    gw.upstream
        .mock("GET", format!("/tx/{txid}").as_str())
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body_from_request(move |_| {
            std::thread::sleep(std::time::Duration::from_millis(150));
            tx_body.clone().into_bytes()
        })
        .create_async()
        .await;
    gw.upstream
        .mock("GET", "/v1/prices")
        .with_status(200)
        .with_body(r#"{"USD": 50000.0}"#)
        .create_async()
        .await;
    gw.upstream
        .mock("GET", "/blocks/tip/height")
        .with_status(200)
        .with_body("800100")
        .create_async()
        .await;

    let app = router(gw.ctx.clone());
    let response = app
        .oneshot(authed_get(
            &format!("/api/crypto/{txid}?count=5"),
            "ops@example.com",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // the insert runs off the response path
    let mut row = None;
    for _ in 0..50 {
        row = sqlx::query_as::<_, (String, Option<String>, Option<String>, String, bool)>(
            "SELECT route_name, path_args, args, username, failed FROM api_requests",
        )
        .fetch_optional(gw.kv.pool())
        .await
        .unwrap();
        if row.is_some() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    let (route_name, path_args, args, username, failed) = row.expect("journaled row");
    assert_eq!(route_name, "/api/crypto/{txid}");
    assert_eq!(username, "ops@example.com");
    assert!(!failed);
    let path_args: serde_json::Value = serde_json::from_str(&path_args.unwrap()).unwrap();
    assert_eq!(path_args["txid"], txid);
    let args: serde_json::Value = serde_json::from_str(&args.unwrap()).unwrap();
    assert_eq!(args["count"], "5");
}

#[tokio::test]
async fn proxy_borrow_without_proxy_state_is_an_error() {
    let gw = build_gateway().await.unwrap();
    let err = gw.ctx.pool.borrow_page(true, None).await.unwrap_err();
    assert!(err.to_string().contains("no proxy session"));
}

#[tokio::test]
async fn relogin_without_a_credential_is_not_found() {
    let gw = build_gateway().await.unwrap();
    let err = gw.ctx.pool.relogin("ghost").await.unwrap_err();
    assert!(err.to_string().contains("No saved credential for user ghost"));
}

#[tokio::test]
async fn media_path_traversal_is_rejected() {
    let gw = build_gateway().await.unwrap();
    let app = router(gw.ctx.clone());
    let response = app.oneshot(get("/media/a..b.jpg")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
