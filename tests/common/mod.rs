//! Shared fixtures for the integration suite

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use tempfile::TempDir;

use mediagate::browser::SessionPool;
use mediagate::cache::Memoize;
use mediagate::config::{LimitedUsers, Settings};
use mediagate::extract::Extractors;
use mediagate::http::Context;
use mediagate::shutdown::Shutdown;
use mediagate::{AuditLog, BlobStore, KvStore, RenderRunner, Verifier};

/// Secret behind the test JWKS
pub const TEST_JWT_SECRET: &[u8] = b"integration-test-secret";

/// Smallest payload `infer` identifies as image/jpeg
pub const JPEG_BYTES: &[u8] = &[
    0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46, 0x49, 0x46, 0x00, 0x01, 0x01, 0x00, 0x00,
    0x01, 0x00, 0x01, 0x00, 0x00, 0xFF, 0xD9,
];

#[allow(dead_code)]
pub fn jwks_body() -> String {
    serde_json::json!({
        "keys": [{
            "kty": "oct",
            "kid": "test-key",
            "k": URL_SAFE_NO_PAD.encode(TEST_JWT_SECRET),
        }]
    })
    .to_string()
}

#[allow(dead_code)]
pub struct TestGateway {
    pub ctx: Arc<Context>,
    pub kv: KvStore,
    pub blob: BlobStore,
    pub render: RenderRunner,
    // Mock servers and the cache dir live as long as the gateway
    pub jwks_server: mockito::ServerGuard,
    pub upstream: mockito::ServerGuard,
    pub cache_dir: TempDir,
}

/// A full gateway over an empty session pool, a private in-memory KV, and
/// mock JWKS/upstream servers. Everything except live browser traffic.
#[allow(dead_code)]
pub async fn build_gateway() -> Result<TestGateway> {
    let mut jwks_server = mockito::Server::new_async().await;
    jwks_server
        .mock("GET", "/cdn-cgi/access/certs")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(jwks_body())
        .create_async()
        .await;
    let upstream = mockito::Server::new_async().await;

    let cache_dir = TempDir::new()?;

    // Stand-in optimizer: copies the source to its .webp sibling
    let opti_script = cache_dir.path().join("opti.sh");
    std::fs::write(
        &opti_script,
        "#!/bin/sh\ncp \"$1\" \"$3/$(basename \"$1\" .jpg).webp\"\n",
    )?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&opti_script, std::fs::Permissions::from_mode(0o755))?;
    }

    let settings = Settings {
        browser_url: "ws://127.0.0.1:1/unused".into(),
        db_url: "sqlite::memory:".into(),
        jwks_url: format!("{}/cdn-cgi/access/certs", jwks_server.url()),
        audiences: vec!["test-aud".into()],
        issuers: vec!["https://issuer.test".into()],
        cache_dir: cache_dir.path().to_path_buf(),
        fernet_key: None,
        opti_path: Some(opti_script.to_string_lossy().into_owned()),
        debug: false,
    };

    let kv = KvStore::connect(&settings.db_url).await?;
    let audit = AuditLog::new(kv.pool().clone()).await?;
    let blob = BlobStore::open(&settings.cache_dir).await?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;
    let render = RenderRunner::new(
        blob.clone(),
        kv.clone(),
        client.clone(),
        client.clone(),
        false,
    );

    let shutdown = Shutdown::new();
    let pool =
        SessionPool::build(&settings, kv.clone(), shutdown.clone(), HashMap::new()).await?;

    let verifier = Verifier::from_jwks(
        &client,
        &settings.jwks_url,
        &settings.audiences,
        &settings.issuers,
        &[],
        settings.debug,
    )
    .await?;

    let extract = Extractors {
        pool: pool.clone(),
        render: render.clone(),
        memo: Memoize::new(kv.clone()),
        http: client,
        mempool_base: upstream.url(),
    };

    let ctx = Arc::new(Context {
        settings,
        kv: kv.clone(),
        blob: blob.clone(),
        render: render.clone(),
        pool,
        extract,
        verifier,
        limited: limited_users(),
        audit,
        shutdown,
    });

    Ok(TestGateway {
        ctx,
        kv,
        blob,
        render,
        jwks_server,
        upstream,
        cache_dir,
    })
}

/// One scoped caller so the allowance path is covered end to end
#[allow(dead_code)]
fn limited_users() -> LimitedUsers {
    let mut limited = LimitedUsers::default();
    limited
        .users
        .insert("partner@example.com".into(), vec!["crypto".into()]);
    limited
}

#[allow(dead_code)]
pub fn signed_token(claims: serde_json::Value) -> String {
    jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(TEST_JWT_SECRET),
    )
    .unwrap()
}

#[allow(dead_code)]
pub fn valid_claims(email: &str) -> serde_json::Value {
    let exp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
        + 600;
    serde_json::json!({
        "email": email,
        "aud": "test-aud",
        "iss": "https://issuer.test",
        "exp": exp,
    })
}
