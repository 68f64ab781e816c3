//! Render pipeline behavior against a mock upstream

mod common;

use common::JPEG_BYTES;
use mediagate::blob::{BlobStore, sniff_mime};
use mediagate::render::{RenderOptions, RenderRunner};
use mediagate::{KvStore, target_filename};
use tempfile::TempDir;

async fn make_runner() -> (RenderRunner, BlobStore, KvStore, TempDir) {
    let dir = TempDir::new().unwrap();
    let kv = KvStore::connect("sqlite::memory:").await.unwrap();
    let blob = BlobStore::open(dir.path()).await.unwrap();
    let client = reqwest::Client::new();
    let runner = RenderRunner::new(blob.clone(), kv.clone(), client.clone(), client, false);
    (runner, blob, kv, dir)
}

#[tokio::test]
async fn render_writes_artifact_and_fires_event() {
    let (runner, blob, _kv, _dir) = make_runner().await;
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/asset.jpg")
        .with_status(200)
        .with_header("content-type", "image/jpeg")
        .with_body(JPEG_BYTES)
        .create_async()
        .await;

    let url = format!("{}/asset.jpg", server.url());
    let (target, handle) = runner.start_render(&url, "Test", RenderOptions::suffix(".jpg"));
    assert!(target.starts_with("Test"));
    assert!(target.ends_with(".jpg"));

    let written = handle.await.unwrap().unwrap();
    assert_eq!(written, JPEG_BYTES.len() as u64);

    let event = runner.active_event(&target).expect("event registered");
    assert!(event.is_set());
    event.wait().await; // late waiter returns immediately

    let stored = blob.read(&target).await.unwrap().unwrap();
    assert_eq!(&stored[..], JPEG_BYTES);
}

#[tokio::test]
async fn existing_valid_artifact_skips_the_fetch() {
    let (runner, _blob, _kv, _dir) = make_runner().await;
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/once.jpg")
        .with_status(200)
        .with_body(JPEG_BYTES)
        .expect(1)
        .create_async()
        .await;

    let url = format!("{}/once.jpg", server.url());
    let (_, first) = runner.start_render(&url, "Test", RenderOptions::suffix(".jpg"));
    first.await.unwrap().unwrap();
    let (_, second) = runner.start_render(&url, "Test", RenderOptions::suffix(".jpg"));
    second.await.unwrap().unwrap();

    mock.assert_async().await;
}

#[tokio::test]
async fn force_rerenders_over_a_valid_artifact() {
    let (runner, _blob, _kv, _dir) = make_runner().await;
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/forced.jpg")
        .with_status(200)
        .with_body(JPEG_BYTES)
        .expect(2)
        .create_async()
        .await;

    let url = format!("{}/forced.jpg", server.url());
    let (_, first) = runner.start_render(&url, "Test", RenderOptions::suffix(".jpg"));
    first.await.unwrap().unwrap();

    let opts = RenderOptions {
        force: true,
        ..RenderOptions::suffix(".jpg")
    };
    let (_, second) = runner.start_render(&url, "Test", opts);
    second.await.unwrap().unwrap();

    mock.assert_async().await;
}

#[tokio::test]
async fn unrecognizable_payload_creates_no_file() {
    let (runner, blob, _kv, _dir) = make_runner().await;
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/garbage.jpg")
        .with_status(200)
        .with_body("this is not an image")
        .create_async()
        .await;

    let url = format!("{}/garbage.jpg", server.url());
    let (target, handle) = runner.start_render(&url, "Test", RenderOptions::suffix(".jpg"));
    assert!(handle.await.unwrap().is_err());
    assert!(!blob.exists(&target).await);

    // failure still fires the completion event
    assert!(runner.active_event(&target).unwrap().is_set());
}

#[tokio::test]
async fn gone_avatar_is_substituted() {
    let (runner, blob, _kv, _dir) = make_runner().await;
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/avatar.jpg")
        .with_status(410)
        .create_async()
        .await;

    let url = format!("{}/avatar.jpg", server.url());
    let (target, handle) = runner.start_render(&url, "Test", RenderOptions::suffix(".jpg"));
    handle.await.unwrap().unwrap();

    let stored = blob.read(&target).await.unwrap().unwrap();
    assert_eq!(sniff_mime(&stored), Some("image/jpeg"));
}

#[tokio::test]
async fn passive_registration_defers_the_download() {
    let (runner, blob, _kv, _dir) = make_runner().await;
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/lazy.jpg")
        .with_status(200)
        .with_body(JPEG_BYTES)
        .expect(1)
        .create_async()
        .await;

    let url = format!("{}/lazy.jpg", server.url());
    let (target, handle) = runner.start_render(&url, "Test", RenderOptions::passive_suffix(".jpg"));
    handle.await.unwrap().unwrap();

    // registration only: no event, no artifact, no upstream traffic
    assert!(runner.active_event(&target).is_none());
    assert!(!blob.exists(&target).await);
    assert!(runner.passive_registered(&target).await);

    let mime = runner.download_passive(&target).await.unwrap();
    assert_eq!(mime.as_deref(), Some("image/jpeg"));
    assert!(blob.exists(&target).await);

    // memoized: the second media hit performs no new fetch
    runner.download_passive(&target).await.unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn passive_artifact_already_on_disk_skips_upstream() {
    let (runner, blob, kv, _dir) = make_runner().await;
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/already.jpg")
        .with_status(200)
        .with_body(JPEG_BYTES)
        .expect(0)
        .create_async()
        .await;

    let target = "Instagramcafe01.jpg";
    blob.write(target, JPEG_BYTES).await.unwrap();
    let url = format!("{}/already.jpg", server.url());
    kv.hset("api_passive_url", target, url.as_bytes(), None)
        .await
        .unwrap();

    let mime = runner.download_passive(target).await.unwrap();
    assert_eq!(mime.as_deref(), Some("image/jpeg"));
    mock.assert_async().await;
}

#[tokio::test]
async fn caller_supplied_bytes_skip_the_fetch_entirely() {
    let (runner, blob, _kv, _dir) = make_runner().await;
    let opts = RenderOptions {
        prekey: Some("shot-1".into()),
        ..RenderOptions::suffix(".jpg")
    };
    let (target, handle) =
        runner.start_render_bytes(bytes::Bytes::from_static(JPEG_BYTES), "Screenshot", opts);
    assert!(target.starts_with("Screenshot"));

    assert_eq!(handle.await.unwrap().unwrap(), JPEG_BYTES.len() as u64);
    assert!(blob.exists(&target).await);
    assert!(runner.active_event(&target).unwrap().is_set());
}

#[tokio::test]
async fn unregistered_passive_target_is_a_noop() {
    let (runner, _blob, _kv, _dir) = make_runner().await;
    assert_eq!(runner.download_passive("Nothing123.jpg").await.unwrap(), None);
}

#[test]
fn filename_scheme_is_stable_across_processes() {
    let opts = RenderOptions::suffix(".mp4");
    let a = target_filename("https://host.test/v/123/video.mp4?sig=aaa", "TikTok", &opts);
    let b = target_filename("https://host.test/v/123/video.mp4?sig=bbb", "TikTok", &opts);
    assert_eq!(a, b);
}
