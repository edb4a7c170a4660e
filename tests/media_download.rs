//! Media downloader behavior: skip-before-network, atomic finalize, and
//! `.part` hygiene on failure.

use std::fs;
use std::sync::Arc;
use std::time::Duration;
use weiboloader::context::captcha::CaptchaMode;
use weiboloader::context::{ContextOptions, WeiboContext};
use weiboloader::downloader::{part_path, MediaDownloader};
use weiboloader::events::{MediaOutcome, NullSink};
use weiboloader::ratecontrol::{RateLimits, SlidingWindowRateController};

fn fast_limits() -> RateLimits {
    RateLimits {
        api_limit: 1000,
        api_window: Duration::from_secs(1),
        media_limit: 1000,
        media_window: Duration::from_secs(1),
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        jitter_ratio: 0.0,
        request_interval: Duration::ZERO,
    }
}

fn downloader_for(base_url: &str) -> MediaDownloader {
    let rate = Arc::new(SlidingWindowRateController::new(fast_limits()));
    let ctx = WeiboContext::new(
        rate,
        Arc::new(NullSink),
        ContextOptions {
            base_url: base_url.to_string(),
            captcha_mode: CaptchaMode::Skip,
            ..ContextOptions::default()
        },
    )
    .unwrap();
    MediaDownloader::new(Arc::new(ctx))
}

#[test]
fn test_download_writes_file_and_removes_part() {
    let mut server = mockito::Server::new();
    let mock = server
        .mock("GET", "/media/photo.jpg")
        .with_status(200)
        .with_body(vec![7u8; 150_000])
        .create();

    let dir = tempfile::TempDir::new().unwrap();
    let dest = dir.path().join("photo.jpg");
    let downloader = downloader_for(&server.url());

    let result = downloader.download(&format!("{}/media/photo.jpg", server.url()), &dest);
    assert_eq!(result.outcome, MediaOutcome::Downloaded);
    assert_eq!(fs::metadata(&dest).unwrap().len(), 150_000);
    assert!(!part_path(&dest).exists());
    mock.assert();
}

#[test]
fn test_existing_file_is_skipped_without_network() {
    let mut server = mockito::Server::new();
    let mock = server
        .mock("GET", "/media/photo.jpg")
        .with_status(200)
        .with_body("never fetched")
        .expect(0)
        .create();

    let dir = tempfile::TempDir::new().unwrap();
    let dest = dir.path().join("photo.jpg");
    fs::write(&dest, b"already here").unwrap();

    let downloader = downloader_for(&server.url());
    let result = downloader.download(&format!("{}/media/photo.jpg", server.url()), &dest);

    assert_eq!(result.outcome, MediaOutcome::Skipped);
    assert_eq!(fs::read(&dest).unwrap(), b"already here");
    mock.assert();
}

#[test]
fn test_empty_existing_file_is_refetched() {
    let mut server = mockito::Server::new();
    server
        .mock("GET", "/media/photo.jpg")
        .with_status(200)
        .with_body("fresh content")
        .create();

    let dir = tempfile::TempDir::new().unwrap();
    let dest = dir.path().join("photo.jpg");
    fs::write(&dest, b"").unwrap();

    let downloader = downloader_for(&server.url());
    let result = downloader.download(&format!("{}/media/photo.jpg", server.url()), &dest);

    assert_eq!(result.outcome, MediaOutcome::Downloaded);
    assert_eq!(fs::read(&dest).unwrap(), b"fresh content");
}

#[test]
fn test_missing_media_fails_without_part_file() {
    let mut server = mockito::Server::new();
    server.mock("GET", "/media/gone.jpg").with_status(404).create();

    let dir = tempfile::TempDir::new().unwrap();
    let dest = dir.path().join("gone.jpg");
    let downloader = downloader_for(&server.url());

    let result = downloader.download(&format!("{}/media/gone.jpg", server.url()), &dest);
    assert_eq!(result.outcome, MediaOutcome::Failed);
    assert!(!dest.exists());
    assert!(!part_path(&dest).exists());
}

#[test]
fn test_server_errors_retry_then_fail_cleanly() {
    let mut server = mockito::Server::new();
    let mock = server
        .mock("GET", "/media/flaky.jpg")
        .with_status(500)
        .expect(3)
        .create();

    let dir = tempfile::TempDir::new().unwrap();
    let dest = dir.path().join("flaky.jpg");
    let downloader = downloader_for(&server.url());

    let result = downloader.download(&format!("{}/media/flaky.jpg", server.url()), &dest);
    assert_eq!(result.outcome, MediaOutcome::Failed);
    assert!(!dest.exists());
    assert!(!part_path(&dest).exists());
    mock.assert();
}

#[test]
fn test_unreachable_host_fails_cleanly() {
    let dir = tempfile::TempDir::new().unwrap();
    let dest = dir.path().join("never.jpg");
    let downloader = downloader_for("http://127.0.0.1:1");

    let result = downloader.download("http://127.0.0.1:1/never.jpg", &dest);
    assert_eq!(result.outcome, MediaOutcome::Failed);
    assert!(!dest.exists());
    assert!(!part_path(&dest).exists());
}
