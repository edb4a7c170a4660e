//! End-to-end orchestrator flows over a mocked feed: happy path, resume,
//! fast-update and incremental stamps.

use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use weiboloader::constants::CHECKPOINT_VERSION;
use weiboloader::context::captcha::CaptchaMode;
use weiboloader::context::{ContextOptions, WeiboContext};
use weiboloader::events::{Event, EventKind, MediaOutcome, ProgressSink};
use weiboloader::ratecontrol::{RateLimits, SlidingWindowRateController};
use weiboloader::resume::{CheckpointStore, CursorState};
use weiboloader::{LoaderOptions, Target, WeiboLoader};

#[derive(Default)]
struct RecordingSink(Mutex<Vec<Event>>);

impl ProgressSink for RecordingSink {
    fn emit(&self, event: &Event) {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

impl RecordingSink {
    fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn of_kind(&self, kind: EventKind) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.kind == kind)
            .collect()
    }
}

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

fn make_loader(
    server_url: &str,
    options: LoaderOptions,
) -> (WeiboLoader, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let rate = Arc::new(SlidingWindowRateController::new(fast_limits()));
    let ctx = Arc::new(
        WeiboContext::new(
            rate,
            sink.clone(),
            ContextOptions {
                base_url: server_url.to_string(),
                captcha_mode: CaptchaMode::Skip,
                ..ContextOptions::default()
            },
        )
        .unwrap(),
    );
    let loader = WeiboLoader::new(ctx, options, sink.clone()).unwrap();
    (loader, sink)
}

fn post_card(mid: &str, created: &str, pic_urls: &[String]) -> Value {
    json!({
        "mblog": {
            "mid": mid,
            "created_at": created,
            "text": format!("post {mid}"),
            "user": {"id": 999, "screen_name": "alice"},
            "pics": pic_urls
                .iter()
                .map(|u| json!({"large": {"url": u}}))
                .collect::<Vec<_>>(),
        }
    })
}

/// Mount the standard three-post fixture: two pages for uid 999, media
/// served under `/media/`. Post 1 (newest) has two pictures, post 2 one,
/// post 3 none.
fn mount_feed(server: &mut mockito::Server) {
    let base = server.url();

    server
        .mock("GET", "/api/container/getIndex")
        .match_query(mockito::Matcher::AllOf(vec![
            mockito::Matcher::UrlEncoded("type".into(), "uid".into()),
            mockito::Matcher::UrlEncoded("value".into(), "999".into()),
        ]))
        .with_status(200)
        .with_body(
            json!({"ok": 1, "data": {"userInfo": {"id": 999, "screen_name": "alice"}}})
                .to_string(),
        )
        .create();

    server
        .mock("GET", "/api/container/getIndex")
        .match_query(mockito::Matcher::AllOf(vec![
            mockito::Matcher::UrlEncoded("containerid".into(), "107603999".into()),
            mockito::Matcher::UrlEncoded("page".into(), "1".into()),
        ]))
        .with_status(200)
        .with_body(
            json!({"ok": 1, "data": {
                "cards": [
                    post_card(
                        "101",
                        "Thu Oct 10 12:00:00 +0800 2024",
                        &[format!("{base}/media/p1a.jpg"), format!("{base}/media/p1b.jpg")],
                    ),
                    post_card(
                        "102",
                        "Wed Oct 09 12:00:00 +0800 2024",
                        &[format!("{base}/media/p2a.jpg")],
                    ),
                ],
                "cardlistInfo": {"since_id": 2}
            }})
            .to_string(),
        )
        .create();

    server
        .mock("GET", "/api/container/getIndex")
        .match_query(mockito::Matcher::AllOf(vec![
            mockito::Matcher::UrlEncoded("containerid".into(), "107603999".into()),
            mockito::Matcher::UrlEncoded("page".into(), "2".into()),
        ]))
        .with_status(200)
        .with_body(
            json!({"ok": 1, "data": {
                "cards": [post_card("103", "Tue Oct 08 12:00:00 +0800 2024", &[])],
                "cardlistInfo": {}
            }})
            .to_string(),
        )
        .create();
}

fn mount_media(server: &mut mockito::Server, path: &str, body: &str) -> mockito::Mock {
    server
        .mock("GET", path)
        .with_status(200)
        .with_body(body)
        .create()
}

fn user_target() -> Target {
    Target::User {
        identifier: "999".to_string(),
        is_uid: true,
    }
}

fn checkpoint_file_in(dir: &Path) -> Option<std::path::PathBuf> {
    fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .find(|p| p.extension().is_some_and(|ext| ext == "json"))
}

#[test]
fn test_happy_path_downloads_everything() {
    let mut server = mockito::Server::new();
    mount_feed(&mut server);
    mount_media(&mut server, "/media/p1a.jpg", "picture 1a");
    mount_media(&mut server, "/media/p1b.jpg", "picture 1b");
    mount_media(&mut server, "/media/p2a.jpg", "picture 2a");

    let out = tempfile::TempDir::new().unwrap();
    let stamps_path = out.path().join("stamps.json");
    let options = LoaderOptions {
        output_dir: out.path().to_path_buf(),
        latest_stamps: Some(stamps_path.clone()),
        max_workers: 2,
        ..LoaderOptions::default()
    };

    let (mut loader, sink) = make_loader(&server.url(), options);
    let results = loader.download_targets(&[user_target()]).unwrap();
    assert_eq!(results.get("user:999"), Some(&true));

    // Three files in the nickname directory.
    let dir = out.path().join("alice");
    assert_eq!(
        fs::read_to_string(dir.join("20241010_120000_p1a.jpg")).unwrap(),
        "picture 1a"
    );
    assert_eq!(
        fs::read_to_string(dir.join("20241010_120000_p1b.jpg")).unwrap(),
        "picture 1b"
    );
    assert_eq!(
        fs::read_to_string(dir.join("20241009_120000_p2a.jpg")).unwrap(),
        "picture 2a"
    );

    // Aggregate counts.
    let done = sink.of_kind(EventKind::TargetDone);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].downloaded, Some(3));
    assert_eq!(done[0].skipped, Some(0));
    assert_eq!(done[0].failed, Some(0));
    assert_eq!(done[0].posts_processed, Some(3));
    assert_eq!(done[0].ok, Some(true));

    // MEDIA_DONE counters are strictly increasing within each post.
    let media = sink.of_kind(EventKind::MediaDone);
    assert_eq!(media.len(), 3);
    for events in media.chunk_by(|a, b| a.post_index == b.post_index) {
        let counters: Vec<usize> = events.iter().filter_map(|e| e.media_done).collect();
        for pair in counters.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        let total = events[0].media_total.unwrap();
        assert_eq!(counters.last().copied(), Some(total));
    }

    // POST_DONE is emitted in iterator order.
    let posts: Vec<usize> = sink
        .of_kind(EventKind::PostDone)
        .iter()
        .filter_map(|e| e.posts_processed)
        .collect();
    assert_eq!(posts, vec![1, 2, 3]);

    // Stamps carry the newest post timestamp in CST.
    let stamps: Value = serde_json::from_str(&fs::read_to_string(&stamps_path).unwrap()).unwrap();
    assert_eq!(
        stamps.get("user:999").and_then(Value::as_str),
        Some("2024-10-10T12:00:00+08:00")
    );

    // A clean completion retires the checkpoint; the next run starts from
    // the head of the feed instead of a stale page.
    assert!(checkpoint_file_in(&out.path().join(".checkpoints")).is_none());
}

#[test]
fn test_fast_update_stops_after_skipped_post() {
    let mut server = mockito::Server::new();
    mount_feed(&mut server);
    let p1a = mount_media(&mut server, "/media/p1a.jpg", "picture 1a");
    let p1b = mount_media(&mut server, "/media/p1b.jpg", "picture 1b");
    // Post 2's file exists up front; its media must never be fetched.
    let p2a = server
        .mock("GET", "/media/p2a.jpg")
        .with_status(200)
        .with_body("never fetched")
        .expect(0)
        .create();

    let out = tempfile::TempDir::new().unwrap();
    let dir = out.path().join("alice");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("20241009_120000_p2a.jpg"), "from last run").unwrap();

    let options = LoaderOptions {
        output_dir: out.path().to_path_buf(),
        fast_update: true,
        max_workers: 2,
        ..LoaderOptions::default()
    };

    let (mut loader, sink) = make_loader(&server.url(), options);
    let results = loader.download_targets(&[user_target()]).unwrap();
    assert_eq!(results.get("user:999"), Some(&true));

    // Posts 1 and 2 processed, post 3 never reached.
    let done = sink.of_kind(EventKind::TargetDone);
    assert_eq!(done[0].posts_processed, Some(2));
    assert_eq!(done[0].downloaded, Some(2));
    assert_eq!(done[0].skipped, Some(1));

    p1a.assert();
    p1b.assert();
    p2a.assert();
}

#[test]
fn test_incremental_cutoff_stops_before_stamped_posts() {
    let mut server = mockito::Server::new();
    mount_feed(&mut server);
    let p1a = mount_media(&mut server, "/media/p1a.jpg", "picture 1a");
    let p1b = mount_media(&mut server, "/media/p1b.jpg", "picture 1b");
    let p2a = server
        .mock("GET", "/media/p2a.jpg")
        .with_status(200)
        .with_body("never fetched")
        .expect(0)
        .create();

    let out = tempfile::TempDir::new().unwrap();
    let stamps_path = out.path().join("stamps.json");
    // Previous run saw post 2; only post 1 is newer.
    fs::write(
        &stamps_path,
        json!({"user:999": "2024-10-09T12:00:00+08:00"}).to_string(),
    )
    .unwrap();

    let options = LoaderOptions {
        output_dir: out.path().to_path_buf(),
        latest_stamps: Some(stamps_path.clone()),
        max_workers: 2,
        ..LoaderOptions::default()
    };

    let (mut loader, sink) = make_loader(&server.url(), options);
    let results = loader.download_targets(&[user_target()]).unwrap();
    assert_eq!(results.get("user:999"), Some(&true));

    let done = sink.of_kind(EventKind::TargetDone);
    assert_eq!(done[0].posts_processed, Some(1));
    assert_eq!(done[0].downloaded, Some(2));
    p1a.assert();
    p1b.assert();
    p2a.assert();

    // The stamp advanced to post 1; an identical second run downloads zero.
    let stamps: Value = serde_json::from_str(&fs::read_to_string(&stamps_path).unwrap()).unwrap();
    assert_eq!(
        stamps.get("user:999").and_then(Value::as_str),
        Some("2024-10-10T12:00:00+08:00")
    );

    let options = LoaderOptions {
        output_dir: out.path().to_path_buf(),
        latest_stamps: Some(stamps_path),
        max_workers: 2,
        ..LoaderOptions::default()
    };
    let (mut loader, sink) = make_loader(&server.url(), options);
    let results = loader.download_targets(&[user_target()]).unwrap();
    assert_eq!(results.get("user:999"), Some(&true));
    assert_eq!(
        sink.of_kind(EventKind::TargetDone)[0].downloaded,
        Some(0)
    );
}

#[test]
fn test_resume_skips_seen_mids_and_existing_files() {
    let mut server = mockito::Server::new();
    mount_feed(&mut server);
    // Post 1 was committed by the previous (crashed) run.
    let p1a = server
        .mock("GET", "/media/p1a.jpg")
        .with_status(200)
        .with_body("never fetched")
        .expect(0)
        .create();
    let p1b = server
        .mock("GET", "/media/p1b.jpg")
        .with_status(200)
        .with_body("never fetched")
        .expect(0)
        .create();
    // Post 2's file survived on disk as well.
    server
        .mock("GET", "/media/p2a.jpg")
        .with_status(200)
        .with_body("never fetched")
        .expect(0)
        .create();

    let out = tempfile::TempDir::new().unwrap();
    let dir = out.path().join("alice");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("20241009_120000_p2a.jpg"), "from last run").unwrap();

    let options = LoaderOptions {
        output_dir: out.path().to_path_buf(),
        max_workers: 2,
        ..LoaderOptions::default()
    };

    // Seed the checkpoint a crashed run would have left behind.
    let store =
        CheckpointStore::new(out.path().join(".checkpoints"), options.options_hash()).unwrap();
    store
        .save(
            "user:999",
            &CursorState {
                version: CHECKPOINT_VERSION.to_string(),
                page: 1,
                cursor: None,
                seen_mids: vec!["101".to_string()],
                options_hash: options.options_hash(),
                timestamp: None,
            },
        )
        .unwrap();

    let (mut loader, sink) = make_loader(&server.url(), options);
    let results = loader.download_targets(&[user_target()]).unwrap();
    assert_eq!(results.get("user:999"), Some(&true));

    let done = sink.of_kind(EventKind::TargetDone);
    // Posts 2 and 3 remain; post 2's media is skipped on disk.
    assert_eq!(done[0].posts_processed, Some(2));
    assert_eq!(done[0].downloaded, Some(0));
    assert_eq!(done[0].skipped, Some(1));
    assert_eq!(done[0].failed, Some(0));

    let media = sink.of_kind(EventKind::MediaDone);
    assert_eq!(media.len(), 1);
    assert_eq!(media[0].outcome, Some(MediaOutcome::Skipped));

    p1a.assert();
    p1b.assert();
}

#[test]
fn test_count_limits_posts_per_target() {
    let mut server = mockito::Server::new();
    mount_feed(&mut server);
    mount_media(&mut server, "/media/p1a.jpg", "picture 1a");
    mount_media(&mut server, "/media/p1b.jpg", "picture 1b");
    let p2a = server
        .mock("GET", "/media/p2a.jpg")
        .with_status(200)
        .with_body("never fetched")
        .expect(0)
        .create();

    let out = tempfile::TempDir::new().unwrap();
    let options = LoaderOptions {
        output_dir: out.path().to_path_buf(),
        count: 1,
        max_workers: 2,
        ..LoaderOptions::default()
    };

    let (mut loader, sink) = make_loader(&server.url(), options);
    let results = loader.download_targets(&[user_target()]).unwrap();
    assert_eq!(results.get("user:999"), Some(&true));
    assert_eq!(
        sink.of_kind(EventKind::TargetDone)[0].posts_processed,
        Some(1)
    );
    p2a.assert();
}

#[test]
fn test_metadata_sidecars_are_written() {
    let mut server = mockito::Server::new();
    mount_feed(&mut server);
    mount_media(&mut server, "/media/p1a.jpg", "picture 1a");
    mount_media(&mut server, "/media/p1b.jpg", "picture 1b");
    mount_media(&mut server, "/media/p2a.jpg", "picture 2a");

    let out = tempfile::TempDir::new().unwrap();
    let options = LoaderOptions {
        output_dir: out.path().to_path_buf(),
        metadata_json: true,
        post_metadata_txt: Some("{mid} by {nickname}".to_string()),
        max_workers: 2,
        ..LoaderOptions::default()
    };

    let (mut loader, _sink) = make_loader(&server.url(), options);
    loader.download_targets(&[user_target()]).unwrap();

    let dir = out.path().join("alice");
    let raw: Value =
        serde_json::from_str(&fs::read_to_string(dir.join("101.json")).unwrap()).unwrap();
    assert_eq!(
        raw.pointer("/mblog/mid").and_then(Value::as_str),
        Some("101")
    );
    assert_eq!(
        fs::read_to_string(dir.join("101.txt")).unwrap(),
        "101 by alice"
    );
    assert!(dir.join("103.json").exists());
}
