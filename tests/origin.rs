use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, routing::get, Router};
use pretty_assertions::assert_eq;
use tunecache::{CacheLayout, HelperLocator, MediaCore, OriginServer};

const TRACK_BYTES: &[u8] = b"ID3\x04\x00fake mpeg frames for the cache test";

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// In-process mirror: `/good.mp3` serves bytes (slowly), `/missing` is 404,
/// `/empty.mp3` is an empty 200.
async fn spawn_mirror() -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route(
            "/good.mp3",
            get(|State(hits): State<Arc<AtomicUsize>>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                TRACK_BYTES
            }),
        )
        .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
        .route("/empty.mp3", get(|| async { "" }))
        .with_state(hits.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), hits)
}

struct Harness {
    _dir: tempfile::TempDir,
    core: MediaCore,
    server: OriginServer,
}

async fn start_origin() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let layout = Arc::new(CacheLayout::new(dir.path().join("root"), port));
    let locator = HelperLocator::with_bundled_dir(dir.path(), "no-such-helper-7c21");
    let core = MediaCore::build(layout, Duration::from_secs(5), locator)
        .await
        .unwrap();
    let server = OriginServer::new(core.clone(), SocketAddr::from(([127, 0, 0, 1], port)));
    server.start().await.unwrap();
    Harness {
        _dir: dir,
        core,
        server,
    }
}

fn audio_dir_entries(core: &MediaCore) -> Vec<String> {
    std::fs::read_dir(core.layout.audio_dir())
        .map(|rd| {
            rd.filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn cached_track_is_served_by_the_origin() {
    let (mirror, _) = spawn_mirror().await;
    let h = start_origin().await;

    assert!(!h.core.cache.is_cached("abc"));
    let url = h
        .core
        .cache
        .ensure_cached("abc", &[format!("{mirror}/good.mp3")])
        .await
        .unwrap();
    assert_eq!(url, h.core.cache.local_url("abc"));
    assert!(h.core.cache.is_cached("abc"));

    let resp = reqwest::get(&url).await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(resp.headers()["access-control-allow-origin"], "*");
    assert_eq!(resp.bytes().await.unwrap().as_ref(), TRACK_BYTES);

    h.server.stop().await;
}

#[tokio::test]
async fn failing_mirrors_fall_through_to_a_good_one() {
    let (mirror, _) = spawn_mirror().await;
    let h = start_origin().await;

    let mirrors = vec![
        "http://127.0.0.1:1/unreachable.mp3".to_string(),
        format!("{mirror}/missing"),
        format!("{mirror}/empty.mp3"),
        format!("{mirror}/good.mp3"),
    ];
    let url = h.core.cache.ensure_cached("fallback", &mirrors).await.unwrap();
    let direct = h
        .core
        .cache
        .ensure_cached("fallback", &[format!("{mirror}/good.mp3")])
        .await
        .unwrap();
    assert_eq!(url, direct);
    assert_eq!(
        std::fs::read(h.core.cache.cached_path("fallback")).unwrap(),
        TRACK_BYTES
    );

    h.server.stop().await;
}

#[tokio::test]
async fn exhausted_mirrors_leave_nothing_behind() {
    let (mirror, _) = spawn_mirror().await;
    let h = start_origin().await;

    let err = h
        .core
        .cache
        .ensure_cached(
            "doomed",
            &[format!("{mirror}/missing"), format!("{mirror}/empty.mp3")],
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("all mirrors failed"));
    assert!(!h.core.cache.is_cached("doomed"));
    assert_eq!(audio_dir_entries(&h.core), Vec::<String>::new());

    let resp = reqwest::get(h.core.cache.local_url("doomed")).await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

    h.server.stop().await;
}

#[tokio::test]
async fn concurrent_misses_download_once() {
    let (mirror, hits) = spawn_mirror().await;
    let h = start_origin().await;
    let mirrors = vec![format!("{mirror}/good.mp3")];

    let (a, b) = tokio::join!(
        h.core.cache.ensure_cached("shared", &mirrors),
        h.core.cache.ensure_cached("shared", &mirrors),
    );
    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    h.server.stop().await;
}

#[tokio::test]
async fn preflight_and_missing_files() {
    let h = start_origin().await;
    let client = reqwest::Client::new();
    let url = h.core.cache.local_url("nothing-here");

    let pre = client
        .request(reqwest::Method::OPTIONS, &url)
        .send()
        .await
        .unwrap();
    assert_eq!(pre.status(), reqwest::StatusCode::OK);
    assert_eq!(pre.headers()["access-control-allow-headers"], "Range");

    let missing = client.get(&url).send().await.unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    h.server.stop().await;
}

#[tokio::test]
async fn percent_encoded_names_are_served() {
    let h = start_origin().await;
    std::fs::write(h.core.layout.audio_dir().join("my song.mp3"), TRACK_BYTES).unwrap();

    let url = h.core.layout.url_for("my%20song.mp3");
    let resp = reqwest::get(&url).await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(resp.bytes().await.unwrap().as_ref(), TRACK_BYTES);

    h.server.stop().await;
}

/// Reads from an event stream until `needle` shows up.
async fn read_until(resp: &mut reqwest::Response, buf: &mut String, needle: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !buf.contains(needle) {
        let chunk = tokio::time::timeout_at(deadline, resp.chunk())
            .await
            .expect("timed out waiting for stream data")
            .unwrap()
            .expect("stream ended early");
        buf.push_str(&String::from_utf8_lossy(&chunk));
    }
}

#[tokio::test]
async fn lyrics_stream_delivers_updates_and_closes_on_stop() {
    let h = start_origin().await;
    let addr = h.server.local_addr().await.unwrap();

    let mut resp = reqwest::get(format!("http://{addr}/api/osd-lyrics/sse"))
        .await
        .unwrap();
    assert_eq!(resp.headers()["content-type"], "text/event-stream");
    assert_eq!(resp.headers()["access-control-allow-origin"], "*");

    let mut buf = String::new();
    read_until(&mut resp, &mut buf, r#"data: {"type":"connected""#).await;
    assert_eq!(h.core.hub.subscriber_count(), 1);

    h.core
        .update_current_lyrics("[12,3]<0,1,0>hello", "Song", "Artist");
    read_until(&mut resp, &mut buf, r#""format":"krc"}"#).await;
    assert!(buf.contains(r#""type":"lyrics_update""#));
    assert!(buf.contains(r#""songName":"Song""#));

    let started = std::time::Instant::now();
    h.server.stop().await;
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(h.core.hub.subscriber_count(), 0);
    assert!(!h.server.is_running().await);

    // The body ends once the subscriber is gone.
    let tail = tokio::time::timeout(Duration::from_secs(5), async {
        while let Ok(Some(_)) = resp.chunk().await {}
    })
    .await;
    assert!(tail.is_ok());
}

#[tokio::test]
async fn control_api_round_trip() {
    let (mirror, _) = spawn_mirror().await;
    let h = start_origin().await;
    let addr = h.server.local_addr().await.unwrap();
    let client = reqwest::Client::new();

    let health = client.get(format!("http://{addr}/health")).send().await.unwrap();
    assert_eq!(health.text().await.unwrap(), "OK");

    let cached: serde_json::Value = client
        .post(format!("http://{addr}/api/v1/cache"))
        .json(&serde_json::json!({ "id": "api-track", "urls": [format!("{mirror}/good.mp3")] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(cached["success"], true);
    assert_eq!(cached["data"], h.core.cache.local_url("api-track"));

    let lookup: serde_json::Value = client
        .get(format!("http://{addr}/api/v1/cache?id=api-track"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(lookup["success"], true);

    let osd: serde_json::Value = client
        .get(format!("http://{addr}/api/v1/osd"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(osd["enabled"], false);

    let lyrics: serde_json::Value = client
        .post(format!("http://{addr}/api/v1/lyrics"))
        .json(&serde_json::json!({ "text": "hello" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(lyrics["success"], true);

    h.server.stop().await;
}

#[tokio::test]
async fn restart_and_repeated_stop() {
    let h = start_origin().await;
    let first = h.server.local_addr().await.unwrap();

    let again = h.server.start().await.unwrap();
    assert_eq!(first, again);
    assert!(h.server.is_running().await);

    h.server.stop().await;
    h.server.stop().await;
    assert!(!h.server.is_running().await);
}
