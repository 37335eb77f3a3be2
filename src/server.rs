use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use axum::{
    body::Body,
    extract::{ConnectInfo, Query, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{sse::Sse, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::lyrics::HEARTBEAT_INTERVAL;
use crate::media::{MediaCore, ServiceResponse};

pub const LYRICS_STREAM_PATH: &str = "/api/osd-lyrics/sse";

/// Pause after spawning the listener before `start` returns.
const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Bound on graceful shutdown before the listener task is aborted.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

// --- Origin server lifecycle ----------------------------------------------------
//
// Stopped -> Starting -> Running -> Stopping -> Stopped. Both transitions run
// under the `running` mutex, so callers only ever see Stopped or Running.

struct RunningServer {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

pub struct OriginServer {
    core: MediaCore,
    bind: SocketAddr,
    running: tokio::sync::Mutex<Option<RunningServer>>,
}

impl OriginServer {
    pub fn new(core: MediaCore, bind: SocketAddr) -> Self {
        Self {
            core,
            bind,
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Binds and serves in the background. A server that is already running
    /// is stopped first. Returns the bound address.
    pub async fn start(&self) -> anyhow::Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if let Some(prev) = running.take() {
            info!("server: restarting, stopping previous listener on {}", prev.local_addr);
            self.shutdown(prev).await;
        }

        self.core.layout.ensure_dirs().await?;

        let listener = tokio::net::TcpListener::bind(self.bind)
            .await
            .with_context(|| format!("failed to bind {}", self.bind))?;
        let local_addr = listener.local_addr()?;

        let shutdown = CancellationToken::new();
        let app = build_router(self.core.clone());
        let signal = shutdown.clone();
        let task = tokio::spawn(async move {
            let served = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await;
            if let Err(e) = served {
                warn!("server: listener failed: {e}");
            }
        });

        info!(
            "server: serving {} on http://{local_addr}",
            self.core.layout.root().display()
        );
        *running = Some(RunningServer {
            shutdown,
            task,
            local_addr,
        });
        drop(running);

        tokio::time::sleep(SETTLE_DELAY).await;
        Ok(local_addr)
    }

    /// Drops every lyrics subscriber, then shuts down gracefully with a
    /// forced fallback. No-op when stopped.
    pub async fn stop(&self) {
        let prev = self.running.lock().await.take();
        match prev {
            Some(prev) => self.shutdown(prev).await,
            None => debug!("server: stop requested but not running"),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    async fn shutdown(&self, srv: RunningServer) {
        info!("server: stopping listener on {}", srv.local_addr);
        self.core.hub.close_all();
        srv.shutdown.cancel();

        let mut task = srv.task;
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut task).await.is_err() {
            warn!("server: graceful shutdown timed out, forcing close");
            task.abort();
            let _ = task.await;
        }
        info!("server: stopped");
    }
}

pub fn build_router(core: MediaCore) -> Router {
    Router::new()
        .route(LYRICS_STREAM_PATH, get(lyrics_stream))
        .route("/health", get(|| async { "OK" }))
        .route("/api/v1/cache", get(api_cache_lookup).post(api_cache_fetch))
        .route("/api/v1/local", post(api_local_register))
        .route("/api/v1/lyrics", post(api_lyrics_update))
        .route("/api/v1/osd", get(api_osd_get).post(api_osd_set))
        // Everything else is a file under the cache root.
        .fallback(serve_cached)
        .layer(TraceLayer::new_for_http())
        .with_state(core)
}

// --- Static cache files ----------------------------------------------------------

fn with_cors(mut resp: Response) -> Response {
    let headers = resp.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, HEAD, OPTIONS"),
    );
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("Range"));
    resp
}

/// Maps a request path onto `root`, refusing anything that would leave it.
fn resolve_under(root: &Path, request_path: &str) -> Option<PathBuf> {
    let rel = Path::new(request_path.trim_start_matches('/'));
    let mut out = root.to_path_buf();
    for part in rel.components() {
        match part {
            Component::Normal(seg) => out.push(seg),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(out)
}

async fn serve_cached(State(core): State<MediaCore>, req: Request) -> Response {
    let path = req.uri().path().to_string();
    debug!("server: {} {path}", req.method());

    if req.method() == Method::OPTIONS {
        return with_cors(StatusCode::OK.into_response());
    }

    let Ok(decoded) = urlencoding::decode(&path) else {
        warn!("server: undecodable path: {path}");
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(file) = resolve_under(core.layout.root(), &decoded) else {
        warn!("server: rejected path outside cache root: {path}");
        return StatusCode::NOT_FOUND.into_response();
    };
    if !file.is_file() {
        warn!("server: not found: {}", file.display());
        return StatusCode::NOT_FOUND.into_response();
    }

    match ServeDir::new(core.layout.root()).oneshot(req).await {
        Ok(resp) => with_cors(resp.map(Body::new)),
        Err(never) => match never {},
    }
}

// --- Lyrics stream -----------------------------------------------------------------

async fn lyrics_stream(
    State(core): State<MediaCore>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let sub = core.hub.subscribe(remote);
    let stream = core.hub.event_stream(sub, HEARTBEAT_INTERVAL);
    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        Sse::new(stream),
    )
}

// --- Control API -------------------------------------------------------------------

#[derive(Deserialize, Default)]
#[serde(default)]
struct CacheFetchReq {
    id: String,
    urls: Vec<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct CacheLookupQuery {
    id: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct LocalRegisterReq {
    id: String,
    path: String,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct LyricsUpdateReq {
    text: String,
    song_name: String,
    artist: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct OsdReq {
    enabled: bool,
}

async fn api_cache_fetch(
    State(core): State<MediaCore>,
    Json(body): Json<CacheFetchReq>,
) -> Json<ServiceResponse> {
    Json(core.cache_audio_file(&body.id, &body.urls).await)
}

async fn api_cache_lookup(
    State(core): State<MediaCore>,
    Query(q): Query<CacheLookupQuery>,
) -> Json<ServiceResponse> {
    Json(core.get_cached_url(&q.id).await)
}

async fn api_local_register(
    State(core): State<MediaCore>,
    Json(body): Json<LocalRegisterReq>,
) -> Json<ServiceResponse> {
    Json(core.register_local_music(&body.id, &body.path).await)
}

async fn api_lyrics_update(
    State(core): State<MediaCore>,
    Json(body): Json<LyricsUpdateReq>,
) -> Json<ServiceResponse> {
    Json(core.update_current_lyrics(&body.text, &body.song_name, &body.artist))
}

async fn api_osd_get(State(core): State<MediaCore>) -> Json<serde_json::Value> {
    Json(json!({ "enabled": core.is_osd_enabled().await }))
}

async fn api_osd_set(
    State(core): State<MediaCore>,
    Json(body): Json<OsdReq>,
) -> Json<ServiceResponse> {
    Json(core.set_osd_enabled(body.enabled).await)
}
