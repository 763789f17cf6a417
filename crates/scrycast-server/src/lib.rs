// crates/scrycast-server/src/lib.rs
//
// HTTP file server for the HLS mode (§6): a trivial range-less static
// responder over the segment directory: axum router, TraceLayer, and a
// tokio_util ReaderStream chunked body.
//
// A flattened per-connection send loop is preferred over a recursive
// continuation; `ReaderStream` already reads the file in fixed-size
// chunks with exactly one pending read/write at a time, so no hand-rolled
// loop is needed to get that property.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path as AxumPath, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;

#[derive(Debug, Clone)]
pub struct HlsServerConfig {
    pub bind_addr: SocketAddr,
    pub hls_dir: PathBuf,
    pub playlist_name: String,
}

#[derive(Clone)]
struct AppState {
    hls_dir: Arc<PathBuf>,
    playlist_name: Arc<String>,
}

/// Binds and serves until the process is signaled to stop; the caller owns
/// shutdown (via `axum::serve(..).with_graceful_shutdown(..)` composition at
/// the call site in the pipeline controller).
pub async fn serve(config: HlsServerConfig) -> anyhow::Result<()> {
    let state = AppState {
        hls_dir: Arc::new(config.hls_dir),
        playlist_name: Arc::new(config.playlist_name),
    };

    let app = Router::new()
        .route("/", get(serve_playlist))
        .route("/index.html", get(serve_playlist))
        .route("/*path", get(serve_named_file))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = TcpListener::bind(config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "hls http server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn serve_playlist(State(state): State<AppState>) -> Response {
    let path = state.hls_dir.join(state.playlist_name.as_str());
    respond_with_file(&path).await
}

async fn serve_named_file(State(state): State<AppState>, AxumPath(path): AxumPath<String>) -> Response {
    let requested = Path::new(&path);
    if requested.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
        return not_found();
    }
    respond_with_file(&state.hls_dir.join(requested)).await
}

async fn respond_with_file(path: &Path) -> Response {
    let file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(_) => return not_found(),
    };
    let len = match file.metadata().await {
        Ok(meta) => meta.len(),
        Err(_) => return not_found(),
    };

    let body = Body::from_stream(ReaderStream::new(file));
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, mime_for(path));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from_str(&len.to_string()).unwrap());
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    response
}

fn mime_for(path: &Path) -> HeaderValue {
    match path.extension().and_then(|e| e.to_str()) {
        Some("m3u8") => HeaderValue::from_static("application/vnd.apple.mpegurl"),
        Some("ts") => HeaderValue::from_static("video/mp2t"),
        _ => HeaderValue::from_static("application/octet-stream"),
    }
}

fn not_found() -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_for_playlist_and_segment() {
        assert_eq!(mime_for(Path::new("stream.m3u8")), "application/vnd.apple.mpegurl");
        assert_eq!(mime_for(Path::new("segment_000.ts")), "video/mp2t");
        assert_eq!(mime_for(Path::new("unknown.bin")), "application/octet-stream");
    }
}
