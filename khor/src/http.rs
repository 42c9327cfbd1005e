//! HTTP control plane
//!
//! A thin, threaded layer over the control surface in [`crate::app`]: parse
//! the route, hand off to the matching operation, serialize the answer.
//! Also serves the static UI directory for non-API paths and streams metrics
//! snapshots as server-sent events.

use crate::app::{ApiError, App};
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use tracing::{info, warn};

const WORKERS: usize = 4;
const SSE_PERIOD: Duration = Duration::from_millis(100);

pub struct HttpServer {
    server: Arc<Server>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl HttpServer {
    /// Bind and start serving. A bind failure is fatal to startup; the
    /// caller exits with code 2.
    pub fn start(
        app: Arc<App>,
        addr: &str,
        ui_dir: Option<PathBuf>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let server = Arc::new(Server::http(addr).map_err(|e| format!("failed to bind {addr}: {e}"))?);
        info!(%addr, "control plane listening");

        let mut workers = Vec::with_capacity(WORKERS);
        for i in 0..WORKERS {
            let server = server.clone();
            let app = app.clone();
            let ui_dir = ui_dir.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("khor-http-{i}"))
                    .spawn(move || {
                        for request in server.incoming_requests() {
                            handle(&app, ui_dir.as_deref(), request);
                        }
                    })?,
            );
        }

        Ok(Self { server, workers })
    }

    pub fn stop(mut self) {
        self.server.unblock();
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
    }
}

fn json_header() -> Header {
    Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
        .expect("static header is valid")
}

fn respond_json<T: Serialize>(request: Request, status: u16, body: &T) {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".into());
    let response = Response::from_string(json)
        .with_status_code(StatusCode(status))
        .with_header(json_header());
    let _ = request.respond(response);
}

#[derive(Serialize)]
struct ErrorBody {
    ok: bool,
    error: String,
}

fn respond_error(request: Request, err: ApiError) {
    respond_json(
        request,
        err.status,
        &ErrorBody { ok: false, error: err.message },
    );
}

#[derive(Serialize)]
struct OkBody {
    ok: bool,
}

fn respond_ok(request: Request) {
    respond_json(request, 200, &OkBody { ok: true });
}

/// Split `/path?query` and decode the query pairs.
fn split_url(url: &str) -> (&str, Vec<(String, String)>) {
    match url.split_once('?') {
        Some((path, query)) => {
            let pairs = query
                .split('&')
                .filter(|kv| !kv.is_empty())
                .map(|kv| match kv.split_once('=') {
                    Some((k, v)) => (url_decode(k), url_decode(v)),
                    None => (url_decode(kv), String::new()),
                })
                .collect();
            (path, pairs)
        }
        None => (url, Vec::new()),
    }
}

fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(b) => {
                        out.push(b);
                        i += 2;
                    }
                    None => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn query<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn read_body_json(request: &mut Request) -> Result<serde_json::Value, ApiError> {
    let mut body = String::new();
    request
        .as_reader()
        .read_to_string(&mut body)
        .map_err(|e| ApiError { status: 400, message: format!("failed to read body: {e}") })?;
    serde_json::from_str(&body)
        .map_err(|e| ApiError { status: 400, message: format!("malformed JSON body: {e}") })
}

fn handle(app: &Arc<App>, ui_dir: Option<&Path>, mut request: Request) {
    let url = request.url().to_string();
    let (path, pairs) = split_url(&url);
    let method = request.method().clone();

    match (&method, path) {
        (Method::Get, "/api/health") => respond_json(request, 200, &app.api_health()),
        (Method::Get, "/api/metrics") => respond_json(request, 200, &app.api_metrics(true)),
        (Method::Get, "/api/config") => respond_json(request, 200, &app.config_snapshot()),
        (Method::Put, "/api/config") => match read_body_json(&mut request) {
            Ok(patch) => match app.api_put_config(&patch) {
                Ok(resp) => respond_json(request, 200, &resp),
                Err(e) => respond_error(request, e),
            },
            Err(e) => respond_error(request, e),
        },
        (Method::Get, "/api/presets") => respond_json(request, 200, &app.api_presets()),
        (Method::Post, "/api/preset/select") => {
            let Some(name) = query(&pairs, "name") else {
                return respond_error(
                    request,
                    ApiError { status: 400, message: "missing name parameter".into() },
                );
            };
            match app.api_select_preset(name) {
                Ok(()) => respond_ok(request),
                Err(e) => respond_error(request, e),
            }
        }
        (Method::Get, "/api/audio/devices") => match app.api_audio_devices() {
            Ok(devices) => respond_json(request, 200, &devices),
            Err(e) => respond_error(request, e),
        },
        (Method::Post, "/api/audio/device") => {
            // Device comes from the query or a {"device": "..."} body.
            let device = match query(&pairs, "device") {
                Some(d) => d.to_string(),
                None => match read_body_json(&mut request) {
                    Ok(body) => body
                        .get("device")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    Err(e) => return respond_error(request, e),
                },
            };
            match app.api_audio_set_device(&device) {
                Ok(()) => respond_ok(request),
                Err(e) => respond_error(request, e),
            }
        }
        (Method::Post, "/api/actions/test_note") => {
            let midi = query(&pairs, "midi").and_then(|v| v.parse().ok()).unwrap_or(62);
            let vel = query(&pairs, "vel").and_then(|v| v.parse().ok()).unwrap_or(0.7);
            let dur = query(&pairs, "dur").and_then(|v| v.parse().ok()).unwrap_or(0.5);
            match app.api_test_note(midi, vel, dur) {
                Ok(()) => respond_ok(request),
                Err(e) => respond_error(request, e),
            }
        }
        (Method::Get, "/api/stream") => serve_sse(app.clone(), request),
        (Method::Get, _) if !path.starts_with("/api") => serve_static(ui_dir, path, request),
        _ => respond_error(
            request,
            ApiError { status: 404, message: format!("no such endpoint: {path}") },
        ),
    }
}

/// Server-sent events: one metrics snapshot every 100 ms until the client
/// goes away. The response reader produces the stream lazily.
fn serve_sse(app: Arc<App>, request: Request) {
    let stream = SseMetrics { app, pending: Vec::new(), next: Instant::now() };
    let headers = vec![
        Header::from_bytes(&b"Content-Type"[..], &b"text/event-stream"[..])
            .expect("static header is valid"),
        Header::from_bytes(&b"Cache-Control"[..], &b"no-cache"[..])
            .expect("static header is valid"),
    ];
    let response = Response::new(StatusCode(200), headers, stream, None, None);
    // Returns when the client disconnects and the write fails.
    let _ = request.respond(response);
}

struct SseMetrics {
    app: Arc<App>,
    pending: Vec<u8>,
    next: Instant,
}

impl Read for SseMetrics {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pending.is_empty() {
            let now = Instant::now();
            if let Some(wait) = self.next.checked_duration_since(now) {
                thread::sleep(wait);
            }
            self.next += SSE_PERIOD;

            let snapshot = serde_json::to_string(&self.app.api_metrics(false))
                .unwrap_or_else(|_| "{}".into());
            self.pending = format!("data: {snapshot}\n\n").into_bytes();
        }

        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

fn content_type_for(path: &Path) -> &'static [u8] {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => b"text/html; charset=utf-8",
        Some("js") => b"application/javascript",
        Some("css") => b"text/css",
        Some("json") => b"application/json",
        Some("svg") => b"image/svg+xml",
        Some("png") => b"image/png",
        Some("ico") => b"image/x-icon",
        _ => b"application/octet-stream",
    }
}

fn serve_static(ui_dir: Option<&Path>, path: &str, request: Request) {
    let Some(ui_dir) = ui_dir else {
        let _ = request.respond(Response::from_string("khor").with_status_code(StatusCode(200)));
        return;
    };

    let rel = path.trim_start_matches('/');
    let rel = if rel.is_empty() { "index.html" } else { rel };

    // No path traversal out of the UI directory.
    if rel.split('/').any(|seg| seg == "..") {
        let _ = request.respond(Response::from_string("bad path").with_status_code(StatusCode(400)));
        return;
    }

    let mut file = ui_dir.join(rel);
    if !file.is_file() {
        // Single-page UI fallback.
        file = ui_dir.join("index.html");
    }

    match std::fs::read(&file) {
        Ok(data) => {
            let header = Header::from_bytes(&b"Content-Type"[..], content_type_for(&file))
                .expect("static header is valid");
            let _ = request.respond(Response::from_data(data).with_header(header));
        }
        Err(e) => {
            warn!("static file {} unavailable: {e}", file.display());
            let _ = request.respond(Response::from_string("not found").with_status_code(StatusCode(404)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_split_and_decode() {
        let (path, pairs) = split_url("/api/preset/select?name=percussive");
        assert_eq!(path, "/api/preset/select");
        assert_eq!(query(&pairs, "name"), Some("percussive"));

        let (path, pairs) = split_url("/api/actions/test_note?midi=64&vel=0.5&dur=0.25");
        assert_eq!(path, "/api/actions/test_note");
        assert_eq!(query(&pairs, "midi"), Some("64"));
        assert_eq!(query(&pairs, "vel"), Some("0.5"));
        assert_eq!(query(&pairs, "dur"), Some("0.25"));

        let (_, pairs) = split_url("/x?a=hello%20world&b=1+2");
        assert_eq!(query(&pairs, "a"), Some("hello world"));
        assert_eq!(query(&pairs, "b"), Some("1 2"));
    }

    #[test]
    fn plain_paths_have_no_query() {
        let (path, pairs) = split_url("/api/metrics");
        assert_eq!(path, "/api/metrics");
        assert!(pairs.is_empty());
    }

    #[test]
    fn content_types_cover_the_ui_set() {
        assert_eq!(content_type_for(Path::new("index.html")), b"text/html; charset=utf-8");
        assert_eq!(content_type_for(Path::new("app.js")), b"application/javascript");
        assert_eq!(content_type_for(Path::new("x.bin")), b"application/octet-stream");
    }
}
