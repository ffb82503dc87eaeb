//! HTTP surface: viewer streams, ROI editing and a one-shot debug frame.

pub mod mjpeg;
pub mod ws;

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::json;

use crate::error::PipelineError;
use crate::forward::epoch_seconds;
use crate::roi::RoiEntry;
use crate::session::{PipelineContext, Session};
use crate::CameraId;

const MAX_REQUEST_BYTES: usize = 8192;
const MAX_BODY_BYTES: usize = 64 * 1024;
const ACCEPT_IDLE: Duration = Duration::from_millis(50);

pub const DEFAULT_SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    /// How long `/view/debug/detections` waits for the first frame.
    pub snapshot_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8080".to_string(),
            snapshot_timeout: DEFAULT_SNAPSHOT_TIMEOUT,
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Flag observed by the accept loop and every running session.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    ctx: Arc<PipelineContext>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, ctx: Arc<PipelineContext>) -> Self {
        Self { cfg, ctx }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid listen address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("failed to bind {configured_addr}"))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        log::info!("traffic view api listening on {}", addr);

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, self.cfg, self.ctx, shutdown_thread) {
                log::error!("traffic view api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: ApiConfig,
    ctx: Arc<PipelineContext>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let mut workers: Vec<JoinHandle<()>> = Vec::new();
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let cfg = cfg.clone();
                let ctx = ctx.clone();
                let shutdown = shutdown.clone();
                workers.push(std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &cfg, ctx, shutdown) {
                        log::warn!("request from {} rejected: {:#}", peer, err);
                    }
                }));
                workers.retain(|worker| !worker.is_finished());
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_IDLE);
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    for worker in workers {
        let _ = worker.join();
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Route {
    Health,
    Mjpeg,
    WebSocket,
    Roi,
    DebugDetections,
}

impl Route {
    fn from_path(path: &str) -> Option<Self> {
        match path.trim_end_matches('/') {
            "/health" => Some(Route::Health),
            "/view/mjpeg" => Some(Route::Mjpeg),
            "/view/ws" => Some(Route::WebSocket),
            "/view/roi" => Some(Route::Roi),
            "/view/debug/detections" => Some(Route::DebugDetections),
            _ => None,
        }
    }

    fn allows(self, method: &str) -> bool {
        match self {
            Route::Roi => method == "GET" || method == "POST",
            _ => method == "GET",
        }
    }
}

fn handle_connection(
    mut stream: TcpStream,
    cfg: &ApiConfig,
    ctx: Arc<PipelineContext>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    // Accepted sockets inherit O_NONBLOCK on some platforms.
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    log::debug!("{} {}", request.method, request.raw_path);

    let Some(route) = Route::from_path(&request.path) else {
        write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#)?;
        return Ok(());
    };
    if !route.allows(&request.method) {
        write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        return Ok(());
    }
    if route == Route::Health {
        write_json_response(&mut stream, 200, r#"{"status":"ok"}"#)?;
        return Ok(());
    }

    let camera_id = match request.camera_id() {
        Ok(id) => id,
        Err(reason) => {
            log::warn!("{} {}: {}", request.method, request.raw_path, reason);
            write_error(&mut stream, 400, &reason)?;
            return Ok(());
        }
    };

    match (route, request.method.as_str()) {
        (Route::Mjpeg, _) => {
            let session = Session::new(camera_id, ctx, shutdown);
            mjpeg::serve(stream, session)
        }
        (Route::WebSocket, _) => {
            let Some(key) = request.websocket_key() else {
                write_error(&mut stream, 400, "websocket upgrade required")?;
                return Ok(());
            };
            let session = Session::new(camera_id, ctx, shutdown);
            ws::serve(stream, key, session)
        }
        (Route::Roi, "POST") => save_roi(&mut stream, &ctx, camera_id, &request.body),
        (Route::Roi, _) => load_roi(&mut stream, &ctx, camera_id),
        (Route::DebugDetections, _) => {
            let mut session = Session::new(camera_id, ctx, shutdown);
            debug_detections(&mut stream, &mut session, cfg.snapshot_timeout)
        }
        (Route::Health, _) => Ok(()),
    }
}

fn load_roi(stream: &mut TcpStream, ctx: &PipelineContext, camera_id: CameraId) -> Result<()> {
    match ctx.rois.get(camera_id) {
        Ok(config) => {
            let payload = serde_json::to_vec(&RoiEntry::from_config(config.as_ref()))?;
            write_response(stream, 200, "application/json", &payload)
        }
        Err(err) => {
            log::warn!("camera {}: roi lookup failed: {:#}", camera_id, err);
            write_error(stream, 500, "roi store unavailable")
        }
    }
}

fn save_roi(
    stream: &mut TcpStream,
    ctx: &PipelineContext,
    camera_id: CameraId,
    body: &[u8],
) -> Result<()> {
    let entry: RoiEntry = match serde_json::from_slice(body) {
        Ok(entry) => entry,
        Err(err) => {
            return write_error(stream, 400, &format!("invalid roi body: {err}"));
        }
    };
    // A body without any usable polygon removes the stored zones.
    let result = match entry.into_config(camera_id) {
        Some(config) => ctx.rois.save(config),
        None => ctx.rois.clear(camera_id),
    };
    match result {
        Ok(()) => {
            log::info!("camera {}: roi updated", camera_id);
            write_json_response(stream, 200, r#"{"success":true}"#)
        }
        Err(err) => {
            log::warn!("camera {}: roi save failed: {:#}", camera_id, err);
            write_error(stream, 500, "roi store unavailable")
        }
    }
}

fn debug_detections(
    stream: &mut TcpStream,
    session: &mut Session,
    timeout: Duration,
) -> Result<()> {
    let tick = match session.snapshot(timeout) {
        Ok(tick) => tick,
        Err(err) => {
            let status = err
                .downcast_ref::<PipelineError>()
                .map_or(502, PipelineError::http_status);
            return write_error(stream, status, &err.to_string());
        }
    };
    let payload = json!({
        "timestamp": epoch_seconds(tick.timestamp),
        "detections": tick.detections,
        "roiPolygon": tick.roi.primary_polygon(),
        "congestion": tick.report,
    });
    write_response(stream, 200, "application/json", &serde_json::to_vec(&payload)?)
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before request headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
    };

    let text = String::from_utf8_lossy(&data[..header_end]);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length '{}'", value))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(anyhow!("request body too large"));
    }
    let mut body = data[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed mid-body"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, query),
        None => (raw_path, ""),
    };
    let query = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();

    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        raw_path: raw_path.to_string(),
        query,
        headers,
        body,
    })
}

pub(crate) fn write_error(stream: &mut TcpStream, status: u16, message: &str) -> Result<()> {
    let body = json!({ "error": message }).to_string();
    write_json_response(stream, status, &body)
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn status_line(status: u16) -> &'static str {
    match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        502 => "HTTP/1.1 502 Bad Gateway",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    }
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line(status),
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    raw_path: String,
    query: HashMap<String, String>,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl HttpRequest {
    fn camera_id(&self) -> std::result::Result<CameraId, String> {
        let raw = self
            .query
            .get("cctv_id")
            .ok_or_else(|| "missing cctv_id".to_string())?;
        match raw.trim().parse::<CameraId>() {
            Ok(id) if id >= 1 => Ok(id),
            _ => Err(format!("cctv_id must be an integer >= 1, got '{raw}'")),
        }
    }

    /// `Sec-WebSocket-Key` of a well-formed upgrade request.
    fn websocket_key(&self) -> Option<&str> {
        let upgrade = self.headers.get("upgrade")?;
        if !upgrade.eq_ignore_ascii_case("websocket") {
            return None;
        }
        let connection = self.headers.get("connection")?;
        if !connection
            .split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        {
            return None;
        }
        self.headers
            .get("sec-websocket-key")
            .map(String::as_str)
            .filter(|key| !key.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(raw_path: &str, headers: &[(&str, &str)]) -> HttpRequest {
        let (path, query) = raw_path.split_once('?').unwrap_or((raw_path, ""));
        HttpRequest {
            method: "GET".into(),
            path: path.into(),
            raw_path: raw_path.into(),
            query: url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_lowercase(), v.to_string()))
                .collect(),
            body: Vec::new(),
        }
    }

    #[test]
    fn routes_and_methods() {
        assert_eq!(Route::from_path("/view/mjpeg"), Some(Route::Mjpeg));
        assert_eq!(Route::from_path("/view/roi/"), Some(Route::Roi));
        assert_eq!(Route::from_path("/view/nothing"), None);
        assert!(Route::Roi.allows("POST"));
        assert!(!Route::Mjpeg.allows("POST"));
        assert!(!Route::Health.allows("DELETE"));
    }

    #[test]
    fn camera_id_must_be_positive_integer() {
        assert_eq!(request("/view/mjpeg?cctv_id=149416", &[]).camera_id(), Ok(149416));
        assert!(request("/view/mjpeg?cctv_id=0", &[]).camera_id().is_err());
        assert!(request("/view/mjpeg?cctv_id=-4", &[]).camera_id().is_err());
        assert!(request("/view/mjpeg?cctv_id=abc", &[]).camera_id().is_err());
        assert!(request("/view/mjpeg", &[]).camera_id().is_err());
    }

    #[test]
    fn websocket_key_requires_upgrade_headers() {
        let ok = request(
            "/view/ws?cctv_id=1",
            &[
                ("Upgrade", "websocket"),
                ("Connection", "keep-alive, Upgrade"),
                ("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
            ],
        );
        assert_eq!(ok.websocket_key(), Some("dGhlIHNhbXBsZSBub25jZQ=="));

        let plain = request("/view/ws?cctv_id=1", &[("Connection", "close")]);
        assert_eq!(plain.websocket_key(), None);
    }
}
