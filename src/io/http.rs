//! HTTP API for POS terminals
//!
//! Plain hyper http1 server. Every response, including errors, is a JSON
//! object with CORS headers so browser clients can always tell "no data yet"
//! from "device error". `/barcode` and `/weight` only read shared state; print
//! routes go through the dispatcher and never touch the printer directly.

use crate::domain::types::JobKind;
use crate::infra::error::BridgeError;
use crate::services::context::BridgeContext;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Drawer requests carry `{}` at most
const MAX_DRAWER_BODY: usize = 4096;

const ENDPOINTS: &[(&str, &str)] = &[
    ("/", "GET"),
    ("/health", "GET"),
    ("/metrics", "GET"),
    ("/barcode", "GET"),
    ("/weight", "GET"),
    ("/printer_status", "GET"),
    ("/print_raw", "POST"),
    ("/open_drawer", "POST"),
];

/// Methods a known path accepts, formatted for `Allow` headers
fn allowed_methods(path: &str) -> Option<&'static str> {
    ENDPOINTS.iter().find(|(p, _)| *p == path).map(|(_, m)| match *m {
        "POST" => "POST, OPTIONS",
        _ => "GET, OPTIONS",
    })
}

fn json_response(status: StatusCode, body: &Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn error_response(status: StatusCode, code: &str, message: Option<String>) -> Response<Full<Bytes>> {
    let mut body = json!({ "status": "error", "error": code });
    if let Some(message) = message {
        body["message"] = Value::String(message);
    }
    json_response(status, &body)
}

fn bridge_error_response(e: &BridgeError) -> Response<Full<Bytes>> {
    error_response(e.http_status(), e.code(), Some(e.to_string()))
}

fn not_found() -> Response<Full<Bytes>> {
    error_response(StatusCode::NOT_FOUND, "not_found", None)
}

fn method_not_allowed(allowed: &'static str) -> Response<Full<Bytes>> {
    let mut response = error_response(StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed", None);
    response.headers_mut().insert(header::ALLOW, HeaderValue::from_static(allowed));
    response
}

fn preflight(allowed: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::NO_CONTENT;
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static(allowed));
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("Content-Type"));
    headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("600"));
    response
}

/// Run a read-side handler under the request timeout
async fn within<F>(limit: Duration, operation: &'static str, handler: F) -> Response<Full<Bytes>>
where
    F: Future<Output = Response<Full<Bytes>>>,
{
    match tokio::time::timeout(limit, handler).await {
        Ok(response) => response,
        Err(_) => bridge_error_response(&BridgeError::timeout(operation, limit)),
    }
}

/// Entry point for every request
pub async fn handle_request<B>(
    req: Request<B>,
    ctx: Arc<BridgeContext>,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let mut response = route(req, &ctx, &path).await;
    response
        .headers_mut()
        .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, ctx.http.cors_origin.clone());

    debug!(
        method = %method,
        path = %path,
        status = %response.status().as_u16(),
        elapsed_us = %start.elapsed().as_micros(),
        "http_request"
    );
    Ok(response)
}

async fn route<B>(req: Request<B>, ctx: &Arc<BridgeContext>, path: &str) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let Some(allowed) = allowed_methods(path) else {
        return not_found();
    };
    if req.method() == Method::OPTIONS {
        return preflight(allowed);
    }

    let limit = ctx.http.request_timeout;
    match (req.method().clone(), path) {
        (Method::GET, "/") => service_info(ctx),
        (Method::GET, "/health") => json_response(StatusCode::OK, &json!({ "status": "ok" })),
        (Method::GET, "/metrics") => {
            let mut response = Response::new(Full::new(Bytes::from(ctx.metrics.render_prometheus())));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            response
        }
        (Method::GET, "/barcode") => within(limit, "barcode", async { barcode(ctx) }).await,
        (Method::GET, "/weight") => within(limit, "weight", async { weight(ctx) }).await,
        (Method::GET, "/printer_status") => within(limit, "printer_status", printer_status(ctx)).await,
        (Method::POST, "/print_raw") => print_raw(req, ctx).await,
        (Method::POST, "/open_drawer") => open_drawer(req, ctx).await,
        _ => method_not_allowed(allowed),
    }
}

fn service_info(ctx: &BridgeContext) -> Response<Full<Bytes>> {
    let endpoints: serde_json::Map<String, Value> = ENDPOINTS
        .iter()
        .map(|(path, method)| (path.to_string(), Value::String(method.to_string())))
        .collect();

    json_response(
        StatusCode::OK,
        &json!({
            "status": "running",
            "service": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "git_hash": env!("GIT_HASH"),
            "serial_port": ctx.serial_port(),
            "serial_state": ctx.serial_state(),
            "uptime_secs": ctx.uptime().as_secs(),
            "endpoints": endpoints,
        }),
    )
}

/// Hint attached to poll responses while the serial device is down
fn serial_hint(ctx: &BridgeContext) -> Option<String> {
    let state = ctx.serial_state();
    (!state.is_connected())
        .then(|| format!("serial device {} is {}", ctx.serial_port(), state.as_str()))
}

fn barcode(ctx: &BridgeContext) -> Response<Full<Bytes>> {
    let code = ctx.state.pop_barcode().map(|event| {
        ctx.metrics.record_barcode_delivered();
        info!(barcode = %event.code, "barcode_delivered");
        event.code
    });

    let mut body = json!({ "barcode": code });
    if let Some(hint) = serial_hint(ctx) {
        body["error"] = Value::String(hint);
    }
    json_response(StatusCode::OK, &body)
}

fn weight(ctx: &BridgeContext) -> Response<Full<Bytes>> {
    let mut body = match ctx.state.fresh_reading_at(Instant::now()) {
        Some(reading) => json!({ "weight": reading.value, "raw": reading.raw }),
        None => json!({ "weight": null }),
    };
    if let Some(hint) = serial_hint(ctx) {
        body["error"] = Value::String(hint);
    }
    json_response(StatusCode::OK, &body)
}

async fn printer_status(ctx: &BridgeContext) -> Response<Full<Bytes>> {
    let status = ctx.dispatcher.status().await;
    match serde_json::to_value(&status) {
        Ok(mut body) => {
            body["busy"] = Value::Bool(ctx.dispatcher.is_busy());
            json_response(StatusCode::OK, &body)
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", Some(e.to_string())),
    }
}

/// Raw printer streams arrive untyped, as octet-stream, or as text/plain
fn accepts_raw_payload(content_type: &HeaderValue) -> bool {
    let Ok(value) = content_type.to_str() else {
        return false;
    };
    let media_type = value.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    matches!(media_type.as_str(), "application/octet-stream" | "text/plain")
}

async fn read_body<B>(req: Request<B>, limit: usize) -> Result<Bytes, Response<Full<Bytes>>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let too_large = || {
        error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            "payload_too_large",
            Some(format!("payload exceeds {limit} bytes")),
        )
    };

    let declared = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared.is_some_and(|len| len > limit as u64) {
        return Err(too_large());
    }

    match Limited::new(req.into_body(), limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => Err(too_large()),
        Err(e) => {
            warn!(error = %e, "http_body_read_failed");
            Err(bridge_error_response(&BridgeError::InvalidRequest(format!("unreadable body: {e}"))))
        }
    }
}

async fn print_raw<B>(req: Request<B>, ctx: &Arc<BridgeContext>) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    if let Some(content_type) = req.headers().get(header::CONTENT_TYPE) {
        if !accepts_raw_payload(content_type) {
            return error_response(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "unsupported_media_type",
                Some("expected application/octet-stream or text/plain".to_string()),
            );
        }
    }

    let payload = match read_body(req, ctx.http.max_payload_bytes).await {
        Ok(payload) => payload,
        Err(response) => return response,
    };
    if payload.is_empty() {
        return bridge_error_response(&BridgeError::InvalidRequest("empty print payload".to_string()));
    }

    run_job(ctx, JobKind::Raw, payload).await
}

async fn open_drawer<B>(req: Request<B>, ctx: &Arc<BridgeContext>) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let body = match read_body(req, MAX_DRAWER_BODY).await {
        Ok(body) => body,
        Err(response) => return response,
    };
    if !body.iter().all(u8::is_ascii_whitespace) {
        if let Err(e) = serde_json::from_slice::<Value>(&body) {
            return bridge_error_response(&BridgeError::InvalidRequest(format!("body is not JSON: {e}")));
        }
    }

    run_job(ctx, JobKind::DrawerKick, Bytes::new()).await
}

/// Run a print job on its own task. A client timeout answers 504 but lets
/// the job finish, so the printer never sees a half-written stream.
async fn run_job(ctx: &Arc<BridgeContext>, kind: JobKind, payload: Bytes) -> Response<Full<Bytes>> {
    let dispatcher = ctx.dispatcher.clone();
    let task = tokio::spawn(async move {
        match kind {
            JobKind::Raw => dispatcher.print(&payload).await,
            JobKind::DrawerKick => dispatcher.open_drawer().await,
        }
    });

    let limit = ctx.http.print_timeout;
    match tokio::time::timeout(limit, task).await {
        Ok(Ok(Ok(job))) => json_response(
            StatusCode::OK,
            &json!({
                "status": "ok",
                "job_id": job.id.to_string(),
                "method": job.transport,
                "bytes": job.bytes,
                "fell_back": job.fell_back,
            }),
        ),
        Ok(Ok(Err(e))) => bridge_error_response(&e),
        Ok(Err(e)) => {
            error!(kind = %kind.as_str(), error = %e, "print_task_failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", Some(e.to_string()))
        }
        Err(_) => {
            warn!(kind = %kind.as_str(), timeout_ms = %limit.as_millis(), "print_request_timed_out");
            bridge_error_response(&BridgeError::timeout(kind.as_str(), limit))
        }
    }
}

/// Accept connections until shutdown flips to true
pub async fn serve(
    listener: TcpListener,
    ctx: Arc<BridgeContext>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let io = TokioIo::new(stream);
                        let ctx = ctx.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| handle_request(req, ctx.clone()));

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                debug!(peer = %peer, error = %e, "http_connection_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "http_accept_error");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("http_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

/// Bind the API listener and serve until shutdown
pub async fn start_http_server(
    host: &str,
    port: u16,
    ctx: Arc<BridgeContext>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), BoxError> {
    let listener = TcpListener::bind((host, port)).await?;
    info!(addr = %listener.local_addr()?, "http_server_started");
    serve(listener, ctx, shutdown).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{BarcodeEvent, DeviceState, WeightReading};
    use crate::infra::metrics::Metrics;
    use crate::io::printer::{DirectUsbTransport, PrinterHandles, SpoolerTransport};
    use crate::services::context::HttpSettings;
    use crate::services::dispatcher::PrinterDispatcher;
    use crate::services::state::SharedState;
    use std::io::Read;
    use tempfile::NamedTempFile;

    struct Fixture {
        ctx: Arc<BridgeContext>,
        device: NamedTempFile,
        _serial_tx: watch::Sender<DeviceState>,
    }

    fn fixture(serial: DeviceState) -> Fixture {
        let device = NamedTempFile::new().unwrap();
        let direct = DirectUsbTransport::new(device.path().to_str().unwrap(), Duration::from_secs(1));
        let spooler =
            SpoolerTransport::new("q", "/nonexistent/lp", "/nonexistent/lpstat", Duration::from_secs(1));
        let metrics = Arc::new(Metrics::new());
        let dispatcher = Arc::new(PrinterDispatcher::new(
            PrinterHandles::new(Arc::new(direct), Arc::new(spooler)),
            metrics.clone(),
        ));
        let state = Arc::new(SharedState::new(Duration::from_secs(2), 64));
        let (serial_tx, serial_rx) = watch::channel(serial);
        let http = HttpSettings { max_payload_bytes: 64, ..HttpSettings::default() };
        let ctx = BridgeContext::new(state, dispatcher, metrics, "/dev/ttyUSB0", serial_rx, http);
        Fixture { ctx: Arc::new(ctx), device, _serial_tx: serial_tx }
    }

    fn request(method: Method, path: &str, body: &'static [u8]) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(path)
            .body(Full::new(Bytes::from_static(body)))
            .unwrap()
    }

    async fn send(ctx: &Arc<BridgeContext>, req: Request<Full<Bytes>>) -> (StatusCode, Value) {
        let response = handle_request(req, ctx.clone()).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json = if body.is_empty() { Value::Null } else { serde_json::from_slice(&body).unwrap() };
        (status, json)
    }

    #[tokio::test]
    async fn test_barcode_pops_in_order_then_null() {
        let f = fixture(DeviceState::Connected);
        f.ctx.state.push_barcode(BarcodeEvent::new("111"));
        f.ctx.state.push_barcode(BarcodeEvent::new("222"));

        let (_, body) = send(&f.ctx, request(Method::GET, "/barcode", b"")).await;
        assert_eq!(body, json!({ "barcode": "111" }));
        let (_, body) = send(&f.ctx, request(Method::GET, "/barcode", b"")).await;
        assert_eq!(body, json!({ "barcode": "222" }));
        let (status, body) = send(&f.ctx, request(Method::GET, "/barcode", b"")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "barcode": null }));
    }

    #[tokio::test]
    async fn test_poll_reports_serial_hint_when_disconnected() {
        let f = fixture(DeviceState::Disconnected);
        let (status, body) = send(&f.ctx, request(Method::GET, "/weight", b"")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["weight"], Value::Null);
        assert!(body["error"].as_str().unwrap().contains("/dev/ttyUSB0"));
    }

    #[tokio::test]
    async fn test_weight_fresh_reading() {
        let f = fixture(DeviceState::Connected);
        f.ctx.state.set_weight(WeightReading::from_raw(45, 100.0, Instant::now()));
        let (_, body) = send(&f.ctx, request(Method::GET, "/weight", b"")).await;
        assert_eq!(body, json!({ "weight": 0.45, "raw": 45 }));
    }

    #[tokio::test]
    async fn test_print_raw_writes_device() {
        let mut f = fixture(DeviceState::Connected);
        let (status, body) = send(&f.ctx, request(Method::POST, "/print_raw", b"\x1b@hi\n")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["method"], "direct");
        assert!(body["job_id"].is_string());

        let mut written = Vec::new();
        f.device.as_file_mut().read_to_end(&mut written).unwrap();
        assert_eq!(written, b"\x1b@hi\n");
    }

    #[tokio::test]
    async fn test_print_raw_validation() {
        let f = fixture(DeviceState::Connected);

        let (status, body) = send(&f.ctx, request(Method::POST, "/print_raw", b"")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_request");

        let big = request(Method::POST, "/print_raw", &[b'x'; 65]);
        let (status, body) = send(&f.ctx, big).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["error"], "payload_too_large");

        let mut req = request(Method::POST, "/print_raw", b"{}");
        req.headers_mut().insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let (status, body) = send(&f.ctx, req).await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn test_open_drawer_rejects_non_json() {
        let f = fixture(DeviceState::Connected);
        let (status, body) = send(&f.ctx, request(Method::POST, "/open_drawer", b"kick")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_request");
    }

    #[tokio::test]
    async fn test_routing_errors_are_json() {
        let f = fixture(DeviceState::Connected);

        let (status, body) = send(&f.ctx, request(Method::GET, "/nope", b"")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({ "status": "error", "error": "not_found" }));

        let response = handle_request(request(Method::GET, "/print_raw", b""), f.ctx.clone()).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[header::ALLOW], "POST, OPTIONS");
    }

    #[tokio::test]
    async fn test_preflight_and_cors() {
        let f = fixture(DeviceState::Connected);
        let response =
            handle_request(request(Method::OPTIONS, "/print_raw", b""), f.ctx.clone()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_METHODS], "POST, OPTIONS");

        let response = handle_request(request(Method::GET, "/health", b""), f.ctx.clone()).await.unwrap();
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }

    #[tokio::test]
    async fn test_info_and_metrics() {
        let f = fixture(DeviceState::Connected);
        let (_, body) = send(&f.ctx, request(Method::GET, "/", b"")).await;
        assert_eq!(body["status"], "running");
        assert_eq!(body["serial_state"], "connected");
        assert_eq!(body["endpoints"]["/print_raw"], "POST");

        let response = handle_request(request(Method::GET, "/metrics", b""), f.ctx.clone()).await.unwrap();
        let text = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&text).contains("bridge_barcodes_scanned_total"));
    }

    #[test]
    fn test_accepts_raw_payload() {
        assert!(accepts_raw_payload(&HeaderValue::from_static("application/octet-stream")));
        assert!(accepts_raw_payload(&HeaderValue::from_static("text/plain; charset=utf-8")));
        assert!(!accepts_raw_payload(&HeaderValue::from_static("application/json")));
    }
}
