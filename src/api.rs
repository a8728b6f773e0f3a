//! HTTP surface: the keepalive ping endpoint plus a few read-only helpers
//!
//! - `/api/?name=<svc>&timeout=<secs>[&host=..][&path=..]` (any method)
//! - `GET /health`
//! - `GET /version`
//! - `GET /services`

use crate::adapter::ServiceHints;
use crate::error::{error_response, ControllerError};
use crate::registry::ServiceRegistry;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Version information for the controller
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

const PING_PREFIX: &str = "/api/";
const X_REQUEST_ID: &str = "x-request-id";

/// Helper to create a plain-text response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// A parsed keepalive request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingRequest {
    pub hints: ServiceHints,
    pub timeout_secs: u64,
}

/// Decode one `application/x-www-form-urlencoded` component
fn form_decode(raw: &str) -> Option<String> {
    urlencoding::decode(&raw.replace('+', " "))
        .ok()
        .map(|s| s.into_owned())
}

/// Split a query string into its parameters; the first occurrence of a key wins
fn query_params(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let (Some(key), Some(value)) = (form_decode(key), form_decode(value)) else {
            continue;
        };
        params.entry(key).or_insert(value);
    }
    params
}

/// Parse the ping query string.
///
/// `host` and `path` arrive escaped a second time by the proxy and are
/// unescaped again after query decoding.
pub fn parse_ping(query: Option<&str>) -> Result<PingRequest, ControllerError> {
    let params = query.map(query_params).unwrap_or_default();
    let name = params.get("name").cloned().unwrap_or_default();
    let raw_timeout = params.get("timeout").cloned().unwrap_or_default();

    let invalid = |reason: &str| ControllerError::ParameterInvalid {
        reason: reason.to_string(),
        name: name.clone(),
        timeout: raw_timeout.clone(),
    };

    if name.trim().is_empty() {
        return Err(invalid("name is required"));
    }
    if raw_timeout.is_empty() {
        return Err(invalid("timeout is required"));
    }
    let timeout_secs = match raw_timeout.parse::<u64>() {
        Ok(secs) if secs > 0 => secs,
        _ => return Err(invalid("timeout must be a positive integer")),
    };

    let unescape = |key: &str| -> Result<Option<String>, ControllerError> {
        match params.get(key) {
            None => Ok(None),
            Some(raw) => urlencoding::decode(raw)
                .map(|s| Some(s.into_owned()))
                .map_err(|_| invalid(&format!("{} is not valid URL encoding", key))),
        }
    };
    let host = unescape("host")?;
    let path = unescape("path")?;

    Ok(PingRequest {
        hints: ServiceHints::new(name.clone()).with_host(host).with_path(path),
        timeout_secs,
    })
}

/// HTTP server for proxy keepalive pings
pub struct ApiServer {
    bind_addr: SocketAddr,
    registry: Arc<ServiceRegistry>,
    shutdown_rx: watch::Receiver<bool>,
    strict_status_codes: bool,
}

impl ApiServer {
    pub fn new(
        bind_addr: SocketAddr,
        registry: Arc<ServiceRegistry>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            registry,
            shutdown_rx,
            strict_status_codes: false,
        }
    }

    /// Return the error's status code instead of 200 for failed pings
    pub fn with_strict_status_codes(mut self, strict: bool) -> Self {
        self.strict_status_codes = strict;
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Controller API listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let strict = self.strict_status_codes;

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let registry = Arc::clone(&self.registry);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, registry, strict).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    // A dropped sender also means shutdown
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Controller API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    registry: Arc<ServiceRegistry>,
    strict: bool,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let registry = Arc::clone(&registry);
        async move { handle_request(req, registry, strict).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    registry: Arc<ServiceRegistry>,
    strict: bool,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let path = req.uri().path();
    let method = req.method();
    debug!(%method, %path, request_id, "Incoming request");

    let mut response = match (method, path) {
        (_, path) if path.starts_with(PING_PREFIX) || path == "/api" => {
            handle_ping(req.uri().query(), &registry, strict, &request_id).await
        }

        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        (&Method::GET, "/services") => {
            let services = registry.snapshots();
            let body = serde_json::json!({
                "count": services.len(),
                "services": services,
            });
            json_response(StatusCode::OK, body.to_string())
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    if let Ok(value) = request_id.parse() {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    Ok(response)
}

async fn handle_ping(
    query: Option<&str>,
    registry: &ServiceRegistry,
    strict: bool,
    request_id: &str,
) -> Response<Full<Bytes>> {
    let ping = match parse_ping(query) {
        Ok(ping) => ping,
        Err(e) => {
            warn!(request_id, error = %e, "Rejected ping");
            return error_response(&e, strict);
        }
    };

    debug!(
        request_id,
        service = %ping.hints.name,
        timeout_secs = ping.timeout_secs,
        host = ?ping.hints.host,
        path = ?ping.hints.path,
        "Ping"
    );

    let result = match registry.get_or_create(ping.hints, ping.timeout_secs).await {
        Ok(service) => service.handle_ping().await,
        Err(e) => Err(e),
    };

    match result {
        Ok(reply) => response(StatusCode::OK, reply.as_str()),
        Err(e) => {
            match e {
                ControllerError::ParameterInvalid { .. } | ControllerError::NoMatches { .. } => {
                    warn!(request_id, error = %e, "Ping failed")
                }
                _ => error!(request_id, error = %e, "Ping failed"),
            }
            error_response(&e, strict)
        }
    }
}
