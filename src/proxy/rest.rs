//! REST front end.
//!
//! Accepts the TF-Serving HTTP surface (`/v1/models/{name}/versions/{v}…`)
//! and reverse-proxies it byte-for-byte: inference payloads are never
//! deserialized, so tensor encodings survive the hop unchanged. Requests
//! without an explicit version are rejected at the edge with the canonical
//! error body before any routing happens.

use std::sync::{Arc, LazyLock};

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::response::Response;
use axum::Router;
use http::request::Parts;
use http::{header, HeaderMap, StatusCode};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use super::{Dispatcher, Target};
use crate::telemetry;
use crate::{ModelKey, MuninError, Result};

/// Upper bound on one buffered inference payload.
const MAX_BODY_BYTES: usize = 256 * 1024 * 1024;

static MODEL_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^/v1/models/([a-z0-9]+)(?:/versions/([0-9]+))?")
        .expect("model path regex is valid")
});

/// Headers that must not cross a proxy hop.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorBody {
    status: &'static str,
    message: String,
}

/// Build the REST app for a dispatcher. Every path funnels through one
/// handler; the model path regex decides what is a model request.
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new().fallback(handle).with_state(dispatcher)
}

/// Extract `(name, version)` from a request path. `None` means the path is
/// not a model request at all; `Some((name, None))` means the version
/// segment is missing.
fn model_path(path: &str) -> Option<(String, Option<String>)> {
    let caps = MODEL_PATH_RE.captures(path)?;
    let name = caps.get(1)?.as_str().to_string();
    let version = caps.get(2).map(|m| m.as_str().to_string());
    Some((name, version))
}

async fn handle(State(dispatcher): State<Arc<Dispatcher>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    debug!(uri = %parts.uri, "handling request");

    let (name, version) = match model_path(parts.uri.path()) {
        Some((name, version)) => (name, version),
        None => {
            metrics::counter!(telemetry::PROXY_INVALID_TOTAL, "protocol" => "rest").increment(1);
            return error_response(StatusCode::NOT_FOUND, "No model found in request path".into());
        }
    };
    let Some(version) = version else {
        metrics::counter!(telemetry::PROXY_INVALID_TOTAL, "protocol" => "rest").increment(1);
        return error_response(
            StatusCode::BAD_REQUEST,
            "Model version must be provided".into(),
        );
    };
    let key = ModelKey::new(name, version);

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            metrics::counter!(telemetry::PROXY_INVALID_TOTAL, "protocol" => "rest").increment(1);
            return error_response(StatusCode::BAD_REQUEST, format!("unreadable body: {e}"));
        }
    };

    metrics::counter!(telemetry::PROXY_FORWARDS_TOTAL, "protocol" => "rest").increment(1);
    match dispatch(&dispatcher, &key, &parts, body).await {
        Ok(response) => response,
        Err(err) => error_response(err.http_status(), err.to_string()),
    }
}

/// Walk the dispatch order: serve locally, or forward to the first
/// reachable replica. Transport failures fail over; application responses
/// (any status) pass through.
async fn dispatch(
    dispatcher: &Dispatcher,
    key: &ModelKey,
    parts: &Parts,
    body: Bytes,
) -> Result<Response> {
    for target in dispatcher.candidates(key)? {
        match target {
            Target::Local => return serve_local(dispatcher, key, parts, body).await,
            Target::Peer(peer) => {
                match forward(&dispatcher.http, &peer.rest_addr, parts, body.clone()).await {
                    Ok(response) => return Ok(response),
                    Err(e) => {
                        warn!(peer = %peer.id, error = %e, "peer forward failed, trying next replica");
                    }
                }
            }
        }
    }
    Err(MuninError::PeerUnavailable {
        model: key.to_string(),
    })
}

/// Admit into the local cache, then pass through to the engine REST port.
/// The read pin is held until the engine response is fully buffered.
async fn serve_local(
    dispatcher: &Dispatcher,
    key: &ModelKey,
    parts: &Parts,
    body: Bytes,
) -> Result<Response> {
    let _guard = dispatcher.cache.acquire(key).await?;
    forward(&dispatcher.http, dispatcher.engine.rest_base(), parts, body)
        .await
        .map_err(|e| MuninError::Upstream {
            status: StatusCode::SERVICE_UNAVAILABLE.as_u16(),
            message: format!("engine unreachable: {e}"),
        })
}

/// Byte-preserving HTTP hop: method, query, body, and all non-hop-by-hop
/// headers are forwarded unchanged.
async fn forward(
    http: &reqwest::Client,
    base: &str,
    parts: &Parts,
    body: Bytes,
) -> std::result::Result<Response, reqwest::Error> {
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{path_and_query}", base.trim_end_matches('/'));

    let mut headers = parts.headers.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);

    let upstream = http
        .request(parts.method.clone(), url)
        .headers(headers)
        .body(body)
        .send()
        .await?;

    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    strip_hop_by_hop(&mut headers);
    let bytes = upstream.bytes().await?;

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    let body = serde_json::to_vec(&ErrorBody {
        status: "Error",
        message,
    })
    .unwrap_or_default();
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    response
}
