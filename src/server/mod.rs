//! HTTP transport adapting the wire to the dispatcher.
//!
//! The transport is deliberately thin: one catch-all handler turns
//! `(path, method, JSON body)` into a [`Dispatcher::handle`] call on a
//! network thread and the dispatcher's [`Response`] back into an HTTP
//! response. All routing, validation, and dispatch semantics live in the
//! dispatcher; no host-API call ever happens here.

use std::io;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::IntoResponse;
use serde_json::{Map, Value};

use crate::dispatch::router::Response;
use crate::dispatch::Dispatcher;

/// Builds the axum application over a shared dispatcher.
#[must_use]
pub fn app(dispatcher: Arc<Dispatcher>) -> axum::Router {
    axum::Router::new()
        .fallback(handle_any)
        .with_state(dispatcher)
}

/// Serves the app on `addr` until the shutdown signal fires.
///
/// # Errors
///
/// Returns an error if binding or serving fails.
pub async fn serve(dispatcher: Arc<Dispatcher>, addr: &str) -> io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr, "HTTP transport listening");

    axum::serve(listener, app(dispatcher))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

/// The catch-all request handler.
async fn handle_any(
    State(dispatcher): State<Arc<Dispatcher>>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> impl IntoResponse {
    let data = match parse_body(&body) {
        Ok(data) => data,
        Err(message) => {
            return to_http(&Response::fail(400, message));
        }
    };

    let response = dispatcher.handle(uri.path(), method.as_str(), data);
    to_http(&response)
}

/// Parses the request body into a JSON object map. An empty body is an empty
/// object; anything else must be a JSON object.
fn parse_body(body: &Bytes) -> Result<Map<String, Value>, String> {
    if body.is_empty() {
        return Ok(Map::new());
    }

    let value: Value =
        serde_json::from_slice(body).map_err(|e| format!("request body is not valid JSON: {e}"))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err("request body must be a JSON object".to_string()),
    }
}

/// Converts a dispatcher response into an HTTP response.
fn to_http(response: &Response) -> (StatusCode, [(header::HeaderName, &'static str); 1], String) {
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::to_string(response)
        .unwrap_or_else(|_| r#"{"status":500,"error":true,"message":"serialisation failed"}"#.into());
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
}

/// Resolves when SIGINT or SIGTERM arrives.
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint =
        signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT, initiating graceful shutdown");
        }
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

/// Resolves when Ctrl+C arrives.
#[cfg(not(unix))]
async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("Received Ctrl+C, initiating graceful shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_body_is_empty_object() {
        let data = parse_body(&Bytes::new()).unwrap();
        assert!(data.is_empty());
    }

    #[test]
    fn object_body_parses() {
        let data = parse_body(&Bytes::from_static(br#"{"x": 1}"#)).unwrap();
        assert_eq!(data.get("x"), Some(&serde_json::json!(1)));
    }

    #[test]
    fn non_object_body_rejected() {
        assert!(parse_body(&Bytes::from_static(b"[1,2]")).is_err());
        assert!(parse_body(&Bytes::from_static(b"not json")).is_err());
    }

    #[test]
    fn response_serialises_with_status() {
        let (status, _headers, body) = to_http(&Response::fail(404, "no route found"));
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains(r#""status":404"#));
        assert!(body.contains(r#""error":true"#));
    }
}
