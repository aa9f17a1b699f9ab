//! Response interception.
//!
//! # Responsibilities
//! - Inspect the backend's status before anything reaches the client
//! - Substitute the backend-unavailable page on dial failure or 5xx
//! - Replay every other response (status, headers, streaming body)
//!
//! # Design Decisions
//! - Only the status line is inspected; bodies are never buffered
//! - The favicon path is always answered from memory on failure paths
//! - Hop-by-hop headers from the backend are dropped

use std::fmt;

use axum::body::{Body, Bytes, HttpBody};
use axum::http::{header, HeaderValue, Response, StatusCode};
use axum::response::IntoResponse;

use crate::http::pages::{Assets, ErrorPages};
use crate::http::request::strip_hop_by_hop;

/// Path served from the proxy's own assets when routing fails.
pub const FAVICON_PATH: &str = "/favicon.ico";

const FAVICON_CONTENT_TYPE: &str = "image/vnd.microsoft.icon";

/// What the interceptor decided about an upstream result.
#[derive(Debug)]
pub enum Intercepted<B> {
    /// Replay the backend response to the client.
    Passthrough(Response<B>),
    /// Replace the response with the backend-unavailable page.
    Failed { status: StatusCode, detail: Option<String> },
}

impl<B> Intercepted<B> {
    /// `"<code> <reason>"` for a failure.
    pub fn reason(&self) -> Option<String> {
        match self {
            Intercepted::Failed { status, .. } => Some(status_line(*status)),
            Intercepted::Passthrough(_) => None,
        }
    }
}

/// Classify an upstream round-trip.
pub fn intercept<B, E: fmt::Display>(result: Result<Response<B>, E>) -> Intercepted<B> {
    match result {
        Ok(response) if response.status().is_server_error() => Intercepted::Failed {
            status: response.status(),
            detail: None,
        },
        Ok(response) => Intercepted::Passthrough(response),
        Err(e) => Intercepted::Failed {
            status: StatusCode::BAD_GATEWAY,
            detail: Some(e.to_string()),
        },
    }
}

pub fn status_line(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("{} {}", status.as_u16(), reason),
        None => status.as_u16().to_string(),
    }
}

/// Forward a backend response, streaming its body.
pub fn passthrough<B>(response: Response<B>) -> Response<Body>
where
    B: HttpBody<Data = Bytes> + Send + 'static,
    B::Error: Into<axum::BoxError>,
{
    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    Response::from_parts(parts, Body::new(body))
}

/// Response for a request that could not be served by a backend.
///
/// `path` is the request path; the favicon is answered directly.
pub fn failure_response(
    path: &str,
    status: StatusCode,
    page: impl FnOnce() -> String,
    assets: &Assets,
) -> Response<Body> {
    if path == FAVICON_PATH {
        return favicon_response(assets);
    }
    html_response(status, page())
}

/// 503 with the backend-unavailable page.
pub fn unavailable_response(
    pages: &ErrorPages,
    assets: &Assets,
    path: &str,
    reason: &str,
    target: &str,
) -> Response<Body> {
    failure_response(
        path,
        StatusCode::SERVICE_UNAVAILABLE,
        || pages.unavailable(reason, target),
        assets,
    )
}

pub fn favicon_response(assets: &Assets) -> Response<Body> {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, HeaderValue::from_static(FAVICON_CONTENT_TYPE))],
        assets.favicon.clone(),
    )
        .into_response()
}

pub fn html_response(status: StatusCode, html: String) -> Response<Body> {
    (
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"))],
        html,
    )
        .into_response()
}
