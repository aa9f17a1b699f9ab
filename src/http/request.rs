//! Request handling and transformation.
//!
//! # Responsibilities
//! - Extract the routing host from an inbound request
//! - Prepare the request for forwarding to a backend
//!
//! # Design Decisions
//! - Method, path, query, headers and body are preserved; no path rewriting
//! - The original Host header is kept; only the URI authority changes
//! - Hop-by-hop headers are stripped and `x-forwarded-*` appended

use std::net::SocketAddr;

use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Request, Uri, Version};
use url::Url;

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Headers meaningful only for a single transport-level connection.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Host used for routing: the Host header, else the URI authority.
pub fn request_host<B>(request: &Request<B>) -> String {
    request
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Rewrite `request` to target `upstream`.
///
/// `scheme` is the scheme the client used to reach the proxy.
pub fn upstream_request(
    request: Request<Body>,
    upstream: &Url,
    client: Option<SocketAddr>,
    scheme: &str,
) -> Result<Request<Body>, axum::http::Error> {
    let (mut parts, body) = request.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let authority = match (upstream.host_str(), upstream.port_or_known_default()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        (None, _) => String::new(),
    };

    parts.uri = Uri::builder()
        .scheme(upstream.scheme())
        .authority(authority.as_str())
        .path_and_query(path_and_query)
        .build()?;
    // the upstream client speaks HTTP/1.1
    parts.version = Version::HTTP_11;

    let original_host = parts.headers.get(header::HOST).cloned();
    strip_hop_by_hop(&mut parts.headers);

    if let Some(ip) = client.map(|addr| addr.ip().to_string()) {
        let forwarded = match parts
            .headers
            .get(&X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
        {
            Some(prior) => format!("{}, {}", prior, ip),
            None => ip,
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded) {
            parts.headers.insert(X_FORWARDED_FOR, value);
        }
    }
    if let Some(host) = original_host {
        if !parts.headers.contains_key(&X_FORWARDED_HOST) {
            parts.headers.insert(X_FORWARDED_HOST, host);
        }
    }
    if let Ok(proto) = HeaderValue::from_str(scheme) {
        parts.headers.insert(X_FORWARDED_PROTO, proto);
    }

    Ok(Request::from_parts(parts, body))
}
