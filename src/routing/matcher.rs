//! Host matching logic.
//!
//! # Responsibilities
//! - Normalize the inbound Host header
//! - Decide whether a host key claims a host
//!
//! # Design Decisions
//! - Host matching is case-insensitive (per HTTP spec)
//! - A key claims `key` itself and anything under `key.`
//! - Port and trailing dot are stripped before matching

/// Lower-case, strip the port and any trailing dot.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let without_port = if host.starts_with('[') {
        // bracketed IPv6 literal
        host.split_once(']')
            .map(|(addr, _)| &addr[1..])
            .unwrap_or(host)
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
            _ => host,
        }
    };
    without_port.trim_end_matches('.').to_lowercase()
}

/// True when `key` claims the normalized `host`.
pub fn key_matches(key: &str, host: &str) -> bool {
    match host.strip_prefix(key) {
        Some("") => true,
        Some(rest) => rest.starts_with('.'),
        None => false,
    }
}
