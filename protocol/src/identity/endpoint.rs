//! Endpoint parsing helpers.
//!
//! Peers advertise endpoints as URLs, the registry hands out bare IPs, and
//! catalog authorities can be either a name or an IP literal. These helpers
//! normalise all three.

use std::net::IpAddr;

use reqwest::Url;

use crate::config::DEFAULT_HTTP_PORT;

/// Parse an endpoint, tolerating a missing scheme (`1.2.3.4:7440`).
pub fn parse_endpoint(endpoint: &str) -> Option<Url> {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.contains("://") {
        Url::parse(trimmed).ok()
    } else {
        Url::parse(&format!("http://{}", trimmed)).ok()
    }
}

/// Canonical string form: scheme, host and port, no trailing slash.
pub fn normalize_endpoint(endpoint: &str) -> Option<String> {
    let url = parse_endpoint(endpoint)?;
    let host = url.host_str()?;
    let port = url.port_or_known_default()?;
    Some(format!("{}://{}:{}", url.scheme(), host, port))
}

/// Host portion of an endpoint.
pub fn endpoint_host(endpoint: &str) -> Option<String> {
    parse_endpoint(endpoint).and_then(|u| u.host_str().map(|h| h.trim_matches(['[', ']']).to_string()))
}

/// Port explicitly present in the endpoint, if any.
pub fn explicit_port(endpoint: &str) -> Option<u16> {
    parse_endpoint(endpoint).and_then(|u| u.port())
}

/// `true` for IP literals (with or without port) and `localhost`.
pub fn is_address_literal(authority: &str) -> bool {
    let Some(host) = endpoint_host(authority) else {
        return false;
    };
    host.eq_ignore_ascii_case("localhost") || host.parse::<IpAddr>().is_ok()
}

/// Endpoint URL for an IP/localhost authority; defaults the port.
pub fn endpoint_from_literal(authority: &str) -> Option<String> {
    let url = parse_endpoint(authority)?;
    let host = url.host_str()?;
    let port = url.port().unwrap_or(DEFAULT_HTTP_PORT);
    Some(format!("{}://{}:{}", url.scheme(), host, port))
}

/// Join a path onto an endpoint base.
pub fn join(endpoint: &str, path: &str) -> String {
    format!(
        "{}/{}",
        endpoint.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
