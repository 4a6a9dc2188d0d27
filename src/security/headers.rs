//! Header scrubbing for relayed traffic.

use std::collections::HashSet;

use axum::http::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST};

use crate::protocol::HeaderList;

/// Header carrying the broker token on inbound requests.
pub const DEFAULT_AUTH_HEADER: &str = "x-broker-authorization";

/// Older spelling of the broker credential, scrubbed as well.
pub const LEGACY_TOKEN_HEADER: &str = "x-broker-token";

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Names listed in `Connection` plus the fixed hop-by-hop set, lowercased.
fn hop_by_hop(headers: &HeaderMap) -> HashSet<String> {
    let mut names: HashSet<String> = HOP_BY_HOP.iter().map(|s| s.to_string()).collect();
    for value in headers.get_all(CONNECTION) {
        if let Ok(list) = value.to_str() {
            names.extend(list.split(',').map(|n| n.trim().to_ascii_lowercase()).filter(|n| !n.is_empty()));
        }
    }
    names
}

/// Headers of an inbound request in relay form.
///
/// Drops hop-by-hop headers, `Host`, the configured authentication header
/// and the legacy token header. Order and repeated values are preserved.
pub fn scrub_request_headers(headers: &HeaderMap, auth_header: &str) -> HeaderList {
    let mut dropped = hop_by_hop(headers);
    dropped.insert(HOST.as_str().to_string());
    dropped.insert(auth_header.to_ascii_lowercase());
    dropped.insert(LEGACY_TOKEN_HEADER.to_string());
    to_header_list(headers, &dropped)
}

/// Headers of a private service response in relay form.
pub fn response_header_list(headers: &HeaderMap) -> HeaderList {
    to_header_list(headers, &hop_by_hop(headers))
}

fn to_header_list(headers: &HeaderMap, dropped: &HashSet<String>) -> HeaderList {
    headers
        .iter()
        .filter(|(name, _)| !dropped.contains(name.as_str()))
        .filter_map(|(name, value)| match value.to_str() {
            Ok(v) => Some((name.as_str().to_string(), v.to_string())),
            Err(_) => {
                tracing::debug!(header = %name, "Dropping non UTF-8 header value");
                None
            }
        })
        .collect()
}

fn to_header_map(list: &HeaderList) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(list.len());
    for (name, value) in list {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                map.append(name, value);
            }
            _ => tracing::debug!(header = %name, "Dropping invalid relayed header"),
        }
    }
    map
}

fn without(mut map: HeaderMap, extra: &[&str]) -> HeaderMap {
    for name in hop_by_hop(&map).iter().map(String::as_str).chain(extra.iter().copied()) {
        map.remove(name);
    }
    map
}

/// Headers to send to the private service for a relayed request.
///
/// `Host` and `Content-Length` are left to the HTTP client, which sets them
/// for the actual origin and the actual (possibly rewritten) body.
pub fn forwardable_headers(list: &HeaderList) -> HeaderMap {
    without(
        to_header_map(list),
        &[HOST.as_str(), CONTENT_LENGTH.as_str(), DEFAULT_AUTH_HEADER, LEGACY_TOKEN_HEADER],
    )
}

/// Headers to answer the original caller with.
pub fn response_header_map(list: &HeaderList) -> HeaderMap {
    without(to_header_map(list), &[])
}
