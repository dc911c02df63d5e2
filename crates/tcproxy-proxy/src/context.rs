//! Per-request state and the request/response rewriting rules

use axum::http::header::{self, HeaderMap, HeaderName};
use reqwest::Url;
use tcproxy_core::{CredentialSnapshot, Result, TcProxyError};

/// Headers that describe one connection and are never forwarded
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

/// Everything the proxy needs to know about one inbound request.
///
/// The snapshot is read once when the request arrives and used for the whole
/// exchange, so a rotation mid-request cannot mix credentials.
#[derive(Debug, Clone)]
pub struct ProxyRequestContext {
    pub original_path: String,
    pub target: Url,
    pub snapshot: CredentialSnapshot,
}

impl ProxyRequestContext {
    pub fn new(original_path: &str, root_url: &str, snapshot: CredentialSnapshot) -> Result<Self> {
        Ok(Self {
            original_path: original_path.to_string(),
            target: upstream_url(root_url, original_path)?,
            snapshot,
        })
    }

    pub fn generation(&self) -> u64 {
        self.snapshot.generation
    }
}

/// Map a proxy path onto the real API.
///
/// `/queue/v1/ping` becomes `<root_url>/api/queue/v1/ping`; a path that
/// already starts with `/api/` is appended as is. The query string is kept.
/// Paths with `.` or `..` segments are rejected so the result always stays
/// under the API prefix.
pub fn upstream_url(root_url: &str, path_and_query: &str) -> Result<Url> {
    let path_only = path_and_query.split(['?', '#']).next().unwrap_or_default();
    if path_only.split(['/', '\\']).any(is_dot_segment) {
        return Err(TcProxyError::Proxy(format!(
            "Refusing path with dot segments: {}",
            path_and_query
        )));
    }

    let root = root_url.trim_end_matches('/');
    let path = if path_and_query.starts_with("/api/") {
        path_and_query.to_string()
    } else if path_and_query.starts_with('/') {
        format!("/api{}", path_and_query)
    } else {
        format!("/api/{}", path_and_query)
    };

    let url = format!("{}{}", root, path);
    let parsed = Url::parse(&url)
        .map_err(|e| TcProxyError::Proxy(format!("Invalid upstream URL {}: {}", url, e)))?;

    let api_prefix = match Url::parse(root) {
        Ok(root) => format!("{}/api/", root.path().trim_end_matches('/')),
        Err(_) => "/api/".to_string(),
    };
    if !parsed.path().starts_with(&api_prefix) {
        return Err(TcProxyError::Proxy(format!(
            "Upstream URL {} escapes {}",
            parsed, api_prefix
        )));
    }
    Ok(parsed)
}

/// `.` or `..`, also when percent-encoded
fn is_dot_segment(segment: &str) -> bool {
    let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
    decoded == "." || decoded == ".."
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(name)
}

/// Inbound headers to send upstream.
///
/// Drops hop-by-hop headers, anything the task tried to authenticate with,
/// `Host` (reqwest sets the upstream one) and `Content-Length` (recomputed
/// from the buffered body).
pub fn request_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound {
        if is_hop_by_hop(name)
            || *name == header::AUTHORIZATION
            || *name == header::HOST
            || *name == header::CONTENT_LENGTH
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Upstream headers to return to the task
pub fn response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if !is_hop_by_hop(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    headers
}
