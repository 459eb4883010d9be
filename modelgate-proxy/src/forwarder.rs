//! Streaming reverse-proxy client for the single origin.
//!
//! One shared `reqwest::Client` (and therefore one upstream connection pool)
//! serves every request. The forwarder re-issues the client's method, path,
//! and filtered headers against the origin and resolves as soon as response
//! headers arrive; bodies stream in both directions.

use std::net::IpAddr;
use std::time::Duration;

use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::Method;
use reqwest::Client;
use tracing::{debug, info};

/// Maximum time to establish a connection to the origin.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long an idle upstream connection is kept for reuse.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Error types for forwarder construction.
#[derive(Debug, thiserror::Error)]
pub enum ForwarderError {
    #[error("invalid backend url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Upstream client for the single configured origin.
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: Client,
    base_url: String,
}

impl Forwarder {
    /// Create a forwarder for `base_url`.
    ///
    /// Redirects are not followed (3xx statuses belong to the client) and
    /// compression is left off so bodies pass through byte-for-byte. HTTP/2
    /// is negotiated via ALPN where the origin offers it.
    pub fn new(base_url: &str) -> Result<Self, ForwarderError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if let Err(err) = base_url.parse::<reqwest::Url>() {
            return Err(ForwarderError::InvalidUrl {
                url: base_url,
                reason: err.to_string(),
            });
        }
        info!(url = %base_url, "creating upstream forwarder");

        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .no_gzip()
            .no_brotli()
            .no_deflate()
            .build()?;

        Ok(Self { client, base_url })
    }

    /// Origin base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Re-issue a client request against the origin.
    ///
    /// Resolves once response headers arrive; the body on the returned
    /// response is streamed by the caller. Dropping the future or the
    /// response cancels the transfer and frees the connection.
    pub async fn forward(
        &self,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        peer: Option<IpAddr>,
        body: reqwest::Body,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let url = format!("{}{}", self.base_url, path_and_query);
        debug!(method = %method, url = %url, "forwarding request");

        let mut outbound = filter_request_headers(headers);
        append_forwarded_for(&mut outbound, peer);

        self.client
            .request(method, url)
            .headers(outbound)
            .body(body)
            .send()
            .await
    }
}

/// RFC 7230 §6.1 hop-by-hop headers, dropped in both directions.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    name == header::CONNECTION
        || name.as_str() == "keep-alive"
        || name == header::PROXY_AUTHENTICATE
        || name == header::PROXY_AUTHORIZATION
        || name == header::TE
        || name == header::TRAILER
        || name == header::TRANSFER_ENCODING
        || name == header::UPGRADE
}

/// Headers additionally named by a `Connection` header are hop-by-hop too.
fn connection_named(headers: &HeaderMap) -> Vec<String> {
    let mut out = Vec::new();
    for value in headers.get_all(header::CONNECTION) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for token in value.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            out.push(token.to_ascii_lowercase());
        }
    }
    out
}

/// Client headers eligible for the upstream request.
///
/// `Host` belongs to the origin and `Content-Length` no longer matches the
/// re-framed (chunked) body.
pub(crate) fn filter_request_headers(headers: &HeaderMap) -> HeaderMap {
    let named = connection_named(headers);
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if is_hop_by_hop(name) || name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        if named.iter().any(|n| n == name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Origin headers eligible for the client response.
pub(crate) fn filter_response_headers(headers: &HeaderMap) -> HeaderMap {
    let named = connection_named(headers);
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if is_hop_by_hop(name) {
            continue;
        }
        if named.iter().any(|n| n == name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Append the peer address to `X-Forwarded-For`, comma-joined with any value
/// the client already sent.
fn append_forwarded_for(headers: &mut HeaderMap, peer: Option<IpAddr>) {
    let Some(peer) = peer else {
        return;
    };
    let joined = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.trim().is_empty() => format!("{existing}, {peer}"),
        _ => peer.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&joined) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}
