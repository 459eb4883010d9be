//! End-to-end request lifecycle: parse, admit, forward, release.
//!
//! One handler serves every method and path. The phases before the upstream
//! response arrives run under the lifecycle deadline; once streaming starts
//! the same deadline rides inside the response body. hyper drops the
//! in-flight future (or the response stream) when the client disconnects,
//! which cancels whichever phase is running; the [`Completion`] guard turns
//! that into an orderly release-then-log on every exit path.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{Method, Uri};
use axum::response::{IntoResponse, Response};
use bytes::BytesMut;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tokio::time::{sleep_until, timeout_at, Instant, Sleep};
use tracing::{info, warn};

use modelgate_core::AcquireError;
use modelgate_core::AdmissionToken;

use crate::error::ProxyError;
use crate::forwarder::filter_response_headers;
use crate::payload::{ModelExtractor, PayloadError, ScanStatus};
use crate::state::AppState;

/// Terminal request outcomes, one per summary log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    BadRequest,
    NotAdmitted,
    UpstreamFailed,
    ClientCanceled,
    TimedOut,
}

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::BadRequest => "bad_request",
            Outcome::NotAdmitted => "not_admitted",
            Outcome::UpstreamFailed => "upstream_failed",
            Outcome::ClientCanceled => "client_canceled",
            Outcome::TimedOut => "timed_out",
        }
    }
}

/// Scope-exit guard for one request.
///
/// Created at receipt, it owns the admission token once one exists and is
/// either finished explicitly or dropped by cancellation; in both cases the
/// token is released first and then exactly one summary line is logged. A
/// drop without an explicit finish means the client went away.
struct Completion {
    remote: String,
    method: Method,
    path: String,
    model: String,
    token: Option<AdmissionToken>,
    outcome: Outcome,
}

impl Completion {
    fn new(peer: Option<SocketAddr>, method: &Method, uri: &Uri) -> Self {
        Self {
            remote: peer.map(|addr| addr.to_string()).unwrap_or_else(|| "-".to_string()),
            method: method.clone(),
            path: uri.path().to_string(),
            model: String::new(),
            token: None,
            outcome: Outcome::ClientCanceled,
        }
    }

    fn set_model(&mut self, model: &str) {
        self.model = model.to_string();
    }

    fn admitted(&mut self, token: AdmissionToken) {
        self.token = Some(token);
    }

    fn finish(mut self, outcome: Outcome) {
        self.outcome = outcome;
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        // Free the slot before logging so the next waiter is not held up.
        self.token.take();
        info!(
            remote_addr = %self.remote,
            method = %self.method,
            path = %self.path,
            model = %self.model,
            outcome = self.outcome.as_str(),
            "request finished"
        );
    }
}

fn fail(completion: Completion, outcome: Outcome, err: ProxyError) -> Response {
    completion.finish(outcome);
    err.into_response()
}

/// Serve one proxied request. Registered as the router's fallback so every
/// method and path goes through admission control.
pub async fn proxy_request(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request,
) -> Response {
    let deadline = Instant::now() + state.lifecycle_timeout;
    let peer = connect_info.map(|ConnectInfo(addr)| addr);
    let (parts, body) = req.into_parts();
    let mut completion = Completion::new(peer, &parts.method, &parts.uri);

    // Read the body prefix until the model resolves; the prefix plus the
    // unread remainder is what goes upstream.
    let peeked = match timeout_at(deadline, peek_model(body)).await {
        Err(_elapsed) => {
            return fail(
                completion,
                Outcome::TimedOut,
                ProxyError::Timeout(state.lifecycle_timeout),
            )
        }
        Ok(Err(err)) => {
            return fail(completion, Outcome::BadRequest, ProxyError::BadRequest(err.to_string()))
        }
        Ok(Ok(peeked)) => peeked,
    };
    let model = peeked.model.unwrap_or_default();
    let pool = state.registry.lookup(&model).name().to_string();
    completion.set_model(&pool);

    // Admission: wait for a slot, bounded by both the admission deadline and
    // the lifecycle ceiling.
    match timeout_at(deadline, state.registry.acquire(&model)).await {
        Err(_elapsed) => {
            return fail(
                completion,
                Outcome::TimedOut,
                ProxyError::Timeout(state.lifecycle_timeout),
            )
        }
        Ok(Err(err @ (AcquireError::TimedOut { .. } | AcquireError::Closed))) => {
            warn!(model = %pool, error = %err, "admission rejected");
            return fail(completion, Outcome::NotAdmitted, ProxyError::QueueFull { model: pool });
        }
        Ok(Ok(token)) => completion.admitted(token),
    }

    // Forward: re-issue the request and wait for response headers.
    let upstream_body = reqwest::Body::wrap_stream(
        futures::stream::iter([Ok::<_, axum::Error>(peeked.prefix)]).chain(peeked.rest),
    );
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let send = state.forwarder.forward(
        parts.method.clone(),
        path_and_query,
        &parts.headers,
        peer.map(|addr| addr.ip()),
        upstream_body,
    );
    let upstream = match timeout_at(deadline, send).await {
        Err(_elapsed) => {
            return fail(
                completion,
                Outcome::TimedOut,
                ProxyError::Timeout(state.lifecycle_timeout),
            )
        }
        Ok(Err(err)) => {
            warn!(model = %pool, error = %err, "upstream request failed");
            return fail(completion, Outcome::UpstreamFailed, ProxyError::Upstream(err.to_string()));
        }
        Ok(Ok(upstream)) => upstream,
    };

    // Stream the origin's response back. The completion guard moves into the
    // body so the slot is released only once the last byte is delivered, the
    // deadline fires, or the client goes away.
    let status = upstream.status();
    let headers = filter_response_headers(upstream.headers());
    let relay = RelayBody::new(upstream.bytes_stream().boxed(), deadline, completion);

    let mut response = Response::new(Body::from_stream(relay));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Result of peeking the request body for its model.
#[derive(Debug)]
struct PeekedBody {
    model: Option<String>,
    prefix: Bytes,
    rest: axum::body::BodyDataStream,
}

/// Read body frames until the top-level `model` member resolves.
///
/// Only the consumed prefix is buffered; a valid body that states its model
/// early costs a few bytes of memory no matter how large it is.
async fn peek_model(body: Body) -> Result<PeekedBody, PayloadError> {
    let mut rest = body.into_data_stream();
    let mut prefix = BytesMut::new();
    let mut extractor = ModelExtractor::new();

    loop {
        match rest.next().await {
            Some(Ok(chunk)) => {
                let status = extractor.push(&chunk)?;
                prefix.extend_from_slice(&chunk);
                if let ScanStatus::Resolved(model) = status {
                    return Ok(PeekedBody { model, prefix: prefix.freeze(), rest });
                }
            }
            Some(Err(_)) => return Err(PayloadError::Unreadable),
            None => return Err(PayloadError::Truncated),
        }
    }
}

/// Upstream response body relayed to the client.
///
/// Owns the request's [`Completion`] guard so the admission slot is released
/// exactly when the response reaches a terminal state, and enforces the
/// lifecycle deadline during streaming.
struct RelayBody {
    inner: BoxStream<'static, Result<Bytes, reqwest::Error>>,
    deadline: Pin<Box<Sleep>>,
    completion: Option<Completion>,
}

impl RelayBody {
    fn new(
        inner: BoxStream<'static, Result<Bytes, reqwest::Error>>,
        deadline: Instant,
        completion: Completion,
    ) -> Self {
        Self {
            inner,
            deadline: Box::pin(sleep_until(deadline)),
            completion: Some(completion),
        }
    }

    fn finish(&mut self, outcome: Outcome) {
        if let Some(completion) = self.completion.take() {
            completion.finish(outcome);
        }
    }
}

impl Stream for RelayBody {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.completion.is_none() {
            return Poll::Ready(None);
        }

        if this.deadline.as_mut().poll(cx).is_ready() {
            this.finish(Outcome::TimedOut);
            return Poll::Ready(Some(Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "lifecycle ceiling elapsed mid-stream",
            ))));
        }

        match this.inner.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(err))) => {
                this.finish(Outcome::UpstreamFailed);
                Poll::Ready(Some(Err(std::io::Error::other(err))))
            }
            Poll::Ready(None) => {
                this.finish(Outcome::Completed);
                Poll::Ready(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_have_stable_log_names() {
        assert_eq!(Outcome::Completed.as_str(), "completed");
        assert_eq!(Outcome::ClientCanceled.as_str(), "client_canceled");
        assert_eq!(Outcome::NotAdmitted.as_str(), "not_admitted");
    }

    #[tokio::test]
    async fn peek_keeps_the_consumed_prefix() {
        let body = Body::from(r#"{"model":"m","input":"tail"}"#);
        let peeked = peek_model(body).await.unwrap();

        assert_eq!(peeked.model.as_deref(), Some("m"));
        // Everything read so far is retained for forwarding.
        let prefix = std::str::from_utf8(&peeked.prefix).unwrap();
        assert!(prefix.starts_with(r#"{"model":"m""#));
    }

    #[tokio::test]
    async fn peek_rejects_empty_and_invalid_bodies() {
        assert_eq!(
            peek_model(Body::empty()).await.unwrap_err(),
            PayloadError::Truncated
        );
        assert_eq!(
            peek_model(Body::from("not json")).await.unwrap_err(),
            PayloadError::NotAnObject
        );
        assert_eq!(
            peek_model(Body::from(r#"{"model":"m"#)).await.unwrap_err(),
            PayloadError::Truncated
        );
    }
}
