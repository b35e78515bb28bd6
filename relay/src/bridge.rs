//! Public HTTP ingress: turns an inbound request into a tunnel request and
//! streams the tunneled response back to the caller.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::HOST;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::stream;
use proxyhub_shared::identity::{constant_time_eq, stable_id_from_host};
use proxyhub_shared::protocol::ResponseHead;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Sleep;
use tracing::{debug, warn};

use crate::connection::ResponseEvent;
use crate::correlator::{RequestCorrelator, RequestEnvelope};
use crate::error::BridgeError;
use crate::headers::{forward_request_headers, response_header_map, ForwardContext};
use crate::registry::TunnelMapping;
use crate::server::RelayState;

/// Header carrying the tunnel access token.
pub const TOKEN_HEADER: &str = "x-proxy-token";

/// Body chunks buffered between the tunnel and a slow HTTP caller.
const BODY_BUFFER_CHUNKS: usize = 16;

/// Fallback handler for every request that is not a relay control route.
pub async fn handle(
    State(state): State<RelayState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request,
) -> Response {
    forward(&state, connect_info.map(|ConnectInfo(addr)| addr), req).await
}

pub async fn forward(state: &RelayState, peer: Option<SocketAddr>, req: Request) -> Response {
    match try_forward(state, peer, req).await {
        Ok(response) => response,
        Err(e) => {
            debug!(status = %e.status(), "Bridge error: {}", e);
            e.into_response()
        }
    }
}

async fn try_forward(
    state: &RelayState,
    peer: Option<SocketAddr>,
    req: Request,
) -> Result<Response, BridgeError> {
    let host = request_host(&req);
    let stable_id = stable_id_from_host(&host).ok_or(BridgeError::InvalidHost)?;

    let mapping = state
        .registry
        .lookup(&stable_id)
        .ok_or_else(|| BridgeError::TunnelNotFound(stable_id.clone()))?;
    if !mapping.connection.is_connected() {
        return Err(BridgeError::TunnelUnavailable(stable_id));
    }
    authorize(&mapping, req.headers())?;

    let (parts, body) = req.into_parts();
    let body = axum::body::to_bytes(body, state.config.max_body_bytes)
        .await
        .map_err(|e| BridgeError::BadRequest(e.to_string()))?;

    let ctx = ForwardContext {
        peer: peer.map(|addr| addr.ip()),
        proto: &state.config.protocol,
        host: &host,
    };
    let envelope = RequestEnvelope {
        method: parts.method.as_str().to_string(),
        path: parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
        headers: forward_request_headers(&parts.headers, &ctx),
        body: (!body.is_empty()).then(|| body.to_vec()),
    };

    // The deadline runs from dispatch, so a stalled outbound queue still ends in 504.
    let mut deadline = Box::pin(tokio::time::sleep(state.config.request_timeout));
    let opened = tokio::select! {
        opened = RequestCorrelator::open(mapping.connection.clone(), envelope) => opened,
        _ = &mut deadline => {
            warn!(%stable_id, "Tunnel did not accept the request before the deadline");
            return Err(BridgeError::Timeout);
        }
    };
    let correlator = opened
        .map_err(|_| BridgeError::TunnelUnavailable(stable_id.clone()))?
        .with_buffer_limit(state.config.max_buffered_bytes);
    debug!(
        %stable_id,
        request_id = correlator.request_id(),
        method = %parts.method,
        uri = %parts.uri,
        "Forwarding request"
    );

    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel(BODY_BUFFER_CHUNKS);
    let (abort_tx, abort_rx) = oneshot::channel();
    tokio::spawn(pump(
        correlator,
        deadline,
        head_tx,
        BodySink {
            chunks: body_tx,
            abort: Some(abort_tx),
        },
    ));

    let head = match head_rx.await {
        Ok(result) => result?,
        Err(_) => return Err(BridgeError::Upstream("Tunnel stream closed".to_string())),
    };
    build_response(
        head,
        BodyFeed {
            chunks: body_rx,
            abort: Some(abort_rx),
            failed: false,
        },
    )
}

fn request_host(req: &Request) -> String {
    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

fn authorize(mapping: &TunnelMapping, headers: &HeaderMap) -> Result<(), BridgeError> {
    let Some(expected) = mapping.auth_token.as_deref() else {
        return Ok(());
    };
    match headers.get(TOKEN_HEADER).map(|v| v.to_str().unwrap_or_default()) {
        None => Err(BridgeError::Unauthorized(
            "This tunnel requires authentication. Provide X-Proxy-Token header.",
        )),
        Some(provided) if constant_time_eq(provided, expected) => Ok(()),
        Some(_) => {
            warn!(stable_id = %mapping.stable_id, "Rejected request with invalid tunnel token");
            Err(BridgeError::Unauthorized("Invalid token provided."))
        }
    }
}

fn build_response(head: ResponseHead, feed: BodyFeed) -> Result<Response, BridgeError> {
    let status = StatusCode::from_u16(head.status_code)
        .map_err(|_| BridgeError::InvalidResponse(format!("status {}", head.status_code)))?;

    let body = Body::from_stream(stream::unfold(feed, |mut feed| async move {
        let item = feed.next().await?;
        Some((item, feed))
    }));
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = response_header_map(&head.headers);
    Ok(response)
}

/// Pump side of the response body.
struct BodySink {
    chunks: mpsc::Sender<Bytes>,
    abort: Option<oneshot::Sender<String>>,
}

impl BodySink {
    /// Fail the HTTP body so the caller sees a truncated response.
    fn abort(&mut self, reason: impl Into<String>) {
        if let Some(tx) = self.abort.take() {
            let _ = tx.send(reason.into());
        }
    }
}

/// Caller side of the response body. An abort takes priority over any
/// chunks still buffered.
struct BodyFeed {
    chunks: mpsc::Receiver<Bytes>,
    abort: Option<oneshot::Receiver<String>>,
    failed: bool,
}

enum FeedStep {
    Abort(Option<String>),
    Chunk(Option<Bytes>),
}

impl BodyFeed {
    async fn next(&mut self) -> Option<Result<Bytes, io::Error>> {
        loop {
            if self.failed {
                return None;
            }
            let step = match self.abort.as_mut() {
                Some(abort) => tokio::select! {
                    biased;
                    reason = abort => FeedStep::Abort(reason.ok()),
                    chunk = self.chunks.recv() => FeedStep::Chunk(chunk),
                },
                None => FeedStep::Chunk(self.chunks.recv().await),
            };
            match step {
                FeedStep::Chunk(chunk) => return chunk.map(Ok),
                FeedStep::Abort(Some(reason)) => {
                    self.failed = true;
                    return Some(Err(io::Error::new(io::ErrorKind::Other, reason)));
                }
                // Pump finished without aborting; drain what is left.
                FeedStep::Abort(None) => self.abort = None,
            }
        }
    }
}

/// Drive one correlator until its response completes, fails or times out.
///
/// The head goes to the waiting handler through `head_tx`; data goes into the
/// bounded body channel. A full channel pauses the correlator until the
/// caller reads.
async fn pump(
    mut correlator: RequestCorrelator,
    mut timer: Pin<Box<Sleep>>,
    head_tx: oneshot::Sender<Result<ResponseHead, BridgeError>>,
    mut body: BodySink,
) {
    let request_id = correlator.request_id().to_string();
    let mut head_tx = Some(head_tx);

    loop {
        let step = tokio::select! {
            event = correlator.next_event() => Step::Event(event),
            _ = &mut timer => Step::Deadline,
            _ = caller_gone(&mut head_tx, &body.chunks) => Step::CallerGone,
        };

        let event = match step {
            Step::Event(event) => event,
            Step::Deadline => {
                warn!(%request_id, "Tunnel request timed out");
                match head_tx.take() {
                    Some(tx) => {
                        let _ = tx.send(Err(BridgeError::Timeout));
                    }
                    None => body.abort("tunnel response timed out"),
                }
                correlator.destroy();
                return;
            }
            Step::CallerGone => {
                debug!(%request_id, "HTTP caller went away");
                correlator.destroy();
                return;
            }
        };

        match event {
            Some(ResponseEvent::Headers(head)) => {
                let Some(tx) = head_tx.take() else { continue };
                if tx.send(Ok(head)).is_err() {
                    correlator.destroy();
                    return;
                }
            }
            Some(ResponseEvent::Data(data)) => {
                let bytes = Bytes::from(data);
                match body.chunks.try_send(bytes) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(bytes)) => {
                        correlator.pause();
                        let drained = tokio::select! {
                            sent = body.chunks.send(bytes) => Drain::Sent(sent.is_ok()),
                            _ = &mut timer => Drain::Deadline,
                            overflow = correlator.buffer_while_paused() => Drain::Overflow(overflow.to_string()),
                        };
                        match drained {
                            Drain::Sent(true) => correlator.resume(),
                            Drain::Sent(false) => {
                                correlator.destroy();
                                return;
                            }
                            Drain::Deadline => {
                                warn!(%request_id, "Tunnel request timed out while streaming");
                                body.abort("tunnel response timed out");
                                correlator.destroy();
                                return;
                            }
                            Drain::Overflow(reason) => {
                                warn!(%request_id, %reason, "Caller too slow, dropping tunnel response");
                                body.abort(reason);
                                return;
                            }
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        correlator.destroy();
                        return;
                    }
                }
            }
            Some(ResponseEvent::End) => {
                debug!(%request_id, "Response complete");
                return;
            }
            Some(ResponseEvent::Destroyed(reason)) => {
                let reason = reason.unwrap_or_else(|| "Tunnel client aborted the response".to_string());
                warn!(%request_id, %reason, "Tunnel response destroyed");
                fail(&mut head_tx, &mut body, reason);
                return;
            }
            None => {
                warn!(%request_id, "Tunnel connection lost mid-request");
                fail(&mut head_tx, &mut body, "Tunnel connection lost".to_string());
                return;
            }
        }
    }
}

enum Step {
    Event(Option<ResponseEvent>),
    Deadline,
    CallerGone,
}

/// How waiting for room in the body channel ended.
enum Drain {
    Sent(bool),
    Deadline,
    Overflow(String),
}

fn fail(
    head_tx: &mut Option<oneshot::Sender<Result<ResponseHead, BridgeError>>>,
    body: &mut BodySink,
    reason: String,
) {
    match head_tx.take() {
        Some(tx) => {
            let _ = tx.send(Err(BridgeError::Upstream(reason)));
        }
        None => body.abort(reason),
    }
}

/// Resolves when whoever consumes the next piece of the response is gone.
async fn caller_gone(
    head_tx: &mut Option<oneshot::Sender<Result<ResponseHead, BridgeError>>>,
    chunks: &mpsc::Sender<Bytes>,
) {
    match head_tx {
        Some(tx) => tx.closed().await,
        None => chunks.closed().await,
    }
}
