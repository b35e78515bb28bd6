//! One live tunnel client connection and its per-request dispatch table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use proxyhub_shared::protocol::{RequestRef, ResponseHead};
use proxyhub_shared::Frame;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

/// Process-unique connection identifier
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Event delivered to the correlator that owns a request id.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEvent {
    Headers(ResponseHead),
    Data(Vec<u8>),
    End,
    /// Client aborted the response, or the stream broke before headers.
    Destroyed(Option<String>),
}

impl ResponseEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResponseEvent::End | ResponseEvent::Destroyed(_))
    }
}

struct Route {
    tx: mpsc::UnboundedSender<ResponseEvent>,
    headers_seen: bool,
}

/// Handle to a connected tunnel client.
///
/// Outbound frames go through a bounded queue drained by the socket task.
/// Inbound response frames are routed by request id into unbounded
/// per-request queues, so one slow request never stalls the reader.
pub struct TunnelConnection {
    id: ConnectionId,
    connected_at: DateTime<Utc>,
    outbound: mpsc::Sender<Frame>,
    routes: Mutex<HashMap<String, Route>>,
    connected: AtomicBool,
    superseded: watch::Sender<bool>,
    close_requested: watch::Sender<bool>,
}

impl TunnelConnection {
    pub fn new(outbound: mpsc::Sender<Frame>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            connected_at: Utc::now(),
            outbound,
            routes: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
            superseded: watch::channel(false).0,
            close_requested: watch::channel(false).0,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Queue a frame for the client, waiting while the outbound queue is full.
    pub async fn send(&self, frame: Frame) -> Result<(), mpsc::error::SendError<Frame>> {
        self.outbound.send(frame).await
    }

    /// Queue a frame without waiting. A full queue hands the frame to a
    /// background task instead of dropping it.
    pub fn send_nowait(&self, frame: Frame) {
        match self.outbound.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                let outbound = self.outbound.clone();
                tokio::spawn(async move {
                    let _ = outbound.send(frame).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(frame)) => {
                trace!(connection = self.id, kind = frame.kind(), "Dropping frame for closed connection");
            }
        }
    }

    /// Start routing response frames for `request_id` into the returned queue.
    pub fn open_route(&self, request_id: &str) -> mpsc::UnboundedReceiver<ResponseEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes().insert(
            request_id.to_string(),
            Route {
                tx,
                headers_seen: false,
            },
        );
        rx
    }

    /// Stop routing frames for `request_id`. Returns false if no route existed.
    pub fn close_route(&self, request_id: &str) -> bool {
        self.routes().remove(request_id).is_some()
    }

    pub fn active_routes(&self) -> usize {
        self.routes().len()
    }

    /// Route one inbound response frame to its correlator.
    ///
    /// Per request id the delivered sequence is always
    /// `Headers Data* (End | Destroyed)` or a lone `Destroyed`. Frames for
    /// unknown or finished ids are dropped.
    pub fn dispatch(&self, frame: Frame) {
        let Some(request_id) = frame.request_id().map(str::to_string) else {
            warn!(connection = self.id, kind = frame.kind(), "Unexpected frame on dispatch path");
            return;
        };

        let mut routes = self.routes();
        let Some(route) = routes.get_mut(&request_id) else {
            trace!(connection = self.id, %request_id, kind = frame.kind(), "Ignoring frame for unknown request");
            return;
        };

        let (event, terminal) = match frame {
            Frame::ResponseHeaders(h) if !route.headers_seen => {
                route.headers_seen = true;
                (Some(ResponseEvent::Headers(h.head)), false)
            }
            Frame::ResponseHeaders(_) => {
                debug!(%request_id, "Duplicate response headers ignored");
                (None, false)
            }
            Frame::ResponseChunk(chunk) if route.headers_seen => {
                (Some(ResponseEvent::Data(chunk.data)), false)
            }
            Frame::ResponseChunk(_) => {
                warn!(%request_id, "Response chunk before headers dropped");
                (None, false)
            }
            Frame::ResponseEnd(_) if route.headers_seen => (Some(ResponseEvent::End), true),
            Frame::ResponseEnd(_) => (
                Some(ResponseEvent::Destroyed(Some(
                    "response ended before headers".to_string(),
                ))),
                true,
            ),
            Frame::ResponseDestroy(d) => (Some(ResponseEvent::Destroyed(d.reason)), true),
            other => {
                warn!(%request_id, kind = other.kind(), "Unexpected frame on dispatch path");
                (None, false)
            }
        };

        let receiver_gone = match event {
            Some(event) => route.tx.send(event).is_err(),
            None => false,
        };
        if terminal || receiver_gone {
            routes.remove(&request_id);
        }
    }

    /// Ask the client to abort its local work for `request_id`.
    pub fn send_client_destroy(&self, request_id: &str) {
        self.send_nowait(Frame::ClientDestroy(RequestRef::new(request_id)));
    }

    /// Mark the socket gone and fail every open request.
    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let dropped = {
            let mut routes = self.routes();
            let n = routes.len();
            routes.clear();
            n
        };
        if dropped > 0 {
            debug!(connection = self.id, dropped, "Released routes of closed connection");
        }
    }

    /// Newer registrations took over every stable id this connection held.
    pub fn mark_superseded(&self) {
        self.superseded.send_replace(true);
    }

    pub fn is_superseded(&self) -> bool {
        *self.superseded.borrow()
    }

    /// Resolves once the connection has been superseded.
    pub async fn superseded(&self) {
        let mut rx = self.superseded.subscribe();
        let _ = rx.wait_for(|s| *s).await;
    }

    /// Ask the socket task to close the connection.
    pub fn request_close(&self) {
        self.close_requested.send_replace(true);
    }

    /// Resolves once a close has been requested.
    pub async fn close_requested(&self) {
        let mut rx = self.close_requested.subscribe();
        let _ = rx.wait_for(|c| *c).await;
    }

    fn routes(&self) -> MutexGuard<'_, HashMap<String, Route>> {
        self.routes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proxyhub_shared::protocol::{ResponseChunk, ResponseDestroy, ResponseHeaders};
    use std::sync::Arc;

    /// Connection backed by a plain channel instead of a socket.
    pub(crate) fn test_connection() -> (Arc<TunnelConnection>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(256);
        (Arc::new(TunnelConnection::new(tx)), rx)
    }

    pub(crate) fn head(status: u16) -> ResponseHead {
        ResponseHead {
            status_code: status,
            status_message: "OK".into(),
            headers: vec![("content-type".into(), "text/plain".into())],
            http_version: "1.1".into(),
        }
    }

    pub(crate) fn headers_frame(id: &str, status: u16) -> Frame {
        Frame::ResponseHeaders(ResponseHeaders {
            request_id: id.into(),
            head: head(status),
        })
    }

    pub(crate) fn chunk_frame(id: &str, data: &[u8]) -> Frame {
        Frame::ResponseChunk(ResponseChunk {
            request_id: id.into(),
            data: data.to_vec(),
        })
    }

    pub(crate) fn end_frame(id: &str) -> Frame {
        Frame::ResponseEnd(RequestRef::new(id))
    }

    pub(crate) fn destroy_frame(id: &str) -> Frame {
        Frame::ResponseDestroy(ResponseDestroy {
            request_id: id.into(),
            reason: Some("boom".into()),
        })
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ResponseEvent>) -> Vec<ResponseEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn test_routes_frames_by_request_id() {
        let (conn, _out) = test_connection();
        let mut a = conn.open_route("a");
        let mut b = conn.open_route("b");

        conn.dispatch(headers_frame("a", 200));
        conn.dispatch(headers_frame("b", 404));
        conn.dispatch(chunk_frame("b", b"two"));
        conn.dispatch(chunk_frame("a", b"one"));
        conn.dispatch(end_frame("a"));

        assert_eq!(
            drain(&mut a),
            vec![
                ResponseEvent::Headers(head(200)),
                ResponseEvent::Data(b"one".to_vec()),
                ResponseEvent::End,
            ]
        );
        assert_eq!(
            drain(&mut b),
            vec![ResponseEvent::Headers(head(404)), ResponseEvent::Data(b"two".to_vec())]
        );
        assert_eq!(conn.active_routes(), 1);
    }

    #[tokio::test]
    async fn test_unknown_and_finished_ids_are_ignored() {
        let (conn, _out) = test_connection();
        conn.dispatch(chunk_frame("ghost", b"x"));
        conn.dispatch(end_frame("ghost"));

        let mut rx = conn.open_route("a");
        conn.dispatch(headers_frame("a", 200));
        conn.dispatch(end_frame("a"));
        conn.dispatch(chunk_frame("a", b"late"));
        conn.dispatch(destroy_frame("a"));

        assert_eq!(drain(&mut rx), vec![ResponseEvent::Headers(head(200)), ResponseEvent::End]);
        assert_eq!(conn.active_routes(), 0);
    }

    #[tokio::test]
    async fn test_destroy_before_headers_terminates() {
        let (conn, _out) = test_connection();
        let mut rx = conn.open_route("a");
        conn.dispatch(chunk_frame("a", b"early"));
        conn.dispatch(destroy_frame("a"));
        conn.dispatch(headers_frame("a", 200));

        assert_eq!(
            drain(&mut rx),
            vec![ResponseEvent::Destroyed(Some("boom".into()))]
        );
    }

    #[tokio::test]
    async fn test_no_listener_cap() {
        let (conn, _out) = test_connection();
        let receivers: Vec<_> = (0..1000).map(|i| conn.open_route(&format!("r{}", i))).collect();
        assert_eq!(conn.active_routes(), 1000);
        drop(receivers);
        conn.mark_disconnected();
        assert_eq!(conn.active_routes(), 0);
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_dropped_receiver_releases_route() {
        let (conn, _out) = test_connection();
        let rx = conn.open_route("a");
        drop(rx);
        conn.dispatch(headers_frame("a", 200));
        assert_eq!(conn.active_routes(), 0);
    }
}
