//! Per-request response stream seen from the public side of the relay.

use std::collections::VecDeque;
use std::sync::Arc;

use proxyhub_shared::identity::new_request_id;
use proxyhub_shared::protocol::{HeaderList, TunnelRequest};
use proxyhub_shared::Frame;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::connection::{ResponseEvent, TunnelConnection};

/// Request data forwarded to the tunnel client.
#[derive(Debug, Clone, Default)]
pub struct RequestEnvelope {
    pub method: String,
    pub path: String,
    pub headers: HeaderList,
    pub body: Option<Vec<u8>>,
}

/// Response bytes held for one request while its caller is not reading.
pub const DEFAULT_BUFFER_LIMIT: usize = 8 * 1024 * 1024;

/// The tunnel connection stopped accepting frames before the request was sent.
#[derive(Debug, thiserror::Error)]
#[error("tunnel connection closed")]
pub struct ConnectionClosed;

/// The paused backlog grew past the buffer limit. The request has been
/// destroyed.
#[derive(Debug, thiserror::Error)]
#[error("response buffer exceeded {limit} bytes")]
pub struct BufferOverflow {
    pub limit: usize,
}

/// Owns one request id on a tunnel connection.
///
/// Events arrive in wire order. While paused they accumulate in a local
/// backlog and are released, still in order, after `resume`. The backlog is
/// capped in bytes; going over destroys the request.
pub struct RequestCorrelator {
    request_id: String,
    conn: Arc<TunnelConnection>,
    events: mpsc::UnboundedReceiver<ResponseEvent>,
    backlog: VecDeque<ResponseEvent>,
    backlog_bytes: usize,
    buffer_limit: usize,
    paused: bool,
    sent: bool,
    finished: bool,
    channel_closed: bool,
}

impl RequestCorrelator {
    /// Allocate a request id, start listening for its frames and send the
    /// request to the client.
    ///
    /// Cancel-safe: dropping the future while the outbound queue is full
    /// releases the route.
    pub async fn open(
        conn: Arc<TunnelConnection>,
        envelope: RequestEnvelope,
    ) -> Result<Self, ConnectionClosed> {
        let request_id = new_request_id();
        let events = conn.open_route(&request_id);
        let mut correlator = Self {
            request_id: request_id.clone(),
            conn,
            events,
            backlog: VecDeque::new(),
            backlog_bytes: 0,
            buffer_limit: DEFAULT_BUFFER_LIMIT,
            paused: false,
            sent: false,
            finished: false,
            channel_closed: false,
        };

        let frame = Frame::TunnelRequest(TunnelRequest {
            request_id: request_id.clone(),
            method: envelope.method,
            path: envelope.path,
            headers: envelope.headers,
            body: envelope.body,
        });
        if correlator.conn.send(frame).await.is_err() {
            return Err(ConnectionClosed);
        }
        correlator.sent = true;
        trace!(%request_id, connection = correlator.conn.id(), "Request sent to tunnel");
        Ok(correlator)
    }

    pub fn with_buffer_limit(mut self, limit: usize) -> Self {
        self.buffer_limit = limit;
        self
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Events held back while paused.
    pub fn buffered(&self) -> usize {
        self.backlog.len()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.backlog_bytes
    }

    /// Next response event in order.
    ///
    /// Returns `None` once the connection is gone without a terminal event.
    /// While paused this only completes if the backlog overflows, which
    /// yields `Destroyed`. Cancel-safe.
    pub async fn next_event(&mut self) -> Option<ResponseEvent> {
        if self.paused {
            let overflow = self.buffer_while_paused().await;
            return Some(ResponseEvent::Destroyed(Some(overflow.to_string())));
        }
        let event = match self.backlog.pop_front() {
            Some(event) => {
                if let ResponseEvent::Data(data) = &event {
                    self.backlog_bytes -= data.len();
                }
                Some(event)
            }
            None if self.channel_closed => None,
            None => {
                let event = self.events.recv().await;
                if event.is_none() {
                    self.channel_closed = true;
                }
                event
            }
        };
        if event.as_ref().map_or(true, ResponseEvent::is_terminal) {
            self.finished = true;
        }
        event
    }

    /// Move arriving events into the backlog. Meant to be raced against
    /// whatever ends the pause; completes only when the backlog exceeds the
    /// buffer limit, after destroying the request.
    pub async fn buffer_while_paused(&mut self) -> BufferOverflow {
        loop {
            if self.channel_closed {
                std::future::pending::<()>().await;
            }
            match self.events.recv().await {
                Some(event) => {
                    if let ResponseEvent::Data(data) = &event {
                        self.backlog_bytes += data.len();
                    }
                    self.backlog.push_back(event);
                    if self.backlog_bytes > self.buffer_limit {
                        self.destroy();
                        return BufferOverflow {
                            limit: self.buffer_limit,
                        };
                    }
                }
                None => self.channel_closed = true,
            }
        }
    }

    /// Abort the request: drop buffered data, stop routing and tell the
    /// client to stop producing. No-op once a terminal event was seen.
    pub fn destroy(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.backlog.clear();
        self.backlog_bytes = 0;
        self.conn.close_route(&self.request_id);
        if self.sent {
            self.conn.send_client_destroy(&self.request_id);
        }
        debug!(request_id = %self.request_id, "Request destroyed");
    }
}

impl Drop for RequestCorrelator {
    fn drop(&mut self) {
        self.destroy();
    }
}
