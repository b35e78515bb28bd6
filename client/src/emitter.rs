//! Turns a local response into outbound frames for one request id.

use proxyhub_shared::protocol::{RequestRef, ResponseChunk, ResponseDestroy, ResponseHead, ResponseHeaders};
use proxyhub_shared::Frame;
use thiserror::Error;
use tokio::sync::mpsc;

/// Largest body slice carried by one `response-chunk` frame.
pub const MAX_CHUNK_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EmitError {
    #[error("response headers have not been sent")]
    HeadersNotSent,

    #[error("response already finished")]
    Finished,

    #[error("tunnel connection closed")]
    ConnectionClosed,
}

/// Per-request frame writer.
///
/// Sends `response-headers` at most once, then chunks, then exactly one of
/// `response-end` / `response-destroy`. Every send waits for room in the
/// connection's outbound queue.
pub struct ResponseEmitter {
    request_id: String,
    out: mpsc::Sender<Frame>,
    headers_sent: bool,
    terminal_sent: bool,
}

impl ResponseEmitter {
    pub fn new(request_id: impl Into<String>, out: mpsc::Sender<Frame>) -> Self {
        Self {
            request_id: request_id.into(),
            out,
            headers_sent: false,
            terminal_sent: false,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    pub fn is_finished(&self) -> bool {
        self.terminal_sent
    }

    /// Later calls are no-ops.
    pub async fn send_headers(&mut self, head: ResponseHead) -> Result<(), EmitError> {
        if self.headers_sent || self.terminal_sent {
            return Ok(());
        }
        self.headers_sent = true;
        self.emit(Frame::ResponseHeaders(ResponseHeaders {
            request_id: self.request_id.clone(),
            head,
        }))
        .await
    }

    pub async fn write(&mut self, data: Vec<u8>) -> Result<(), EmitError> {
        if self.terminal_sent {
            return Err(EmitError::Finished);
        }
        if !self.headers_sent {
            return Err(EmitError::HeadersNotSent);
        }
        if data.is_empty() {
            return Ok(());
        }
        if data.len() <= MAX_CHUNK_BYTES {
            return self.emit(self.chunk(data)).await;
        }
        for part in data.chunks(MAX_CHUNK_BYTES) {
            self.emit(self.chunk(part.to_vec())).await?;
        }
        Ok(())
    }

    pub async fn end(&mut self) -> Result<(), EmitError> {
        if self.terminal_sent {
            return Ok(());
        }
        self.terminal_sent = true;
        self.emit(Frame::ResponseEnd(RequestRef::new(self.request_id.clone())))
            .await
    }

    pub async fn destroy(&mut self, reason: Option<String>) -> Result<(), EmitError> {
        if self.terminal_sent {
            return Ok(());
        }
        self.terminal_sent = true;
        self.emit(Frame::ResponseDestroy(ResponseDestroy {
            request_id: self.request_id.clone(),
            reason,
        }))
        .await
    }

    fn chunk(&self, data: Vec<u8>) -> Frame {
        Frame::ResponseChunk(ResponseChunk {
            request_id: self.request_id.clone(),
            data,
        })
    }

    async fn emit(&self, frame: Frame) -> Result<(), EmitError> {
        self.out
            .send(frame)
            .await
            .map_err(|_| EmitError::ConnectionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn head() -> ResponseHead {
        ResponseHead {
            status_code: 200,
            status_message: "OK".into(),
            headers: vec![],
            http_version: "1.1".into(),
        }
    }

    fn kinds(rx: &mut mpsc::Receiver<Frame>) -> Vec<&'static str> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(frame.kind());
        }
        out
    }

    #[tokio::test]
    async fn test_frame_sequence() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut emitter = ResponseEmitter::new("r1", tx);

        assert_eq!(emitter.write(b"early".to_vec()).await, Err(EmitError::HeadersNotSent));
        emitter.send_headers(head()).await.unwrap();
        emitter.send_headers(head()).await.unwrap();
        emitter.write(b"a".to_vec()).await.unwrap();
        emitter.write(Vec::new()).await.unwrap();
        emitter.end().await.unwrap();
        emitter.end().await.unwrap();
        emitter.destroy(None).await.unwrap();
        assert_eq!(emitter.write(b"late".to_vec()).await, Err(EmitError::Finished));

        assert_eq!(
            kinds(&mut rx),
            vec!["response-headers", "response-chunk", "response-end"]
        );
    }

    #[tokio::test]
    async fn test_destroy_before_headers() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut emitter = ResponseEmitter::new("r1", tx);
        emitter.destroy(Some("refused".into())).await.unwrap();
        emitter.send_headers(head()).await.unwrap();

        match rx.try_recv().unwrap() {
            Frame::ResponseDestroy(d) => assert_eq!(d.reason.as_deref(), Some("refused")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_write_waits_for_queue_room() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut emitter = ResponseEmitter::new("r1", tx);
        emitter.send_headers(head()).await.unwrap();

        // Queue is full with the header frame.
        let blocked = tokio::time::timeout(Duration::from_millis(20), emitter.write(b"x".to_vec())).await;
        assert!(blocked.is_err());

        assert_eq!(rx.recv().await.unwrap().kind(), "response-headers");
        emitter.write(b"x".to_vec()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().kind(), "response-chunk");
    }

    #[tokio::test]
    async fn test_large_write_is_split() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut emitter = ResponseEmitter::new("r1", tx);
        emitter.send_headers(head()).await.unwrap();
        emitter.write(vec![7; MAX_CHUNK_BYTES * 2 + 10]).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().kind(), "response-headers");
        let sizes: Vec<usize> = std::iter::from_fn(|| match rx.try_recv() {
            Ok(Frame::ResponseChunk(c)) => Some(c.data.len()),
            _ => None,
        })
        .collect();
        assert_eq!(sizes, vec![MAX_CHUNK_BYTES, MAX_CHUNK_BYTES, 10]);
    }

    #[tokio::test]
    async fn test_closed_connection() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut emitter = ResponseEmitter::new("r1", tx);
        assert_eq!(emitter.send_headers(head()).await, Err(EmitError::ConnectionClosed));
    }
}
