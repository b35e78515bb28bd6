//! Serves one tunneled request: a mock, the no-match reply, or the local
//! service.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use proxyhub_shared::protocol::{HeaderList, ResponseHead, TunnelRequest, HOP_BY_HOP};
use proxyhub_shared::Frame;
use reqwest::{StatusCode, Version};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::emitter::{EmitError, ResponseEmitter};
use crate::mock::{find_match, MockRule, MockStore};
use crate::request_log::{Completion, RequestLog, MAX_CAPTURED_BODY};

/// Marks responses produced by the mock layer.
pub const MOCK_HEADER: &str = "x-proxyhub-mock";

/// What to do with a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Mock(MockRule),
    NoMatch,
    Proxy { port: u16 },
}

/// Mock hit first; otherwise the local service when there is one.
pub fn decide(rules: &[MockRule], method: &str, path: &str, local_port: Option<u16>) -> Disposition {
    match (find_match(rules, method, path), local_port) {
        (Some(rule), _) => Disposition::Mock(rule.clone()),
        (None, Some(port)) => Disposition::Proxy { port },
        (None, None) => Disposition::NoMatch,
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("local service did not respond within {0:?}")]
    Timeout(Duration),

    #[error("invalid method '{0}'")]
    InvalidMethod(String),

    #[error("local request failed: {0}")]
    Local(#[from] reqwest::Error),

    #[error(transparent)]
    Emit(#[from] EmitError),
}

/// Everything a request needs that outlives one connection.
pub struct RequestHandler {
    mocks: Arc<dyn MockStore>,
    log: Arc<dyn RequestLog>,
    http: reqwest::Client,
    local_host: String,
    local_port: Option<u16>,
    local_timeout: Duration,
}

impl RequestHandler {
    pub fn new(
        mocks: Arc<dyn MockStore>,
        log: Arc<dyn RequestLog>,
        local_host: impl Into<String>,
        local_port: Option<u16>,
        local_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            mocks,
            log,
            http,
            local_host: local_host.into(),
            local_port,
            local_timeout,
        })
    }

    /// Serve `request`, answering on `out`. Stops early when `cancel` fires.
    pub async fn run(
        &self,
        request: TunnelRequest,
        out: mpsc::Sender<Frame>,
        cancel: oneshot::Receiver<()>,
    ) {
        let request_id = request.request_id.clone();
        let started = Instant::now();
        let client_ip = request
            .header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .map(str::to_string);
        self.log.insert(&request, client_ip.as_deref());

        let mut emitter = ResponseEmitter::new(request_id.clone(), out);
        let mut capture = Capture::default();

        let result = tokio::select! {
            result = self.serve(&request, &mut emitter, &mut capture) => result,
            _ = cancel => {
                debug!(%request_id, "Request cancelled by relay");
                self.log.record_error(&request_id, "cancelled by relay");
                return;
            }
        };

        match result {
            Ok(head) => {
                self.log.record_completion(
                    &request_id,
                    Completion {
                        body_size: capture.size,
                        body: capture.bytes,
                        duration: started.elapsed(),
                    },
                );
                info!(
                    "{:<6} {:<50} {}{}",
                    request.method,
                    request.path,
                    head.status_code,
                    if head.headers.iter().any(|(k, _)| k == MOCK_HEADER) { " [MOCK]" } else { "" }
                );
            }
            Err(e) => {
                warn!(%request_id, "{} {} failed: {}", request.method, request.path, e);
                self.log.record_error(&request_id, &e.to_string());
                let _ = emitter.destroy(Some(e.to_string())).await;
            }
        }
    }

    async fn serve(
        &self,
        request: &TunnelRequest,
        emitter: &mut ResponseEmitter,
        capture: &mut Capture,
    ) -> Result<ResponseHead, HandlerError> {
        let rules = self.mocks.list_enabled_rules();
        match decide(&rules, &request.method, &request.path, self.local_port) {
            Disposition::Mock(rule) => self.serve_mock(&rule, emitter, capture).await,
            Disposition::NoMatch => self.serve_no_match(request, emitter, capture).await,
            Disposition::Proxy { port } => self.proxy(port, request, emitter, capture).await,
        }
    }

    async fn serve_mock(
        &self,
        rule: &MockRule,
        emitter: &mut ResponseEmitter,
        capture: &mut Capture,
    ) -> Result<ResponseHead, HandlerError> {
        if rule.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(rule.delay_ms)).await;
        }

        let mut headers: HeaderList = rule
            .headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
            .collect();
        headers.push((MOCK_HEADER.to_string(), rule.id.clone()));

        let head = ResponseHead {
            status_code: rule.status_code,
            status_message: reason_phrase(rule.status_code),
            headers,
            http_version: "1.1".to_string(),
        };
        let body = rule.body.clone().unwrap_or_default().into_bytes();
        self.respond(head, body, emitter, capture).await
    }

    async fn serve_no_match(
        &self,
        request: &TunnelRequest,
        emitter: &mut ResponseEmitter,
        capture: &mut Capture,
    ) -> Result<ResponseHead, HandlerError> {
        let body = serde_json::json!({
            "error": "No mock defined",
            "path": request.path,
            "method": request.method,
        })
        .to_string();

        let head = ResponseHead {
            status_code: 404,
            status_message: "Not Found".to_string(),
            headers: vec![
                ("content-type".to_string(), "application/json".to_string()),
                (MOCK_HEADER.to_string(), "no-match".to_string()),
            ],
            http_version: "1.1".to_string(),
        };
        self.respond(head, body.into_bytes(), emitter, capture).await
    }

    async fn respond(
        &self,
        head: ResponseHead,
        body: Vec<u8>,
        emitter: &mut ResponseEmitter,
        capture: &mut Capture,
    ) -> Result<ResponseHead, HandlerError> {
        self.log.record_response_headers(emitter.request_id(), &head);
        emitter.send_headers(head.clone()).await?;
        capture.push(&body);
        emitter.write(body).await?;
        emitter.end().await?;
        Ok(head)
    }

    async fn proxy(
        &self,
        port: u16,
        request: &TunnelRequest,
        emitter: &mut ResponseEmitter,
        capture: &mut Capture,
    ) -> Result<ResponseHead, HandlerError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| HandlerError::InvalidMethod(request.method.clone()))?;
        let url = format!("http://{}:{}{}", self.local_host, port, request.path);

        let mut builder = self.http.request(method, &url);
        for (name, value) in &request.headers {
            if skip_request_header(name) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = tokio::time::timeout(self.local_timeout, builder.send())
            .await
            .map_err(|_| HandlerError::Timeout(self.local_timeout))??;

        let status = response.status();
        let head = ResponseHead {
            status_code: status.as_u16(),
            status_message: reason_phrase(status.as_u16()),
            headers: response
                .headers()
                .iter()
                .filter(|(name, _)| !HOP_BY_HOP.contains(&name.as_str()))
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect(),
            http_version: version_text(response.version()).to_string(),
        };
        self.log.record_response_headers(emitter.request_id(), &head);
        emitter.send_headers(head.clone()).await?;

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            capture.push(&chunk);
            emitter.write(chunk.to_vec()).await?;
        }
        emitter.end().await?;
        Ok(head)
    }
}

fn skip_request_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
        || HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

fn reason_phrase(status: u16) -> String {
    StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("OK")
        .to_string()
}

fn version_text(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_2 => "2.0",
        Version::HTTP_3 => "3.0",
        _ => "1.1",
    }
}

/// Body size and leading bytes for the request log.
#[derive(Default)]
struct Capture {
    size: usize,
    bytes: Vec<u8>,
}

impl Capture {
    fn push(&mut self, chunk: &[u8]) {
        self.size += chunk.len();
        let room = MAX_CAPTURED_BODY.saturating_sub(self.bytes.len());
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::tests::rule;
    use crate::mock::{MatchKind, StaticMockStore};
    use crate::request_log::MemoryRequestLog;

    fn request(method: &str, path: &str) -> TunnelRequest {
        TunnelRequest {
            request_id: "r1".to_string(),
            method: method.to_string(),
            path: path.to_string(),
            headers: vec![("x-forwarded-for".into(), "203.0.113.9, 10.0.0.1".into())],
            body: None,
        }
    }

    fn handler(rules: Vec<MockRule>, port: Option<u16>, log: Arc<MemoryRequestLog>) -> RequestHandler {
        RequestHandler::new(
            Arc::new(StaticMockStore::new(rules)),
            log,
            "127.0.0.1",
            port,
            Duration::from_millis(200),
        )
        .unwrap()
    }

    async fn frames(rx: &mut mpsc::Receiver<Frame>) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Some(frame) = rx.recv().await {
            let done = frame.is_terminal();
            out.push(frame);
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn test_decide() {
        let rules = vec![rule("a", "/a", MatchKind::Exact, 0)];
        assert!(matches!(decide(&rules, "GET", "/a", None), Disposition::Mock(r) if r.id == "a"));
        assert_eq!(decide(&rules, "GET", "/b", None), Disposition::NoMatch);
        assert_eq!(decide(&rules, "GET", "/b", Some(3000)), Disposition::Proxy { port: 3000 });
    }

    #[tokio::test]
    async fn test_serves_mock() {
        let log = Arc::new(MemoryRequestLog::new());
        let mut mock = rule("m1", "/a", MatchKind::Exact, 0);
        mock.headers.insert("Content-Type".into(), "text/plain".into());
        let handler = handler(vec![mock], None, log.clone());
        let (tx, mut rx) = mpsc::channel(16);
        let (_cancel_tx, cancel_rx) = oneshot::channel();

        handler.run(request("GET", "/a?x=1"), tx, cancel_rx).await;

        let frames = frames(&mut rx).await;
        let Frame::ResponseHeaders(h) = &frames[0] else { panic!("expected headers") };
        assert_eq!(h.head.status_code, 200);
        assert!(h.head.headers.contains(&("content-type".into(), "text/plain".into())));
        assert!(h.head.headers.contains(&(MOCK_HEADER.into(), "m1".into())));
        let Frame::ResponseChunk(c) = &frames[1] else { panic!("expected chunk") };
        assert_eq!(c.data, b"m1");
        assert!(matches!(frames[2], Frame::ResponseEnd(_)));

        let entry = log.get("r1").unwrap();
        assert_eq!(entry.client_ip.as_deref(), Some("203.0.113.9"));
        assert_eq!(entry.status_code, Some(200));
        assert_eq!(entry.response_body.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn test_no_match_is_404() {
        let log = Arc::new(MemoryRequestLog::new());
        let handler = handler(vec![], None, log);
        let (tx, mut rx) = mpsc::channel(16);
        let (_cancel_tx, cancel_rx) = oneshot::channel();

        handler.run(request("DELETE", "/nope"), tx, cancel_rx).await;

        let frames = frames(&mut rx).await;
        let Frame::ResponseHeaders(h) = &frames[0] else { panic!("expected headers") };
        assert_eq!(h.head.status_code, 404);
        assert!(h.head.headers.contains(&(MOCK_HEADER.into(), "no-match".into())));
        let Frame::ResponseChunk(c) = &frames[1] else { panic!("expected chunk") };
        let body: serde_json::Value = serde_json::from_slice(&c.data).unwrap();
        assert_eq!(body["error"], "No mock defined");
        assert_eq!(body["path"], "/nope");
        assert_eq!(body["method"], "DELETE");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_delayed_mock() {
        let log = Arc::new(MemoryRequestLog::new());
        let mut slow = rule("slow", "/", MatchKind::Prefix, 0);
        slow.delay_ms = 60_000;
        let handler = handler(vec![slow], None, log.clone());
        let (tx, mut rx) = mpsc::channel(16);
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let task = tokio::spawn(async move { handler.run(request("GET", "/x"), tx, cancel_rx).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel_tx.send(()).unwrap();
        task.await.unwrap();

        assert!(rx.recv().await.is_none());
        assert_eq!(log.get("r1").unwrap().error.as_deref(), Some("cancelled by relay"));
    }

    #[tokio::test]
    async fn test_unreachable_local_service_destroys() {
        let log = Arc::new(MemoryRequestLog::new());
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let handler = handler(vec![], Some(port), log.clone());
        let (tx, mut rx) = mpsc::channel(16);
        let (_cancel_tx, cancel_rx) = oneshot::channel();

        handler.run(request("GET", "/"), tx, cancel_rx).await;

        let frames = frames(&mut rx).await;
        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], Frame::ResponseDestroy(d) if d.reason.is_some()));
        assert!(log.get("r1").unwrap().error.is_some());
    }

    #[test]
    fn test_skipped_request_headers() {
        for name in ["Connection", "transfer-encoding", "Upgrade", "content-length"] {
            assert!(skip_request_header(name), "{}", name);
        }
        assert!(!skip_request_header("x-forwarded-host"));
        assert!(!skip_request_header("cookie"));
    }

    #[test]
    fn test_capture_is_capped() {
        let mut capture = Capture::default();
        capture.push(&vec![0u8; MAX_CAPTURED_BODY - 1]);
        capture.push(b"abc");
        assert_eq!(capture.size, MAX_CAPTURED_BODY + 2);
        assert_eq!(capture.bytes.len(), MAX_CAPTURED_BODY);
    }
}
