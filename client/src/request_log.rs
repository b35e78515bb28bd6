//! Request log sink
//!
//! Keeps recent tunneled requests with their response metadata for
//! inspection. Calls are synchronous and never fail.

use chrono::{DateTime, Utc};
use proxyhub_shared::protocol::{HeaderList, ResponseHead, TunnelRequest};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Max entries kept in the ring buffer
pub const MAX_ENTRIES: usize = 500;

/// Largest body prefix kept per request or response
pub const MAX_CAPTURED_BODY: usize = 64 * 1024;

/// One request/response pair
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub client_ip: Option<String>,
    pub request_headers: HeaderList,
    pub request_body: Option<String>,
    pub status_code: Option<u16>,
    pub status_message: Option<String>,
    pub response_headers: HeaderList,
    pub response_body: Option<String>,
    pub response_body_size: usize,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

/// Final numbers for a finished response.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub body_size: usize,
    /// Leading bytes of the body, at most `MAX_CAPTURED_BODY`
    pub body: Vec<u8>,
    pub duration: Duration,
}

/// Where tunneled requests are recorded.
pub trait RequestLog: Send + Sync {
    fn insert(&self, request: &TunnelRequest, client_ip: Option<&str>);
    fn record_response_headers(&self, request_id: &str, head: &ResponseHead);
    fn record_completion(&self, request_id: &str, completion: Completion);
    fn record_error(&self, request_id: &str, error: &str);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRequestLog;

impl RequestLog for NoopRequestLog {
    fn insert(&self, _: &TunnelRequest, _: Option<&str>) {}
    fn record_response_headers(&self, _: &str, _: &ResponseHead) {}
    fn record_completion(&self, _: &str, _: Completion) {}
    fn record_error(&self, _: &str, _: &str) {}
}

/// Ring buffer of the most recent requests, newest first.
#[derive(Debug, Default)]
pub struct MemoryRequestLog {
    entries: Mutex<VecDeque<RequestRecord>>,
}

impl MemoryRequestLog {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(MAX_ENTRIES)),
        }
    }

    pub fn entries(&self) -> Vec<RequestRecord> {
        self.lock().iter().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<RequestRecord> {
        self.lock().iter().find(|e| e.id == id).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<RequestRecord>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut RequestRecord)) {
        if let Some(entry) = self.lock().iter_mut().find(|e| e.id == id) {
            f(entry);
        }
    }
}

impl RequestLog for MemoryRequestLog {
    fn insert(&self, request: &TunnelRequest, client_ip: Option<&str>) {
        let record = RequestRecord {
            id: request.request_id.clone(),
            started_at: Utc::now(),
            method: request.method.clone(),
            path: request.path.clone(),
            client_ip: client_ip.map(str::to_string),
            request_headers: request.headers.clone(),
            request_body: request.body.as_deref().map(captured_text),
            status_code: None,
            status_message: None,
            response_headers: Vec::new(),
            response_body: None,
            response_body_size: 0,
            duration_ms: None,
            error: None,
        };

        let mut entries = self.lock();
        if entries.len() >= MAX_ENTRIES {
            entries.pop_back();
        }
        entries.push_front(record);
    }

    fn record_response_headers(&self, request_id: &str, head: &ResponseHead) {
        self.update(request_id, |e| {
            e.status_code = Some(head.status_code);
            e.status_message = Some(head.status_message.clone());
            e.response_headers = head.headers.clone();
        });
    }

    fn record_completion(&self, request_id: &str, completion: Completion) {
        self.update(request_id, |e| {
            e.response_body_size = completion.body_size;
            e.response_body = (!completion.body.is_empty()).then(|| captured_text(&completion.body));
            e.duration_ms = Some(completion.duration.as_millis() as u64);
        });
    }

    fn record_error(&self, request_id: &str, error: &str) {
        self.update(request_id, |e| e.error = Some(error.to_string()));
    }
}

fn captured_text(body: &[u8]) -> String {
    let end = body.len().min(MAX_CAPTURED_BODY);
    String::from_utf8_lossy(&body[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str) -> TunnelRequest {
        TunnelRequest {
            request_id: id.to_string(),
            method: "POST".to_string(),
            path: "/orders".to_string(),
            headers: vec![("content-type".into(), "application/json".into())],
            body: Some(br#"{"qty":1}"#.to_vec()),
        }
    }

    #[test]
    fn test_lifecycle() {
        let log = MemoryRequestLog::new();
        log.insert(&request("r1"), Some("10.0.0.1"));
        log.record_response_headers(
            "r1",
            &ResponseHead {
                status_code: 201,
                status_message: "Created".into(),
                headers: vec![],
                http_version: "1.1".into(),
            },
        );
        log.record_completion(
            "r1",
            Completion {
                body_size: 2,
                body: b"ok".to_vec(),
                duration: Duration::from_millis(12),
            },
        );

        let entry = log.get("r1").unwrap();
        assert_eq!(entry.client_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(entry.request_body.as_deref(), Some(r#"{"qty":1}"#));
        assert_eq!(entry.status_code, Some(201));
        assert_eq!(entry.response_body.as_deref(), Some("ok"));
        assert_eq!(entry.duration_ms, Some(12));
        assert!(entry.error.is_none());

        log.record_error("unknown", "ignored");
        log.record_error("r1", "reset");
        assert_eq!(log.get("r1").unwrap().error.as_deref(), Some("reset"));
    }

    #[test]
    fn test_ring_buffer_keeps_newest() {
        let log = MemoryRequestLog::new();
        for i in 0..MAX_ENTRIES + 5 {
            log.insert(&request(&format!("r{}", i)), None);
        }
        let entries = log.entries();
        assert_eq!(entries.len(), MAX_ENTRIES);
        assert_eq!(entries[0].id, format!("r{}", MAX_ENTRIES + 4));
        assert!(log.get("r0").is_none());
    }

    #[test]
    fn test_body_capture_is_capped() {
        let big = vec![b'a'; MAX_CAPTURED_BODY * 2];
        assert_eq!(captured_text(&big).len(), MAX_CAPTURED_BODY);
    }
}
