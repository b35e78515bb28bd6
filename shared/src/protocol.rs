//! Frame vocabulary exchanged over the tunnel WebSocket.
//!
//! Every frame travels as one JSON text message of the form
//! `{"event": "<name>", "data": {...}}`. Body bytes are base64 encoded.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Maximum encoded frame size (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Header pairs with lower-cased names. Repeated headers keep one entry each.
pub type HeaderList = Vec<(String, String)>;

/// Connection-scoped headers that never cross the tunnel in either direction.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum Frame {
    /// client → relay
    RegisterTunnel(Registration),
    /// relay → client
    OnConnectTunnel(TunnelInfo),
    /// relay → client
    TunnelRequest(TunnelRequest),
    /// client → relay
    ResponseHeaders(ResponseHeaders),
    /// client → relay
    ResponseChunk(ResponseChunk),
    /// client → relay
    ResponseEnd(RequestRef),
    /// client → relay
    ResponseDestroy(ResponseDestroy),
    /// relay → client
    ClientDestroy(RequestRef),
    /// relay → client
    ConnectionTimeout(TimeoutNotice),
}

impl Frame {
    pub fn encode(&self) -> Result<String> {
        let text = serde_json::to_string(self)?;
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(Error::FrameTooLarge(text.len()));
        }
        Ok(text)
    }

    pub fn decode(text: &str) -> Result<Self> {
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(Error::FrameTooLarge(text.len()));
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Request id carried by per-request frames.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Frame::TunnelRequest(f) => Some(&f.request_id),
            Frame::ResponseHeaders(f) => Some(&f.request_id),
            Frame::ResponseChunk(f) => Some(&f.request_id),
            Frame::ResponseEnd(f) | Frame::ClientDestroy(f) => Some(&f.request_id),
            Frame::ResponseDestroy(f) => Some(&f.request_id),
            Frame::RegisterTunnel(_) | Frame::OnConnectTunnel(_) | Frame::ConnectionTimeout(_) => {
                None
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::RegisterTunnel(_) => "register-tunnel",
            Frame::OnConnectTunnel(_) => "on-connect-tunnel",
            Frame::TunnelRequest(_) => "tunnel-request",
            Frame::ResponseHeaders(_) => "response-headers",
            Frame::ResponseChunk(_) => "response-chunk",
            Frame::ResponseEnd(_) => "response-end",
            Frame::ResponseDestroy(_) => "response-destroy",
            Frame::ClientDestroy(_) => "client-destroy",
            Frame::ConnectionTimeout(_) => "connection-timeout",
        }
    }

    /// `response-end` and `response-destroy` close a request stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Frame::ResponseEnd(_) | Frame::ResponseDestroy(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub stable_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    Online,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelInfo {
    pub id: String,
    pub tunnel_url: String,
    pub status: TunnelStatus,
    pub version: String,
    pub token_protected: bool,
    pub timeout: SessionTimeout,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Session expiry as announced to the client on registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTimeout {
    pub minutes: i64,
    pub enabled: bool,
    /// Unix epoch milliseconds.
    pub session_start_time: i64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelRequest {
    pub request_id: String,
    pub method: String,
    /// Path including the query string.
    pub path: String,
    pub headers: HeaderList,
    #[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
}

impl TunnelRequest {
    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Status line and headers of a tunneled response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseHead {
    pub status_code: u16,
    pub status_message: String,
    pub headers: HeaderList,
    pub http_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseHeaders {
    pub request_id: String,
    #[serde(flatten)]
    pub head: ResponseHead,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseChunk {
    pub request_id: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseDestroy {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRef {
    pub request_id: String,
}

impl RequestRef {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutNotice {
    pub message: String,
    pub timeout_minutes: i64,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

mod base64_opt {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_some(&STANDARD.encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD
                .decode(encoded)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
