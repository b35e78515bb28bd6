//! HTTP router, tunnel WebSocket loop and control routes.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{any, get};
use axum::{Json, Router};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use proxyhub_shared::identity::validate_stable_id;
use proxyhub_shared::protocol::{
    Registration, ResponseDestroy, TunnelInfo, TunnelStatus, MAX_MESSAGE_SIZE,
};
use proxyhub_shared::Frame;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bridge;
use crate::config::RelayConfig;
use crate::connection::TunnelConnection;
use crate::registry::{TunnelMapping, TunnelRegistry};
use crate::session::SessionSupervisor;

/// Frames queued for one client before producers start waiting.
const OUTBOUND_QUEUE: usize = 256;

pub const HEALTH_PATH: &str = "/_proxyhub/health";

#[derive(Clone)]
pub struct RelayState {
    pub registry: Arc<TunnelRegistry>,
    pub sessions: SessionSupervisor,
    pub config: Arc<RelayConfig>,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            registry: Arc::new(TunnelRegistry::new()),
            sessions: SessionSupervisor::new(config.session_timeout_minutes, config.session_grace),
            config: Arc::new(config),
        }
    }
}

pub fn router(state: RelayState) -> Router {
    let tunnel_path = state.config.tunnel_path.clone();
    Router::new()
        .route(&tunnel_path, get(ws_handler))
        .route(HEALTH_PATH, get(health))
        .fallback(any(bridge::handle))
        .with_state(state)
}

/// Serve the relay on an already bound listener until the server fails.
pub async fn serve(listener: TcpListener, state: RelayState) -> anyhow::Result<()> {
    let app = router(state);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}

async fn health(State(state): State<RelayState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "tunnels": state.registry.len(),
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: RelayState) {
    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE);
    let conn = Arc::new(TunnelConnection::new(out_tx));
    let session = state.sessions.start(conn.clone());
    info!(connection = conn.id(), "Tunnel client connected");

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match Frame::decode(&text) {
                        Ok(Frame::RegisterTunnel(registration)) => {
                            let reply = register(&state, &conn, registration);
                            if send_frame(&mut sender, &reply).await.is_err() {
                                break;
                            }
                        }
                        Ok(frame) if frame.request_id().is_some() => conn.dispatch(frame),
                        Ok(frame) => {
                            debug!(connection = conn.id(), kind = frame.kind(), "Ignoring unexpected frame");
                        }
                        Err(e) => warn!(connection = conn.id(), "Malformed frame: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(connection = conn.id(), "WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            Some(frame) = out_rx.recv() => {
                let text = match frame.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        reject_unsendable(&conn, &frame, &e);
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            _ = conn.close_requested() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    conn.mark_disconnected();
    if let Some(timer) = session {
        timer.cancel();
    }
    let removed = state.registry.remove_all(conn.id());
    info!(connection = conn.id(), tunnels = ?removed, "Tunnel client disconnected");
}

fn register(state: &RelayState, conn: &Arc<TunnelConnection>, registration: Registration) -> Frame {
    let timeout = state.sessions.describe(conn);
    let version = env!("CARGO_PKG_VERSION").to_string();

    let stable_id = match validate_stable_id(&registration.stable_id) {
        Ok(id) => id,
        Err(e) => {
            warn!(connection = conn.id(), "Rejected registration: {}", e);
            return Frame::OnConnectTunnel(TunnelInfo {
                id: registration.stable_id,
                tunnel_url: String::new(),
                status: TunnelStatus::Error,
                version,
                token_protected: false,
                timeout,
                error: Some(e.to_string()),
            });
        }
    };

    let mapping = TunnelMapping::new(
        stable_id.clone(),
        conn.clone(),
        registration.port,
        registration.token,
    );
    let token_protected = mapping.is_token_protected();
    state.registry.register(mapping);

    let tunnel_url = state.config.tunnel_url(&stable_id);
    info!(
        connection = conn.id(),
        %stable_id,
        port = ?registration.port,
        client_version = registration.version.as_deref().unwrap_or("unknown"),
        token_protected,
        "Tunnel registered at {}",
        tunnel_url
    );

    Frame::OnConnectTunnel(TunnelInfo {
        id: stable_id,
        tunnel_url,
        status: TunnelStatus::Online,
        version,
        token_protected,
        timeout,
        error: None,
    })
}

/// A queued frame that cannot be encoded never reaches the client. A
/// tunnel request fails its own route instead of waiting for the deadline.
fn reject_unsendable(conn: &TunnelConnection, frame: &Frame, error: &proxyhub_shared::Error) {
    warn!(connection = conn.id(), kind = frame.kind(), "Cannot send frame: {}", error);
    if let Frame::TunnelRequest(request) = frame {
        conn.dispatch(Frame::ResponseDestroy(ResponseDestroy {
            request_id: request.request_id.clone(),
            reason: Some(format!("Request too large for tunnel: {}", error)),
        }));
    }
}

async fn send_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    frame: &Frame,
) -> Result<(), axum::Error> {
    match frame.encode() {
        Ok(text) => sender.send(Message::Text(text)).await,
        Err(e) => {
            warn!(kind = frame.kind(), "Dropping frame: {}", e);
            Ok(())
        }
    }
}
