//! Relay connection loop: register, serve tunneled requests, reconnect.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use proxyhub_shared::protocol::{Registration, ResponseDestroy, TunnelInfo, TunnelStatus};
use proxyhub_shared::Frame;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::handler::RequestHandler;
use crate::mock::MockStore;
use crate::request_log::RequestLog;
use crate::session::start_countdown;

/// Frames queued for the relay before handlers start waiting.
const OUTBOUND_QUEUE: usize = 64;

/// Time given to the writer to flush after the session ends.
const WRITER_DRAIN: Duration = Duration::from_secs(2);

/// How one connection ended.
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Shutdown,
    /// The relay expired the session.
    TimedOut,
    Rejected(String),
    Disconnected { registered: bool },
}

type Inflight = Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>;

fn lock(inflight: &Inflight) -> MutexGuard<'_, HashMap<String, oneshot::Sender<()>>> {
    inflight.lock().unwrap_or_else(|e| e.into_inner())
}

/// Run the tunnel until Ctrl+C.
pub async fn run(
    config: ClientConfig,
    stable_id: String,
    mocks: Arc<dyn MockStore>,
    log: Arc<dyn RequestLog>,
) -> Result<()> {
    run_until(config, stable_id, mocks, log, async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    })
    .await
}

/// Run the tunnel until `shutdown` resolves, the relay expires the session,
/// or reconnect attempts are exhausted.
pub async fn run_until<F>(
    config: ClientConfig,
    stable_id: String,
    mocks: Arc<dyn MockStore>,
    log: Arc<dyn RequestLog>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    let handler = Arc::new(
        RequestHandler::new(
            mocks,
            log,
            config.local_host.clone(),
            config.port,
            config.local_timeout(),
        )
        .context("Failed to build local HTTP client")?,
    );
    tokio::pin!(shutdown);

    let mut attempts = 0u32;
    loop {
        let registered = match connect_once(&config, &stable_id, &handler, shutdown.as_mut()).await {
            Ok(SessionEnd::Shutdown) => return Ok(()),
            Ok(SessionEnd::TimedOut) => {
                info!("Session ended by relay timeout, not reconnecting");
                return Ok(());
            }
            Ok(SessionEnd::Rejected(reason)) => anyhow::bail!("Registration rejected: {}", reason),
            Ok(SessionEnd::Disconnected { registered }) => {
                warn!("Disconnected from relay");
                registered
            }
            Err(e) => {
                error!("Connection error: {:#}", e);
                false
            }
        };

        if registered {
            attempts = 0;
        }
        attempts += 1;
        if attempts > config.reconnect_attempts {
            anyhow::bail!("Giving up after {} reconnect attempts", config.reconnect_attempts);
        }
        info!(
            "Reconnecting in {}ms (attempt {}/{})",
            config.reconnect_delay_ms, attempts, config.reconnect_attempts
        );
        tokio::select! {
            _ = tokio::time::sleep(config.reconnect_delay()) => {}
            _ = shutdown.as_mut() => return Ok(()),
        }
    }
}

async fn connect_once<F>(
    config: &ClientConfig,
    stable_id: &str,
    handler: &Arc<RequestHandler>,
    mut shutdown: Pin<&mut F>,
) -> Result<SessionEnd>
where
    F: Future<Output = ()>,
{
    info!("Connecting to relay: {}", config.relay);
    let (ws_stream, _) = connect_async(config.relay.as_str())
        .await
        .context("Failed to connect to relay server")?;
    let (mut write, mut read) = ws_stream.split();

    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE);
    let registration = Frame::RegisterTunnel(Registration {
        stable_id: stable_id.to_string(),
        port: config.port,
        token: config.token.clone().filter(|t| !t.is_empty()),
        version: Some(env!("CARGO_PKG_VERSION").to_string()),
    });
    write
        .send(Message::Text(registration.encode()?))
        .await
        .context("Failed to send registration")?;

    let inflight: Inflight = Arc::default();
    let writer_inflight = inflight.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let text = match frame.encode() {
                Ok(text) => text,
                Err(e) => {
                    warn!(kind = frame.kind(), "Cannot send frame: {}", e);
                    let Some(replacement) = undeliverable(&frame, &e) else {
                        continue;
                    };
                    if let Some(cancel) = frame.request_id().and_then(|id| lock(&writer_inflight).remove(id)) {
                        let _ = cancel.send(());
                    }
                    match replacement.encode() {
                        Ok(text) => text,
                        Err(_) => continue,
                    }
                }
            };
            if write.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = write.close().await;
    });

    let mut countdown: Option<JoinHandle<()>> = None;
    let mut registered = false;
    let mut timed_out = false;

    let end = loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match Frame::decode(&text) {
                        Ok(Frame::OnConnectTunnel(info)) => {
                            if info.status == TunnelStatus::Error {
                                break SessionEnd::Rejected(info.error.unwrap_or_else(|| "unknown error".to_string()));
                            }
                            registered = true;
                            print_banner(&info, config);
                            if let Some(old) = countdown.take() {
                                old.abort();
                            }
                            countdown = start_countdown(info.timeout);
                        }
                        Ok(Frame::TunnelRequest(request)) => {
                            let (cancel_tx, cancel_rx) = oneshot::channel();
                            let request_id = request.request_id.clone();
                            lock(&inflight).insert(request_id.clone(), cancel_tx);

                            let handler = handler.clone();
                            let inflight = inflight.clone();
                            let out = out_tx.clone();
                            tokio::spawn(async move {
                                handler.run(request, out, cancel_rx).await;
                                lock(&inflight).remove(&request_id);
                            });
                        }
                        Ok(Frame::ClientDestroy(r)) => {
                            if let Some(cancel) = lock(&inflight).remove(&r.request_id) {
                                let _ = cancel.send(());
                            }
                        }
                        Ok(Frame::ConnectionTimeout(notice)) => {
                            warn!("Connection timeout: {}", notice.message);
                            warn!(
                                "Your connection has been active for {} minutes and will be closed shortly",
                                notice.timeout_minutes
                            );
                            timed_out = true;
                        }
                        Ok(other) => debug!(kind = other.kind(), "Ignoring unexpected frame"),
                        Err(e) => warn!("Malformed frame from relay: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        break disconnected(timed_out, registered);
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        break disconnected(timed_out, registered);
                    }
                    _ => {}
                }
            }
            _ = shutdown.as_mut() => break SessionEnd::Shutdown,
        }
    };

    if let Some(handle) = countdown {
        handle.abort();
    }
    for (_, cancel) in lock(&inflight).drain() {
        let _ = cancel.send(());
    }
    drop(out_tx);
    if tokio::time::timeout(WRITER_DRAIN, writer).await.is_err() {
        debug!("Writer did not finish in time");
    }
    Ok(end)
}

/// Stand-in for a per-request frame that is too large to send: the relay
/// learns the response failed instead of seeing it silently truncated.
fn undeliverable(frame: &Frame, error: &proxyhub_shared::Error) -> Option<Frame> {
    let request_id = frame.request_id()?;
    Some(Frame::ResponseDestroy(ResponseDestroy {
        request_id: request_id.to_string(),
        reason: Some(format!("Response frame rejected: {}", error)),
    }))
}

fn disconnected(timed_out: bool, registered: bool) -> SessionEnd {
    if timed_out {
        SessionEnd::TimedOut
    } else {
        SessionEnd::Disconnected { registered }
    }
}

fn print_banner(info: &TunnelInfo, config: &ClientConfig) {
    let target = match config.port {
        Some(port) => format!("http://{}:{}", config.local_host, port),
        None => "mocks only".to_string(),
    };
    let timeout = if info.timeout.enabled {
        format!("{} minutes", info.timeout.minutes)
    } else {
        "unlimited".to_string()
    };

    println!("\n╔══════════════════════════════════════════════════════════════╗");
    println!("║  ProxyHub tunnel online                                      ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Public URL: {:<47} ║", info.tunnel_url);
    println!("║  Forwarding: {:<47} ║", target);
    println!("║  Session:    {:<47} ║", timeout);
    println!("║  Protected:  {:<47} ║", if info.token_protected { "X-Proxy-Token" } else { "no" });
    println!("╚══════════════════════════════════════════════════════════════╝\n");
    info!(stable_id = %info.id, relay_version = %info.version, "Tunnel registered");
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxyhub_shared::protocol::{ResponseChunk, TimeoutNotice, MAX_MESSAGE_SIZE};

    #[test]
    fn test_oversized_frame_becomes_destroy() {
        let chunk = Frame::ResponseChunk(ResponseChunk {
            request_id: "r1".to_string(),
            data: vec![0; MAX_MESSAGE_SIZE],
        });
        let error = chunk.encode().unwrap_err();

        match undeliverable(&chunk, &error) {
            Some(Frame::ResponseDestroy(d)) => {
                assert_eq!(d.request_id, "r1");
                assert!(d.reason.unwrap().contains("too large"));
            }
            other => panic!("expected response-destroy, got {:?}", other),
        }

        let timeout = Frame::ConnectionTimeout(TimeoutNotice {
            message: "x".repeat(MAX_MESSAGE_SIZE),
            timeout_minutes: 1,
        });
        let error = timeout.encode().unwrap_err();
        assert!(undeliverable(&timeout, &error).is_none());
    }

    #[test]
    fn test_disconnect_after_timeout_is_final() {
        assert_eq!(disconnected(true, true), SessionEnd::TimedOut);
        assert_eq!(
            disconnected(false, true),
            SessionEnd::Disconnected { registered: true }
        );
    }
}
