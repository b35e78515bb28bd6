use anyhow::{Context, Result};
use proxyhub_relay::{serve, RelayConfig, RelayState};
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("proxyhub_relay=info")),
        )
        .init();

    let config = RelayConfig::from_env();
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(
        "ProxyHub Relay v{} on {} (domain: {}, tunnel path: {}, session timeout: {}m)",
        env!("CARGO_PKG_VERSION"),
        addr,
        config.base_domain,
        config.tunnel_path,
        config.session_timeout_minutes
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    serve(listener, RelayState::new(config)).await
}
