use anyhow::{Context, Result};
use clap::Parser;
use proxyhub::identity::{resolve_stable_id, IdStore};
use proxyhub::{ClientConfig, MemoryRequestLog, NoopRequestLog, RequestLog, StaticMockStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "proxyhub")]
#[command(author = "ProxyHub Team")]
#[command(version)]
#[command(about = "Expose a local HTTP service through a ProxyHub relay", long_about = None)]
struct Cli {
    /// Local port to expose (omit to serve mocks only)
    port: Option<u16>,

    /// Relay WebSocket URL
    #[arg(short, long)]
    relay: Option<String>,

    /// Subdomain to use instead of the persisted one
    #[arg(long)]
    id: Option<String>,

    /// Require callers to send this value in X-Proxy-Token
    #[arg(short, long)]
    token: Option<String>,

    /// Local hostname to forward to
    #[arg(long)]
    host: Option<String>,

    /// Config file (default: proxyhub.yml in the current or home directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Do not keep a request log
    #[arg(long)]
    no_inspect: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    let mut config = match cli.config.clone().or_else(ClientConfig::find_config) {
        Some(path) => {
            info!("Using config {}", path.display());
            ClientConfig::load(&path)?
        }
        None => ClientConfig::default(),
    };
    apply_overrides(&mut config, cli);
    config.validate()?;

    let store = match &config.id_dir {
        Some(dir) => IdStore::new(dir),
        None => IdStore::new(IdStore::default_dir().context("Cannot locate home directory")?),
    };
    let stable_id = resolve_stable_id(config.stable_id.as_deref(), &store, config.port)?;

    let mocks = Arc::new(StaticMockStore::new(config.mocks.clone()));
    let log: Arc<dyn RequestLog> = if config.inspect {
        Arc::new(MemoryRequestLog::new())
    } else {
        Arc::new(NoopRequestLog)
    };

    info!("Starting ProxyHub client (tunnel id: {})", stable_id);
    proxyhub::tunnel::run(config, stable_id, mocks, log).await
}

fn apply_overrides(config: &mut ClientConfig, cli: Cli) {
    if let Some(port) = cli.port {
        config.port = Some(port);
    }
    if let Some(relay) = cli.relay {
        config.relay = relay;
    }
    if let Some(id) = cli.id {
        config.stable_id = Some(id);
    }
    if let Some(token) = cli.token {
        config.token = Some(token);
    }
    if let Some(host) = cli.host {
        config.local_host = host;
    }
    if cli.no_inspect {
        config.inspect = false;
    }
}
