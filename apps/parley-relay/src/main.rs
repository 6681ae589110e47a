use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use parley_relay::cli::Cli;
use parley_relay::config::Config;
use parley_relay::registry::ConnectionRegistry;
use parley_relay::{router, RelayState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to INFO if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }

    let registry = Arc::new(ConnectionRegistry::new());
    let state = RelayState::new(registry, config.send_queue_depth);
    let app = router(state);

    let addr = SocketAddr::new(cli.bind, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("parley relay listening on {addr}");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
