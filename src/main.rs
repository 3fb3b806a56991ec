//! Binary entry point: loads configuration, builds the process-wide
//! [`AppState`], and serves the thin JSON-RPC-shaped HTTP surface.
//!
//! Everything that matters — canonical encoding, the ledger, attestation and
//! checkpoints, the idempotency registry, the liquidity policy evaluator,
//! and the matching rollout controller — lives in the library and is
//! exercised directly by its own tests; this binary is glue.

use clap::Parser;
use marketcore_backend::{config::Config, api::AppState};
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "marketcore", about = "Marketplace policy & attestation core")]
struct Cli {
    /// Address to bind the HTTP surface to.
    #[arg(long, env = "MARKETCORE_BIND_ADDR", default_value = "0.0.0.0:8080")]
    bind_addr: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    let state = AppState::new(config);

    let app = marketcore_backend::api::build_router(state).layer(TraceLayer::new_for_http());

    tracing::info!(addr = %cli.bind_addr, "starting marketcore");
    let listener = tokio::net::TcpListener::bind(cli.bind_addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
