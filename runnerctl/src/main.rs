use std::sync::Arc;

use anyhow::{Context, Result};
use envconfig::Envconfig;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use runnerctl::config::Config;
use runnerctl::controller::ControllerContext;
use runnerctl::server;

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "could not listen for shutdown signal");
    }
    info!("shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::init_from_env().context("invalid configuration")?;
    let provider = config.provider().context("failed to configure provider")?;
    let secrets = config
        .secret_store()
        .await
        .context("failed to configure secret store")?;
    info!(
        provider = provider.name(),
        target_label = %config.target_label,
        prefix = %config.instance_prefix,
        "starting runnerctl"
    );

    let ctx = Arc::new(ControllerContext {
        provider,
        secrets,
        bootstrap: config.bootstrap(),
        settings: config.controller_settings(),
    });

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "listening");
    axum::serve(listener, server::router(ctx))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}
