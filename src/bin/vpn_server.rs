//! Traverse VPN server binary.
//!
//! Loads configuration from the environment and CLI, connects the
//! relational store, and runs the tunnel listener until SIGINT/SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use traverse_core::config::Config;
use traverse_core::server::VpnServer;
use traverse_core::store::PgStore;

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut config = Config::parse();
    config.validate().context("validating configuration")?;

    info!(
        version = traverse_core::VERSION,
        listen = %config.listen_addr(),
        subnet = %config.subnet,
        "starting Traverse VPN server"
    );

    let store = PgStore::connect(&config.database_url()).await?;
    let (server, to_tun_rx) = VpnServer::new(Arc::new(config), Arc::new(store.clone()));

    let result = server.run(to_tun_rx).await;

    store.close().await;
    result
}
