use std::path::PathBuf;

use anyhow::{Context as _, bail};
use clap::Parser;
use log::info;
use tokio::sync::mpsc;

mod api;
mod config;
mod connection;
mod controller;
mod device;
mod manager;
mod messages;
mod registry;
mod status;

/// Keeps a live view of a light-barrier fleet and edits device roles.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the TOML config file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Device host (and optional port), overrides `server.host`.
    #[arg(long)]
    host: Option<String>,

    /// Use wss:// and https:// when talking to the device.
    #[arg(long)]
    secure: bool,
}

fn load_config(args: &Args) -> anyhow::Result<config::AppConfig> {
    let mut config = if args.config.exists() {
        config::AppConfig::load(&args.config)?
    } else if let Some(host) = &args.host {
        config::AppConfig::for_host(host)
    } else {
        bail!(
            "config file {} not found and no --host given",
            args.config.display()
        );
    };
    if let Some(host) = &args.host {
        config.server.host = host.clone();
    }
    if args.secure {
        config.server.secure = Some(true);
    }
    Ok(config)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::formatted_timed_builder()
        .parse_filters(&std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let ws_url = config.server.ws_url().context("building channel url")?;
    let http_base = config.server.http_base().context("building http url")?;
    info!("Controlling device at {}", config.server.host);

    let (link_tx, link_rx) = mpsc::unbounded_channel();
    let policy = connection::ReconnectPolicy::from_config(config.reconnect.as_ref());
    let link = connection::ConnectionManager::new(ws_url, policy, link_tx).spawn();

    let api = api::ApiClient::new(http_base, config.server.request_timeout())
        .context("building http client")?;
    let core = manager::Manager::new(
        controller::Controller::new(config.pending_timeout()),
        api,
        link,
        link_rx,
        config.snapshot_interval(),
    );
    core.run_loop().await?;

    Ok(())
}
