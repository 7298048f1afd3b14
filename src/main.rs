//! Entry point: parses configuration, sets up logging, bootstraps or joins
//! a ring, and runs the dispatcher until a graceful leave completes.

mod config;
mod dispatcher;
mod hash;
mod packet;
mod ring;
mod routing;
mod store;

use anyhow::Context;
use clap::Parser;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use dispatcher::Node;
use ring::NodeState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_logging(config.debug);

    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "invalid configuration");
        std::process::exit(1);
    }

    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "fatal error");
        std::process::exit(1);
    }

    Ok(())
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(config: Config) -> anyhow::Result<()> {
    let socket = UdpSocket::bind(config.my_ip)
        .await
        .with_context(|| format!("failed to bind {}", config.my_ip))?;
    info!(addr = %config.my_ip, "bound socket");

    config.write_bootstrap_file().context("writing bootstrap file")?;

    let predecessor = config.read_predecessor().context("reading predecessor file")?;

    let state = match predecessor {
        Some(pred_addr) => {
            info!(pred = %pred_addr, "joining existing ring");
            NodeState::joining(config.my_ip, pred_addr)
        }
        None => {
            info!("starting a new ring");
            NodeState::solo(config.my_ip)
        }
    };

    let mut node = Node::new(state, config.num_routes, config.cache, config.debug, socket);

    if predecessor.is_some() {
        node.send_join().await;
    }

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(());
        }
    });

    node.run(shutdown_rx).await;
    Ok(())
}
