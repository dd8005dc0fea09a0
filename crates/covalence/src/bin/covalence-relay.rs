//! Covalence relay: a sync server that keeps every CoValue its clients send.
//!
//! Configuration comes from the environment:
//!
//! - `COVALENCE_LISTEN` - listen address (default `127.0.0.1:4200`)
//! - `COVALENCE_DB` - SQLite file to persist into (in-memory when unset)
//! - `RUST_LOG` - log filter (default `info`)

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use covalence::perms::AgentSecret;
use covalence::store::SqliteStore;
use covalence::sync::StreamTransport;
use covalence::{LocalNode, NodeConfig, PeerConfig, PeerId, PeerRole};

const DEFAULT_LISTEN: &str = "127.0.0.1:4200";

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let listen = std::env::var("COVALENCE_LISTEN").unwrap_or_else(|_| DEFAULT_LISTEN.to_string());
    let config = NodeConfig::default();
    let node = LocalNode::new(AgentSecret::generate(), config.clone());

    let store = match std::env::var("COVALENCE_DB") {
        Ok(path) => {
            info!(%path, "opening database");
            SqliteStore::open(&path).with_context(|| format!("opening {path}"))?
        }
        Err(_) => {
            warn!("COVALENCE_DB not set, keeping data in memory");
            SqliteStore::open_memory().context("opening in-memory database")?
        }
    };
    node.add_storage(Arc::new(store));
    let gc = node.spawn_gc();

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    info!(addr = %listen, agent = %node.agent_id(), "relay listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(%addr, error = %e, "set_nodelay failed");
                    }
                    let transport = StreamTransport::spawn(stream, config.sync.clone());
                    let peer = PeerConfig::new(PeerId::new(addr.to_string()), PeerRole::Client);
                    node.add_peer(peer, Arc::new(transport));
                }
                Err(e) => error!(error = %e, "accept failed"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    gc.abort();
    node.shutdown().await;
    Ok(())
}
