//! Deck Sync Server: reference room hub over WebSocket.
//!
//! Environment:
//! - `DECK_SYNC_ADDR` bind address (default `127.0.0.1:9090`)
//! - `DECK_SYNC_MAX_PEERS` peers per room (default 100)
//! - `RUST_LOG` log filter, e.g. `info` or `deck_collab=debug`

use log::{error, info};

use deck_collab::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut config = ServerConfig::default();
    if let Ok(addr) = std::env::var("DECK_SYNC_ADDR") {
        config.bind_addr = addr;
    }
    if let Some(max) = std::env::var("DECK_SYNC_MAX_PEERS")
        .ok()
        .and_then(|v| v.parse().ok())
    {
        config.max_peers_per_room = max;
    }

    info!("Starting Deck Sync Server on {}...", config.bind_addr);

    let server = SyncServer::new(config);
    if let Err(e) = server.run().await {
        error!("Sync server stopped: {e}");
        std::process::exit(1);
    }
}
