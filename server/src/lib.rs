//! Backing store for the tabletop client: JSON rows per table, equality
//! selects, and a change feed pushed to every subscribed socket.

pub mod config;
pub mod connection;
pub mod feed;
pub mod store;

use tokio::net::TcpListener;
use tracing::{info, warn};

pub use config::ServerConfig;
pub use feed::ChangeFeed;
pub use store::{Store, StoreError};

const LOG_TARGET: &str = "tabletop_server";

/// Accepts clients until the listener fails.
pub async fn serve(listener: TcpListener, store: Store, config: &ServerConfig) -> std::io::Result<()> {
    let feed = ChangeFeed::new(config.feed_capacity);
    info!(
        target: LOG_TARGET,
        addr = %listener.local_addr()?,
        persistent = store.is_persistent(),
        "listening"
    );
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(target: LOG_TARGET, error = %err, "accept failed");
                return Err(err);
            }
        };
        tokio::spawn(connection::handle_connection(stream, peer, store.clone(), feed.clone(), config.heartbeat));
    }
}
