use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_BIND: &str = "0.0.0.0:9001";
/// Used when `server_config` has no row, or when running without a database.
pub const MIN_CLIENT_VERSION_DEFAULT: u32 = tabletop::protocol::CLIENT_VERSION;
pub const FEED_CAPACITY_DEFAULT: usize = 100;
pub const HEARTBEAT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Postgres URL. Without one (or if it can't be reached) rows live in memory.
    pub database_url: Option<String>,
    pub min_client_version: u32,
    /// Reject a second encounter row for the same session.
    pub unique_encounters: bool,
    pub feed_capacity: usize,
    pub heartbeat: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: SocketAddr::from(([0, 0, 0, 0], 9001)),
            database_url: None,
            min_client_version: MIN_CLIENT_VERSION_DEFAULT,
            unique_encounters: false,
            feed_capacity: FEED_CAPACITY_DEFAULT,
            heartbeat: HEARTBEAT,
        }
    }
}
