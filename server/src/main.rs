use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::{fmt, EnvFilter};

use tabletop_server::config::{DEFAULT_BIND, FEED_CAPACITY_DEFAULT, HEARTBEAT, MIN_CLIENT_VERSION_DEFAULT};
use tabletop_server::{serve, ServerConfig, Store};

#[derive(Debug, Parser)]
#[command(name = "tabletop-server")]
#[command(about = "Row store and change feed for the shared tabletop", long_about = None)]
struct Args {
    /// Address to listen on (host:port)
    #[arg(long, env = "BIND", default_value = DEFAULT_BIND)]
    bind: SocketAddr,

    /// Overrides the port of --bind
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Postgres URL; rows stay in memory without one
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Fallback when server_config has no min_client_version
    #[arg(long, env = "MIN_CLIENT_VERSION", default_value_t = MIN_CLIENT_VERSION_DEFAULT)]
    min_client_version: u32,

    /// Allow at most one encounter per session
    #[arg(long, env = "UNIQUE_ENCOUNTERS", default_value_t = false)]
    unique_encounters: bool,

    /// Change events buffered per connection before it lags
    #[arg(long, env = "FEED_CAPACITY", default_value_t = FEED_CAPACITY_DEFAULT)]
    feed_capacity: usize,

    /// Toggle structured (JSON) logs
    #[arg(long, env = "LOG_JSON", default_value_t = false)]
    json: bool,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        let mut bind = self.bind;
        if let Some(port) = self.port {
            bind.set_port(port);
        }
        ServerConfig {
            bind,
            database_url: self.database_url.filter(|url| !url.trim().is_empty()),
            min_client_version: self.min_client_version,
            unique_encounters: self.unique_encounters,
            feed_capacity: self.feed_capacity,
            heartbeat: HEARTBEAT,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.json);
    let config = args.into_config();

    let store = Store::open(&config).await;
    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    serve(listener, store, &config).await.context("server stopped")
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().flatten_event(true).init();
    } else {
        builder.compact().init();
    }
}
