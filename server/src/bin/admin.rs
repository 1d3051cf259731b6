use std::io::BufRead;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use tabletop_server::config::MIN_CLIENT_VERSION_DEFAULT;
use tabletop_server::Store;

#[derive(Debug, Parser)]
#[command(name = "admin")]
#[command(about = "Operational chores for the tabletop database", long_about = None)]
struct Args {
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Refuse clients older than VERSION from the next connection on
    SetVersion { version: u32 },
    /// Delete every row of every table
    ResetTables {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Keep only the earliest encounter of each session
    DedupeEncounters,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt().with_target(false).compact().init();
    let args = Args::parse();

    println!("Connecting to database...");
    let store = Store::attach(&args.database_url, MIN_CLIENT_VERSION_DEFAULT)
        .await
        .context("failed to connect to the database")?;

    match args.command {
        Command::SetVersion { version } => {
            store.set_min_client_version(version).await?;
            println!("min_client_version set to {}", version);
        }
        Command::ResetTables { yes } => {
            if !yes && !confirm("This will WIPE every encounter, token, roll and monster. Type 'yes' to confirm:")? {
                println!("Operation cancelled.");
                return Ok(());
            }
            store.reset().await?;
            println!("All tables reset.");
        }
        Command::DedupeEncounters => {
            let removed = store.dedupe_encounters().await?;
            println!("Removed {} duplicate encounter(s).", removed);
        }
    }
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    println!("{}", prompt);
    let mut input = String::new();
    if std::io::stdin().lock().read_line(&mut input)? == 0 {
        bail!("no confirmation on stdin");
    }
    Ok(input.trim() == "yes")
}
