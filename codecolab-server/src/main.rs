//! `codecolab`: relay server or interactive terminal client.
//!
//! `--relay` serves documents over WebSocket; without it the binary
//! connects to a relay and joins a document from the terminal.

mod config;
mod terminal;

use clap::Parser;
use codecolab_sync::SyncServer;

use config::Cli;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    if cli.relay {
        let config = cli.server_config();
        log::info!("Starting relay on {}", config.bind_addr);
        if let Some(dir) = &config.storage_path {
            log::info!("Document snapshots in {}", dir.display());
        }
        SyncServer::new(config)?.run().await?;
    } else {
        log::info!("Connecting to {} as {}", cli.server, cli.user_id());
        terminal::run(&cli).await?;
    }

    Ok(())
}
