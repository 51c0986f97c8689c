//! Command-line configuration.

use std::path::PathBuf;

use clap::Parser;
use codecolab_sync::{ClientConfig, ServerConfig};

#[derive(Debug, Parser)]
#[command(name = "codecolab")]
#[command(about = "Real-time collaborative code editing: relay server and terminal client")]
#[command(version)]
#[command(after_help = "\
Examples:
  codecolab --relay --port 9000 --storage-dir ./documents
  codecolab --server ws://127.0.0.1:9000 --document notes --user u1 --name Alice")]
pub struct Cli {
    /// Run the relay server instead of the terminal client
    #[arg(long, env = "CODECOLAB_RELAY")]
    pub relay: bool,

    /// Port the relay listens on
    #[arg(long, env = "CODECOLAB_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Host the relay binds to
    #[arg(long, env = "CODECOLAB_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    /// Directory of document snapshots; without it every room is open
    #[arg(long, env = "CODECOLAB_STORAGE_DIR")]
    pub storage_dir: Option<PathBuf>,

    /// Maximum members per document room
    #[arg(long, default_value_t = 100)]
    pub max_peers: usize,

    /// Relay URL (client mode)
    #[arg(long, default_value = "ws://127.0.0.1:8080")]
    pub server: String,

    /// Document to join (client mode)
    #[arg(long, default_value = "scratch")]
    pub document: String,

    /// User id (client mode)
    #[arg(long)]
    pub user: Option<String>,

    /// Display name (client mode), defaults to the user id
    #[arg(long)]
    pub name: Option<String>,

    /// Seconds to wait for the relay handshake (client mode)
    #[arg(long, default_value_t = 5)]
    pub connect_timeout: u64,
}

impl Cli {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: format!("{}:{}", self.bind, self.port),
            max_peers_per_room: self.max_peers,
            storage_path: self.storage_dir.clone(),
            ..ServerConfig::default()
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            connect_timeout: std::time::Duration::from_secs(self.connect_timeout),
            ..ClientConfig::default()
        }
    }

    pub fn user_id(&self) -> String {
        self.user
            .clone()
            .unwrap_or_else(|| format!("guest-{}", std::process::id()))
    }

    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.user_id())
    }
}
