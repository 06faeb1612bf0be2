//! Command line configuration

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AuthBackend {
    /// Process-local storage, lost on restart
    Memory,
    /// SQLite database file
    Sqlite,
}

/// Transparent proxy between game clients and a backend game server
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Address to accept client connections on
    #[arg(short = 'l', long, default_value = "0.0.0.0:40000")]
    pub listen: SocketAddr,

    /// Backend game server to relay sessions to
    #[arg(short = 's', long, default_value = "127.0.0.1:30000")]
    pub server: SocketAddr,

    /// Storage backend for credentials, bans and privileges
    #[arg(long, value_enum, default_value = "sqlite")]
    pub auth_backend: AuthBackend,

    /// SQLite database path
    #[arg(long, default_value = "auth.sqlite")]
    pub auth_db: PathBuf,

    /// Maximum number of concurrently connected clients
    #[arg(short = 'm', long, default_value = "32")]
    pub max_peers: usize,

    /// How long an authentication step waits for the client to acknowledge
    #[arg(long, default_value = "5000")]
    pub ack_timeout_ms: u64,

    /// Seconds without traffic before a client is dropped
    #[arg(long, default_value = "30")]
    pub peer_timeout_secs: u64,

    /// Prefix marking chat messages as proxy commands
    #[arg(long, default_value = "#")]
    pub chat_prefix: String,

    /// Player granted the `privs` privilege on startup
    #[arg(long)]
    pub admin: Option<String>,
}

impl Config {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }
}
