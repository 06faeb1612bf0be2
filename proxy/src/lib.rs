//! # Game Proxy Library
//!
//! A transparent reverse proxy for the game's UDP protocol. Clients connect to
//! the proxy as if it were the game server; every session is relayed to a
//! backend server, with a small set of packets rewritten or answered on the way.
//!
//! ## Core Responsibilities
//!
//! ### Relaying
//! Each client/backend pairing runs two relay loops, one per direction. The
//! loops are fate-shared: when one side disconnects or times out, the other
//! side is told and closed as well.
//!
//! ### Active Object Rewriting
//! Backends announce the player's own object like any other. The client must
//! see that announcement once per session, so repeats are cut out of
//! TOCLIENT_ACTIVE_OBJECT_REMOVE_ADD before it reaches the client.
//!
//! ### Sudo Mode
//! Logged-in players re-authenticate against the proxy with SRP before they
//! may change their password. The proxy answers those handshake packets
//! itself and stores the new credential through its provider.
//!
//! ## Module Organization
//!
//! - `connection` / `udp`: the transport contract and its datagram implementation
//! - `peer`: per-endpoint session state
//! - `dispatcher` / `relay`: opcode routing and the relay loops
//! - `remap`: active object rewriting
//! - `auth` / `srp` / `credential`: the sudo-mode handshake
//! - `provider`: credential, ban and privilege storage
//! - `hooks` / `commands`: join, leave and chat extension points, built-in commands
//! - `context` / `config`: startup and process-wide state
//! - `listener` / `session_table`: the public socket and its clients
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use clap::Parser;
//! use proxy::config::Config;
//! use proxy::context::ProxyContext;
//! use proxy::listener::Listener;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::parse();
//!     let ctx = ProxyContext::init(&config)?;
//!
//!     // Relays every client to `config.server` until the task is dropped
//!     let listener = Listener::bind(&config, ctx).await?;
//!     listener.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod commands;
pub mod config;
pub mod connection;
pub mod context;
pub mod credential;
pub mod dispatcher;
pub mod error;
pub mod hooks;
pub mod listener;
pub mod peer;
pub mod provider;
pub mod relay;
pub mod remap;
pub mod session_table;
pub mod srp;
pub mod udp;
