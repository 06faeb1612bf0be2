//! Scripted game client for poking at a running proxy
//!
//! Connects, introduces itself, waits for the backend to accept the login,
//! sends one chat line and then walks through the sudo-mode handshake,
//! optionally changing the password at the end.

use clap::Parser;
use log::{info, warn};
use proxy::connection::Connection;
use proxy::srp::{self, ClientHandshake};
use proxy::udp::UdpConnection;
use shared::{to_client, Packet};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Proxy address to connect to
    #[arg(short = 'p', long, default_value = "127.0.0.1:40000")]
    proxy: SocketAddr,

    /// Player name
    #[arg(short = 'n', long, default_value = "tester")]
    name: String,

    #[arg(long, default_value = "")]
    password: String,

    /// Change the password to this once in sudo mode
    #[arg(long)]
    new_password: Option<String>,

    /// Chat line to send after login
    #[arg(long, default_value = "#help")]
    chat: String,

    /// Seconds to wait for each expected reply
    #[arg(long, default_value = "10")]
    wait_secs: u64,
}

/// Reads packets until one with `opcode` arrives, logging the others
async fn wait_for(
    conn: &UdpConnection,
    opcode: u16,
    limit: Duration,
) -> Result<Packet, Box<dyn std::error::Error>> {
    let deadline = Instant::now() + limit;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let pkt = timeout(remaining, conn.recv())
            .await
            .map_err(|_| format!("no packet {:#04x} within {:?}", opcode, limit))??;

        match pkt.opcode() {
            Some(op) if op == opcode => return Ok(pkt),
            Some(to_client::ACCESS_DENIED) => {
                let denied = shared::parse_access_denied(&pkt.data)?;
                return Err(format!("access denied: {:?} {}", denied.reason, denied.custom).into());
            }
            Some(to_client::CHAT_MESSAGE) => info!("Chat message ({} bytes)", pkt.data.len()),
            Some(op) => info!("Skipping packet {:#04x} ({} bytes)", op, pkt.data.len()),
            None => warn!("Received a packet without opcode"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    let limit = Duration::from_secs(args.wait_secs);

    let conn = UdpConnection::dial(args.proxy).await?;
    info!("Connecting to proxy at {} as {}", args.proxy, args.name);

    conn.send(Packet::new(shared::init(&args.name)?)).await?;
    wait_for(&conn, to_client::AUTH_ACCEPT, limit).await?;
    info!("Backend accepted login");

    conn.send(Packet::new(shared::client_chat_message(&args.chat)?))
        .await?;
    sleep(Duration::from_millis(200)).await;

    let handshake = ClientHandshake::start(&args.name, &args.password);
    conn.send(Packet::new(shared::srp_bytes_a(handshake.public_ephemeral())?))
        .await?;

    let challenge = wait_for(&conn, to_client::SRP_BYTES_S_B, limit).await?;
    let (salt, b_pub) = shared::parse_srp_bytes_s_b(&challenge.data)?;
    let (proof, _) = handshake.process_challenge(salt, b_pub)?;
    conn.send(Packet::new(shared::srp_bytes_m(&proof)?)).await?;

    let deadline = Instant::now() + limit;
    let verdict = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let pkt = timeout(remaining, conn.recv())
            .await
            .map_err(|_| "no sudo mode verdict")??;
        match pkt.opcode() {
            Some(to_client::ACCEPT_SUDO_MODE) => break true,
            Some(to_client::DENY_SUDO_MODE) => break false,
            _ => continue,
        }
    };

    if !verdict {
        warn!("Sudo mode denied, wrong password?");
    } else {
        info!("Entered sudo mode");
        if let Some(new_password) = &args.new_password {
            let (salt, verifier) = srp::create_verifier(&args.name, new_password);
            conn.send(Packet::new(shared::first_srp(&salt, &verifier, new_password.is_empty())?))
                .await?;
            info!("Sent new password");
        }
    }

    sleep(Duration::from_millis(200)).await;
    conn.send_disco(false).await?;
    conn.close();
    info!("Test client finished");
    Ok(())
}
