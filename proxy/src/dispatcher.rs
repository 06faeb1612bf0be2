//! Opcode routing for relayed packets
//!
//! Packets from the backend and packets from the client are looked up in two
//! separate tables since the same opcode value means different things in each
//! direction. Anything not listed is forwarded untouched.

use crate::auth;
use crate::context::ProxyContext;
use crate::peer::{AuthStep, Peer};
use crate::remap::remap_active_objects;
use log::{debug, error, warn};
use shared::{to_client, to_server, Packet};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Authentication packets a client may have waiting before more are dropped
const AUTH_QUEUE_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Send the (possibly rewritten) packet on to the destination
    Forward,
    /// Handled by the proxy, must not reach the destination
    Consumed,
}

/// Routes one packet travelling from `src` to `dst`, rewriting it in place
/// where needed.
pub async fn dispatch(
    ctx: &Arc<ProxyContext>,
    src: &Arc<Peer>,
    dst: &Arc<Peer>,
    pkt: &mut Packet,
) -> Disposition {
    let opcode = match pkt.opcode() {
        Some(opcode) => opcode,
        None => return Disposition::Forward,
    };

    if src.is_server() {
        from_server(dst, opcode, pkt)
    } else {
        from_client(ctx, src, opcode, pkt).await
    }
}

fn from_server(client: &Peer, opcode: u16, pkt: &mut Packet) -> Disposition {
    match opcode {
        to_client::ACTIVE_OBJECT_REMOVE_ADD => match remap_active_objects(client, &pkt.data) {
            Ok(data) => {
                pkt.data = data;
                Disposition::Forward
            }
            Err(e) => {
                warn!(
                    "Dropping malformed active object packet for {}: {}",
                    client.addr(),
                    e
                );
                Disposition::Consumed
            }
        },
        to_client::AUTH_ACCEPT => {
            client.set_logged_in();
            Disposition::Forward
        }
        _ => Disposition::Forward,
    }
}

async fn from_client(
    ctx: &Arc<ProxyContext>,
    client: &Arc<Peer>,
    opcode: u16,
    pkt: &Packet,
) -> Disposition {
    match opcode {
        to_server::INIT => {
            match shared::parse_init_name(&pkt.data) {
                Ok(name) => {
                    if !client.bind_username(&name) {
                        debug!("{} sent INIT again, keeping first name", client.addr());
                    }
                }
                Err(e) => warn!("Unreadable INIT from {}: {}", client.addr(), e),
            }
            Disposition::Forward
        }
        to_server::CHAT_MESSAGE => {
            let msg = match shared::parse_chat_message(&pkt.data) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("Unreadable chat message from {}: {}", client.addr(), e);
                    return Disposition::Forward;
                }
            };

            if ctx.hooks().on_chat(client, &msg).await {
                Disposition::Consumed
            } else {
                Disposition::Forward
            }
        }
        to_server::CLIENT_READY => {
            spawn_join(ctx, client);
            Disposition::Forward
        }
        to_server::FIRST_SRP | to_server::SRP_BYTES_A | to_server::SRP_BYTES_M => {
            // Before login these belong to the backend's own handshake
            if !client.is_logged_in() {
                return Disposition::Forward;
            }
            queue_auth_step(ctx, client, opcode, pkt.data.clone());
            Disposition::Consumed
        }
        _ => Disposition::Forward,
    }
}

/// Runs the join hook detached, logging its failure or panic
fn spawn_join(ctx: &Arc<ProxyContext>, client: &Arc<Peer>) -> JoinHandle<()> {
    let hooks = ctx.hooks().clone();
    let peer = client.clone();
    let addr = client.addr();

    let task = tokio::spawn(async move { hooks.on_join(peer).await });
    tokio::spawn(async move {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Join handler for {} failed: {}", addr, e),
            Err(e) => error!("Join handler for {} aborted: {}", addr, e),
        }
    })
}

/// Handshake steps wait for client acknowledgements, so they run off the
/// relay task. Each client gets one worker that runs its steps in arrival
/// order.
fn queue_auth_step(ctx: &Arc<ProxyContext>, client: &Arc<Peer>, opcode: u16, data: Vec<u8>) {
    let steps = client
        .auth_steps()
        .get_or_init(|| spawn_auth_worker(ctx.clone(), Arc::downgrade(client)));

    if let Err(e) = steps.try_send((opcode, data)) {
        warn!(
            "Dropping authentication step {:#04x} from {}: {}",
            opcode,
            client.addr(),
            e
        );
    }
}

// The worker only holds the peer while a step runs, so it ends once the
// session is gone and the sender with it.
fn spawn_auth_worker(ctx: Arc<ProxyContext>, client: Weak<Peer>) -> mpsc::Sender<AuthStep> {
    let (tx, mut rx) = mpsc::channel::<AuthStep>(AUTH_QUEUE_LEN);

    tokio::spawn(async move {
        while let Some((opcode, data)) = rx.recv().await {
            let client = match client.upgrade() {
                Some(client) => client,
                None => break,
            };
            run_auth_step(&ctx, &client, opcode, &data).await;
        }
    });
    tx
}

async fn run_auth_step(ctx: &ProxyContext, client: &Peer, opcode: u16, data: &[u8]) {
    let result = match opcode {
        to_server::FIRST_SRP => auth::handle_first_srp(ctx, client, data).await,
        to_server::SRP_BYTES_A => auth::handle_srp_bytes_a(ctx, client, data).await,
        _ => auth::handle_srp_bytes_m(ctx, client, data).await,
    };

    if let Err(e) = result {
        warn!(
            "Authentication step {:#04x} from {} at {} failed: {}",
            opcode,
            client.username().unwrap_or("<unnamed>"),
            client.addr(),
            e
        );
    }
}
