//! Password authentication handshake and the sudo-mode gate
//!
//! ```text
//! Unauthenticated --INIT--> AwaitingEphemeral --SRP_BYTES_A--> AwaitingProof
//!                                                                   |
//!                      proof ok: Authenticated + sudo mode  <-------+
//!                      proof bad: back to the state before A, deny
//! ```
//!
//! Sudo mode is one-shot: FIRST_SRP (password change) is only honoured while
//! it is set and consumes it. Every outgoing handshake message is sent with
//! [`Peer::send_acked`], so a step does not return before the client has
//! acknowledged it.

use crate::context::ProxyContext;
use crate::credential;
use crate::error::AuthError;
use crate::peer::Peer;
use crate::provider;
use crate::srp;
use log::{info, warn};
use shared::Packet;
use subtle::ConstantTimeEq;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    /// No player name bound yet
    #[default]
    Unauthenticated,
    AwaitingEphemeral,
    /// Salt and server ephemeral sent, waiting for the client proof
    AwaitingProof,
    Authenticated,
}

/// Key exchange values kept between SRP_BYTES_A and SRP_BYTES_M
#[derive(Clone)]
pub struct AuthSession {
    pub salt: Vec<u8>,
    pub client_public: Vec<u8>,
    pub server_public: Vec<u8>,
    pub shared_key: Vec<u8>,
    /// State to return to once the exchange is over
    resume: AuthState,
}

impl std::fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSession")
            .field("resume", &self.resume)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct AuthContext {
    pub(crate) state: AuthState,
    pub(crate) session: Option<AuthSession>,
    pub(crate) sudo_mode: bool,
}

/// Constant-time proof comparison
pub fn proofs_match(supplied: &[u8], expected: &[u8]) -> bool {
    supplied.ct_eq(expected).into()
}

fn username(peer: &Peer) -> Result<String, AuthError> {
    peer.username()
        .map(str::to_string)
        .ok_or(AuthError::NoUsername)
}

/// FIRST_SRP: stores a new salt and verifier for the peer's account
pub async fn handle_first_srp(ctx: &ProxyContext, peer: &Peer, data: &[u8]) -> Result<(), AuthError> {
    let name = username(peer)?;
    if !peer.sudo_mode() {
        warn!(
            "User {} at {} did not enter sudo mode before attempting to change the password",
            name,
            peer.addr()
        );
        return Err(AuthError::NotInSudoMode);
    }

    let first = shared::parse_first_srp(data)?;
    let encoded = credential::encode(first.salt, first.verifier);
    peer.auth().sudo_mode = false;

    let account = name.clone();
    provider::run_blocking(ctx.provider(), move |p| p.set_password(&account, &encoded)).await?;

    info!("User {} at {} changed their password", name, peer.addr());
    Ok(())
}

/// SRP_BYTES_A: answers the client's ephemeral value with salt and B
pub async fn handle_srp_bytes_a(ctx: &ProxyContext, peer: &Peer, data: &[u8]) -> Result<(), AuthError> {
    if peer.sudo_mode() {
        return Err(AuthError::AlreadyInSudoMode);
    }
    let name = username(peer)?;
    let client_public = shared::parse_srp_bytes_a(data)?.to_vec();

    let account = name.clone();
    let stored = provider::run_blocking(ctx.provider(), move |p| p.password(&account)).await?;
    let (salt, verifier) = match stored {
        Some(stored) if !stored.is_empty() => credential::decode(&stored)?,
        _ => return Err(AuthError::NoCredential(name)),
    };

    let (server_public, shared_key) = srp::server_handshake(&client_public, &verifier)?;
    let reply = shared::srp_bytes_s_b(&salt, &server_public)?;

    {
        let mut auth = peer.auth();
        let resume = match (&auth.session, auth.state) {
            (Some(previous), AuthState::AwaitingProof) => previous.resume,
            (_, state) => state,
        };
        auth.session = Some(AuthSession {
            salt,
            client_public,
            server_public,
            shared_key,
            resume,
        });
        auth.state = AuthState::AwaitingProof;
    }

    peer.send_acked(Packet::new(reply), ctx.ack_timeout()).await?;
    Ok(())
}

/// SRP_BYTES_M: verifies the client proof and grants or denies sudo mode
pub async fn handle_srp_bytes_m(ctx: &ProxyContext, peer: &Peer, data: &[u8]) -> Result<(), AuthError> {
    if peer.sudo_mode() {
        return Err(AuthError::AlreadyInSudoMode);
    }
    let name = username(peer)?;
    let proof = shared::parse_srp_bytes_m(data)?;

    let session = {
        let mut auth = peer.auth();
        if auth.state != AuthState::AwaitingProof {
            return Err(AuthError::NoSession);
        }
        auth.session.take().ok_or(AuthError::NoSession)?
    };

    let expected = srp::calculate_m(
        &name,
        &session.salt,
        &session.client_public,
        &session.server_public,
        &session.shared_key,
    );
    let verified = proofs_match(proof, &expected);

    {
        let mut auth = peer.auth();
        if verified {
            auth.state = AuthState::Authenticated;
            auth.sudo_mode = true;
        } else {
            auth.state = session.resume;
        }
    }

    let reply = if verified {
        info!("User {} at {} entered sudo mode", name, peer.addr());
        shared::accept_sudo_mode()
    } else {
        warn!(
            "User {} at {} supplied wrong password for sudo mode",
            name,
            peer.addr()
        );
        shared::deny_sudo_mode()
    };

    peer.send_acked(Packet::new(reply), ctx.ack_timeout()).await?;
    Ok(())
}
