//! Proxy-side state of one endpoint of a relayed session
//!
//! A session pairs a client peer with a server peer. Each peer is shared
//! (`Arc<Peer>`) between the two relay directions, so all mutable state sits
//! behind atomics or a lock owned by this peer alone.

use crate::auth::{AuthContext, AuthState};
use crate::connection::{Ack, Connection};
use crate::error::{ConnError, ProxyError};
use crate::provider::{self, Provider, ProviderError};
use log::{info, warn};
use shared::{AccessDeniedReason, Packet};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

pub type PeerId = u32;

/// Opcode and payload of a queued authentication packet
pub(crate) type AuthStep = (u16, Vec<u8>);

pub struct Peer {
    id: PeerId,
    conn: Arc<dyn Connection>,
    is_server: bool,
    username: OnceLock<String>,
    /// Cleared to stop the relay loops of this peer's session
    forward: AtomicBool,
    /// The backend accepted the login of this (client) peer
    logged_in: AtomicBool,
    /// Latched once the peer has been counted out of the session total
    left: AtomicBool,
    initial_object_seen: AtomicBool,
    active_objects: Mutex<HashSet<u16>>,
    auth: Mutex<AuthContext>,
    /// Feeds this client's authentication worker, set up on first use
    auth_steps: OnceLock<mpsc::Sender<AuthStep>>,
}

impl Peer {
    pub fn new(id: PeerId, conn: Arc<dyn Connection>, is_server: bool) -> Self {
        Self {
            id,
            conn,
            is_server,
            username: OnceLock::new(),
            forward: AtomicBool::new(true),
            logged_in: AtomicBool::new(false),
            left: AtomicBool::new(false),
            initial_object_seen: AtomicBool::new(false),
            active_objects: Mutex::new(HashSet::new()),
            auth: Mutex::new(AuthContext::default()),
            auth_steps: OnceLock::new(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    pub fn addr(&self) -> SocketAddr {
        self.conn.addr()
    }

    pub fn username(&self) -> Option<&str> {
        self.username.get().map(String::as_str)
    }

    /// Binds the player name for this session. Only the first call wins.
    pub fn bind_username(&self, name: &str) -> bool {
        if self.username.set(name.to_string()).is_err() {
            return false;
        }

        let mut auth = self.auth();
        if auth.state == AuthState::Unauthenticated {
            auth.state = AuthState::AwaitingEphemeral;
        }
        true
    }

    pub fn forward(&self) -> bool {
        self.forward.load(Ordering::SeqCst)
    }

    pub fn set_forward(&self, enabled: bool) {
        self.forward.store(enabled, Ordering::SeqCst);
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    pub fn set_logged_in(&self) {
        self.logged_in.store(true, Ordering::SeqCst);
    }

    /// Returns true exactly once, for the first caller
    pub(crate) fn mark_left(&self) -> bool {
        !self.left.swap(true, Ordering::SeqCst)
    }

    pub fn initial_object_seen(&self) -> bool {
        self.initial_object_seen.load(Ordering::SeqCst)
    }

    pub(crate) fn set_initial_object_seen(&self) {
        self.initial_object_seen.store(true, Ordering::SeqCst);
    }

    /// Applies one add/remove batch under the peer's object lock.
    /// Zero is never a valid object id.
    pub(crate) fn update_active_objects(&self, added: &[u16], removed: &[u16]) {
        let mut ids = self
            .active_objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for id in added.iter().filter(|id| **id != 0) {
            ids.insert(*id);
        }
        for id in removed {
            ids.remove(id);
        }
    }

    pub fn has_active_object(&self, id: u16) -> bool {
        self.active_objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
    }

    pub fn active_object_ids(&self) -> HashSet<u16> {
        self.active_objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn auth(&self) -> MutexGuard<'_, AuthContext> {
        self.auth.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn auth_steps(&self) -> &OnceLock<mpsc::Sender<AuthStep>> {
        &self.auth_steps
    }

    pub fn auth_state(&self) -> AuthState {
        self.auth().state
    }

    pub fn sudo_mode(&self) -> bool {
        self.auth().sudo_mode
    }

    pub fn has_auth_session(&self) -> bool {
        self.auth().session.is_some()
    }

    pub async fn recv(&self) -> Result<Packet, ConnError> {
        self.conn.recv().await
    }

    /// Sends without waiting for delivery
    pub async fn send(&self, pkt: Packet) -> Result<Ack, ConnError> {
        self.conn.send(pkt).await
    }

    /// Sends and waits until the remote acknowledged the packet
    pub async fn send_acked(&self, pkt: Packet, timeout: Duration) -> Result<(), ConnError> {
        let ack = self.conn.send(pkt).await?;
        match tokio::time::timeout(timeout, ack).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ConnError::Closed),
            Err(_) => Err(ConnError::AckTimeout),
        }
    }

    pub async fn send_disco(&self, timed_out: bool) -> Result<(), ConnError> {
        self.conn.send_disco(timed_out).await
    }

    pub fn close(&self) {
        self.auth().sudo_mode = false;
        self.conn.close();
    }

    pub fn timed_out(&self) -> bool {
        self.conn.timed_out()
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    /// Refuses the client with an access denied message and disconnects it
    pub async fn deny(
        &self,
        reason: AccessDeniedReason,
        custom: &str,
        ack_timeout: Duration,
    ) -> Result<(), ProxyError> {
        let data = shared::access_denied(reason, custom, false)?;
        if let Err(e) = self.send_acked(Packet::new(data), ack_timeout).await {
            warn!("Access denied message to {} not delivered: {}", self.addr(), e);
        }

        let _ = self.send_disco(false).await;
        self.close();
        Ok(())
    }

    pub async fn kick(&self, reason: &str, ack_timeout: Duration) -> Result<(), ProxyError> {
        let msg = if reason.is_empty() {
            "Kicked.".to_string()
        } else {
            format!("Kicked. {}", reason)
        };

        info!(
            "Kicking {} at {}: {}",
            self.username().unwrap_or("<unnamed>"),
            self.addr(),
            msg
        );
        self.deny(AccessDeniedReason::CustomString, &msg, ack_timeout)
            .await
    }

    /// Adds this peer's address to the ban list and disconnects it
    pub async fn ban(
        &self,
        provider: &Arc<dyn Provider>,
        ack_timeout: Duration,
    ) -> Result<(), ProxyError> {
        let ip = self.addr().ip();
        let name = self.username().unwrap_or_default().to_string();

        provider::run_blocking(provider, move |p| {
            if p.is_banned(ip)?.is_some() {
                return Err(ProviderError::AlreadyBanned(ip));
            }
            p.ban(ip, &name)
        })
        .await?;

        info!("Banned {} at {}", self.username().unwrap_or("<unnamed>"), ip);
        self.deny(AccessDeniedReason::CustomString, "Banned.", ack_timeout)
            .await
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("addr", &self.addr())
            .field("is_server", &self.is_server)
            .field("username", &self.username())
            .finish()
    }
}
