//! Process-wide proxy state
//!
//! Built once at startup and shared by every session as `Arc<ProxyContext>`.

use crate::commands::{self, Moderation};
use crate::config::Config;
use crate::error::ProxyError;
use crate::hooks::{ChatCommands, SessionHooks};
use crate::peer::{Peer, PeerId};
use crate::provider::{self, Provider};
use log::{info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Clients with a live session, for commands that act on other players
#[derive(Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<PeerId, Arc<Peer>>>,
}

impl PeerRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<PeerId, Arc<Peer>>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, peer: &Arc<Peer>) {
        self.lock().insert(peer.id(), Arc::clone(peer));
    }

    pub fn remove(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.lock().remove(&id)
    }

    /// The connected client playing as `name`
    pub fn by_name(&self, name: &str) -> Option<Arc<Peer>> {
        self.lock()
            .values()
            .find(|peer| peer.username() == Some(name))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Upper bound on waiting for the client to acknowledge an auth reply
    pub ack_timeout: Duration,
}

impl Settings {
    pub fn with_ack_timeout(ack_timeout: Duration) -> Self {
        Self { ack_timeout }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::with_ack_timeout(Duration::from_secs(5))
    }
}

pub struct ProxyContext {
    provider: Arc<dyn Provider>,
    hooks: Arc<dyn SessionHooks>,
    settings: Settings,
    peers: Arc<PeerRegistry>,
    /// Secret shared with backends, empty unless loaded at startup
    passphrase: Vec<u8>,
    connected: AtomicUsize,
    next_peer_id: AtomicU32,
}

impl ProxyContext {
    pub fn new(
        provider: Arc<dyn Provider>,
        hooks: Arc<dyn SessionHooks>,
        settings: Settings,
    ) -> Self {
        Self::with_peers(provider, hooks, settings, Arc::default())
    }

    fn with_peers(
        provider: Arc<dyn Provider>,
        hooks: Arc<dyn SessionHooks>,
        settings: Settings,
        peers: Arc<PeerRegistry>,
    ) -> Self {
        Self {
            provider,
            hooks,
            settings,
            peers,
            passphrase: Vec::new(),
            connected: AtomicUsize::new(0),
            next_peer_id: AtomicU32::new(1),
        }
    }

    /// Opens the configured provider, applies the admin grant and sets up
    /// chat commands
    pub fn init(config: &Config) -> Result<Arc<Self>, ProxyError> {
        let provider = provider::open(config.auth_backend, &config.auth_db)?;
        info!("Using {:?} auth backend", config.auth_backend);

        if let Some(admin) = &config.admin {
            if let Err(e) = provider::grant_admin(provider.as_ref(), admin) {
                warn!("Could not grant privs to admin {}: {}", admin, e);
            }
        }
        let passphrase = provider::load_passphrase(provider.as_ref())?;

        let settings = Settings::with_ack_timeout(config.ack_timeout());
        let peers = Arc::new(PeerRegistry::default());

        let mut commands = ChatCommands::with_provider(&config.chat_prefix, provider.clone());
        commands::register_builtin(
            &mut commands,
            Moderation {
                provider: provider.clone(),
                peers: peers.clone(),
                ack_timeout: settings.ack_timeout,
            },
        );

        let mut ctx = Self::with_peers(provider, Arc::new(commands), settings, peers);
        ctx.passphrase = passphrase;
        Ok(Arc::new(ctx))
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn hooks(&self) -> &Arc<dyn SessionHooks> {
        &self.hooks
    }

    pub fn ack_timeout(&self) -> Duration {
        self.settings.ack_timeout
    }

    pub fn peers(&self) -> &Arc<PeerRegistry> {
        &self.peers
    }

    pub fn passphrase(&self) -> &[u8] {
        &self.passphrase
    }

    /// Number of clients with a live session
    pub fn connected(&self) -> usize {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn next_peer_id(&self) -> PeerId {
        self.next_peer_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn peer_joined(&self, peer: &Arc<Peer>) {
        self.peers.register(peer);
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    /// Counts a client out of the session total. Safe to call from both
    /// relay directions; only the first call has any effect.
    pub(crate) async fn peer_left(&self, peer: &Arc<Peer>) {
        if !peer.mark_left() {
            return;
        }

        self.peers.remove(peer.id());
        self.connected.fetch_sub(1, Ordering::SeqCst);
        self.hooks.on_leave(peer).await;
    }
}
