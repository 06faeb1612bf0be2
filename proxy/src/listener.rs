//! Public UDP endpoint
//!
//! One socket serves every client. Datagrams are routed to the client's
//! connection by source address; an unknown address that sends data is a new
//! client and gets checked against the ban list and the session limit before
//! a backend connection is dialed for it.

use crate::config::Config;
use crate::connection::CloseSignal;
use crate::context::ProxyContext;
use crate::error::ProxyError;
use crate::peer::Peer;
use crate::provider;
use crate::relay::spawn_session;
use crate::session_table::SessionTable;
use crate::udp::{decode_datagram, Datagram, UdpConnection, MAX_DATAGRAM};
use log::{debug, error, info, warn};
use shared::AccessDeniedReason;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::task::JoinSet;

pub struct Listener {
    socket: Arc<UdpSocket>,
    admission: Admission,
    peer_timeout: Duration,
    stopped: Arc<CloseSignal>,
}

/// What an admission task needs from the listener
#[derive(Clone)]
struct Admission {
    ctx: Arc<ProxyContext>,
    backend: SocketAddr,
    sessions: Arc<RwLock<SessionTable>>,
    shutting_down: Arc<AtomicBool>,
}

impl Listener {
    pub async fn bind(config: &Config, ctx: Arc<ProxyContext>) -> Result<Self, ProxyError> {
        let socket = Arc::new(UdpSocket::bind(config.listen).await?);
        info!(
            "Proxy listening on {}, backend {}",
            socket.local_addr()?,
            config.server
        );

        Ok(Self {
            socket,
            admission: Admission {
                ctx,
                backend: config.server,
                sessions: Arc::new(RwLock::new(SessionTable::new(config.max_peers))),
                shutting_down: Arc::new(AtomicBool::new(false)),
            },
            peer_timeout: config.peer_timeout(),
            stopped: Arc::new(CloseSignal::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn context(&self) -> &Arc<ProxyContext> {
        &self.admission.ctx
    }

    /// Number of accepted sessions still tracked
    pub async fn session_count(&self) -> usize {
        self.admission.sessions.read().await.len()
    }

    /// Receives and routes datagrams until [`Listener::shutdown`] completes
    pub async fn run(&self) -> Result<(), ProxyError> {
        self.spawn_timeout_checker();

        let mut buffer = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buffer) => match received {
                    Ok((len, addr)) => self.handle_datagram(&buffer[..len], addr).await,
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
                _ = self.stopped.wait() => break,
            }
        }

        Ok(())
    }

    /// Periodically expires idle clients and forgets finished sessions
    fn spawn_timeout_checker(&self) {
        let sessions = Arc::clone(&self.admission.sessions);
        let timeout = self.peer_timeout;
        let stopped = Arc::clone(&self.stopped);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = stopped.wait() => break,
                }

                let timed_out = sessions.write().await.check_timeouts(timeout);
                if !timed_out.is_empty() {
                    debug!("Expired {} idle clients", timed_out.len());
                }
            }
        });
    }

    async fn handle_datagram(&self, buf: &[u8], addr: SocketAddr) {
        let existing = self.admission.sessions.read().await.get(addr);
        if let Some(conn) = existing {
            if let Err(e) = conn.handle_datagram(buf).await {
                debug!("Dropped datagram from {}: {}", addr, e);
            }
            return;
        }

        // Only data opens a connection, stray acks or goodbyes do not
        match decode_datagram(buf) {
            Ok(Datagram::Data { .. }) => {}
            Ok(_) => return,
            Err(e) => {
                debug!("Malformed datagram from {}: {}", addr, e);
                return;
            }
        }

        if self.admission.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        let conn = UdpConnection::new(Arc::clone(&self.socket), addr);
        let reserved = self
            .admission
            .sessions
            .write()
            .await
            .reserve(addr, Arc::clone(&conn));

        // Buffered in the connection until the session starts reading it
        if let Err(e) = conn.handle_datagram(buf).await {
            debug!("First datagram from {} dropped: {}", addr, e);
        }

        let admission = self.admission.clone();
        tokio::spawn(async move { admission.admit(addr, conn, reserved).await });
    }

    /// Tells every client the proxy is going down, then stops [`Listener::run`]
    pub async fn shutdown(&self) {
        let sessions = &self.admission.sessions;
        self.admission.shutting_down.store(true, Ordering::SeqCst);
        let clients = sessions.read().await.clients();
        info!("Shutting down, disconnecting {} clients", clients.len());

        // Entries stay in the table until here so acknowledgements still arrive
        let ack_timeout = self.admission.ctx.ack_timeout();
        let mut tasks = JoinSet::new();
        for client in clients {
            tasks.spawn(async move {
                if let Err(e) = client
                    .deny(AccessDeniedReason::Shutdown, "", ack_timeout)
                    .await
                {
                    warn!("Shutdown notice to {} failed: {}", client.addr(), e);
                }
            });
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!("Shutdown task failed: {}", e);
            }
        }

        let drained = sessions.write().await.drain_sessions();
        for session in drained {
            session.stop();
            session.join().await;
        }

        self.stopped.close(false);
    }
}

impl Admission {
    /// Checks the ban list and the session limit, then dials the backend and
    /// starts relaying. Runs off the receive loop so storage and dial latency
    /// only delay this client.
    async fn admit(self, addr: SocketAddr, conn: Arc<UdpConnection>, reserved: bool) {
        let client = Arc::new(Peer::new(self.ctx.next_peer_id(), conn, false));

        let ip = addr.ip();
        let banned = provider::run_blocking(self.ctx.provider(), move |p| p.is_banned(ip)).await;
        let refusal = match banned {
            Ok(Some(name)) => {
                info!("Refusing {}, banned as {}", addr, name);
                Some((AccessDeniedReason::CustomString, "Banned."))
            }
            Ok(None) if !reserved => {
                info!("Refusing {}, proxy is full", addr);
                Some((AccessDeniedReason::TooManyUsers, ""))
            }
            Ok(None) => None,
            Err(e) => {
                error!("Ban lookup for {} failed: {}", addr, e);
                Some((AccessDeniedReason::ServerFail, ""))
            }
        };

        if let Some((reason, text)) = refusal {
            self.refuse(addr, client, reason, text).await;
            return;
        }

        let backend = match UdpConnection::dial(self.backend).await {
            Ok(backend) => backend,
            Err(e) => {
                error!("Could not reach backend {} for {}: {}", self.backend, addr, e);
                self.refuse(addr, client, AccessDeniedReason::ServerFail, "")
                    .await;
                return;
            }
        };
        let server = Arc::new(Peer::new(self.ctx.next_peer_id(), backend, true));

        let session = spawn_session(&self.ctx, client, server);
        let activated = {
            let mut sessions = self.sessions.write().await;
            if self.shutting_down.load(Ordering::SeqCst) {
                Err(session)
            } else {
                sessions.activate(addr, session)
            }
        };

        if let Err(session) = activated {
            debug!("{} went away while being admitted", addr);
            if self.shutting_down.load(Ordering::SeqCst) {
                let ack_timeout = self.ctx.ack_timeout();
                if let Err(e) = session
                    .client()
                    .deny(AccessDeniedReason::Shutdown, "", ack_timeout)
                    .await
                {
                    warn!("Shutdown notice to {} failed: {}", addr, e);
                }
            }
            session.stop();
            session.join().await;
        }
    }

    /// Sends the access denied message; the client's acknowledgement comes
    /// back through the listener while the entry is kept as refused.
    async fn refuse(
        &self,
        addr: SocketAddr,
        client: Arc<Peer>,
        reason: AccessDeniedReason,
        text: &'static str,
    ) {
        self.sessions.write().await.refuse(addr);

        if let Err(e) = client.deny(reason, text, self.ctx.ack_timeout()).await {
            warn!("Refusing {} failed: {}", addr, e);
        }
    }
}
