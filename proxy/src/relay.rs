//! Per-direction relay loops
//!
//! Every session runs two loops, client to server and server to client.
//! They are fate-shared: whichever ends first closes its destination, which
//! in turn ends the other loop's pending receive.

use crate::context::ProxyContext;
use crate::dispatcher::{dispatch, Disposition};
use crate::peer::Peer;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Forwards packets from `src` to `dst` until either side goes away
pub async fn relay(ctx: Arc<ProxyContext>, src: Arc<Peer>, dst: Arc<Peer>) {
    loop {
        let received = src.recv().await;
        if !src.forward() || !dst.forward() {
            break;
        }

        let mut pkt = match received {
            Ok(pkt) => pkt,
            Err(e) if e.is_closed() => {
                let suffix = if src.timed_out() { " (timed out)" } else { "" };
                info!("{} disconnected{}", src.addr(), suffix);
                break;
            }
            Err(e) => {
                warn!("Receive from {} failed: {}", src.addr(), e);
                continue;
            }
        };

        if dispatch(&ctx, &src, &dst, &mut pkt).await == Disposition::Consumed {
            continue;
        }

        if let Err(e) = dst.send(pkt).await {
            warn!("Forwarding to {} failed: {}", dst.addr(), e);
        }
    }

    if !src.is_server() {
        ctx.peer_left(&src).await;
    }

    if let Err(e) = dst.send_disco(false).await {
        debug!("Disconnect notice to {} not sent: {}", dst.addr(), e);
    }
    dst.close();
}

/// Both relay directions of one client/backend pairing
pub struct SessionHandle {
    client: Arc<Peer>,
    server: Arc<Peer>,
    upstream: JoinHandle<()>,
    downstream: JoinHandle<()>,
}

impl SessionHandle {
    pub fn client(&self) -> &Arc<Peer> {
        &self.client
    }

    pub fn server(&self) -> &Arc<Peer> {
        &self.server
    }

    pub fn is_finished(&self) -> bool {
        self.upstream.is_finished() && self.downstream.is_finished()
    }

    /// Stops forwarding and closes both ends
    pub fn stop(&self) {
        self.client.set_forward(false);
        self.client.close();
        self.server.close();
    }

    /// Waits for both directions to end
    pub async fn join(self) {
        let (up, down) = tokio::join!(self.upstream, self.downstream);
        for result in [up, down] {
            if let Err(e) = result {
                warn!("Relay task for {} ended abnormally: {}", self.client.addr(), e);
            }
        }
    }
}

/// Counts the client in and starts relaying in both directions
pub fn spawn_session(ctx: &Arc<ProxyContext>, client: Arc<Peer>, server: Arc<Peer>) -> SessionHandle {
    ctx.peer_joined(&client);
    info!(
        "{} connected, relaying to {} ({} online)",
        client.addr(),
        server.addr(),
        ctx.connected()
    );

    let upstream = tokio::spawn(relay(ctx.clone(), client.clone(), server.clone()));
    let downstream = tokio::spawn(relay(ctx.clone(), server.clone(), client.clone()));

    SessionHandle {
        client,
        server,
        upstream,
        downstream,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Ack, Connection, MemoryConnection};
    use crate::context::Settings;
    use crate::error::ConnError;
    use crate::hooks::{ChatCommands, NoHooks, SessionHooks};
    use crate::provider::MemoryProvider;
    use crate::remap::tests::{parse, remove_add};
    use async_trait::async_trait;
    use shared::{to_client, Packet};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    /// Fails its first receive and its first send, then passes through
    struct Flaky {
        inner: MemoryConnection,
        recv_fault: AtomicBool,
        send_fault: AtomicBool,
    }

    impl Flaky {
        fn new(inner: MemoryConnection) -> Self {
            Self {
                inner,
                recv_fault: AtomicBool::new(true),
                send_fault: AtomicBool::new(true),
            }
        }
    }

    #[async_trait]
    impl Connection for Flaky {
        async fn recv(&self) -> Result<Packet, ConnError> {
            if self.recv_fault.swap(false, Ordering::SeqCst) {
                return Err(ConnError::Frame("2 byte datagram".into()));
            }
            self.inner.recv().await
        }

        async fn send(&self, pkt: Packet) -> Result<Ack, ConnError> {
            if self.send_fault.swap(false, Ordering::SeqCst) {
                return Err(ConnError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "no buffer space",
                )));
            }
            self.inner.send(pkt).await
        }

        async fn send_disco(&self, timed_out: bool) -> Result<(), ConnError> {
            self.inner.send_disco(timed_out).await
        }

        fn close(&self) {
            self.inner.close()
        }

        fn addr(&self) -> SocketAddr {
            self.inner.addr()
        }

        fn timed_out(&self) -> bool {
            self.inner.timed_out()
        }

        fn is_closed(&self) -> bool {
            self.inner.is_closed()
        }
    }

    struct Pairing {
        ctx: Arc<ProxyContext>,
        session: SessionHandle,
        /// The real game client's end
        client: MemoryConnection,
        /// The real backend's end
        server: MemoryConnection,
    }

    fn pairing(hooks: Arc<dyn SessionHooks>) -> Pairing {
        let ctx = Arc::new(ProxyContext::new(
            Arc::new(MemoryProvider::new()),
            hooks,
            Settings::default(),
        ));

        let (client_local, client) = MemoryConnection::pair(
            "127.0.0.1:40000".parse().unwrap(),
            "127.0.0.1:50000".parse().unwrap(),
        );
        let (server_local, server) = MemoryConnection::pair(
            "127.0.0.1:40001".parse().unwrap(),
            "127.0.0.1:30000".parse().unwrap(),
        );

        let session = spawn_session(
            &ctx,
            Arc::new(Peer::new(1, Arc::new(client_local), false)),
            Arc::new(Peer::new(2, Arc::new(server_local), true)),
        );

        Pairing {
            ctx,
            session,
            client,
            server,
        }
    }

    async fn recv(conn: &MemoryConnection) -> Packet {
        timeout(Duration::from_secs(1), conn.recv())
            .await
            .expect("nothing relayed")
            .expect("connection closed")
    }

    #[tokio::test]
    async fn test_plain_chat_is_forwarded_verbatim() {
        let p = pairing(Arc::new(ChatCommands::new("#")));
        let data = shared::client_chat_message("hello there").unwrap();

        p.client.send(Packet::new(data.clone())).await.unwrap();

        assert_eq!(recv(&p.server).await.data, data);
    }

    #[tokio::test]
    async fn test_intercepted_chat_never_reaches_backend() {
        let p = pairing(Arc::new(ChatCommands::new("#")));

        p.client
            .send(Packet::new(shared::client_chat_message("#help").unwrap()))
            .await
            .unwrap();
        let marker = vec![0x00, 0x23, 7];
        p.client.send(Packet::new(marker.clone())).await.unwrap();

        // the system reply comes back to the client
        assert_eq!(recv(&p.client).await.opcode(), Some(to_client::CHAT_MESSAGE));
        // and the next thing the backend sees is the packet after the command
        assert_eq!(recv(&p.server).await.data, marker);
    }

    #[tokio::test]
    async fn test_server_traffic_is_remapped() {
        let p = pairing(Arc::new(NoHooks));
        p.session.client().bind_username("alice");

        p.server
            .send(Packet::new(remove_add(&[], &[(1, "alice")])))
            .await
            .unwrap();
        p.server
            .send(Packet::new(remove_add(&[], &[(2, "alice"), (3, "bob")])))
            .await
            .unwrap();

        let (_, first) = parse(&recv(&p.client).await.data);
        assert_eq!(first, vec![(1, "alice".to_string())]);
        let (_, second) = parse(&recv(&p.client).await.data);
        assert_eq!(second, vec![(3, "bob".to_string())]);
    }

    #[tokio::test]
    async fn test_client_disconnect_tears_down_both_directions() {
        let p = pairing(Arc::new(NoHooks));
        assert_eq!(p.ctx.connected(), 1);

        p.client.send_disco(false).await.unwrap();

        // backend is told the session is over
        let closed = timeout(Duration::from_secs(1), p.server.recv()).await.unwrap();
        assert!(closed.unwrap_err().is_closed());

        timeout(Duration::from_secs(1), p.session.join())
            .await
            .expect("relay loops did not end");
        assert_eq!(p.ctx.connected(), 0);
    }

    #[tokio::test]
    async fn test_backend_disconnect_reaches_client() {
        let p = pairing(Arc::new(NoHooks));
        let client_peer = p.session.client().clone();

        p.server.send_disco(true).await.unwrap();

        let closed = timeout(Duration::from_secs(1), p.client.recv()).await.unwrap();
        assert!(closed.unwrap_err().is_closed());

        timeout(Duration::from_secs(1), p.session.join())
            .await
            .expect("relay loops did not end");
        assert!(client_peer.is_closed());
        assert_eq!(p.ctx.connected(), 0);
    }

    #[tokio::test]
    async fn test_transient_errors_keep_relaying() {
        let ctx = Arc::new(ProxyContext::new(
            Arc::new(MemoryProvider::new()),
            Arc::new(NoHooks),
            Settings::default(),
        ));
        let (client_local, client) = MemoryConnection::pair(
            "127.0.0.1:40000".parse().unwrap(),
            "127.0.0.1:50000".parse().unwrap(),
        );
        let (server_local, server) = MemoryConnection::pair(
            "127.0.0.1:40001".parse().unwrap(),
            "127.0.0.1:30000".parse().unwrap(),
        );
        let session = spawn_session(
            &ctx,
            Arc::new(Peer::new(1, Arc::new(Flaky::new(client_local)), false)),
            Arc::new(Peer::new(2, Arc::new(server_local), true)),
        );

        // the failed receive is skipped
        client.send(Packet::new(vec![0x00, 0x23, 1])).await.unwrap();
        assert_eq!(recv(&server).await.data, vec![0x00, 0x23, 1]);

        // the packet whose send failed is lost, the next one gets through
        server.send(Packet::new(vec![0x00, 0x23, 2])).await.unwrap();
        server.send(Packet::new(vec![0x00, 0x23, 3])).await.unwrap();
        assert_eq!(recv(&client).await.data, vec![0x00, 0x23, 3]);

        assert_eq!(ctx.connected(), 1);
        assert!(!session.is_finished());
        assert!(!session.client().is_closed());
        assert!(!session.server().is_closed());
    }

    #[tokio::test]
    async fn test_stop_ends_session_once() {
        let p = pairing(Arc::new(NoHooks));
        p.session.stop();

        timeout(Duration::from_secs(1), p.session.join())
            .await
            .expect("relay loops did not end");
        assert_eq!(p.ctx.connected(), 0);
    }
}
