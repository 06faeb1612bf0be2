//! Connection contract the proxy core is written against
//!
//! A connection is a bidirectional, channelized packet transport. The core
//! only needs to receive, send (optionally waiting for the acknowledgement),
//! say goodbye and close. Closing must wake a pending `recv`.

use crate::error::ConnError;
use async_trait::async_trait;
use shared::Packet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot, watch, Mutex};

/// Resolves once the remote side acknowledged a reliable packet.
/// Dropped without a value if the connection closes first.
pub type Ack = oneshot::Receiver<()>;

#[async_trait]
pub trait Connection: Send + Sync {
    /// Waits for the next packet. `ConnError::Closed` is terminal.
    async fn recv(&self) -> Result<Packet, ConnError>;

    /// Queues a packet and returns its acknowledgement handle
    async fn send(&self, pkt: Packet) -> Result<Ack, ConnError>;

    /// Tells the remote side this connection is going away
    async fn send_disco(&self, timed_out: bool) -> Result<(), ConnError>;

    fn close(&self);

    fn addr(&self) -> SocketAddr;

    /// Whether the connection was closed because the remote stopped responding
    fn timed_out(&self) -> bool;

    fn is_closed(&self) -> bool;
}

/// Ack handle for packets that need no acknowledgement
pub fn resolved_ack() -> Ack {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(());
    rx
}

/// Closed/timed-out state that async waiters can subscribe to
#[derive(Debug)]
pub struct CloseSignal {
    closed: watch::Sender<bool>,
    timed_out: AtomicBool,
}

impl CloseSignal {
    pub fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            closed,
            timed_out: AtomicBool::new(false),
        }
    }

    /// Returns true if this call performed the transition
    pub fn close(&self, timed_out: bool) -> bool {
        if timed_out {
            self.timed_out.store(true, Ordering::SeqCst);
        }
        !self.closed.send_replace(true)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    /// Completes once the connection is closed
    pub async fn wait(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
enum Frame {
    Data(Packet, Option<oneshot::Sender<()>>),
    Disco { timed_out: bool },
}

/// One end of an in-process connection pair
pub struct MemoryConnection {
    local: SocketAddr,
    remote: SocketAddr,
    tx: mpsc::UnboundedSender<Frame>,
    rx: Mutex<mpsc::UnboundedReceiver<Frame>>,
    close: CloseSignal,
}

impl MemoryConnection {
    /// Creates two connected ends; `a` is the address the second end sees
    /// as its remote and vice versa.
    pub fn pair(a: SocketAddr, b: SocketAddr) -> (MemoryConnection, MemoryConnection) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();

        let first = MemoryConnection {
            local: a,
            remote: b,
            tx: a_tx,
            rx: Mutex::new(a_rx),
            close: CloseSignal::new(),
        };
        let second = MemoryConnection {
            local: b,
            remote: a,
            tx: b_tx,
            rx: Mutex::new(b_rx),
            close: CloseSignal::new(),
        };

        (first, second)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn recv(&self) -> Result<Packet, ConnError> {
        if self.close.is_closed() {
            return Err(ConnError::Closed);
        }

        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(Frame::Data(pkt, ack)) => {
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                    Ok(pkt)
                }
                Some(Frame::Disco { timed_out }) => {
                    self.close.close(timed_out);
                    Err(ConnError::Closed)
                }
                None => {
                    self.close.close(false);
                    Err(ConnError::Closed)
                }
            },
            _ = self.close.wait() => Err(ConnError::Closed),
        }
    }

    async fn send(&self, pkt: Packet) -> Result<Ack, ConnError> {
        if self.close.is_closed() {
            return Err(ConnError::Closed);
        }

        let (ack, handle) = if pkt.unreliable {
            (None, resolved_ack())
        } else {
            let (tx, rx) = oneshot::channel();
            (Some(tx), rx)
        };

        self.tx
            .send(Frame::Data(pkt, ack))
            .map_err(|_| ConnError::Closed)?;
        Ok(handle)
    }

    async fn send_disco(&self, timed_out: bool) -> Result<(), ConnError> {
        self.tx
            .send(Frame::Disco { timed_out })
            .map_err(|_| ConnError::Closed)
    }

    fn close(&self) {
        self.close.close(false);
    }

    fn addr(&self) -> SocketAddr {
        self.remote
    }

    fn timed_out(&self) -> bool {
        self.close.timed_out()
    }

    fn is_closed(&self) -> bool {
        self.close.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn addrs() -> (SocketAddr, SocketAddr) {
        (
            "127.0.0.1:30000".parse().unwrap(),
            "127.0.0.1:40000".parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_pair_delivers_and_acks() {
        let (a, b) = addrs();
        let (left, right) = MemoryConnection::pair(a, b);

        assert_eq!(left.addr(), b);
        assert_eq!(right.addr(), a);

        let ack = left.send(Packet::new(vec![0, 1, 2])).await.unwrap();
        let pkt = right.recv().await.unwrap();
        assert_eq!(pkt.data, vec![0, 1, 2]);

        timeout(Duration::from_secs(1), ack).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unreliable_ack_is_immediate() {
        let (a, b) = addrs();
        let (left, _right) = MemoryConnection::pair(a, b);

        let ack = left.send(Packet::new(vec![0, 1]).unreliable()).await.unwrap();
        timeout(Duration::from_millis(50), ack).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_disco_closes_remote() {
        let (a, b) = addrs();
        let (left, right) = MemoryConnection::pair(a, b);

        left.send_disco(true).await.unwrap();
        assert!(right.recv().await.unwrap_err().is_closed());
        assert!(right.is_closed());
        assert!(right.timed_out());
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_recv() {
        let (a, b) = addrs();
        let (left, _right) = MemoryConnection::pair(a, b);
        let left = std::sync::Arc::new(left);

        let waiter = {
            let left = left.clone();
            tokio::spawn(async move { left.recv().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        left.close();

        let result = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(result.unwrap_err().is_closed());
        assert!(left.send(Packet::new(vec![0, 0])).await.is_err());
    }

    #[test]
    fn test_close_signal_transitions_once() {
        let signal = CloseSignal::new();
        assert!(!signal.is_closed());
        assert!(signal.close(false));
        assert!(!signal.close(true));
        assert!(signal.is_closed());
        assert!(signal.timed_out());
    }
}
