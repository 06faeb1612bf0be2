//! Datagram transport behind [`Connection`]
//!
//! Every datagram starts with a four byte header:
//!
//! ```text
//! u8 kind, u8 channel, u16 sequence number
//! ```
//!
//! Reliable packets are acknowledged by the receiver with an ACK carrying the
//! same sequence number; the sender's [`Ack`] resolves when it arrives.
//! Nothing is retransmitted: a reliable packet whose ACK never comes shows up
//! as an acknowledgement timeout at the caller. A DISCO datagram ends the
//! connection, its one byte payload says whether the sender timed out.
//!
//! A connection does not read from its socket by itself. Datagrams are fed in
//! through [`UdpConnection::handle_datagram`], either by the listener that
//! owns the shared public socket or by the reader task [`UdpConnection::dial`]
//! spawns for backend connections.

use crate::connection::{resolved_ack, Ack, CloseSignal, Connection};
use crate::error::ConnError;
use async_trait::async_trait;
use log::{debug, warn};
use shared::Packet;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Mutex};

pub const HEADER_LEN: usize = 4;
/// Largest UDP payload over IPv4
pub const MAX_DATAGRAM: usize = 65507;
/// Largest packet that fits one datagram
pub const MAX_PAYLOAD: usize = MAX_DATAGRAM - HEADER_LEN;

const KIND_RELIABLE: u8 = 0;
const KIND_UNRELIABLE: u8 = 1;
const KIND_ACK: u8 = 2;
const KIND_DISCO: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    Data { packet: Packet, seq: u16 },
    Ack { seq: u16 },
    Disco { timed_out: bool },
}

pub fn encode_datagram(kind: u8, channel: u8, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.push(kind);
    buf.push(channel);
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

pub fn decode_datagram(buf: &[u8]) -> Result<Datagram, ConnError> {
    if buf.len() < HEADER_LEN {
        return Err(ConnError::Frame(format!(
            "{} byte datagram is shorter than its header",
            buf.len()
        )));
    }

    let kind = buf[0];
    let channel = buf[1];
    let seq = u16::from_be_bytes([buf[2], buf[3]]);
    let payload = &buf[HEADER_LEN..];

    match kind {
        KIND_RELIABLE => Ok(Datagram::Data {
            packet: Packet::new(payload.to_vec()).on_channel(channel),
            seq,
        }),
        KIND_UNRELIABLE => Ok(Datagram::Data {
            packet: Packet::new(payload.to_vec()).on_channel(channel).unreliable(),
            seq,
        }),
        KIND_ACK => Ok(Datagram::Ack { seq }),
        KIND_DISCO => Ok(Datagram::Disco {
            timed_out: payload.first().copied().unwrap_or(0) != 0,
        }),
        other => Err(ConnError::Frame(format!("unknown datagram kind {}", other))),
    }
}

pub struct UdpConnection {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    inbox_tx: mpsc::UnboundedSender<Packet>,
    inbox_rx: Mutex<mpsc::UnboundedReceiver<Packet>>,
    next_seq: AtomicU16,
    pending: StdMutex<HashMap<u16, oneshot::Sender<()>>>,
    last_seen: StdMutex<Instant>,
    close: CloseSignal,
}

impl UdpConnection {
    /// Connection to `remote` over a socket shared with other connections
    pub fn new(socket: Arc<UdpSocket>, remote: SocketAddr) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            socket,
            remote,
            inbox_tx,
            inbox_rx: Mutex::new(inbox_rx),
            next_seq: AtomicU16::new(0),
            pending: StdMutex::new(HashMap::new()),
            last_seen: StdMutex::new(Instant::now()),
            close: CloseSignal::new(),
        })
    }

    /// Opens a connection on its own socket and starts reading it
    pub async fn dial(remote: SocketAddr) -> Result<Arc<Self>, ConnError> {
        let bind: SocketAddr = match remote.ip() {
            IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = Arc::new(UdpSocket::bind(bind).await?);
        let conn = Self::new(Arc::clone(&socket), remote);

        let reader = Arc::clone(&conn);
        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    received = socket.recv_from(&mut buffer) => match received {
                        Ok((len, from)) if from == reader.remote => {
                            if let Err(e) = reader.handle_datagram(&buffer[..len]).await {
                                warn!("Bad datagram from {}: {}", from, e);
                            }
                        }
                        Ok((_, from)) => debug!("Ignoring datagram from stranger {}", from),
                        Err(e) => {
                            warn!("Error receiving from {}: {}", reader.remote, e);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    },
                    _ = reader.close.wait() => break,
                }
            }
        });

        Ok(conn)
    }

    /// Processes one datagram received from the remote
    pub async fn handle_datagram(&self, buf: &[u8]) -> Result<(), ConnError> {
        if self.close.is_closed() {
            return Err(ConnError::Closed);
        }
        self.touch();

        match decode_datagram(buf)? {
            Datagram::Data { packet, seq } => {
                if !packet.unreliable {
                    let ack = encode_datagram(KIND_ACK, packet.channel, seq, &[]);
                    self.socket.send_to(&ack, self.remote).await?;
                }
                self.inbox_tx.send(packet).map_err(|_| ConnError::Closed)?;
            }
            Datagram::Ack { seq } => {
                if let Some(ack) = self.pending().remove(&seq) {
                    let _ = ack.send(());
                }
            }
            Datagram::Disco { timed_out } => self.shut(timed_out),
        }
        Ok(())
    }

    /// Time since the remote was last heard from
    pub fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Closes the connection as timed out
    pub fn expire(&self) {
        self.shut(true);
    }

    fn touch(&self) {
        *self
            .last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<u16, oneshot::Sender<()>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn shut(&self, timed_out: bool) {
        if self.close.close(timed_out) {
            // Outstanding acks resolve as errors once their senders drop
            self.pending().clear();
        }
    }
}

#[async_trait]
impl Connection for UdpConnection {
    /// Packets that arrived before the connection closed are still delivered
    async fn recv(&self) -> Result<Packet, ConnError> {
        let mut rx = self.inbox_rx.lock().await;
        if let Ok(pkt) = rx.try_recv() {
            return Ok(pkt);
        }
        if self.close.is_closed() {
            return Err(ConnError::Closed);
        }

        tokio::select! {
            biased;
            pkt = rx.recv() => pkt.ok_or(ConnError::Closed),
            _ = self.close.wait() => Err(ConnError::Closed),
        }
    }

    async fn send(&self, pkt: Packet) -> Result<Ack, ConnError> {
        if self.close.is_closed() {
            return Err(ConnError::Closed);
        }
        if pkt.data.len() > MAX_PAYLOAD {
            return Err(ConnError::Frame(format!(
                "{} byte packet does not fit a datagram",
                pkt.data.len()
            )));
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let (kind, handle) = if pkt.unreliable {
            (KIND_UNRELIABLE, resolved_ack())
        } else {
            let (tx, rx) = oneshot::channel();
            self.pending().insert(seq, tx);
            (KIND_RELIABLE, rx)
        };

        let datagram = encode_datagram(kind, pkt.channel, seq, &pkt.data);
        if let Err(e) = self.socket.send_to(&datagram, self.remote).await {
            self.pending().remove(&seq);
            return Err(e.into());
        }
        Ok(handle)
    }

    async fn send_disco(&self, timed_out: bool) -> Result<(), ConnError> {
        let datagram = encode_datagram(KIND_DISCO, 0, 0, &[timed_out as u8]);
        self.socket.send_to(&datagram, self.remote).await?;
        Ok(())
    }

    fn close(&self) {
        self.shut(false);
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
