//! Client address to session bookkeeping for the public socket
//!
//! Every address the listener talks to has an entry holding its connection.
//! A new address first holds a slot while it is being admitted; accepted
//! clients then hold their running session, refused clients only stay until
//! their access denied message is out.

use crate::connection::Connection;
use crate::peer::Peer;
use crate::relay::SessionHandle;
use crate::udp::UdpConnection;
use log::info;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

enum State {
    /// Ban check and backend dial in progress; holds a session slot
    Admitting,
    Refused,
    Active(SessionHandle),
}

struct Entry {
    conn: Arc<UdpConnection>,
    state: State,
}

impl Entry {
    /// Connection gone and nothing left running for it
    fn is_finished(&self) -> bool {
        if !self.conn.is_closed() {
            return false;
        }
        match &self.state {
            State::Active(session) => session.is_finished(),
            State::Admitting | State::Refused => true,
        }
    }

    fn holds_slot(&self) -> bool {
        !matches!(self.state, State::Refused)
    }
}

pub struct SessionTable {
    entries: HashMap<SocketAddr, Entry>,
    max_sessions: usize,
}

impl SessionTable {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_sessions,
        }
    }

    /// Live connection for `addr`, if any
    pub fn get(&self, addr: SocketAddr) -> Option<Arc<UdpConnection>> {
        self.entries
            .get(&addr)
            .filter(|entry| !entry.conn.is_closed())
            .map(|entry| Arc::clone(&entry.conn))
    }

    /// Whether every session slot is taken by an accepted or admitting client
    pub fn is_full(&self) -> bool {
        self.entries.values().filter(|entry| entry.holds_slot()).count() >= self.max_sessions
    }

    /// Starts tracking a new client. Returns false, and tracks it as
    /// refused, when no session slot is free.
    pub fn reserve(&mut self, addr: SocketAddr, conn: Arc<UdpConnection>) -> bool {
        let state = if self.is_full() {
            State::Refused
        } else {
            State::Admitting
        };
        let reserved = matches!(state, State::Admitting);
        self.entries.insert(addr, Entry { conn, state });
        reserved
    }

    /// Hands the admitted client its session. The session comes back if the
    /// client's slot is gone, e.g. because it timed out or was drained.
    pub fn activate(&mut self, addr: SocketAddr, session: SessionHandle) -> Result<(), SessionHandle> {
        match self.entries.get_mut(&addr) {
            Some(entry) if matches!(entry.state, State::Admitting) => {
                entry.state = State::Active(session);
                Ok(())
            }
            _ => Err(session),
        }
    }

    /// Marks an admitting client as refused, freeing its slot
    pub fn refuse(&mut self, addr: SocketAddr) {
        if let Some(entry) = self.entries.get_mut(&addr) {
            if matches!(entry.state, State::Admitting) {
                entry.state = State::Refused;
            }
        }
    }

    pub fn remove(&mut self, addr: SocketAddr) -> Option<SessionHandle> {
        match self.entries.remove(&addr)?.state {
            State::Active(session) => Some(session),
            State::Admitting | State::Refused => None,
        }
    }

    /// Expires connections idle for longer than `timeout` and drops finished
    /// entries. Returns the expired addresses.
    pub fn check_timeouts(&mut self, timeout: Duration) -> Vec<SocketAddr> {
        let timed_out: Vec<SocketAddr> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                !entry.conn.is_closed() && entry.conn.idle_for() > timeout
            })
            .map(|(addr, _)| *addr)
            .collect();

        for addr in &timed_out {
            if let Some(entry) = self.entries.get(addr) {
                info!("{} timed out", addr);
                entry.conn.expire();
            }
        }

        self.entries.retain(|_, entry| !entry.is_finished());
        timed_out
    }

    /// Client peers of all accepted sessions
    pub fn clients(&self) -> Vec<Arc<Peer>> {
        self.entries
            .values()
            .filter_map(|entry| match &entry.state {
                State::Active(session) => Some(Arc::clone(session.client())),
                _ => None,
            })
            .collect()
    }

    /// Removes every accepted session, leaving other clients in place
    pub fn drain_sessions(&mut self) -> Vec<SessionHandle> {
        let addrs: Vec<SocketAddr> = self
            .entries
            .iter()
            .filter(|(_, entry)| matches!(entry.state, State::Active(_)))
            .map(|(addr, _)| *addr)
            .collect();

        addrs.into_iter().filter_map(|addr| self.remove(addr)).collect()
    }

    /// Number of accepted sessions
    pub fn len(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| matches!(entry.state, State::Active(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
