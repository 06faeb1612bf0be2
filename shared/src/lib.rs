//! Wire protocol shared by the proxy and its tooling
//!
//! Packets are raw byte payloads whose first two bytes are a big-endian
//! opcode. The client and the server use disjoint opcode spaces that reuse
//! the same numbers, so an opcode only means something together with the
//! direction it travelled in.

pub mod wire;

pub use wire::{Reader, WireError, Writer};

/// Opcodes of packets sent by a server to a client
pub mod to_client {
    pub const HELLO: u16 = 0x02;
    pub const AUTH_ACCEPT: u16 = 0x03;
    pub const ACCEPT_SUDO_MODE: u16 = 0x04;
    pub const DENY_SUDO_MODE: u16 = 0x05;
    pub const ACCESS_DENIED: u16 = 0x0A;
    pub const CHAT_MESSAGE: u16 = 0x2F;
    pub const ACTIVE_OBJECT_REMOVE_ADD: u16 = 0x31;
    pub const SRP_BYTES_S_B: u16 = 0x60;
}

/// Opcodes of packets sent by a client to a server
pub mod to_server {
    pub const INIT: u16 = 0x02;
    pub const INIT2: u16 = 0x11;
    pub const CHAT_MESSAGE: u16 = 0x32;
    pub const CLIENT_READY: u16 = 0x43;
    pub const FIRST_SRP: u16 = 0x50;
    pub const SRP_BYTES_A: u16 = 0x51;
    pub const SRP_BYTES_M: u16 = 0x52;
}

/// A single protocol message as handed over by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub data: Vec<u8>,
    pub channel: u8,
    pub unreliable: bool,
}

impl Packet {
    /// Reliable packet on channel 0
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            channel: 0,
            unreliable: false,
        }
    }

    pub fn on_channel(mut self, channel: u8) -> Self {
        self.channel = channel;
        self
    }

    pub fn unreliable(mut self) -> Self {
        self.unreliable = true;
        self
    }

    /// Returns None for payloads too short to carry an opcode
    pub fn opcode(&self) -> Option<u16> {
        match self.data.as_slice() {
            [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AccessDeniedReason {
    WrongPassword = 0,
    UnexpectedData = 1,
    Singleplayer = 2,
    WrongVersion = 3,
    WrongCharsInName = 4,
    WrongName = 5,
    TooManyUsers = 6,
    EmptyPassword = 7,
    AlreadyConnected = 8,
    ServerFail = 9,
    CustomString = 10,
    Shutdown = 11,
    Crash = 12,
}

impl AccessDeniedReason {
    /// Reasons followed by a free-text string and a reconnect flag
    pub fn carries_text(self) -> bool {
        matches!(self, Self::CustomString | Self::Shutdown | Self::Crash)
    }
}

impl TryFrom<u8> for AccessDeniedReason {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use AccessDeniedReason::*;
        Ok(match value {
            0 => WrongPassword,
            1 => UnexpectedData,
            2 => Singleplayer,
            3 => WrongVersion,
            4 => WrongCharsInName,
            5 => WrongName,
            6 => TooManyUsers,
            7 => EmptyPassword,
            8 => AlreadyConnected,
            9 => ServerFail,
            10 => CustomString,
            11 => Shutdown,
            12 => Crash,
            other => return Err(WireError::UnknownReason(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChatKind {
    Raw = 0,
    Normal = 1,
    Announce = 2,
    System = 3,
}

/// Decoded TOCLIENT_ACCESS_DENIED
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDenied {
    pub reason: AccessDeniedReason,
    pub custom: String,
    pub reconnect: bool,
}

/// Decoded TOSERVER_FIRST_SRP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirstSrp<'a> {
    pub salt: &'a [u8],
    pub verifier: &'a [u8],
    pub empty_password: bool,
}

pub fn accept_sudo_mode() -> Vec<u8> {
    Writer::with_opcode(to_client::ACCEPT_SUDO_MODE).finish()
}

pub fn deny_sudo_mode() -> Vec<u8> {
    Writer::with_opcode(to_client::DENY_SUDO_MODE).finish()
}

/// TOCLIENT_SRP_BYTES_S_B: salt and server ephemeral public value
pub fn srp_bytes_s_b(salt: &[u8], b_pub: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut w = Writer::with_opcode(to_client::SRP_BYTES_S_B);
    w.string16(salt)?.string16(b_pub)?;
    Ok(w.finish())
}

/// TOCLIENT_ACCESS_DENIED; the text is only encoded for reasons that carry one
pub fn access_denied(
    reason: AccessDeniedReason,
    custom: &str,
    reconnect: bool,
) -> Result<Vec<u8>, WireError> {
    let mut w = Writer::with_opcode(to_client::ACCESS_DENIED);
    w.u8(reason as u8);
    if reason.carries_text() {
        w.string16(custom.as_bytes())?;
        w.u8(reconnect as u8);
    }
    Ok(w.finish())
}

pub fn parse_access_denied(data: &[u8]) -> Result<AccessDenied, WireError> {
    let mut r = Reader::at(data, 2);
    let reason = AccessDeniedReason::try_from(r.u8()?)?;
    let (custom, reconnect) = if reason.carries_text() {
        let text = String::from_utf8_lossy(r.string16()?).into_owned();
        // Older servers omit the flag
        let reconnect = r.remaining() > 0 && r.u8()? != 0;
        (text, reconnect)
    } else {
        (String::new(), false)
    };

    Ok(AccessDenied {
        reason,
        custom,
        reconnect,
    })
}

/// TOCLIENT_CHAT_MESSAGE, version 1 layout
pub fn chat_message(
    kind: ChatKind,
    sender: &str,
    text: &str,
    timestamp: u64,
) -> Result<Vec<u8>, WireError> {
    let mut w = Writer::with_opcode(to_client::CHAT_MESSAGE);
    w.u8(1).u8(kind as u8);
    w.wide_string(sender)?.wide_string(text)?;
    w.u64(timestamp);
    Ok(w.finish())
}

/// TOSERVER_CHAT_MESSAGE
pub fn parse_chat_message(data: &[u8]) -> Result<String, WireError> {
    Reader::at(data, 2).wide_string()
}

/// TOSERVER_CHAT_MESSAGE
pub fn client_chat_message(text: &str) -> Result<Vec<u8>, WireError> {
    let mut w = Writer::with_opcode(to_server::CHAT_MESSAGE);
    w.wide_string(text)?;
    Ok(w.finish())
}

/// Player name from TOSERVER_INIT
pub fn parse_init_name(data: &[u8]) -> Result<String, WireError> {
    let mut r = Reader::at(data, 2);
    // serialization version, compression modes, min and max protocol
    r.skip(1 + 2 + 2 + 2)?;
    Ok(String::from_utf8_lossy(r.string16()?).into_owned())
}

pub fn init(name: &str) -> Result<Vec<u8>, WireError> {
    let mut w = Writer::with_opcode(to_server::INIT);
    w.u8(29).u16(0).u16(37).u16(42);
    w.string16(name.as_bytes())?;
    Ok(w.finish())
}

pub fn parse_first_srp(data: &[u8]) -> Result<FirstSrp<'_>, WireError> {
    let mut r = Reader::at(data, 2);
    let salt = r.string16()?;
    let verifier = r.string16()?;
    let empty_password = r.remaining() > 0 && r.u8()? != 0;

    Ok(FirstSrp {
        salt,
        verifier,
        empty_password,
    })
}

pub fn first_srp(salt: &[u8], verifier: &[u8], empty_password: bool) -> Result<Vec<u8>, WireError> {
    let mut w = Writer::with_opcode(to_server::FIRST_SRP);
    w.string16(salt)?.string16(verifier)?;
    w.u8(empty_password as u8);
    Ok(w.finish())
}

/// Client ephemeral public value from TOSERVER_SRP_BYTES_A
pub fn parse_srp_bytes_a(data: &[u8]) -> Result<&[u8], WireError> {
    Reader::at(data, 2).string16()
}

pub fn srp_bytes_a(a_pub: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut w = Writer::with_opcode(to_server::SRP_BYTES_A);
    // based on the SRP verifier, not the legacy password hash
    w.string16(a_pub)?.u8(1);
    Ok(w.finish())
}

/// Client proof from TOSERVER_SRP_BYTES_M
pub fn parse_srp_bytes_m(data: &[u8]) -> Result<&[u8], WireError> {
    Reader::at(data, 2).string16()
}

pub fn srp_bytes_m(proof: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut w = Writer::with_opcode(to_server::SRP_BYTES_M);
    w.string16(proof)?;
    Ok(w.finish())
}

/// Salt and server ephemeral public value from TOCLIENT_SRP_BYTES_S_B
pub fn parse_srp_bytes_s_b(data: &[u8]) -> Result<(&[u8], &[u8]), WireError> {
    let mut r = Reader::at(data, 2);
    let salt = r.string16()?;
    let b_pub = r.string16()?;
    Ok((salt, b_pub))
}
