//! Error types shared across the proxy
//!
//! Each layer has its own error type so the relay can apply the right policy:
//! malformed input is dropped, state violations are ignored, transport errors
//! are either transient (keep relaying) or terminal (`ConnError::Closed`).
//! None of these messages ever cross the wire; clients only see the protocol's
//! own accept/deny/access-denied signals.

use crate::credential::CredentialError;
use crate::provider::ProviderError;
use crate::srp::SrpError;
use shared::WireError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnError {
    /// The connection is gone; the relay loop for it must end
    #[error("connection closed")]
    Closed,
    #[error("timed out waiting for acknowledgement")]
    AckTimeout,
    #[error("malformed frame: {0}")]
    Frame(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnError {
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnError::Closed)
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("password change attempted without sudo mode")]
    NotInSudoMode,
    #[error("already in sudo mode")]
    AlreadyInSudoMode,
    #[error("no username bound to peer")]
    NoUsername,
    #[error("no stored credential for {0}")]
    NoCredential(String),
    #[error("proof received without a key exchange in progress")]
    NoSession,
    #[error("malformed authentication packet: {0}")]
    Wire(#[from] WireError),
    #[error("key exchange failed: {0}")]
    Srp(#[from] SrpError),
    #[error("credential storage: {0}")]
    Provider(#[from] ProviderError),
    #[error("stored credential unreadable: {0}")]
    Credential(#[from] CredentialError),
    #[error("transport: {0}")]
    Conn(#[from] ConnError),
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("transport: {0}")]
    Conn(#[from] ConnError),
    #[error("provider: {0}")]
    Provider(#[from] ProviderError),
    #[error("protocol: {0}")]
    Wire(#[from] WireError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Config(String),
}
