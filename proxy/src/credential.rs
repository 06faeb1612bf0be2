//! Stored SRP credentials
//!
//! A credential is `base64(salt)#base64(verifier)`. The game server's own
//! auth database stores the same pair as `#1#base64(salt)#base64(verifier)`;
//! both forms decode, so credentials can be shared with it verbatim.

use crate::provider::{Provider, ProviderError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use thiserror::Error;

const SEPARATOR: char = '#';
const SRP_PREFIX: &str = "#1#";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential is missing the salt/verifier separator")]
    MissingSeparator,
    #[error("credential is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

pub fn encode(salt: &[u8], verifier: &[u8]) -> String {
    format!(
        "{}{}{}",
        STANDARD.encode(salt),
        SEPARATOR,
        STANDARD.encode(verifier)
    )
}

/// Returns `(salt, verifier)`
pub fn decode(src: &str) -> Result<(Vec<u8>, Vec<u8>), CredentialError> {
    let src = src.strip_prefix(SRP_PREFIX).unwrap_or(src);
    let (salt, verifier) = src
        .split_once(SEPARATOR)
        .ok_or(CredentialError::MissingSeparator)?;

    Ok((STANDARD.decode(salt)?, STANDARD.decode(verifier)?))
}

/// Looks up and decodes the credential of `name`
pub fn lookup(
    provider: &dyn Provider,
    name: &str,
) -> Result<Option<(Vec<u8>, Vec<u8>)>, CredentialError> {
    match provider.password(name)? {
        Some(stored) if !stored.is_empty() => decode(&stored).map(Some),
        _ => Ok(None),
    }
}

pub fn store(
    provider: &dyn Provider,
    name: &str,
    salt: &[u8],
    verifier: &[u8],
) -> Result<(), CredentialError> {
    provider.set_password(name, &encode(salt, verifier))?;
    Ok(())
}

/// Creates a new account with the given SRP tokens
pub fn register(
    provider: &dyn Provider,
    name: &str,
    salt: &[u8],
    verifier: &[u8],
) -> Result<(), CredentialError> {
    provider.create_user(name, &encode(salt, verifier))?;
    Ok(())
}
