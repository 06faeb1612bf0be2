//! Credential, ban and privilege storage
//!
//! The core talks to storage only through [`Provider`]. A backend is picked
//! once at startup from the configuration and handed around as
//! `Arc<dyn Provider>`; nothing downstream knows which one it got.
//!
//! Provider calls are synchronous and may block on I/O. Async callers run
//! them on the blocking pool (see [`run_blocking`]) and never while holding
//! a peer lock.

mod memory;
mod sqlite;

pub use memory::MemoryProvider;
pub use sqlite::SqliteProvider;

use crate::config::AuthBackend;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use log::info;
use rand::RngCore;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("invalid ip address format: {0}")]
    InvalidAddress(String),
    #[error("unknown user {0}")]
    UnknownUser(String),
    #[error("user {0} already exists")]
    UserExists(String),
    #[error("ip address {0} is already banned")]
    AlreadyBanned(IpAddr),
    #[error("provider is closed")]
    Closed,
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

pub trait Provider: Send + Sync {
    fn create_user(&self, name: &str, password: &str) -> Result<(), ProviderError>;

    /// Stored credential of `name`, None if the user does not exist
    fn password(&self, name: &str) -> Result<Option<String>, ProviderError>;

    fn set_password(&self, name: &str, password: &str) -> Result<(), ProviderError>;

    fn ban(&self, addr: IpAddr, name: &str) -> Result<(), ProviderError>;

    /// Lifts every ban matching either a player name or an address
    fn unban(&self, id: &str) -> Result<(), ProviderError>;

    fn ban_list(&self) -> Result<HashMap<IpAddr, String>, ProviderError>;

    /// Name recorded with the ban if `addr` is banned
    fn is_banned(&self, addr: IpAddr) -> Result<Option<String>, ProviderError>;

    fn privs(&self, name: &str) -> Result<HashSet<String>, ProviderError>;

    fn set_privs(&self, name: &str, privs: &HashSet<String>) -> Result<(), ProviderError>;

    /// Process-wide value stored under `key`
    fn storage_key(&self, key: &str) -> Result<Option<String>, ProviderError>;

    fn set_storage_key(&self, key: &str, value: &str) -> Result<(), ProviderError>;

    fn close(&self) -> Result<(), ProviderError>;
}

/// Opens the configured backend
pub fn open(backend: AuthBackend, path: &Path) -> Result<Arc<dyn Provider>, ProviderError> {
    let provider: Arc<dyn Provider> = match backend {
        AuthBackend::Memory => Arc::new(MemoryProvider::new()),
        AuthBackend::Sqlite => Arc::new(SqliteProvider::open(path)?),
    };
    Ok(provider)
}

/// Runs a provider call on the blocking thread pool
pub async fn run_blocking<T, F>(provider: &Arc<dyn Provider>, f: F) -> Result<T, ProviderError>
where
    T: Send + 'static,
    F: FnOnce(&dyn Provider) -> Result<T, ProviderError> + Send + 'static,
{
    let provider = Arc::clone(provider);
    tokio::task::spawn_blocking(move || f(provider.as_ref()))
        .await
        .map_err(|e| ProviderError::Unavailable(e.to_string()))?
}

/// Whether `name` holds every privilege in `required`
pub fn check_privs(
    provider: &dyn Provider,
    name: &str,
    required: &HashSet<String>,
) -> Result<bool, ProviderError> {
    let privs = provider.privs(name)?;
    Ok(required.is_subset(&privs))
}

/// Grants `name` the `privs` privilege, which lets it hand out every other
pub fn grant_admin(provider: &dyn Provider, name: &str) -> Result<(), ProviderError> {
    let mut privs = provider.privs(name)?;
    if privs.insert("privs".to_string()) {
        provider.set_privs(name, &privs)?;
        info!("Granted privs to admin {}", name);
    }
    Ok(())
}

const PASSPHRASE_KEY: &str = "auth:passphrase";
const PASSPHRASE_LEN: usize = 16;

/// Secret shared with the backend servers. Created on first start and kept
/// in storage from then on; changing it locks existing players out of the
/// backends.
pub fn load_passphrase(provider: &dyn Provider) -> Result<Vec<u8>, ProviderError> {
    if let Some(stored) = provider.storage_key(PASSPHRASE_KEY)? {
        return STANDARD
            .decode(stored)
            .map_err(|e| ProviderError::Unavailable(format!("stored passphrase unreadable: {}", e)));
    }

    let mut passphrase = vec![0u8; PASSPHRASE_LEN];
    rand::thread_rng().fill_bytes(&mut passphrase);
    provider.set_storage_key(PASSPHRASE_KEY, &STANDARD.encode(&passphrase))?;
    info!("Generated a new auth passphrase");
    Ok(passphrase)
}

/// Privilege sets are stored as `a|b|c`
pub fn encode_privs(privs: &HashSet<String>) -> String {
    let mut sorted: Vec<&str> = privs.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.join("|")
}

pub fn decode_privs(s: &str) -> HashSet<String> {
    s.split('|')
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}
