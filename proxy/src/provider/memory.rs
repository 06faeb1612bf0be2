//! Process-local provider, used for ephemeral deployments and tests

use super::{Provider, ProviderError};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Tables {
    auth: HashMap<String, String>,
    privileges: HashMap<String, HashSet<String>>,
    bans: HashMap<IpAddr, String>,
    storage: HashMap<String, String>,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct MemoryProvider {
    tables: Mutex<Tables>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, ProviderError> {
        let tables = self
            .tables
            .lock()
            .map_err(|_| ProviderError::Unavailable("memory provider poisoned".into()))?;
        if tables.closed {
            return Err(ProviderError::Closed);
        }
        Ok(tables)
    }
}

impl Provider for MemoryProvider {
    fn create_user(&self, name: &str, password: &str) -> Result<(), ProviderError> {
        let mut tables = self.tables()?;
        if tables.auth.contains_key(name) {
            return Err(ProviderError::UserExists(name.to_string()));
        }
        tables.auth.insert(name.to_string(), password.to_string());
        Ok(())
    }

    fn password(&self, name: &str) -> Result<Option<String>, ProviderError> {
        Ok(self.tables()?.auth.get(name).cloned())
    }

    fn set_password(&self, name: &str, password: &str) -> Result<(), ProviderError> {
        let mut tables = self.tables()?;
        match tables.auth.get_mut(name) {
            Some(stored) => {
                *stored = password.to_string();
                Ok(())
            }
            None => Err(ProviderError::UnknownUser(name.to_string())),
        }
    }

    fn ban(&self, addr: IpAddr, name: &str) -> Result<(), ProviderError> {
        let mut tables = self.tables()?;
        if tables.bans.contains_key(&addr) {
            return Err(ProviderError::AlreadyBanned(addr));
        }
        tables.bans.insert(addr, name.to_string());
        Ok(())
    }

    fn unban(&self, id: &str) -> Result<(), ProviderError> {
        let mut tables = self.tables()?;
        tables
            .bans
            .retain(|addr, name| name != id && addr.to_string() != id);
        Ok(())
    }

    fn ban_list(&self) -> Result<HashMap<IpAddr, String>, ProviderError> {
        Ok(self.tables()?.bans.clone())
    }

    fn is_banned(&self, addr: IpAddr) -> Result<Option<String>, ProviderError> {
        Ok(self.tables()?.bans.get(&addr).cloned())
    }

    fn privs(&self, name: &str) -> Result<HashSet<String>, ProviderError> {
        Ok(self
            .tables()?
            .privileges
            .get(name)
            .cloned()
            .unwrap_or_default())
    }

    fn set_privs(&self, name: &str, privs: &HashSet<String>) -> Result<(), ProviderError> {
        self.tables()?
            .privileges
            .insert(name.to_string(), privs.clone());
        Ok(())
    }

    fn storage_key(&self, key: &str) -> Result<Option<String>, ProviderError> {
        Ok(self.tables()?.storage.get(key).cloned())
    }

    fn set_storage_key(&self, key: &str, value: &str) -> Result<(), ProviderError> {
        self.tables()?
            .storage
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn close(&self) -> Result<(), ProviderError> {
        self.tables()?.closed = true;
        Ok(())
    }
}
