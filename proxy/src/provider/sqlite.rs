//! SQLite provider

use super::{decode_privs, encode_privs, Provider, ProviderError};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS auth (
        name VARCHAR(32) PRIMARY KEY NOT NULL,
        password VARCHAR(512) NOT NULL
    );
    CREATE TABLE IF NOT EXISTS privileges (
        name VARCHAR(32) PRIMARY KEY NOT NULL,
        privileges VARCHAR(1024)
    );
    CREATE TABLE IF NOT EXISTS ban (
        addr VARCHAR(39) PRIMARY KEY NOT NULL,
        name VARCHAR(32) NOT NULL
    );
    CREATE TABLE IF NOT EXISTS storage (
        key VARCHAR(256) PRIMARY KEY NOT NULL,
        value TEXT NOT NULL
    );
";

pub struct SqliteProvider {
    db: Mutex<Option<Connection>>,
}

impl SqliteProvider {
    pub fn open(path: &Path) -> Result<Self, ProviderError> {
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, ProviderError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, ProviderError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            db: Mutex::new(Some(conn)),
        })
    }

    fn with_db<R, F>(&self, f: F) -> Result<R, ProviderError>
    where
        F: FnOnce(&Connection) -> Result<R, ProviderError>,
    {
        let guard: MutexGuard<'_, Option<Connection>> = self
            .db
            .lock()
            .map_err(|_| ProviderError::Unavailable("sqlite provider poisoned".into()))?;
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(ProviderError::Closed),
        }
    }
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

impl Provider for SqliteProvider {
    fn create_user(&self, name: &str, password: &str) -> Result<(), ProviderError> {
        self.with_db(|db| {
            db.execute(
                "INSERT INTO auth (name, password) VALUES (?1, ?2);",
                params![name, password],
            )
            .map(|_| ())
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    ProviderError::UserExists(name.to_string())
                } else {
                    e.into()
                }
            })
        })
    }

    fn password(&self, name: &str) -> Result<Option<String>, ProviderError> {
        self.with_db(|db| {
            Ok(db
                .query_row(
                    "SELECT password FROM auth WHERE name = ?1;",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    fn set_password(&self, name: &str, password: &str) -> Result<(), ProviderError> {
        self.with_db(|db| {
            let updated = db.execute(
                "UPDATE auth SET password = ?1 WHERE name = ?2;",
                params![password, name],
            )?;
            if updated == 0 {
                return Err(ProviderError::UnknownUser(name.to_string()));
            }
            Ok(())
        })
    }

    fn ban(&self, addr: IpAddr, name: &str) -> Result<(), ProviderError> {
        self.with_db(|db| {
            db.execute(
                "INSERT INTO ban (addr, name) VALUES (?1, ?2);",
                params![addr.to_string(), name],
            )
            .map(|_| ())
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    ProviderError::AlreadyBanned(addr)
                } else {
                    e.into()
                }
            })
        })
    }

    fn unban(&self, id: &str) -> Result<(), ProviderError> {
        self.with_db(|db| {
            db.execute(
                "DELETE FROM ban WHERE name = ?1 OR addr = ?1;",
                params![id],
            )?;
            Ok(())
        })
    }

    fn ban_list(&self) -> Result<HashMap<IpAddr, String>, ProviderError> {
        self.with_db(|db| {
            let mut stmt = db.prepare("SELECT addr, name FROM ban;")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;

            let mut bans = HashMap::new();
            for row in rows {
                let (addr, name) = row?;
                let addr = addr
                    .parse()
                    .map_err(|_| ProviderError::InvalidAddress(addr.clone()))?;
                bans.insert(addr, name);
            }
            Ok(bans)
        })
    }

    fn is_banned(&self, addr: IpAddr) -> Result<Option<String>, ProviderError> {
        self.with_db(|db| {
            Ok(db
                .query_row(
                    "SELECT name FROM ban WHERE addr = ?1;",
                    params![addr.to_string()],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    fn privs(&self, name: &str) -> Result<HashSet<String>, ProviderError> {
        self.with_db(|db| {
            let encoded: Option<Option<String>> = db
                .query_row(
                    "SELECT privileges FROM privileges WHERE name = ?1;",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(encoded.flatten().map(|s| decode_privs(&s)).unwrap_or_default())
        })
    }

    fn set_privs(&self, name: &str, privs: &HashSet<String>) -> Result<(), ProviderError> {
        self.with_db(|db| {
            db.execute(
                "INSERT INTO privileges (name, privileges) VALUES (?1, ?2)
                 ON CONFLICT (name) DO UPDATE SET privileges = excluded.privileges;",
                params![name, encode_privs(privs)],
            )?;
            Ok(())
        })
    }

    fn storage_key(&self, key: &str) -> Result<Option<String>, ProviderError> {
        self.with_db(|db| {
            Ok(db
                .query_row(
                    "SELECT value FROM storage WHERE key = ?1;",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    fn set_storage_key(&self, key: &str, value: &str) -> Result<(), ProviderError> {
        self.with_db(|db| {
            db.execute(
                "INSERT INTO storage (key, value) VALUES (?1, ?2)
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value;",
                params![key, value],
            )?;
            Ok(())
        })
    }

    fn close(&self) -> Result<(), ProviderError> {
        let conn = self
            .db
            .lock()
            .map_err(|_| ProviderError::Unavailable("sqlite provider poisoned".into()))?
            .take();
        match conn {
            Some(conn) => conn.close().map_err(|(_, e)| e.into()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_users() {
        let p = SqliteProvider::in_memory().unwrap();

        assert!(p.password("alice").unwrap().is_none());
        p.create_user("alice", "s#v").unwrap();
        assert!(matches!(
            p.create_user("alice", "x"),
            Err(ProviderError::UserExists(_))
        ));
        assert_eq!(p.password("alice").unwrap().as_deref(), Some("s#v"));

        p.set_password("alice", "t#w").unwrap();
        assert_eq!(p.password("alice").unwrap().as_deref(), Some("t#w"));
        assert!(matches!(
            p.set_password("bob", "x"),
            Err(ProviderError::UnknownUser(_))
        ));
    }

    #[test]
    fn test_bans() {
        let p = SqliteProvider::in_memory().unwrap();
        p.ban(addr("192.168.0.7"), "mallory").unwrap();
        p.ban(addr("::1"), "eve").unwrap();

        assert!(matches!(
            p.ban(addr("192.168.0.7"), "again"),
            Err(ProviderError::AlreadyBanned(_))
        ));
        assert_eq!(
            p.is_banned(addr("192.168.0.7")).unwrap().as_deref(),
            Some("mallory")
        );

        let list = p.ban_list().unwrap();
        assert_eq!(list.get(&addr("::1")).map(String::as_str), Some("eve"));

        p.unban("eve").unwrap();
        p.unban("192.168.0.7").unwrap();
        assert!(p.ban_list().unwrap().is_empty());
    }

    #[test]
    fn test_privs_upsert() {
        let p = SqliteProvider::in_memory().unwrap();
        assert!(p.privs("alice").unwrap().is_empty());

        let first: HashSet<String> = ["fly", "fast"].iter().map(|s| s.to_string()).collect();
        p.set_privs("alice", &first).unwrap();
        assert_eq!(p.privs("alice").unwrap(), first);

        let second: HashSet<String> = ["shout".to_string()].into_iter().collect();
        p.set_privs("alice", &second).unwrap();
        assert_eq!(p.privs("alice").unwrap(), second);
    }

    #[test]
    fn test_storage_keys() {
        let p = SqliteProvider::in_memory().unwrap();
        assert!(p.storage_key("auth:passphrase").unwrap().is_none());

        p.set_storage_key("auth:passphrase", "c2VjcmV0").unwrap();
        p.set_storage_key("auth:passphrase", "b3RoZXI=").unwrap();
        assert_eq!(
            p.storage_key("auth:passphrase").unwrap().as_deref(),
            Some("b3RoZXI=")
        );
    }

    #[test]
    fn test_close() {
        let p = SqliteProvider::in_memory().unwrap();
        p.close().unwrap();
        assert!(matches!(p.password("alice"), Err(ProviderError::Closed)));
        p.close().unwrap();
    }
}
