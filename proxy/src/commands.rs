//! Built-in chat commands
//!
//! Moderation works on players connected through this proxy only. Kicks and
//! bans wait for the target to acknowledge its access denied message, so they
//! run detached from the issuing player's relay loop.

use crate::context::PeerRegistry;
use crate::hooks::{ChatCommands, Command};
use crate::peer::Peer;
use crate::provider::{self, Provider, ProviderError};
use async_trait::async_trait;
use log::warn;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// What the moderation commands act on
#[derive(Clone)]
pub struct Moderation {
    pub provider: Arc<dyn Provider>,
    pub peers: Arc<PeerRegistry>,
    pub ack_timeout: Duration,
}

impl Moderation {
    fn target(&self, name: &str) -> Result<Arc<Peer>, String> {
        if name.is_empty() {
            return Err("Missing player name.".to_string());
        }
        self.peers
            .by_name(name)
            .ok_or_else(|| format!("Player {} is not connected.", name))
    }
}

/// Registers `whoami` and the moderation commands
pub fn register_builtin(commands: &mut ChatCommands, moderation: Moderation) {
    commands
        .register("whoami", "show the name you are playing as", |peer, _| {
            Some(format!(
                "You are {} ({})",
                peer.username().unwrap_or("<unnamed>"),
                peer.addr()
            ))
        })
        .register_command(
            "kick",
            "<name> [reason]: disconnect a player",
            &["kick"],
            Kick(moderation.clone()),
        )
        .register_command(
            "ban",
            "<name>: ban a player's address and disconnect it",
            &["ban"],
            Ban(moderation.clone()),
        )
        .register_command(
            "unban",
            "<name|address>: lift a ban",
            &["ban"],
            Unban(moderation.clone()),
        )
        .register_command(
            "banlist",
            "list banned addresses",
            &["ban"],
            BanList(moderation.clone()),
        )
        .register_command(
            "privs",
            "[name]: show privileges",
            &[],
            Privs(moderation.clone()),
        )
        .register_command(
            "grant",
            "<name> <priv>: give a privilege",
            &["privs"],
            SetPriv {
                moderation: moderation.clone(),
                grant: true,
            },
        )
        .register_command(
            "revoke",
            "<name> <priv>: take a privilege away",
            &["privs"],
            SetPriv {
                moderation,
                grant: false,
            },
        );
}

fn split_first(args: &str) -> (&str, &str) {
    match args.split_once(' ') {
        Some((first, rest)) => (first, rest.trim()),
        None => (args, ""),
    }
}

struct Kick(Moderation);

#[async_trait]
impl Command for Kick {
    async fn run(&self, _peer: &Arc<Peer>, args: &str) -> Option<String> {
        let (name, reason) = split_first(args);
        let target = match self.0.target(name) {
            Ok(target) => target,
            Err(msg) => return Some(msg),
        };

        let reason = reason.to_string();
        let ack_timeout = self.0.ack_timeout;
        tokio::spawn(async move {
            if let Err(e) = target.kick(&reason, ack_timeout).await {
                warn!("Kicking {} failed: {}", target.addr(), e);
            }
        });
        Some(format!("Kicked {}.", name))
    }
}

struct Ban(Moderation);

#[async_trait]
impl Command for Ban {
    async fn run(&self, _peer: &Arc<Peer>, args: &str) -> Option<String> {
        let (name, _) = split_first(args);
        let target = match self.0.target(name) {
            Ok(target) => target,
            Err(msg) => return Some(msg),
        };

        let provider = self.0.provider.clone();
        let ack_timeout = self.0.ack_timeout;
        tokio::spawn(async move {
            if let Err(e) = target.ban(&provider, ack_timeout).await {
                warn!("Banning {} failed: {}", target.addr(), e);
            }
        });
        Some(format!("Banned {}.", name))
    }
}

struct Unban(Moderation);

#[async_trait]
impl Command for Unban {
    async fn run(&self, _peer: &Arc<Peer>, args: &str) -> Option<String> {
        let (id, _) = split_first(args);
        if id.is_empty() {
            return Some("Missing player name or address.".to_string());
        }

        let owned = id.to_string();
        match provider::run_blocking(&self.0.provider, move |p| p.unban(&owned)).await {
            Ok(()) => Some(format!("Unbanned {}.", id)),
            Err(e) => Some(format!("Unban failed: {}", e)),
        }
    }
}

struct BanList(Moderation);

#[async_trait]
impl Command for BanList {
    async fn run(&self, _peer: &Arc<Peer>, _args: &str) -> Option<String> {
        let bans = match provider::run_blocking(&self.0.provider, |p| p.ban_list()).await {
            Ok(bans) => bans,
            Err(e) => return Some(format!("Ban list unavailable: {}", e)),
        };
        if bans.is_empty() {
            return Some("No bans.".to_string());
        }

        let mut lines: Vec<String> = bans
            .into_iter()
            .map(|(addr, name)| format!("{}: {}", addr, name))
            .collect();
        lines.sort();
        Some(lines.join("\n"))
    }
}

struct Privs(Moderation);

#[async_trait]
impl Command for Privs {
    async fn run(&self, peer: &Arc<Peer>, args: &str) -> Option<String> {
        let (name, _) = split_first(args);
        let name = match (name, peer.username()) {
            ("", Some(own)) => own.to_string(),
            ("", None) => return Some("Missing player name.".to_string()),
            (name, _) => name.to_string(),
        };

        let lookup = name.clone();
        match provider::run_blocking(&self.0.provider, move |p| p.privs(&lookup)).await {
            Ok(privs) => {
                let mut privs: Vec<String> = privs.into_iter().collect();
                privs.sort();
                Some(format!("Privileges of {}: {}", name, privs.join(", ")))
            }
            Err(e) => Some(format!("Privilege lookup failed: {}", e)),
        }
    }
}

struct SetPriv {
    moderation: Moderation,
    grant: bool,
}

#[async_trait]
impl Command for SetPriv {
    async fn run(&self, _peer: &Arc<Peer>, args: &str) -> Option<String> {
        let (name, privilege) = split_first(args);
        if name.is_empty() || privilege.is_empty() || privilege.contains(['|', ' ']) {
            return Some("Expected a player name and one privilege.".to_string());
        }

        let (owned, priv_name, grant) = (name.to_string(), privilege.to_string(), self.grant);
        let result = provider::run_blocking(&self.moderation.provider, move |p| {
            let mut privs: HashSet<String> = p.privs(&owned)?;
            let changed = if grant {
                privs.insert(priv_name)
            } else {
                privs.remove(&priv_name)
            };
            if changed {
                p.set_privs(&owned, &privs)?;
            }
            Ok::<_, ProviderError>(changed)
        })
        .await;

        match (result, self.grant) {
            (Ok(true), true) => Some(format!("Granted {} to {}.", privilege, name)),
            (Ok(true), false) => Some(format!("Revoked {} from {}.", privilege, name)),
            (Ok(false), true) => Some(format!("{} already has {}.", name, privilege)),
            (Ok(false), false) => Some(format!("{} does not have {}.", name, privilege)),
            (Err(e), _) => Some(format!("Changing privileges failed: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, MemoryConnection};
    use crate::provider::MemoryProvider;
    use shared::{to_client, AccessDeniedReason};
    use tokio::time::timeout;

    struct Setup {
        store: Arc<MemoryProvider>,
        peers: Arc<PeerRegistry>,
        commands: ChatCommands,
    }

    fn setup() -> Setup {
        let store = Arc::new(MemoryProvider::new());
        let provider: Arc<dyn Provider> = store.clone();
        let peers = Arc::new(PeerRegistry::default());

        let mut commands = ChatCommands::with_provider("#", provider.clone());
        register_builtin(
            &mut commands,
            Moderation {
                provider,
                peers: peers.clone(),
                ack_timeout: Duration::from_secs(1),
            },
        );
        Setup {
            store,
            peers,
            commands,
        }
    }

    fn player(s: &Setup, id: u32, name: &str, port: u16) -> (Arc<Peer>, MemoryConnection) {
        let (local, remote) = MemoryConnection::pair(
            format!("10.0.0.{}:{}", id, port).parse().unwrap(),
            "127.0.0.1:40000".parse().unwrap(),
        );
        let peer = Arc::new(Peer::new(id, Arc::new(local), false));
        peer.bind_username(name);
        s.peers.register(&peer);
        (peer, remote)
    }

    fn grant(s: &Setup, name: &str, privs: &[&str]) {
        let privs: HashSet<String> = privs.iter().map(|p| p.to_string()).collect();
        s.store.set_privs(name, &privs).unwrap();
    }

    async fn run(s: &Setup, peer: &Arc<Peer>, msg: &str) -> String {
        s.commands.execute(peer, msg).await.flatten().unwrap()
    }

    #[tokio::test]
    async fn test_kick_denies_target() {
        let s = setup();
        let (admin, _admin_remote) = player(&s, 1, "root", 5000);
        let (_bob, bob_remote) = player(&s, 2, "bob", 5001);
        grant(&s, "root", &["kick"]);

        assert_eq!(run(&s, &admin, "#kick bob spamming").await, "Kicked bob.");

        let pkt = timeout(Duration::from_secs(1), bob_remote.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pkt.opcode(), Some(to_client::ACCESS_DENIED));
        let denied = shared::parse_access_denied(&pkt.data).unwrap();
        assert_eq!(denied.reason, AccessDeniedReason::CustomString);
        assert_eq!(denied.custom, "Kicked. spamming");
    }

    #[tokio::test]
    async fn test_kick_needs_privilege() {
        let s = setup();
        let (alice, _alice_remote) = player(&s, 1, "alice", 5000);
        let (bob, _bob_remote) = player(&s, 2, "bob", 5001);

        let reply = run(&s, &alice, "#kick bob").await;
        assert!(reply.starts_with("You don't have permission"));
        assert!(!bob.is_closed());
    }

    #[tokio::test]
    async fn test_kick_unknown_player() {
        let s = setup();
        let (admin, _remote) = player(&s, 1, "root", 5000);
        grant(&s, "root", &["kick"]);

        assert_eq!(
            run(&s, &admin, "#kick ghost").await,
            "Player ghost is not connected."
        );
        assert_eq!(run(&s, &admin, "#kick").await, "Missing player name.");
    }

    #[tokio::test]
    async fn test_ban_unban_and_banlist() {
        let s = setup();
        let (admin, _admin_remote) = player(&s, 1, "root", 5000);
        let (bob, bob_remote) = player(&s, 2, "bob", 5001);
        grant(&s, "root", &["ban"]);

        assert_eq!(run(&s, &admin, "#banlist").await, "No bans.");
        assert_eq!(run(&s, &admin, "#ban bob").await, "Banned bob.");

        // ack the access denied message so the ban task can finish
        timeout(Duration::from_secs(1), bob_remote.recv())
            .await
            .unwrap()
            .unwrap();
        timeout(Duration::from_secs(1), async {
            while !bob.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(run(&s, &admin, "#banlist").await, "10.0.0.2: bob");
        assert_eq!(
            run(&s, &admin, "#unban 10.0.0.2").await,
            "Unbanned 10.0.0.2."
        );
        assert_eq!(run(&s, &admin, "#banlist").await, "No bans.");
    }

    #[tokio::test]
    async fn test_grant_and_revoke() {
        let s = setup();
        let (admin, _admin_remote) = player(&s, 1, "root", 5000);
        let (bob, _bob_remote) = player(&s, 2, "bob", 5001);
        grant(&s, "root", &["privs"]);

        assert_eq!(run(&s, &admin, "#grant bob fly").await, "Granted fly to bob.");
        assert_eq!(run(&s, &admin, "#grant bob fly").await, "bob already has fly.");
        assert_eq!(run(&s, &bob, "#privs").await, "Privileges of bob: fly");

        assert_eq!(
            run(&s, &admin, "#revoke bob fly").await,
            "Revoked fly from bob."
        );
        assert_eq!(
            run(&s, &admin, "#revoke bob fly").await,
            "bob does not have fly."
        );
        assert_eq!(
            run(&s, &admin, "#grant bob a|b").await,
            "Expected a player name and one privilege."
        );

        let reply = run(&s, &bob, "#grant bob privs").await;
        assert!(reply.starts_with("You don't have permission"));
    }

    #[tokio::test]
    async fn test_privs_of_another_player() {
        let s = setup();
        let (alice, _remote) = player(&s, 1, "alice", 5000);
        grant(&s, "root", &["privs", "kick"]);

        assert_eq!(
            run(&s, &alice, "#privs root").await,
            "Privileges of root: kick, privs"
        );
    }
}
