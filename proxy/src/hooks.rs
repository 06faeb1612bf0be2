//! Session hooks
//!
//! Extension point for everything the relay itself does not decide: what
//! happens when a player joins or leaves, and whether a chat message is
//! handled by the proxy instead of reaching the backend.

use crate::error::ProxyError;
use crate::peer::Peer;
use crate::provider::{self, Provider};
use async_trait::async_trait;
use log::{debug, warn};
use shared::{ChatKind, Packet};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[async_trait]
pub trait SessionHooks: Send + Sync {
    /// Runs detached once the client reports it is ready
    async fn on_join(&self, _peer: Arc<Peer>) -> Result<(), ProxyError> {
        Ok(())
    }

    async fn on_leave(&self, _peer: &Arc<Peer>) {}

    /// Returns true if the message was handled and must not be forwarded
    async fn on_chat(&self, _peer: &Arc<Peer>, _msg: &str) -> bool {
        false
    }
}

/// Forwards everything, reacts to nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

#[async_trait]
impl SessionHooks for NoHooks {}

/// A chat command answered by the proxy
#[async_trait]
pub trait Command: Send + Sync {
    /// Optional reply to the issuing player
    async fn run(&self, peer: &Arc<Peer>, args: &str) -> Option<String>;
}

/// Adapts a plain function into a [`Command`]
struct FnCommand<F>(F);

#[async_trait]
impl<F> Command for FnCommand<F>
where
    F: Fn(&Peer, &str) -> Option<String> + Send + Sync,
{
    async fn run(&self, peer: &Arc<Peer>, args: &str) -> Option<String> {
        (self.0)(peer.as_ref(), args)
    }
}

struct Entry {
    help: String,
    /// Privileges the issuing player must hold
    privs: HashSet<String>,
    command: Box<dyn Command>,
}

/// Prefixed chat commands answered by the proxy
pub struct ChatCommands {
    prefix: String,
    provider: Option<Arc<dyn Provider>>,
    commands: BTreeMap<String, Entry>,
}

// Milliseconds since the epoch
fn get_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

impl ChatCommands {
    /// Commands without a privilege store; privileged commands are refused
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            provider: None,
            commands: BTreeMap::new(),
        }
    }

    /// Commands whose privileges are checked against `provider`
    pub fn with_provider(prefix: &str, provider: Arc<dyn Provider>) -> Self {
        Self {
            provider: Some(provider),
            ..Self::new(prefix)
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Registers `name`, replacing any earlier command of that name
    pub fn register<F>(&mut self, name: &str, help: &str, handler: F) -> &mut Self
    where
        F: Fn(&Peer, &str) -> Option<String> + Send + Sync + 'static,
    {
        self.register_command(name, help, &[], FnCommand(handler))
    }

    /// Registers a command only players holding all of `privs` may run
    pub fn register_command<C>(
        &mut self,
        name: &str,
        help: &str,
        privs: &[&str],
        command: C,
    ) -> &mut Self
    where
        C: Command + 'static,
    {
        self.commands.insert(
            name.to_string(),
            Entry {
                help: help.to_string(),
                privs: privs.iter().map(|p| p.to_string()).collect(),
                command: Box::new(command),
            },
        );
        self
    }

    fn help_text(&self) -> String {
        let mut lines = vec![format!("{}help: list available commands", self.prefix)];
        for (name, entry) in &self.commands {
            lines.push(format!("{}{}: {}", self.prefix, name, entry.help));
        }
        lines.join("\n")
    }

    async fn permitted(&self, peer: &Peer, required: &HashSet<String>) -> bool {
        if required.is_empty() {
            return true;
        }

        let (store, name) = match (&self.provider, peer.username()) {
            (Some(store), Some(name)) => (store, name.to_string()),
            _ => return false,
        };

        let required = required.clone();
        match provider::run_blocking(store, move |p| {
            provider::check_privs(p, &name, &required)
        })
        .await
        {
            Ok(granted) => granted,
            Err(e) => {
                warn!("Privilege lookup for {} failed: {}", peer.addr(), e);
                false
            }
        }
    }

    /// None if `msg` is not a command, otherwise the (optional) reply
    pub async fn execute(&self, peer: &Arc<Peer>, msg: &str) -> Option<Option<String>> {
        let line = msg.strip_prefix(self.prefix.as_str())?;
        let (name, args) = line.split_once(' ').unwrap_or((line, ""));

        if name == "help" {
            return Some(Some(self.help_text()));
        }

        let entry = match self.commands.get(name) {
            Some(entry) => entry,
            None => {
                return Some(Some(format!(
                    "Unknown command {}. Use {}help.",
                    name, self.prefix
                )))
            }
        };

        if !self.permitted(peer, &entry.privs).await {
            let mut missing: Vec<&str> = entry.privs.iter().map(String::as_str).collect();
            missing.sort_unstable();
            return Some(Some(format!(
                "You don't have permission to run this command (requires {}).",
                missing.join(", ")
            )));
        }

        Some(entry.command.run(peer, args.trim()).await)
    }
}

#[async_trait]
impl SessionHooks for ChatCommands {
    async fn on_chat(&self, peer: &Arc<Peer>, msg: &str) -> bool {
        let reply = match self.execute(peer, msg).await {
            Some(reply) => reply,
            None => return false,
        };

        debug!(
            "{} at {} ran chat command {:?}",
            peer.username().unwrap_or("<unnamed>"),
            peer.addr(),
            msg
        );

        if let Some(text) = reply {
            match shared::chat_message(ChatKind::System, "", &text, get_timestamp()) {
                Ok(data) => {
                    if let Err(e) = peer.send(Packet::new(data)).await {
                        warn!("Failed to answer chat command from {}: {}", peer.addr(), e);
                    }
                }
                Err(e) => warn!("Chat command reply not encodable: {}", e),
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, MemoryConnection};
    use crate::provider::MemoryProvider;
    use shared::to_client;

    fn peer() -> (Arc<Peer>, MemoryConnection) {
        let (local, remote) = MemoryConnection::pair(
            "127.0.0.1:40000".parse().unwrap(),
            "127.0.0.1:50000".parse().unwrap(),
        );
        let peer = Peer::new(1, Arc::new(local), false);
        peer.bind_username("alice");
        (Arc::new(peer), remote)
    }

    fn commands() -> ChatCommands {
        let mut commands = ChatCommands::new("#");
        commands
            .register("whoami", "show your name", |peer, _| {
                peer.username().map(str::to_string)
            })
            .register("quiet", "does nothing", |_, _| None);
        commands
    }

    #[tokio::test]
    async fn test_plain_chat_is_not_a_command() {
        let (peer, _remote) = peer();
        assert!(commands().execute(&peer, "hello #whoami").await.is_none());
    }

    #[tokio::test]
    async fn test_command_arguments() {
        let (peer, _remote) = peer();
        let mut commands = ChatCommands::new("/");
        commands.register("echo", "repeat", |_, args| Some(args.to_string()));

        assert_eq!(
            commands.execute(&peer, "/echo  some words ").await,
            Some(Some("some words".to_string()))
        );
        assert_eq!(
            commands.execute(&peer, "/echo").await,
            Some(Some(String::new()))
        );
    }

    #[tokio::test]
    async fn test_help_lists_commands_in_order() {
        let (peer, _remote) = peer();
        let help = commands().execute(&peer, "#help").await.flatten().unwrap();
        let lines: Vec<&str> = help.lines().collect();
        assert_eq!(
            lines,
            vec![
                "#help: list available commands",
                "#quiet: does nothing",
                "#whoami: show your name",
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_command_is_still_consumed() {
        let (peer, _remote) = peer();
        let reply = commands().execute(&peer, "#nope").await.flatten().unwrap();
        assert!(reply.contains("Unknown command nope"));
    }

    fn gated(provider: Option<Arc<dyn Provider>>) -> ChatCommands {
        let mut commands = match provider {
            Some(provider) => ChatCommands::with_provider("#", provider),
            None => ChatCommands::new("#"),
        };
        commands.register_command(
            "secret",
            "needs privs",
            &["kick", "ban"],
            FnCommand(|_: &Peer, _: &str| Some("done".to_string())),
        );
        commands
    }

    #[tokio::test]
    async fn test_privileged_command_checks_every_priv() {
        let (peer, _remote) = peer();
        let store = Arc::new(MemoryProvider::new());
        let provider: Arc<dyn Provider> = store.clone();
        let commands = gated(Some(provider));

        let privs: HashSet<String> = ["kick".to_string()].into_iter().collect();
        store.set_privs("alice", &privs).unwrap();
        let reply = commands.execute(&peer, "#secret").await.flatten().unwrap();
        assert_eq!(
            reply,
            "You don't have permission to run this command (requires ban, kick)."
        );

        let privs: HashSet<String> = ["kick", "ban", "fly"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        store.set_privs("alice", &privs).unwrap();
        assert_eq!(
            commands.execute(&peer, "#secret").await,
            Some(Some("done".to_string()))
        );
    }

    #[tokio::test]
    async fn test_privileged_command_needs_a_provider() {
        let (peer, _remote) = peer();
        let reply = gated(None).execute(&peer, "#secret").await.flatten().unwrap();
        assert!(reply.starts_with("You don't have permission"));
    }

    #[tokio::test]
    async fn test_reply_is_sent_as_system_message() {
        let (peer, remote) = peer();
        assert!(commands().on_chat(&peer, "#whoami").await);

        let pkt = remote.recv().await.unwrap();
        assert_eq!(pkt.opcode(), Some(to_client::CHAT_MESSAGE));
        // version, kind
        assert_eq!(pkt.data[2..4], [1, ChatKind::System as u8]);
    }

    #[tokio::test]
    async fn test_silent_command_sends_nothing() {
        let (peer, remote) = peer();
        assert!(commands().on_chat(&peer, "#quiet").await);
        assert!(!commands().on_chat(&peer, "just talking").await);

        let nothing = tokio::time::timeout(Duration::from_millis(20), remote.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_no_hooks_forwards_chat() {
        let (peer, _remote) = peer();
        assert!(!NoHooks.on_chat(&peer, "#help").await);
        assert!(NoHooks.on_join(peer).await.is_ok());
    }
}
