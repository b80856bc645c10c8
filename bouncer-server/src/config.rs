use std::time::Duration;

use clap::Parser;

use crate::playback::DEFAULT_SYSTEM_NICK;

/// IRC bouncer serving stored network state to reconnecting clients.
#[derive(Parser, Debug, Clone)]
#[command(name = "bouncer-server", version, about)]
pub struct ServerConfig {
    /// Client listener address.
    #[arg(long, default_value = "127.0.0.1:6667")]
    pub listen_addr: String,

    /// Server name used in IRC messages.
    #[arg(long, default_value = "bouncer")]
    pub server_name: String,

    /// SQLite database file. In-memory when unset.
    #[arg(long)]
    pub db_path: Option<String>,

    /// Network to register at startup. Repeatable.
    #[arg(long = "network")]
    pub networks: Vec<String>,

    /// Account to create (or update) at startup, as
    /// `account:password:nick:username`. Repeatable.
    #[arg(long = "identity", value_parser = IdentitySpec::parse)]
    pub identities: Vec<IdentitySpec>,

    /// Upper bound in seconds for every backend call.
    #[arg(long, default_value = "10")]
    pub call_timeout_secs: u64,

    /// Nickname of the pseudo-user that announces playback.
    #[arg(long, default_value = DEFAULT_SYSTEM_NICK)]
    pub playback_nick: String,

    /// Live events buffered per subscriber before it starts lagging.
    #[arg(long, default_value = "1024")]
    pub feed_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:6667".to_string(),
            server_name: "bouncer".to_string(),
            db_path: None,
            networks: Vec::new(),
            identities: Vec::new(),
            call_timeout_secs: 10,
            playback_nick: DEFAULT_SYSTEM_NICK.to_string(),
            feed_capacity: 1024,
        }
    }
}

/// One `--identity` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentitySpec {
    pub account: String,
    pub password: String,
    pub nick: String,
    pub username: String,
}

impl IdentitySpec {
    /// Parse `account:password:nick:username`. The password may itself
    /// contain ':'.
    pub fn parse(value: &str) -> Result<Self, String> {
        let malformed = || format!("expected account:password:nick:username, got {value:?}");
        let (account, rest) = value.split_once(':').ok_or_else(malformed)?;
        let (rest, username) = rest.rsplit_once(':').ok_or_else(malformed)?;
        let (password, nick) = rest.rsplit_once(':').ok_or_else(malformed)?;
        if [account, password, nick, username].iter().any(|part| part.is_empty()) {
            return Err(malformed());
        }
        Ok(Self {
            account: account.to_string(),
            password: password.to_string(),
            nick: nick.to_string(),
            username: username.to_string(),
        })
    }
}

impl ServerConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}
