//! Per-connection session record and command dispatch.
//!
//! [`Session::apply`] is pure state: it decides what a decoded client
//! command means for this session and returns an [`Action`] for the
//! connection loop to carry out.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use tokio::sync::mpsc;

use crate::error::SessionError;
use crate::event::{Identity, Network};
use crate::irc::{self, Message};

/// Queue of CRLF-terminated lines bound for the client.
pub type Outbound = mpsc::Sender<String>;

/// Push a line to the client, failing once the writer is gone.
pub async fn emit(out: &Outbound, line: String) -> Result<(), SessionError> {
    out.send(line).await.map_err(|_| SessionError::closed())
}

/// Handshake progress. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AuthState {
    Unauthenticated,
    Authenticating,
    Welcomed,
}

/// Commands the session interprets itself. Everything else is `Other`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    Pass(&'a str),
    Nick(&'a str),
    User(&'a str),
    Quit,
    /// PASS/NICK/USER without their parameter.
    MissingParams(&'a str),
    Other,
}

impl<'a> Command<'a> {
    pub fn classify(msg: &'a Message) -> Self {
        let first = msg.params.first().map(String::as_str);
        match (msg.command.as_str(), first) {
            ("PASS", Some(password)) => Command::Pass(password),
            ("NICK", Some(nick)) => Command::Nick(nick),
            ("USER", Some(param)) => Command::User(param),
            ("QUIT", _) => Command::Quit,
            ("PASS" | "NICK" | "USER", None) => Command::MissingParams(&msg.command),
            _ => Command::Other,
        }
    }
}

/// What the connection loop should do after a command was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    None,
    /// Start authentication with the parsed USER parameter.
    Handshake {
        identifier: String,
        network: Option<String>,
    },
    /// Hand the command to the outbound forwarder.
    Forward,
    Quit,
    /// Answer with an error numeric and otherwise ignore the command.
    Reject {
        numeric: &'static str,
        reason: &'static str,
    },
}

/// State of a single client session.
#[derive(Debug)]
pub struct Session {
    /// Random, stable for the session's lifetime. Tags our own events on
    /// the live feed.
    pub id: String,
    state: AuthState,
    password: Option<String>,
    /// Provisional nickname until welcomed, canonical afterwards.
    nick: Option<String>,
    network: Option<Network>,
    identity: Option<Identity>,
}

impl Session {
    pub fn new() -> Self {
        Self::with_id(new_session_id())
    }

    pub fn with_id(id: String) -> Self {
        Self {
            id,
            state: AuthState::Unauthenticated,
            password: None,
            nick: None,
            network: None,
            identity: None,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn welcomed(&self) -> bool {
        self.state == AuthState::Welcomed
    }

    /// Password from PASS, or empty if none was sent.
    pub fn password(&self) -> &str {
        self.password.as_deref().unwrap_or("")
    }

    pub fn nick(&self) -> Option<&str> {
        self.nick.as_deref()
    }

    pub fn nick_or_star(&self) -> &str {
        self.nick.as_deref().unwrap_or("*")
    }

    pub fn network(&self) -> Option<&Network> {
        self.network.as_ref()
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Identity and network, once the handshake bound them.
    pub fn binding(&self) -> Option<(&Identity, &Network)> {
        self.identity.as_ref().zip(self.network.as_ref())
    }

    fn advance(&mut self, next: AuthState) {
        if next > self.state {
            self.state = next;
        }
    }

    /// Attach the authenticated identity and selected network. A session
    /// binds at most once.
    pub fn bind(&mut self, identity: Identity, network: Network) {
        debug_assert!(self.network.is_none(), "session bound twice");
        if self.network.is_some() {
            return;
        }
        self.identity = Some(identity);
        self.network = Some(network);
    }

    /// The welcome burst finished: the canonical nick is now active.
    pub fn mark_welcomed(&mut self) {
        if let Some(identity) = &self.identity {
            self.nick = Some(identity.nick.clone());
        }
        self.advance(AuthState::Welcomed);
    }

    pub fn apply(&mut self, cmd: Command<'_>) -> Action {
        match cmd {
            Command::Pass(password) => {
                if !self.welcomed() {
                    self.password = Some(password.to_string());
                }
                Action::None
            }
            Command::Nick(nick) => {
                if self.welcomed() {
                    return Action::Forward;
                }
                self.nick = Some(nick.to_string());
                Action::None
            }
            Command::User(param) => {
                if self.state != AuthState::Unauthenticated {
                    return Action::Reject {
                        numeric: irc::ERR_ALREADYREGISTRED,
                        reason: "You may not reregister",
                    };
                }
                self.advance(AuthState::Authenticating);
                let (identifier, network) = split_user_param(param);
                Action::Handshake {
                    identifier,
                    network,
                }
            }
            Command::Quit => Action::Quit,
            Command::MissingParams("NICK") if self.welcomed() => Action::Forward,
            Command::MissingParams(_) => Action::Reject {
                numeric: irc::ERR_NEEDMOREPARAMS,
                reason: "Not enough parameters",
            },
            Command::Other => {
                if self.network.is_some() {
                    Action::Forward
                } else {
                    Action::Reject {
                        numeric: irc::ERR_NOTREGISTERED,
                        reason: "You have not registered",
                    }
                }
            }
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// `<identifier>/<network>`; the network part is optional.
fn split_user_param(param: &str) -> (String, Option<String>) {
    match param.rsplit_once('/') {
        Some((identifier, network)) if !network.is_empty() => {
            (identifier.to_string(), Some(network.to_string()))
        }
        Some((identifier, _)) => (identifier.to_string(), None),
        None => (param.to_string(), None),
    }
}

fn new_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
