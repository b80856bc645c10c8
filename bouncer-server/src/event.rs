//! Protocol events, networks and identities.
//!
//! These are the records the session reads from its collaborators. Events
//! flow in two ways: live through the [`EventFeed`](crate::feed::EventFeed)
//! and historically through an [`EventStore`](crate::backend::EventStore).
//! Both use the same [`Event`] shape.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::irc::Message;

pub type NetworkId = i64;
pub type IdentityId = i64;

/// A registered upstream network the bouncer keeps a connection to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Network {
    pub id: NetworkId,
    pub name: String,
}

/// An authenticated bouncer account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: IdentityId,
    /// Login identifier, e.g. "alice@example.com".
    pub account: String,
    /// Canonical nickname used on every network.
    pub nick: String,
    /// Username / ident.
    pub username: String,
    /// When this identity last received traffic. Playback starts here.
    pub last_seen: DateTime<Utc>,
}

/// Event type. The first four are the bootstrap kinds that only the
/// welcome synthesizer replays; the live relay never forwards them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Registered,
    Lusers,
    Motd,
    Usermode,
    Privmsg,
    Notice,
    Join,
    Part,
    Quit,
    Nick,
    Mode,
    Topic,
    Kick,
    Other,
}

impl EventKind {
    pub const BOOTSTRAP: [EventKind; 4] = [
        EventKind::Registered,
        EventKind::Lusers,
        EventKind::Motd,
        EventKind::Usermode,
    ];

    pub fn is_bootstrap(self) -> bool {
        Self::BOOTSTRAP.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Registered => "registered",
            EventKind::Lusers => "lusers",
            EventKind::Motd => "motd",
            EventKind::Usermode => "usermode",
            EventKind::Privmsg => "privmsg",
            EventKind::Notice => "notice",
            EventKind::Join => "join",
            EventKind::Part => "part",
            EventKind::Quit => "quit",
            EventKind::Nick => "nick",
            EventKind::Mode => "mode",
            EventKind::Topic => "topic",
            EventKind::Kick => "kick",
            EventKind::Other => "other",
        }
    }

    /// Classify an upstream command or numeric.
    pub fn from_command(command: &str) -> Self {
        match command.to_ascii_uppercase().as_str() {
            "001" | "002" | "003" | "004" | "005" => EventKind::Registered,
            "251" | "252" | "253" | "254" | "255" | "265" | "266" => EventKind::Lusers,
            "375" | "372" | "376" | "422" => EventKind::Motd,
            "221" => EventKind::Usermode,
            "PRIVMSG" => EventKind::Privmsg,
            "NOTICE" => EventKind::Notice,
            "JOIN" => EventKind::Join,
            "PART" => EventKind::Part,
            "QUIT" => EventKind::Quit,
            "NICK" => EventKind::Nick,
            "MODE" => EventKind::Mode,
            "TOPIC" => EventKind::Topic,
            "KICK" => EventKind::Kick,
            _ => EventKind::Other,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown event kind: {0}")]
pub struct UnknownEventKind(pub String);

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "registered" => EventKind::Registered,
            "lusers" => EventKind::Lusers,
            "motd" => EventKind::Motd,
            "usermode" => EventKind::Usermode,
            "privmsg" => EventKind::Privmsg,
            "notice" => EventKind::Notice,
            "join" => EventKind::Join,
            "part" => EventKind::Part,
            "quit" => EventKind::Quit,
            "nick" => EventKind::Nick,
            "mode" => EventKind::Mode,
            "topic" => EventKind::Topic,
            "kick" => EventKind::Kick,
            "other" => EventKind::Other,
            other => return Err(UnknownEventKind(other.to_string())),
        };
        Ok(kind)
    }
}

/// Raw protocol text of an event: one line, or an ordered block of lines
/// (a whole MOTD, say). Serialized as a JSON string or array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawLines {
    One(String),
    Many(Vec<String>),
}

impl RawLines {
    /// Lines in stored order, without terminators.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        let slice: &[String] = match self {
            RawLines::One(line) => std::slice::from_ref(line),
            RawLines::Many(lines) => lines,
        };
        slice.iter().map(|l| l.trim_end_matches(['\r', '\n']))
    }
}

impl From<&str> for RawLines {
    fn from(line: &str) -> Self {
        RawLines::One(line.to_string())
    }
}

impl From<String> for RawLines {
    fn from(line: String) -> Self {
        RawLines::One(line)
    }
}

impl From<Vec<String>> for RawLines {
    fn from(lines: Vec<String>) -> Self {
        RawLines::Many(lines)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMessage {
    pub raw: RawLines,
    /// Session that caused this event, if it came from one of our clients.
    pub origin_session_id: Option<String>,
    pub time: DateTime<Utc>,
}

/// A protocol event on one network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Network name.
    pub network: String,
    pub kind: EventKind,
    pub message: EventMessage,
}

impl Event {
    /// Build an event from a single upstream line, classifying it by command.
    pub fn from_line(network: &str, line: &str, origin_session_id: Option<String>) -> Self {
        let kind = Message::parse(line)
            .map(|m| EventKind::from_command(&m.command))
            .unwrap_or(EventKind::Other);
        Event {
            network: network.to_string(),
            kind,
            message: EventMessage {
                raw: RawLines::from(line),
                origin_session_id,
                time: Utc::now(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_set() {
        for kind in EventKind::BOOTSTRAP {
            assert!(kind.is_bootstrap());
        }
        assert!(!EventKind::Privmsg.is_bootstrap());
        assert!(!EventKind::Other.is_bootstrap());
    }

    #[test]
    fn kind_names_parse_back() {
        assert_eq!("motd".parse::<EventKind>().unwrap(), EventKind::Motd);
        assert_eq!("usermode".parse::<EventKind>().unwrap(), EventKind::Usermode);
        assert!("MOTD".parse::<EventKind>().is_err());
    }

    #[test]
    fn classify_numerics() {
        assert_eq!(EventKind::from_command("001"), EventKind::Registered);
        assert_eq!(EventKind::from_command("372"), EventKind::Motd);
        assert_eq!(EventKind::from_command("privmsg"), EventKind::Privmsg);
        assert_eq!(EventKind::from_command("WALLOPS"), EventKind::Other);
    }

    #[test]
    fn raw_lines_json_shapes() {
        let one: RawLines = serde_json::from_str(r#""PING :x""#).unwrap();
        assert_eq!(one.lines().collect::<Vec<_>>(), vec!["PING :x"]);

        let many: RawLines = serde_json::from_str(r#"["hi {nick}", "bye {nick}"]"#).unwrap();
        assert_eq!(many.lines().collect::<Vec<_>>(), vec!["hi {nick}", "bye {nick}"]);
        assert_eq!(serde_json::to_string(&many).unwrap(), r#"["hi {nick}","bye {nick}"]"#);
    }

    #[test]
    fn event_from_line_classifies() {
        let ev = Event::from_line("libera", ":bob!b@h PRIVMSG #rust :hi", None);
        assert_eq!(ev.kind, EventKind::Privmsg);
        assert_eq!(ev.network, "libera");
    }
}
