//! Welcome synthesizer.
//!
//! Rebuilds the burst a client expects right after login from the
//! bootstrap events stored when the upstream link itself registered:
//! registration numerics, LUSERS, a NICK to the canonical nickname, MOTD
//! and the user mode. Missing blocks are skipped.

use std::time::Duration;

use crate::backend::{bounded, EventStore};
use crate::error::SessionError;
use crate::event::{EventKind, Identity, Network};
use crate::irc::Message;
use crate::session::{emit, Outbound};

/// Placeholder stored lines may use for the recipient's nickname.
pub const NICK_PLACEHOLDER: &str = "{nick}";

/// Everything the burst needs to know about the bound session.
pub struct Welcome<'a> {
    pub store: &'a dyn EventStore,
    pub limit: Duration,
    pub server_name: &'a str,
    pub identity: &'a Identity,
    pub network: &'a Network,
}

impl Welcome<'_> {
    /// Emit the full burst. `provisional` is the nickname the client
    /// registered with before authenticating.
    ///
    /// A failed lookup stops the burst with [`SessionError::WelcomeLookup`];
    /// lines already sent stay sent.
    pub async fn run(&self, out: &Outbound, provisional: &str) -> Result<(), SessionError> {
        let canonical = self.identity.nick.as_str();

        self.replay(out, EventKind::Registered, provisional).await?;
        self.replay(out, EventKind::Lusers, provisional).await?;

        let hostmask = format!("{provisional}!{}@{}", self.identity.username, self.server_name);
        let nick_change = Message::from_server(&hostmask, "NICK", vec![canonical]);
        emit(out, nick_change.to_line()).await?;

        self.replay(out, EventKind::Motd, canonical).await?;
        self.replay(out, EventKind::Usermode, canonical).await?;
        Ok(())
    }

    async fn replay(
        &self,
        out: &Outbound,
        kind: EventKind,
        nick: &str,
    ) -> Result<(), SessionError> {
        let stored = bounded(
            self.limit,
            &format!("{kind} lookup"),
            self.store.latest(kind, &self.network.name, self.identity.id),
        )
        .await
        .map_err(|e| SessionError::WelcomeLookup(e.context(format!("loading stored {kind}"))))?;

        let Some(event) = stored else {
            tracing::debug!(network = %self.network.name, %kind, "No stored event, skipping");
            return Ok(());
        };
        for line in event.message.raw.lines() {
            emit(out, format!("{}\r\n", substitute_nick(line, nick))).await?;
        }
        Ok(())
    }
}

/// Put `nick` into a stored line: every `{nick}` placeholder, or failing
/// that the nickname field (first parameter) of the message.
pub fn substitute_nick(line: &str, nick: &str) -> String {
    if line.contains(NICK_PLACEHOLDER) {
        return line.replace(NICK_PLACEHOLDER, nick);
    }
    match Message::parse(line) {
        Some(mut msg) if !msg.params.is_empty() => {
            msg.params[0] = nick.to_string();
            msg.to_string()
        }
        _ => line.to_string(),
    }
}
