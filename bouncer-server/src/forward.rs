//! Outbound command forwarder: authenticated client commands go to the
//! backend handler for that command and, verbatim, to the upstream network.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::backend::{bounded, Backends};
use crate::event::{Identity, Network};
use crate::irc::Message;

/// Target used when a command has no parameters.
pub const WILDCARD_TARGET: &str = "*";

/// Command the bouncer treats as "send a message".
pub const MESSAGE_SEND: &str = "PRIVMSG";

/// Normalized view of one client command, as handed to command handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    pub nick: String,
    pub username: String,
    /// First parameter, or [`WILDCARD_TARGET`].
    pub target: String,
    /// Last parameter when there is one beyond the target.
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// The line exactly as the client sent it, without terminator.
    pub raw: String,
    pub origin_session_id: String,
}

impl OutboundRecord {
    pub fn new(msg: &Message, raw: &str, nick: &str, username: &str, session_id: &str) -> Self {
        let target = msg.target().unwrap_or(WILDCARD_TARGET).to_string();
        let text = if msg.params.len() > 1 {
            msg.params.last().cloned().unwrap_or_default()
        } else {
            String::new()
        };
        Self {
            nick: nick.to_string(),
            username: username.to_string(),
            target,
            text,
            timestamp: Utc::now(),
            raw: raw.trim_end_matches(['\r', '\n']).to_string(),
            origin_session_id: session_id.to_string(),
        }
    }
}

pub struct Forwarder<'a> {
    pub backends: &'a Backends,
    pub limit: Duration,
    pub session_id: &'a str,
    pub nick: &'a str,
    pub identity: &'a Identity,
    pub network: &'a Network,
}

impl Forwarder<'_> {
    /// Dispatch one command. Failures are logged, never surfaced to the
    /// client.
    ///
    /// Handlers receive the upstream connection they act on, so both the
    /// handler and the verbatim send are skipped when the network has no
    /// upstream link. A PRIVMSG still refreshes last-seen in that case.
    pub async fn forward(&self, msg: &Message, raw: &str) {
        let session_id = self.session_id;
        let network = self.network.name.as_str();
        let record = OutboundRecord::new(msg, raw, self.nick, &self.identity.username, session_id);
        let message_send = msg.command == MESSAGE_SEND;

        let upstream = match bounded(
            self.limit,
            "upstream lookup",
            self.backends.upstreams.connection(self.network.id),
        )
        .await
        {
            Ok(Some(conn)) => Some(conn),
            Ok(None) => {
                tracing::warn!(
                    %session_id,
                    %network,
                    "No upstream connection, dropping {}",
                    msg.command
                );
                None
            }
            Err(e) => {
                tracing::warn!(%session_id, %network, "Upstream lookup failed: {e:#}");
                None
            }
        };

        if let Some(upstream) = upstream {
            match self.backends.handlers.get(&msg.command, network) {
                Some(handler) => {
                    if let Err(e) = bounded(
                        self.limit,
                        "command handler",
                        handler.handle(upstream.as_ref(), &record),
                    )
                    .await
                    {
                        tracing::warn!(
                            %session_id,
                            command = %msg.command,
                            "Handler failed: {e:#}"
                        );
                    }
                }
                None if message_send => {
                    tracing::warn!(%session_id, %network, "No {MESSAGE_SEND} handler registered");
                }
                None => {}
            }

            if let Err(e) = bounded(self.limit, "upstream send", upstream.send(&record.raw)).await {
                tracing::warn!(%session_id, %network, "Upstream send failed: {e:#}");
            }
        }

        if message_send {
            if let Err(e) = bounded(
                self.limit,
                "last-seen update",
                self.backends.last_seen.touch(self.identity.id, record.timestamp),
            )
            .await
            {
                tracing::warn!(%session_id, "Could not refresh last-seen: {e:#}");
            }
        }
    }
}
