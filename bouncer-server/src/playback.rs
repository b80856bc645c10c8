//! History playback.
//!
//! Replays everything stored for the identity on the bound network since
//! it was last seen, bracketed per target by start and end markers from a
//! system pseudo-user. Last-seen only advances once the whole history was
//! delivered, so an interrupted playback repeats on the next connection.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use futures::StreamExt;

use crate::backend::{bounded, EventStore, LastSeenUpdater};
use crate::error::SessionError;
use crate::event::{Identity, Network};
use crate::irc::Message;
use crate::session::{emit, Outbound};

/// Default nickname of the pseudo-user announcing playback.
pub const DEFAULT_SYSTEM_NICK: &str = "***";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const START_TEXT: &str = "Buffer Playback...";
const END_TEXT: &str = "Playback Complete.";

/// Commands whose last parameter is message text and gets the timestamp.
const TEXT_COMMANDS: [&str; 2] = ["PRIVMSG", "NOTICE"];

pub struct Playback<'a> {
    pub store: &'a dyn EventStore,
    pub last_seen: &'a dyn LastSeenUpdater,
    pub limit: Duration,
    pub server_name: &'a str,
    pub system_nick: &'a str,
    pub identity: &'a Identity,
    pub network: &'a Network,
    /// Newest event time to replay. Anything later reaches the session
    /// through the live relay instead.
    pub until: DateTime<Utc>,
}

/// What a completed playback delivered.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PlaybackSummary {
    /// Targets in first-seen order.
    pub targets: Vec<String>,
    pub lines: usize,
}

impl Playback<'_> {
    pub async fn run(&self, out: &Outbound) -> Result<PlaybackSummary, SessionError> {
        let since = self.identity.last_seen;
        let mut history = bounded(
            self.limit,
            "history query",
            self.store.history(&self.network.name, self.identity.id, since, self.until),
        )
        .await
        .map_err(SessionError::PlaybackRead)?;

        let mut seen = HashSet::new();
        let mut summary = PlaybackSummary::default();

        loop {
            let next = tokio::time::timeout(self.limit, history.next())
                .await
                .map_err(|_| {
                    let limit = self.limit;
                    SessionError::PlaybackRead(anyhow!("history read timed out after {limit:?}"))
                })?;
            let Some(item) = next else { break };
            let event = item.map_err(SessionError::PlaybackRead)?;

            let stamp = format!("[{}]", event.message.time.format(TIMESTAMP_FORMAT));
            for raw in event.message.raw.lines() {
                let Some(mut msg) = Message::parse(raw) else {
                    tracing::warn!(
                        network = %self.network.name,
                        "Skipping undecodable history line"
                    );
                    continue;
                };
                let Some(target) = msg.target().map(str::to_string) else {
                    tracing::warn!(
                        network = %self.network.name,
                        command = %msg.command,
                        "Skipping history line without target"
                    );
                    continue;
                };

                if seen.insert(target.clone()) {
                    emit(out, self.marker(&target, START_TEXT)).await?;
                    summary.targets.push(target);
                }
                if msg.params.len() > 1 && TEXT_COMMANDS.contains(&msg.command.as_str()) {
                    if let Some(text) = msg.params.last_mut() {
                        *text = format!("{stamp} {text}");
                    }
                }
                emit(out, msg.to_line()).await?;
                summary.lines += 1;
            }
        }

        for target in &summary.targets {
            emit(out, self.marker(target, END_TEXT)).await?;
        }

        bounded(
            self.limit,
            "last-seen update",
            self.last_seen.touch(self.identity.id, Utc::now()),
        )
        .await
        .map_err(|e| SessionError::PlaybackRead(e.context("advancing last-seen")))?;

        tracing::info!(
            network = %self.network.name,
            targets = summary.targets.len(),
            lines = summary.lines,
            "Playback complete"
        );
        Ok(summary)
    }

    fn marker(&self, target: &str, text: &str) -> String {
        let source = format!("{}!bouncer@{}", self.system_nick, self.server_name);
        Message::from_server(&source, "PRIVMSG", vec![target, text]).to_line()
    }
}
