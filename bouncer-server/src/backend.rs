//! Collaborator interfaces the session consumes, plus the in-process
//! registries for upstream links and command handlers.
//!
//! Storage-shaped collaborators are implemented for SQLite in
//! [`crate::db::SqliteBackend`]. Anything else (a real upstream link
//! manager, a protocol-specific command handler) plugs in through these
//! traits when the [`Server`](crate::server::Server) is built.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use tokio::sync::mpsc;

use crate::event::{Event, EventKind, Identity, IdentityId, Network, NetworkId};
use crate::forward::OutboundRecord;

/// Lazily produced, arrival-ordered history.
pub type EventStream = BoxStream<'static, Result<Event>>;

/// Checks a login. `Ok(None)` means the credentials were wrong.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, identifier: &str, password: &str) -> Result<Option<Identity>>;
}

#[async_trait]
pub trait NetworkRegistry: Send + Sync {
    async fn networks(&self) -> Result<Vec<Network>>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Most recent stored event of `kind` for this network and identity.
    async fn latest(
        &self,
        kind: EventKind,
        network: &str,
        identity: IdentityId,
    ) -> Result<Option<Event>>;

    /// Every event stored after `since` and no later than `until`, oldest
    /// first.
    async fn history(
        &self,
        network: &str,
        identity: IdentityId,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<EventStream>;
}

#[async_trait]
pub trait LastSeenUpdater: Send + Sync {
    async fn touch(&self, identity: IdentityId, at: DateTime<Utc>) -> Result<()>;
}

/// An established connection to an upstream network.
#[async_trait]
pub trait UpstreamConnection: Send + Sync {
    /// Send one protocol line, without terminator.
    async fn send(&self, line: &str) -> Result<()>;
}

#[async_trait]
pub trait UpstreamRegistry: Send + Sync {
    async fn connection(&self, network: NetworkId) -> Result<Option<Arc<dyn UpstreamConnection>>>;
}

/// Protocol-specific handling for one outbound command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(
        &self,
        upstream: &dyn UpstreamConnection,
        record: &OutboundRecord,
    ) -> Result<()>;
}

/// Run a collaborator call under a deadline. An elapsed deadline is an
/// ordinary error for the caller to classify.
pub async fn bounded<T, F>(limit: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("{what} timed out after {limit:?}")),
    }
}

/// Upstream link backed by a channel drained by whoever owns the socket.
pub struct ChannelUpstream {
    tx: mpsc::Sender<String>,
}

impl ChannelUpstream {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl UpstreamConnection for ChannelUpstream {
    async fn send(&self, line: &str) -> Result<()> {
        self.tx
            .send(line.to_string())
            .await
            .map_err(|_| anyhow!("upstream link closed"))
    }
}

/// networkId -> live upstream connection.
#[derive(Default)]
pub struct Upstreams {
    links: Mutex<HashMap<NetworkId, Arc<dyn UpstreamConnection>>>,
}

impl Upstreams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the connection for a network.
    pub fn attach(&self, network: NetworkId, conn: Arc<dyn UpstreamConnection>) {
        self.links.lock().unwrap().insert(network, conn);
    }

    pub fn detach(&self, network: NetworkId) {
        self.links.lock().unwrap().remove(&network);
    }
}

#[async_trait]
impl UpstreamRegistry for Upstreams {
    async fn connection(&self, network: NetworkId) -> Result<Option<Arc<dyn UpstreamConnection>>> {
        Ok(self.links.lock().unwrap().get(&network).cloned())
    }
}

/// (COMMAND, network name) -> handler.
#[derive(Default)]
pub struct CommandHandlers {
    handlers: HashMap<(String, String), Arc<dyn CommandHandler>>,
}

impl CommandHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, command: &str, network: &str, handler: Arc<dyn CommandHandler>) {
        self.handlers
            .insert((command.to_ascii_uppercase(), network.to_string()), handler);
    }

    pub fn get(&self, command: &str, network: &str) -> Option<&Arc<dyn CommandHandler>> {
        self.handlers
            .get(&(command.to_ascii_uppercase(), network.to_string()))
    }
}

/// Every collaborator a session needs, injected at construction.
#[derive(Clone)]
pub struct Backends {
    pub credentials: Arc<dyn CredentialVerifier>,
    pub networks: Arc<dyn NetworkRegistry>,
    pub events: Arc<dyn EventStore>,
    pub last_seen: Arc<dyn LastSeenUpdater>,
    pub upstreams: Arc<dyn UpstreamRegistry>,
    pub handlers: Arc<CommandHandlers>,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl CommandHandler for Noop {
        async fn handle(&self, _: &dyn UpstreamConnection, _: &OutboundRecord) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn bounded_times_out() {
        let err = bounded(Duration::from_millis(10), "slow lookup", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("slow lookup timed out"));
    }

    #[tokio::test]
    async fn bounded_passes_result_through() {
        let v = bounded(Duration::from_secs(1), "fast", async { Ok(7) }).await.unwrap();
        assert_eq!(v, 7);
    }

    #[tokio::test]
    async fn upstream_registry_attach_detach() {
        let upstreams = Upstreams::new();
        let (tx, mut rx) = mpsc::channel(4);
        upstreams.attach(3, Arc::new(ChannelUpstream::new(tx)));

        let conn = upstreams.connection(3).await.unwrap().unwrap();
        conn.send("PRIVMSG #a :hi").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "PRIVMSG #a :hi");

        upstreams.detach(3);
        assert!(upstreams.connection(3).await.unwrap().is_none());
    }

    #[test]
    fn handlers_keyed_by_command_and_network() {
        let mut handlers = CommandHandlers::new();
        handlers.register("privmsg", "libera", Arc::new(Noop));
        assert!(handlers.get("PRIVMSG", "libera").is_some());
        assert!(handlers.get("PRIVMSG", "oftc").is_none());
        assert!(handlers.get("JOIN", "libera").is_none());
    }
}
