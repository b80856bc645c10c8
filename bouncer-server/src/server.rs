//! Server state and TCP listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::backend::{Backends, CommandHandlers, Upstreams};
use crate::config::ServerConfig;
use crate::connection;
use crate::db::{Db, SqliteBackend};
use crate::feed::EventFeed;

/// Shared state accessible by all connection handlers.
pub struct SharedState {
    pub server_name: String,
    pub backends: Backends,
    /// Live events from the upstream side, fanned out to sessions.
    pub feed: EventFeed,
    pub call_timeout: Duration,
    pub playback_nick: String,
}

pub struct Server {
    config: ServerConfig,
    backends: Backends,
    feed: EventFeed,
}

impl Server {
    /// Build a server on the SQLite backend at `--db-path` (or in memory),
    /// registering every `--network` and `--identity` first.
    ///
    /// No upstream links are attached; commands from clients are dropped
    /// until an embedder provides them through [`Server::with_backends`].
    pub fn open(config: ServerConfig) -> Result<Self> {
        let db = match config.db_path.as_deref() {
            Some(path) => {
                Db::open(path).with_context(|| format!("Failed to open database {path}"))?
            }
            None => Db::open_memory().context("Failed to open in-memory database")?,
        };
        for name in &config.networks {
            let id = db
                .ensure_network(name)
                .with_context(|| format!("Failed to register network {name}"))?;
            tracing::info!(network = %name, id, "Network registered");
        }
        for spec in &config.identities {
            let id = db
                .ensure_identity(&spec.account, &spec.password, &spec.nick, &spec.username)
                .with_context(|| format!("Failed to provision identity {}", spec.account))?;
            tracing::info!(account = %spec.account, id, "Identity provisioned");
        }

        let sqlite = SqliteBackend::new(db);
        let backends = Backends {
            credentials: Arc::new(sqlite.clone()),
            networks: Arc::new(sqlite.clone()),
            events: Arc::new(sqlite.clone()),
            last_seen: Arc::new(sqlite),
            upstreams: Arc::new(Upstreams::new()),
            handlers: Arc::new(CommandHandlers::new()),
        };
        Ok(Self::with_backends(config, backends))
    }

    /// Create a server over custom collaborators (embedding, testing).
    pub fn with_backends(config: ServerConfig, backends: Backends) -> Self {
        let feed = EventFeed::new(config.feed_capacity);
        Self {
            config,
            backends,
            feed,
        }
    }

    /// Handle for publishing live events to connected sessions.
    pub fn feed(&self) -> EventFeed {
        self.feed.clone()
    }

    fn shared_state(&self) -> Arc<SharedState> {
        Arc::new(SharedState {
            server_name: self.config.server_name.clone(),
            backends: self.backends.clone(),
            feed: self.feed.clone(),
            call_timeout: self.config.call_timeout(),
            playback_nick: self.config.playback_nick.clone(),
        })
    }

    /// Run the server, blocking forever.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        tracing::info!("Listening on {}", self.config.listen_addr);
        accept_loop(listener, self.shared_state()).await
    }

    /// Start the server and return the bound address + task handle (for testing).
    pub async fn start(self) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        tracing::info!("Listening on {addr}");

        let state = self.shared_state();
        let handle = tokio::spawn(accept_loop(listener, state));
        Ok((addr, handle))
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<SharedState>) -> Result<()> {
    loop {
        let (stream, _addr) = listener.accept().await?;
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = connection::handle(stream, state).await {
                tracing::error!("Connection error: {e}");
            }
        });
    }
}
