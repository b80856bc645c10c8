//! SQLite persistence layer.
//!
//! Stores bouncer identities (with last-seen), registered networks, and the
//! per-identity event log that feeds the welcome burst and playback.
//! Uses WAL mode for concurrent reads during writes.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use rand::RngCore;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use sha2::{Digest, Sha256};

use crate::backend::{CredentialVerifier, EventStore, EventStream, LastSeenUpdater, NetworkRegistry};
use crate::event::{
    Event, EventKind, EventMessage, Identity, IdentityId, Network, NetworkId, RawLines,
};

/// Rows fetched per history page.
pub const HISTORY_PAGE_SIZE: usize = 256;

/// Database handle wrapping a SQLite connection.
pub struct Db {
    conn: Connection,
}

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> SqlResult<()> {
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS identities (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                account       TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                nick          TEXT NOT NULL,
                username      TEXT NOT NULL,
                last_seen     INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS networks (
                id   INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS events (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                network        TEXT NOT NULL,
                identity_id    INTEGER NOT NULL,
                kind           TEXT NOT NULL,
                raw_json       TEXT NOT NULL,
                origin_session TEXT,
                timestamp      INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_lookup
                ON events(network, identity_id, kind, id DESC);
            ",
        )?;
        Ok(())
    }

    // ── Identities ─────────────────────────────────────────────────────

    /// Create an account. Its last-seen starts at creation time.
    pub fn add_identity(
        &self,
        account: &str,
        password: &str,
        nick: &str,
        username: &str,
    ) -> SqlResult<IdentityId> {
        self.conn.execute(
            "INSERT INTO identities (account, password_hash, nick, username, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                account,
                hash_password(password),
                nick,
                username,
                Utc::now().timestamp_millis()
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Create the account, or reset password, nick and username of an
    /// existing one. Last-seen of an existing account is kept.
    pub fn ensure_identity(
        &self,
        account: &str,
        password: &str,
        nick: &str,
        username: &str,
    ) -> SqlResult<IdentityId> {
        self.conn.execute(
            "INSERT INTO identities (account, password_hash, nick, username, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(account) DO UPDATE SET
                password_hash = excluded.password_hash,
                nick = excluded.nick,
                username = excluded.username",
            params![
                account,
                hash_password(password),
                nick,
                username,
                Utc::now().timestamp_millis()
            ],
        )?;
        self.conn.query_row(
            "SELECT id FROM identities WHERE account = ?1",
            params![account],
            |row| row.get(0),
        )
    }

    /// Look up an account and check its password.
    pub fn verify_credentials(&self, account: &str, password: &str) -> SqlResult<Option<Identity>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, account, nick, username, last_seen, password_hash
                 FROM identities WHERE account = ?1",
                params![account],
                |row| Ok((map_identity_row(row)?, row.get::<_, String>(5)?)),
            )
            .optional()?;
        Ok(row.and_then(|(identity, stored)| {
            check_password(&stored, password).then_some(identity)
        }))
    }

    pub fn identity(&self, id: IdentityId) -> SqlResult<Option<Identity>> {
        self.conn
            .query_row(
                "SELECT id, account, nick, username, last_seen FROM identities WHERE id = ?1",
                params![id],
                map_identity_row,
            )
            .optional()
    }

    pub fn touch_last_seen(&self, id: IdentityId, at: DateTime<Utc>) -> SqlResult<()> {
        self.conn.execute(
            "UPDATE identities SET last_seen = ?2 WHERE id = ?1",
            params![id, at.timestamp_millis()],
        )?;
        Ok(())
    }

    // ── Networks ───────────────────────────────────────────────────────

    /// Register a network by name, returning its id. Idempotent.
    pub fn ensure_network(&self, name: &str) -> SqlResult<NetworkId> {
        self.conn.execute(
            "INSERT OR IGNORE INTO networks (name) VALUES (?1)",
            params![name],
        )?;
        self.conn.query_row(
            "SELECT id FROM networks WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
    }

    pub fn networks(&self) -> SqlResult<Vec<Network>> {
        let mut stmt = self.conn.prepare("SELECT id, name FROM networks ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(Network {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?;
        let networks = rows.collect::<SqlResult<Vec<_>>>()?;
        Ok(networks)
    }

    // ── Events ─────────────────────────────────────────────────────────

    /// Append an event to an identity's log.
    pub fn insert_event(&self, identity: IdentityId, event: &Event) -> SqlResult<i64> {
        let raw_json = serde_json::to_string(&event.message.raw)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        self.conn.execute(
            "INSERT INTO events (network, identity_id, kind, raw_json, origin_session, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.network,
                identity,
                event.kind.as_str(),
                raw_json,
                event.message.origin_session_id,
                event.message.time.timestamp_millis(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Most recently stored event of one kind.
    pub fn latest_event(
        &self,
        kind: EventKind,
        network: &str,
        identity: IdentityId,
    ) -> SqlResult<Option<Event>> {
        self.conn
            .query_row(
                "SELECT id, network, kind, raw_json, origin_session, timestamp FROM events
                 WHERE network = ?1 AND identity_id = ?2 AND kind = ?3
                 ORDER BY id DESC LIMIT 1",
                params![network, identity, kind.as_str()],
                map_event_row,
            )
            .optional()
            .map(|row| row.map(|(_, event)| event))
    }

    /// One page of history: events in `(since, until]`, with row id above
    /// `after_id`, in arrival order. Bootstrap kinds are not history.
    pub fn events_after(
        &self,
        network: &str,
        identity: IdentityId,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        after_id: i64,
        limit: usize,
    ) -> SqlResult<Vec<(i64, Event)>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, network, kind, raw_json, origin_session, timestamp FROM events
             WHERE network = ?1 AND identity_id = ?2 AND timestamp > ?3 AND timestamp <= ?4
               AND id > ?5 AND kind NOT IN ('registered', 'lusers', 'motd', 'usermode')
             ORDER BY id ASC LIMIT ?6",
        )?;
        let rows = stmt.query_map(
            params![
                network,
                identity,
                since.timestamp_millis(),
                until.timestamp_millis(),
                after_id,
                limit as i64
            ],
            map_event_row,
        )?;
        let events = rows.collect::<SqlResult<Vec<_>>>()?;
        Ok(events)
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn map_identity_row(row: &rusqlite::Row) -> SqlResult<Identity> {
    Ok(Identity {
        id: row.get(0)?,
        account: row.get(1)?,
        nick: row.get(2)?,
        username: row.get(3)?,
        last_seen: from_millis(row.get(4)?),
    })
}

fn map_event_row(row: &rusqlite::Row) -> SqlResult<(i64, Event)> {
    let id: i64 = row.get(0)?;
    let kind: String = row.get(2)?;
    let kind: EventKind = kind
        .parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
    let raw_json: String = row.get(3)?;
    let raw: RawLines = serde_json::from_str(&raw_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
    let event = Event {
        network: row.get(1)?,
        kind,
        message: EventMessage {
            raw,
            origin_session_id: row.get(4)?,
            time: from_millis(row.get(5)?),
        },
    };
    Ok((id, event))
}

/// `salt$sha256(salt || password)`, both base64url.
fn hash_password(password: &str) -> String {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    let salt = URL_SAFE_NO_PAD.encode(salt);
    format!("{salt}${}", digest_password(&salt, password))
}

fn digest_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

fn check_password(stored: &str, password: &str) -> bool {
    match stored.split_once('$') {
        Some((salt, hash)) => digest_password(salt, password) == hash,
        None => false,
    }
}

/// All storage-shaped collaborators over one shared SQLite handle.
#[derive(Clone)]
pub struct SqliteBackend {
    db: Arc<Mutex<Db>>,
    page_size: usize,
}

impl SqliteBackend {
    pub fn new(db: Db) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            page_size: HISTORY_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Run a closure with the database, converting SQLite errors.
    pub fn with_db<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Db) -> SqlResult<R>,
    {
        let db = self.db.lock().unwrap();
        Ok(f(&db)?)
    }
}

type Page = (Vec<Event>, (i64, bool));

fn next_page(
    db: &Mutex<Db>,
    network: &str,
    identity: IdentityId,
    window: (DateTime<Utc>, DateTime<Utc>),
    after_id: i64,
    page_size: usize,
) -> Result<Option<Page>> {
    let (since, until) = window;
    let rows = db
        .lock()
        .unwrap()
        .events_after(network, identity, since, until, after_id, page_size)?;
    let Some(last_id) = rows.last().map(|(id, _)| *id) else {
        return Ok(None);
    };
    let exhausted = rows.len() < page_size;
    let events = rows.into_iter().map(|(_, event)| event).collect();
    Ok(Some((events, (last_id, exhausted))))
}

#[async_trait]
impl CredentialVerifier for SqliteBackend {
    async fn verify(&self, identifier: &str, password: &str) -> Result<Option<Identity>> {
        self.with_db(|db| db.verify_credentials(identifier, password))
    }
}

#[async_trait]
impl NetworkRegistry for SqliteBackend {
    async fn networks(&self) -> Result<Vec<Network>> {
        self.with_db(|db| db.networks())
    }
}

#[async_trait]
impl EventStore for SqliteBackend {
    async fn latest(
        &self,
        kind: EventKind,
        network: &str,
        identity: IdentityId,
    ) -> Result<Option<Event>> {
        self.with_db(|db| db.latest_event(kind, network, identity))
    }

    async fn history(
        &self,
        network: &str,
        identity: IdentityId,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<EventStream> {
        let db = Arc::clone(&self.db);
        let network = network.to_string();
        let page_size = self.page_size;

        let pages = stream::try_unfold((0i64, false), move |(after_id, exhausted)| {
            let db = Arc::clone(&db);
            let network = network.clone();
            async move {
                if exhausted {
                    return Ok(None);
                }
                next_page(&db, &network, identity, (since, until), after_id, page_size)
            }
        });

        Ok(pages
            .map_ok(|events: Vec<Event>| stream::iter(events.into_iter().map(Ok)))
            .try_flatten()
            .boxed())
    }
}

#[async_trait]
impl LastSeenUpdater for SqliteBackend {
    async fn touch(&self, identity: IdentityId, at: DateTime<Utc>) -> Result<()> {
        self.with_db(|db| db.touch_last_seen(identity, at))
    }
}
