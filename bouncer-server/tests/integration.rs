//! End-to-end tests: a real listener on 127.0.0.1:0, raw IRC over TCP.
//!
//! Storage is an in-memory SQLite backend seeded with one identity
//! (alice@example.com / hunter2, canonical nick "alice"), two networks and
//! a little stored state on "alpha". Upstream traffic is faked by
//! publishing on the server's feed; the upstream link is a channel.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use bouncer_server::backend::{Backends, ChannelUpstream, CommandHandlers, Upstreams};
use bouncer_server::config::{IdentitySpec, ServerConfig};
use bouncer_server::db::{Db, SqliteBackend};
use bouncer_server::event::{Event, EventKind, EventMessage, IdentityId};
use bouncer_server::feed::EventFeed;
use bouncer_server::server::Server;

const TIMEOUT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: std::net::SocketAddr,
    feed: EventFeed,
    upstream_rx: mpsc::Receiver<String>,
    sqlite: SqliteBackend,
    identity: IdentityId,
}

fn stored(kind: EventKind, raw: Vec<&str>, minutes_ago: i64) -> Event {
    Event {
        network: "alpha".into(),
        kind,
        message: EventMessage {
            raw: raw.into_iter().map(String::from).collect::<Vec<_>>().into(),
            origin_session_id: None,
            time: Utc::now() - chrono::Duration::minutes(minutes_ago),
        },
    }
}

async fn start_test_server() -> TestServer {
    let db = Db::open_memory().unwrap();
    let identity = db.add_identity("alice@example.com", "hunter2", "alice", "al").unwrap();
    db.touch_last_seen(identity, Utc::now() - chrono::Duration::hours(1)).unwrap();
    let alpha = db.ensure_network("alpha").unwrap();
    db.ensure_network("beta").unwrap();

    for event in [
        stored(EventKind::Registered, vec![":upstream 001 {nick} :Welcome to alpha"], 120),
        stored(EventKind::Motd, vec!["hi {nick}", "bye {nick}"], 120),
        stored(EventKind::Privmsg, vec![":bob!b@h PRIVMSG #rust :missed you"], 30),
    ] {
        db.insert_event(identity, &event).unwrap();
    }
    let mut beta_only = stored(EventKind::Privmsg, vec![":eve!e@h PRIVMSG #beta :elsewhere"], 20);
    beta_only.network = "beta".into();
    db.insert_event(identity, &beta_only).unwrap();

    let sqlite = SqliteBackend::new(db);
    let upstreams = Upstreams::new();
    let (tx, upstream_rx) = mpsc::channel(64);
    upstreams.attach(alpha, Arc::new(ChannelUpstream::new(tx)));

    let backends = Backends {
        credentials: Arc::new(sqlite.clone()),
        networks: Arc::new(sqlite.clone()),
        events: Arc::new(sqlite.clone()),
        last_seen: Arc::new(sqlite.clone()),
        upstreams: Arc::new(upstreams),
        handlers: Arc::new(CommandHandlers::new()),
    };
    let config = ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        server_name: "bnc".to_string(),
        call_timeout_secs: 2,
        ..Default::default()
    };

    let server = Server::with_backends(config, backends);
    let feed = server.feed();
    let (addr, _handle) = server.start().await.unwrap();
    TestServer {
        addr,
        feed,
        upstream_rx,
        sqlite,
        identity,
    }
}

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(format!("{line}\r\n").as_bytes()).await.unwrap();
    }

    async fn login(&mut self, user: &str, password: &str) {
        self.send(&format!("PASS {password}")).await;
        self.send("NICK bob").await;
        self.send(&format!("USER {user} 0 * :Alice")).await;
    }

    /// Next line, or None once the server closed the connection.
    async fn recv(&mut self) -> Option<String> {
        timeout(TIMEOUT, self.lines.next_line())
            .await
            .expect("Timeout waiting for a line")
            .unwrap_or(None)
    }

    async fn expect(&mut self, desc: &str) -> String {
        match self.recv().await {
            Some(line) => line,
            None => panic!("Connection closed while waiting for: {desc}"),
        }
    }

    /// Lines up to and including the first one containing `needle`.
    async fn collect_until(&mut self, needle: &str) -> Vec<String> {
        let mut seen = Vec::new();
        loop {
            let line = self.expect(needle).await;
            let done = line.contains(needle);
            seen.push(line);
            if done {
                return seen;
            }
        }
    }

    async fn expect_closed(&mut self) {
        assert_eq!(self.recv().await, None, "expected the server to close");
    }
}

fn live(network: &str, line: &str) -> Event {
    Event::from_line(network, line, None)
}

// ── Test: welcome burst then playback, in order ──────────────────────

#[tokio::test]
async fn login_replays_welcome_and_history() {
    let server = start_test_server().await;
    let mut client = Client::connect(server.addr).await;
    client.login("alice@example.com/alpha", "hunter2").await;

    let lines = client.collect_until("Playback Complete.").await;
    assert_eq!(lines[0], ":upstream 001 bob :Welcome to alpha");
    assert_eq!(lines[1], ":bob!al@bnc NICK alice");
    assert_eq!(lines[2], "hi alice");
    assert_eq!(lines[3], "bye alice");
    assert_eq!(lines[4], ":***!bouncer@bnc PRIVMSG #rust :Buffer Playback...");
    assert!(lines[5].starts_with(":bob!b@h PRIVMSG #rust :["), "{}", lines[5]);
    assert!(lines[5].ends_with("] missed you"), "{}", lines[5]);
    assert_eq!(lines[6], ":***!bouncer@bnc PRIVMSG #rust :Playback Complete.");
    assert_eq!(lines.len(), 7);
}

// ── Test: second connection gets no repeated history ─────────────────

#[tokio::test]
async fn playback_advances_last_seen() {
    let server = start_test_server().await;
    let before = server
        .sqlite
        .with_db(|db| db.identity(server.identity))
        .unwrap()
        .unwrap()
        .last_seen;

    let mut first = Client::connect(server.addr).await;
    first.login("alice@example.com/alpha", "hunter2").await;
    first.collect_until("Playback Complete.").await;
    first.send("QUIT").await;
    first.expect_closed().await;

    let after = server
        .sqlite
        .with_db(|db| db.identity(server.identity))
        .unwrap()
        .unwrap()
        .last_seen;
    assert!(after > before);

    let mut second = Client::connect(server.addr).await;
    second.login("alice@example.com/alpha", "hunter2").await;
    // A repeated USER is rejected; its reply marks the end of the burst.
    second.send("USER alice@example.com/alpha 0 * :Alice").await;
    let lines = second.collect_until(" 462 ").await;
    assert!(lines.iter().all(|l| !l.contains("Buffer Playback")), "{lines:?}");
    assert!(lines.iter().any(|l| l == ":bob!al@bnc NICK alice"));
}

// ── Test: live relay filters by network, kind and origin ─────────────

#[tokio::test]
async fn live_events_are_filtered() {
    let server = start_test_server().await;
    let mut client = Client::connect(server.addr).await;
    client.login("alice@example.com/alpha", "hunter2").await;
    client.collect_until("Playback Complete.").await;

    server.feed.publish(live("beta", ":eve!e@h PRIVMSG #beta :not for alpha"));
    server.feed.publish(live("alpha", ":upstream 375 alice :- MOTD -"));
    server.feed.publish(Event::from_line(
        "alpha",
        ":alice!al@h PRIVMSG #rust :sent elsewhere",
        Some("some-other-session".into()),
    ));
    server.feed.publish(live("alpha", ":carol!c@h PRIVMSG #rust :hello alice"));

    assert_eq!(
        client.expect("other session's message").await,
        ":alice!al@h PRIVMSG #rust :sent elsewhere"
    );
    assert_eq!(client.expect("live message").await, ":carol!c@h PRIVMSG #rust :hello alice");
}

// ── Test: commands after login go upstream verbatim ──────────────────

#[tokio::test]
async fn commands_are_forwarded_upstream() {
    let mut server = start_test_server().await;
    let mut client = Client::connect(server.addr).await;
    client.login("alice@example.com/alpha", "hunter2").await;
    client.collect_until("Playback Complete.").await;

    client.send("JOIN #rust").await;
    client.send("PRIVMSG #rust :hello from the bouncer").await;

    let first = timeout(TIMEOUT, server.upstream_rx.recv()).await.unwrap().unwrap();
    let second = timeout(TIMEOUT, server.upstream_rx.recv()).await.unwrap().unwrap();
    assert_eq!(first, "JOIN #rust");
    assert_eq!(second, "PRIVMSG #rust :hello from the bouncer");
}

// ── Test: handshake failures close the connection ────────────────────

#[tokio::test]
async fn unknown_network_is_rejected() {
    let server = start_test_server().await;
    let mut client = Client::connect(server.addr).await;
    client.login("alice@example.com/gamma", "hunter2").await;

    let line = client.expect("402").await;
    assert!(line.starts_with(":bnc 402 bob gamma"), "{line}");
    client.expect_closed().await;
}

#[tokio::test]
async fn wrong_password_is_rejected() {
    let server = start_test_server().await;
    let mut client = Client::connect(server.addr).await;
    client.login("alice@example.com/alpha", "wrong").await;

    let line = client.expect("464").await;
    assert!(line.starts_with(":bnc 464 bob"), "{line}");
    client.expect_closed().await;
}

// ── Test: nothing passes before registration ─────────────────────────

#[tokio::test]
async fn commands_before_login_are_refused() {
    let mut server = start_test_server().await;
    let mut client = Client::connect(server.addr).await;

    client.send("PRIVMSG #rust :too early").await;
    let line = client.expect("451").await;
    assert!(line.starts_with(":bnc 451 * PRIVMSG"), "{line}");

    client.send("QUIT").await;
    client.expect_closed().await;
    assert!(server.upstream_rx.try_recv().is_err());
}

// ── Test: identities from the command line can log in ────────────────

#[tokio::test]
async fn provisioned_identity_logs_in() {
    let config = ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        server_name: "bnc".to_string(),
        networks: vec!["alpha".to_string()],
        identities: vec![IdentitySpec::parse("carol@example.com:s3cret:carol:cj").unwrap()],
        ..Default::default()
    };
    let (addr, _handle) = Server::open(config).unwrap().start().await.unwrap();

    let mut client = Client::connect(addr).await;
    client.login("carol@example.com", "s3cret").await;
    assert_eq!(client.expect("nick change").await, ":bob!cj@bnc NICK carol");

    client.send("QUIT").await;
    client.expect_closed().await;
}
