//! Per-client connection handler.
//!
//! Each accepted stream gets one task running [`Connection`], which owns
//! the session, a writer task fed through an mpsc queue, and (once bound)
//! a live-feed subscription. The handshake, welcome burst and playback run
//! inline, so live events that arrive meanwhile wait in the relay queue
//! and reach the client only after the burst.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use crate::auth;
use crate::error::{self, SessionError};
use crate::feed::Subscription;
use crate::forward::Forwarder;
use crate::irc::{self, Message};
use crate::playback::Playback;
use crate::relay;
use crate::server::SharedState;
use crate::session::{emit, Action, Command, Outbound, Session};
use crate::welcome::Welcome;

/// Maximum accepted line length, IRCv3 tags included.
pub const MAX_LINE_LENGTH: usize = 8191;

/// Lines queued for the client writer before senders wait.
const OUTBOUND_QUEUE: usize = 256;

enum Flow {
    Continue,
    Quit,
}

/// Handle a plain TCP connection.
pub async fn handle(stream: TcpStream, state: Arc<SharedState>) -> Result<()> {
    let peer = stream.peer_addr()?;
    tracing::info!(%peer, "New connection");
    handle_generic(stream, state).await
}

/// Handle any async byte stream (TCP, in-memory duplex, ...).
pub async fn handle_generic<S>(stream: S, state: Arc<SharedState>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    let session = Session::new();
    let session_id = session.id.clone();
    tracing::info!(%session_id, "Session started");

    // Channel for sending lines TO this client
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
    let write_session_id = session_id.clone();
    let write_handle = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                tracing::warn!(session_id = %write_session_id, "Write error: {e}");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let (live_tx, mut live_rx) = mpsc::unbounded_channel::<String>();
    let mut conn = Connection {
        session,
        state,
        out: tx,
        live_tx,
        subscription: None,
    };

    let result: Result<(), SessionError> = async {
        loop {
            tokio::select! {
                frame = lines.next() => match frame {
                    None => return Ok(()),
                    Some(Err(LinesCodecError::Io(e))) => return Err(SessionError::Transport(e)),
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        return Err(SessionError::Transport(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            "line too long",
                        )));
                    }
                    Some(Ok(line)) => {
                        if let Flow::Quit = conn.dispatch(&line).await? {
                            return Ok(());
                        }
                    }
                },
                Some(line) = live_rx.recv() => emit(&conn.out, line).await?,
            }
        }
    }
    .await;

    if let Err(ref err) = result {
        error::report(&session_id, err);
    }

    conn.close();
    drop(conn);
    let _ = write_handle.await;
    tracing::info!(%session_id, "Connection closed");
    Ok(())
}

struct Connection {
    session: Session,
    state: Arc<SharedState>,
    out: Outbound,
    live_tx: mpsc::UnboundedSender<String>,
    subscription: Option<Subscription>,
}

impl Connection {
    async fn dispatch(&mut self, line: &str) -> Result<Flow, SessionError> {
        let Some(msg) = Message::parse(line) else {
            return Ok(Flow::Continue);
        };
        tracing::debug!(session_id = %self.session.id, "<- {}", msg.command);

        match self.session.apply(Command::classify(&msg)) {
            Action::None => {}
            Action::Quit => return Ok(Flow::Quit),
            Action::Reject { numeric, reason } => {
                let reply = Message::from_server(
                    &self.state.server_name,
                    numeric,
                    vec![self.session.nick_or_star(), msg.command.as_str(), reason],
                );
                emit(&self.out, reply.to_line()).await?;
            }
            Action::Handshake {
                identifier,
                network,
            } => self.handshake(&identifier, network.as_deref()).await?,
            Action::Forward => self.forward(&msg, line).await,
        }
        Ok(Flow::Continue)
    }

    /// Authenticate, bind, subscribe, then welcome and playback, strictly
    /// in that order. Only authentication failures end the connection.
    async fn handshake(
        &mut self,
        identifier: &str,
        requested: Option<&str>,
    ) -> Result<(), SessionError> {
        let state = Arc::clone(&self.state);
        let limit = state.call_timeout;

        let bound = auth::authenticate(
            state.backends.credentials.as_ref(),
            state.backends.networks.as_ref(),
            limit,
            identifier,
            self.session.password(),
            requested,
        )
        .await;
        let (identity, network) = match bound {
            Ok(bound) => bound,
            Err(err) => {
                self.send_failure(&err).await;
                return Err(err);
            }
        };

        self.session.bind(identity.clone(), network.clone());
        // Playback stops here; later events arrive through the relay.
        let cutoff = Utc::now();
        self.subscription = Some(relay::subscribe(
            &state.feed,
            self.session.id.clone(),
            network.name.clone(),
            self.live_tx.clone(),
        ));

        let provisional = self.session.nick().unwrap_or(&identity.nick).to_string();
        let welcome = Welcome {
            store: state.backends.events.as_ref(),
            limit,
            server_name: &state.server_name,
            identity: &identity,
            network: &network,
        };
        match welcome.run(&self.out, &provisional).await {
            Ok(()) => self.session.mark_welcomed(),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => error::report(&self.session.id, &err),
        }

        let playback = Playback {
            store: state.backends.events.as_ref(),
            last_seen: state.backends.last_seen.as_ref(),
            limit,
            server_name: &state.server_name,
            system_nick: &state.playback_nick,
            identity: &identity,
            network: &network,
            until: cutoff,
        };
        match playback.run(&self.out).await {
            Ok(_) => {}
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => error::report(&self.session.id, &err),
        }
        Ok(())
    }

    /// Tell the client why it is about to be disconnected.
    async fn send_failure(&self, err: &SessionError) {
        let nick = self.session.nick_or_star();
        let reply = match err {
            SessionError::Credential(_) => Message::from_server(
                &self.state.server_name,
                irc::ERR_PASSWDMISMATCH,
                vec![nick, "Password incorrect"],
            ),
            SessionError::NetworkNotFound(name) => Message::from_server(
                &self.state.server_name,
                irc::ERR_NOSUCHSERVER,
                vec![nick, name.as_str(), "No such network"],
            ),
            _ => return,
        };
        let _ = emit(&self.out, reply.to_line()).await;
    }

    async fn forward(&self, msg: &Message, raw: &str) {
        let Some((identity, network)) = self.session.binding() else {
            return;
        };
        let forwarder = Forwarder {
            backends: &self.state.backends,
            limit: self.state.call_timeout,
            session_id: &self.session.id,
            nick: self.session.nick().unwrap_or(&identity.nick),
            identity,
            network,
        };
        forwarder.forward(msg, raw).await;
    }

    /// Release the live feed. Safe to call more than once.
    fn close(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }
}
