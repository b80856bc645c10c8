//! Session error taxonomy and the process-wide reporter.

use std::io;

/// Everything that can go wrong while driving one client session.
///
/// Only the first three end the connection. The lookup errors leave the
/// session running in a reduced state.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("authentication failed for {0:?}")]
    Credential(String),

    #[error("no network matching {0:?}")]
    NetworkNotFound(String),

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("welcome lookup failed: {0:#}")]
    WelcomeLookup(anyhow::Error),

    #[error("playback read failed: {0:#}")]
    PlaybackRead(anyhow::Error),
}

impl SessionError {
    /// The client writer has gone away.
    pub fn closed() -> Self {
        SessionError::Transport(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "client writer closed",
        ))
    }

    /// Whether the connection must be torn down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::Credential(_)
                | SessionError::NetworkNotFound(_)
                | SessionError::Transport(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Credential(_) => "credential",
            SessionError::NetworkNotFound(_) => "network_not_found",
            SessionError::Transport(_) => "transport",
            SessionError::WelcomeLookup(_) => "welcome_lookup",
            SessionError::PlaybackRead(_) => "playback_read",
        }
    }
}

/// Central error sink. Every session error ends up here exactly once.
pub fn report(session_id: &str, err: &SessionError) {
    let kind = err.kind();
    match err {
        SessionError::Credential(_) | SessionError::NetworkNotFound(_) => {
            tracing::warn!(%session_id, kind, "Handshake rejected: {err}");
        }
        SessionError::Transport(_) => {
            tracing::warn!(%session_id, kind, "Closing session: {err}");
        }
        SessionError::WelcomeLookup(_) | SessionError::PlaybackRead(_) => {
            tracing::error!(%session_id, kind, "{err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatality_by_kind() {
        assert!(SessionError::Credential("a".into()).is_fatal());
        assert!(SessionError::NetworkNotFound("gamma".into()).is_fatal());
        assert!(SessionError::closed().is_fatal());
        assert!(!SessionError::WelcomeLookup(anyhow::anyhow!("db gone")).is_fatal());
        assert!(!SessionError::PlaybackRead(anyhow::anyhow!("db gone")).is_fatal());
    }

    #[test]
    fn lookup_errors_keep_context() {
        let err = anyhow::anyhow!("disk I/O").context("loading motd");
        let msg = SessionError::WelcomeLookup(err).to_string();
        assert!(msg.contains("loading motd"));
        assert!(msg.contains("disk I/O"));
    }
}
