//! Live relay: filters the shared feed down to what one session should see.

use tokio::sync::mpsc;

use crate::event::Event;
use crate::feed::{EventFeed, Subscription};

/// Whether a live event should reach the session `session_id`, bound to
/// the network named `network`.
pub fn should_forward(event: &Event, session_id: &str, network: &str) -> bool {
    // Self-echo: the session already has what it sent.
    if event.message.origin_session_id.as_deref() == Some(session_id) {
        return false;
    }
    if event.network != network {
        return false;
    }
    !event.kind.is_bootstrap()
}

/// Subscribe a session to the feed. Forwarded lines (CRLF-terminated,
/// verbatim) are queued on `queue`; the session decides when to flush it.
pub fn subscribe(
    feed: &EventFeed,
    session_id: String,
    network: String,
    queue: mpsc::UnboundedSender<String>,
) -> Subscription {
    tracing::debug!(%session_id, %network, "Subscribing to live feed");
    feed.subscribe(move |event| {
        if !should_forward(&event, &session_id, &network) {
            return;
        }
        for line in event.message.raw.lines() {
            if queue.send(format!("{line}\r\n")).is_err() {
                return;
            }
        }
    })
}
