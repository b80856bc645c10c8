//! Shared in-process live event feed.
//!
//! Whatever owns the upstream links publishes every protocol event here;
//! each session subscribes a handler once it is bound to a network.

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::event::Event;

#[derive(Clone)]
pub struct EventFeed {
    tx: broadcast::Sender<Event>,
}

impl EventFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Deliver an event to every current subscriber. Returns how many
    /// subscribers it reached.
    pub fn publish(&self, event: Event) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Run `handler` for each event published from now on, until the
    /// returned [`Subscription`] is released.
    pub fn subscribe<F>(&self, mut handler: F) -> Subscription
    where
        F: FnMut(Event) + Send + 'static,
    {
        let mut rx = self.tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => handler(event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Live feed subscriber lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        Subscription { task: Some(task) }
    }
}

/// Handle to one feed subscription. Released on [`unsubscribe`] or drop,
/// whichever comes first; later releases are no-ops.
///
/// [`unsubscribe`]: Subscription::unsubscribe
pub struct Subscription {
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Stop delivery. Returns false if already unsubscribed.
    pub fn unsubscribe(&mut self) -> bool {
        match self.task.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.task.is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;

    fn line(text: &str) -> Event {
        Event::from_line("net", text, None)
    }

    async fn settle(feed: &EventFeed, expected: usize) {
        timeout(Duration::from_secs(1), async {
            while feed.subscriber_count() != expected {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("subscriber count never settled");
    }

    #[tokio::test]
    async fn delivers_to_handler() {
        let feed = EventFeed::new(16);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = feed.subscribe(move |ev| {
            let _ = tx.send(ev);
        });

        assert_eq!(feed.publish(line("PING :a")), 1);
        let got = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(got.message.raw.lines().next(), Some("PING :a"));
    }

    #[tokio::test]
    async fn unsubscribe_twice_is_harmless() {
        let feed = EventFeed::new(16);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sub = feed.subscribe(move |ev| {
            let _ = tx.send(ev);
        });

        assert!(sub.unsubscribe());
        assert!(!sub.unsubscribe());
        assert!(!sub.is_active());
        settle(&feed, 0).await;

        assert_eq!(feed.publish(line("PRIVMSG #a :late")), 0);
        // Sender was dropped with the aborted task, so the queue just closes.
        assert!(timeout(Duration::from_secs(1), rx.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn drop_releases_subscription() {
        let feed = EventFeed::new(16);
        let sub = feed.subscribe(|_| {});
        settle(&feed, 1).await;
        drop(sub);
        settle(&feed, 0).await;
    }
}
