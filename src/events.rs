//! In-process publish/subscribe with named topics.
//!
//! Dropping a [`Subscription`] unsubscribes it.

use tokio::sync::broadcast;

const BUS_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// The stored API key was set, replaced or cleared.
    CredentialChanged,
    /// Something asked the user to configure their API key.
    OpenSettings,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Topic>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish to every current subscriber of `topic`. No subscribers is not an error.
    pub fn publish(&self, topic: Topic) {
        let _ = self.tx.send(topic);
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        Subscription {
            topic,
            rx: self.tx.subscribe(),
        }
    }
}

pub struct Subscription {
    topic: Topic,
    rx: broadcast::Receiver<Topic>,
}

impl Subscription {
    /// Wait for the next event on this subscription's topic.
    /// Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<()> {
        loop {
            match self.rx.recv().await {
                Ok(t) if t == self.topic => return Some(()),
                Ok(_) => continue,
                // Missed events still mean "something changed".
                Err(broadcast::error::RecvError::Lagged(_)) => return Some(()),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking check; true if at least one event for this topic is queued.
    pub fn drain(&mut self) -> bool {
        let mut seen = false;
        loop {
            match self.rx.try_recv() {
                Ok(t) if t == self.topic => seen = true,
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(_)) => seen = true,
                Err(_) => return seen,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_only_see_their_topic() {
        let bus = EventBus::new();
        let mut creds = bus.subscribe(Topic::CredentialChanged);
        let mut settings = bus.subscribe(Topic::OpenSettings);

        bus.publish(Topic::OpenSettings);
        assert!(!creds.drain());
        assert!(settings.drain());

        bus.publish(Topic::CredentialChanged);
        assert_eq!(creds.recv().await, Some(()));
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(Topic::CredentialChanged);
        let mut late = bus.subscribe(Topic::CredentialChanged);
        assert!(!late.drain());
    }
}
