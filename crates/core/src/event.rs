//! Typed publish/subscribe channel for component events.
//!
//! Every component owns one [`EventBus`] parameterised by its own event enum,
//! so subscribers receive exactly one message type per emitter and messages
//! arrive in emission order. Delivery is fire-and-forget: publishing with no
//! subscribers is not an error, and a subscriber that falls more than the
//! channel capacity behind observes `RecvError::Lagged`.

use tokio::sync::broadcast;

/// Default number of undelivered events buffered per bus.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// An event that can be addressed by a stable topic name such as
/// `"task:assigned"`.
pub trait EventName {
    /// Topic name of this event.
    fn name(&self) -> &'static str;
}

/// Broadcast bus for one component's events.
#[derive(Debug, Clone)]
pub struct EventBus<E: Clone> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone + EventName> EventBus<E> {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: E) {
        let name = event.name();
        match self.sender.send(event) {
            Ok(receivers) => tracing::trace!(event = name, receivers, "event published"),
            Err(_) => tracing::trace!(event = name, "event dropped, no subscribers"),
        }
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<E: Clone + EventName> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Ping {
        One(u32),
        Two,
    }

    impl EventName for Ping {
        fn name(&self) -> &'static str {
            match self {
                Ping::One(_) => "ping:one",
                Ping::Two => "ping:two",
            }
        }
    }

    #[tokio::test]
    async fn test_events_arrive_in_emission_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(Ping::One(1));
        bus.publish(Ping::Two);
        bus.publish(Ping::One(2));

        assert_eq!(rx.recv().await.unwrap(), Ping::One(1));
        assert_eq!(rx.recv().await.unwrap(), Ping::Two);
        assert_eq!(rx.recv().await.unwrap(), Ping::One(2));
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus: EventBus<Ping> = EventBus::new(4);
        bus.publish(Ping::Two);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_every_event() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(Ping::One(7));
        assert_eq!(a.recv().await.unwrap(), Ping::One(7));
        assert_eq!(b.recv().await.unwrap(), Ping::One(7));
    }
}
