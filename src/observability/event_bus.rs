//! Tokio broadcast event bus for connection notifications.

use crate::models::ConnectionEvent;
use tokio::sync::broadcast;

/// Broadcast bus for [`ConnectionEvent`]s.
///
/// Publishing never blocks and never fails the publisher. Every subscriber
/// sees events in publish order. A subscriber that falls more than `capacity`
/// events behind skips the oldest ones.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ConnectionEvent>,
}

/// Filtered receiver that yields events matching a predicate.
///
/// Lag is counted and then surfaced to the caller, so a consumer that
/// derives state from the stream knows it missed events.
pub struct FilteredReceiver<F> {
    receiver: broadcast::Receiver<ConnectionEvent>,
    predicate: F,
}

impl EventBus {
    /// Creates a new event bus with the given buffer capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event to all subscribers (best effort).
    pub fn publish(&self, event: ConnectionEvent) {
        metrics::counter!("event_bus_publish_total", "event" => event.event_type()).increment(1);
        tracing::debug!(event = %event.name(), "Publishing connection event");
        match self.sender.send(event) {
            Ok(_) => {
                metrics::gauge!("event_bus_queue_depth").set(self.sender.len() as f64);
            },
            Err(_) => {
                // No subscribers; nothing to deliver.
                metrics::counter!("event_bus_publish_unobserved_total").increment(1);
            },
        }
    }

    /// Subscribes to the event bus.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        metrics::counter!("event_bus_subscriptions_total").increment(1);
        metrics::gauge!("event_bus_receivers").set(self.sender.receiver_count() as f64 + 1.0);
        self.sender.subscribe()
    }

    /// Subscribes with a predicate to filter events by type or attributes.
    #[must_use]
    pub fn subscribe_filtered<F>(&self, predicate: F) -> FilteredReceiver<F>
    where
        F: Fn(&ConnectionEvent) -> bool,
    {
        FilteredReceiver {
            receiver: self.subscribe(),
            predicate,
        }
    }

    /// Returns the number of live subscribers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_EVENT_BUS_CAPACITY)
    }
}

impl<F> FilteredReceiver<F>
where
    F: Fn(&ConnectionEvent) -> bool,
{
    /// Receives the next event that matches the predicate.
    pub async fn recv(&mut self) -> Result<ConnectionEvent, broadcast::error::RecvError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if (self.predicate)(&event) {
                        return Ok(event);
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    metrics::counter!("event_bus_lagged_total").increment(skipped);
                    return Err(broadcast::error::RecvError::Lagged(skipped));
                },
                Err(err) => return Err(err),
            }
        }
    }
}
