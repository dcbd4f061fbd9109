//! Event publishers: a tokio broadcast bus for live consumers and an in-memory journal

use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::domain::entities::events::DomainEvent;
use crate::domain::repositories::event_publisher::EventPublisher;

/// Fan-out to any number of subscribers. Publishing with no subscribers drops the event.
#[derive(Debug, Clone)]
pub struct BroadcastEventPublisher {
    sender: broadcast::Sender<DomainEvent>,
}

impl BroadcastEventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventPublisher for BroadcastEventPublisher {
    fn publish(&self, event: DomainEvent) {
        let name = event.name();
        match self.sender.send(event) {
            Ok(receivers) => debug!("Published {} to {} subscriber(s)", name, receivers),
            Err(_) => debug!("Dropped {}: no subscribers", name),
        }
    }
}

/// Keeps every event in order; logs each one
#[derive(Debug, Default)]
pub struct EventJournal {
    events: Mutex<Vec<DomainEvent>>,
}

impl EventJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn named(&self, name: &str) -> Vec<DomainEvent> {
        self.events().into_iter().filter(|e| e.name() == name).collect()
    }
}

impl EventPublisher for EventJournal {
    fn publish(&self, event: DomainEvent) {
        info!(event = event.name(), "Domain event");
        let mut events = match self.events.lock() {
            Ok(events) => events,
            Err(poisoned) => poisoned.into_inner(),
        };
        events.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn alert() -> DomainEvent {
        DomainEvent::ExecutionAlert {
            user_id: "u1".to_string(),
            position_id: None,
            code: "ERR_TIMEOUT".to_string(),
            message: "slow".to_string(),
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers() {
        let bus = BroadcastEventPublisher::new(8);
        let mut rx = bus.subscribe();
        bus.publish(alert());
        assert_eq!(rx.recv().await.unwrap().name(), "execution.alert");
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        BroadcastEventPublisher::default().publish(alert());
    }

    #[test]
    fn test_journal_filters_by_name() {
        let journal = EventJournal::new();
        journal.publish(alert());
        assert_eq!(journal.named("execution.alert").len(), 1);
        assert!(journal.named("position.opened").is_empty());
    }
}
