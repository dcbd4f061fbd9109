use crate::domain::entities::events::DomainEvent;

/// Fire-and-forget sink for domain events. Publishing never fails the caller.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: DomainEvent);
}
