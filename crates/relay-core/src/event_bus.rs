use tokio::sync::broadcast;

use relay_types::RunEvent;

/// Fan-out of run progress events. Publishing never blocks the engine; a
/// subscriber that falls behind drops events, not the run.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: RunEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(2048)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.publish(RunEvent::new("run.status", json!({"status": "running"})));
    }

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(RunEvent::new("a", json!({})));
        bus.publish(RunEvent::new("b", json!({})));
        assert_eq!(rx.recv().await.expect("a").event_type, "a");
        assert_eq!(rx.recv().await.expect("b").event_type, "b");
    }
}
