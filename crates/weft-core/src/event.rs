use crate::traits::TaskObserver;
use crate::types::TaskEvent;

/// Event bus using tokio broadcast channel.
/// All subscribers receive all task events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<TaskEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: TaskEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl TaskObserver for EventBus {
    fn on_task_finished(&self, event: &TaskEvent) {
        self.publish(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TaskId, TaskStatus};
    use chrono::Utc;

    fn event(name: &str) -> TaskEvent {
        TaskEvent {
            run_id: "run-1".into(),
            task_id: TaskId::from(name),
            task_name: name.into(),
            status: TaskStatus::Completed,
            result: None,
            error: None,
            attempt: 1,
            retry_exhausted: false,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn observer_rebroadcasts_to_subscribers() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.on_task_finished(&event("draft"));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.task_name, "draft");
        assert_eq!(received.status, TaskStatus::Completed);
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.publish(event("lonely"));
    }
}
